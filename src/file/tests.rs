use std::fmt::Write;

use expect_test::{expect, Expect};

use crate::{error::Error, tests::SyntheticJpeg};

use super::{parse_segment, SegmentKind, SegmentParser};

fn dump(jpeg: &[u8]) -> String {
    fn describe(kind: SegmentKind<'_>, payload: &[u8]) -> String {
        match kind {
            SegmentKind::Dqt(tables) => {
                let mut out = String::from("DQT");
                for table in tables {
                    write!(out, " Tq{}:{:?}", table.id(), table.precision()).unwrap();
                }
                out
            }
            SegmentKind::Dht(tables) => {
                let mut out = String::from("DHT");
                for table in tables {
                    let class = table.class();
                    write!(out, " {:?}{}:{}", class, table.id(), table.values().len()).unwrap();
                }
                out
            }
            // Dump bytes of unknown APP segments too.
            SegmentKind::App(app) if app.as_app_kind().is_none() => {
                format!("{app:?} {payload:x?}")
            }
            kind => format!("{kind:?}"),
        }
    }

    let mut out = String::new();
    let mut parser = SegmentParser::new(jpeg);
    loop {
        let segment = match parser.next_segment() {
            Ok(segment) => segment,
            Err(Error::BufferExhausted) => break,
            Err(e) => {
                writeln!(out, "error: {e}").unwrap();
                return out;
            }
        };
        write!(
            out,
            "{:04X} [FF {:02X}] ",
            segment.offset(),
            segment.marker().code(),
        )
        .unwrap();
        match parse_segment(&segment) {
            Ok(kind) => writeln!(out, "{}", describe(kind, segment.payload())).unwrap(),
            Err(e) => writeln!(out, "error: {e}").unwrap(),
        }
    }

    if !parser.remaining().is_empty() {
        writeln!(
            out,
            "{} trailing bytes: {:x?}",
            parser.remaining().len(),
            parser.remaining()
        )
        .unwrap();
    }
    out
}

fn check(jpeg: &[u8], expect: Expect) {
    expect.assert_eq(&dump(jpeg));
}

#[test]
fn empty() {
    check(
        &[0xFF],
        expect![[r#"
            1 trailing bytes: [ff]
        "#]],
    );
    check(
        &[0xFF, 0xD8 /* SOI */],
        expect![[r#"
            0000 [FF D8] Soi
        "#]],
    );
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xFF, 0xFF, 0xD9, // fill bytes, EOI
        ],
        expect![[r#"
            0000 [FF D8] Soi
            0004 [FF D9] Eoi
        "#]],
    );
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xD9, // EOI
            0xFF, // trailing
        ],
        expect![[r#"
            0000 [FF D8] Soi
            0002 [FF D9] Eoi
            1 trailing bytes: [ff]
        "#]],
    );
}

#[test]
fn app() {
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xE0, // APP0
            0x00, 0x04, // 2 more bytes after this
            0x00, 0x00, // APP0 contents (non-JFIF)
            0xFF, 0xDD, // DRI
            0x00, 0x04, // length
            0x00, 0x0F, // Ri
            0xFF, 0xFE, // COM
            0x00, 0x04, // length
            b'h', b'i', // text
            0xFF, 0xD9, // EOI
        ],
        expect![[r#"
            0000 [FF D8] Soi
            0002 [FF E0] App { n: 0, kind: None } [0, 0]
            0008 [FF DD] Dri(Dri { restart_interval: 15 })
            000E [FF FE] Com(Com("hi"))
            0014 [FF D9] Eoi
        "#]],
    );

    let mut jpeg = vec![0xFF, 0xD8];
    // JFIF
    jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
    jpeg.extend_from_slice(b"JFIF\0");
    jpeg.extend_from_slice(&[0x01, 0x02, 0x01, 0x00, 0x48, 0x00, 0x48, 0x00, 0x00]);
    // AVI1, OpenDML variant
    jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
    jpeg.extend_from_slice(b"AVI1");
    jpeg.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x20, 0x00]);
    // Adobe
    jpeg.extend_from_slice(&[0xFF, 0xEE, 0x00, 0x0E]);
    jpeg.extend_from_slice(b"Adobe");
    jpeg.extend_from_slice(&[0x00, 0x64, 0x00, 0x00, 0x00, 0x00, 0x01]);
    check(
        &jpeg,
        expect![[r#"
            0000 [FF D8] Soi
            0002 [FF E0] App(App { n: 0, kind: Some(Jfif(Jfif { version: (1, 2), density_unit: Some(DotsPerInch), density: (72, 72), thumbnail: (0, 0) })) })
            0014 [FF E0] App(App { n: 0, kind: Some(Avi1(Avi1 { polarity: 0, field_sizes: Some((4096, 8192)) })) })
            0026 [FF EE] App(App { n: 14, kind: Some(Adobe(Adobe { version: 100, flags0: 0, flags1: 0, transform: 1 })) })
        "#]],
    );
}

#[test]
fn malformed_segments() {
    let mut dqt = vec![0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x43, 0x20];
    dqt.extend_from_slice(&[1; 64]);
    check(
        &dqt,
        expect![[r#"
            0000 [FF D8] Soi
            0002 [FF DB] error: invalid quantization table precision Pq=2 (0 and 1 are allowed)
        "#]],
    );

    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xDB, 0x00, 0x03, 0x00, // DQT without table data
            0xFF, 0xDD, 0x00, 0x03, 0x00, // DRI with 1 byte
            0xFF, 0xD9, // EOI
        ],
        expect![[r#"
            0000 [FF D8] Soi
            0002 [FF DB] error: DQT segment is truncated
            0007 [FF DD] error: DRI segment has 1 bytes of payload, expected 2
            000C [FF D9] Eoi
        "#]],
    );

    // The length field runs past the end of the data.
    check(
        &[0xFF, 0xD8, 0xFF, 0xC4, 0x01, 0x00, 0x00],
        expect![[r#"
            0000 [FF D8] Soi
            5 trailing bytes: [ff, c4, 1, 0, 0]
        "#]],
    );
}

#[test]
fn synthetic_file() {
    let jpeg = SyntheticJpeg::new(16, 16, &[(2, 2), (1, 1), (1, 1)])
        .jfif()
        .restart_interval(1)
        .build();
    let out = dump(&jpeg);
    let lines: Vec<_> = out.lines().collect();
    assert_eq!(lines.len(), 8, "{out}");
    assert_eq!(
        lines[7],
        format!("{:04X} [FF D9] Eoi", jpeg.len() - 2),
        "entropy-coded data should be skipped"
    );

    expect![[r#"
        0000 [FF D8] Soi
        0002 [FF E0] App(App { n: 0, kind: Some(Jfif(Jfif { version: (1, 1), density_unit: Some(None), density: (1, 1), thumbnail: (0, 0) })) })
        0014 [FF DB] DQT Tq0:Bits8 Tq1:Bits8
        009A [FF C0] Sof(Sof { marker: SOF0, precision: 8, height: 16, width: 16, components: [#1 2x2 q0, #2 1x1 q1, #3 1x1 q1] })
        00AD [FF C4] DHT Dc0:12 Dc1:12 Ac0:162 Ac1:162
        0251 [FF DD] Dri(Dri { restart_interval: 1 })
        0257 [FF DA] Sos(Sos { components: [#1 dc0 ac0, #2 dc1 ac1, #3 dc1 ac1], ss: 0, se: 63, ah: 0, al: 0 })"#]]
    .assert_eq(&lines[..7].join("\n"));
}
