//! End-to-end container flows through the driver.

use std::fs;
use std::io::{Read, Write};

use tempfile::tempdir;

use coffer_container::{ContainerFormat, Driver};
use coffer_core::{CofferError, CompressionMethod, DriverConfig, Entry, VerifyOutcome};

fn build_zip(driver: &Driver, path: &std::path::Path, entries: &[(&str, &[u8])]) {
    let mut output = driver
        .create_output(ContainerFormat::Zip, path, None)
        .unwrap();
    for (name, data) in entries {
        let mut stream = output.create_entry(Entry::draft(name), None).unwrap();
        stream.write_all(data).unwrap();
        stream.close().unwrap();
    }
    output.finish().unwrap();
    output.close().unwrap();
}

#[test]
fn test_zip_roundtrip_through_driver() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("archive.zip");
    let driver = Driver::new(DriverConfig::default());

    build_zip(
        &driver,
        &path,
        &[
            ("readme.md", b"# hello"),
            ("src/main.rs", b"fn main() {}"),
        ],
    );

    let mut input = driver.open_input(ContainerFormat::Zip, &path).unwrap();
    let names: Vec<&str> = input.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["readme.md", "src/main.rs"]);

    let mut stream = input.open_entry("src/main.rs").unwrap();
    let mut content = Vec::new();
    stream.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"fn main() {}");
    assert_eq!(stream.close().unwrap(), VerifyOutcome::Verified);
    drop(stream);
    input.close().unwrap();
}

#[test]
fn test_same_format_rewrite_copies_through() {
    let dir = tempdir().unwrap();
    let src_path = dir.path().join("src.zip");
    let dst_path = dir.path().join("dst.zip");
    let driver = Driver::new(DriverConfig::default());

    let payload = "a very compressible line of text\n".repeat(64);
    build_zip(&driver, &src_path, &[("big.txt", payload.as_bytes())]);

    let mut source = driver.open_input(ContainerFormat::Zip, &src_path).unwrap();
    let original = source.entry("big.txt").unwrap().clone();
    assert_eq!(original.method, CompressionMethod::Deflated);

    let mut dest = driver
        .create_output(ContainerFormat::Zip, &dst_path, None)
        .unwrap();
    let copied = driver
        .copy_entry(source.as_mut(), dest.as_ref(), "big.txt")
        .unwrap();
    dest.finish().unwrap();

    // Copy-through keeps the stored byte layout verbatim.
    assert_eq!(copied.crc32, original.crc32);
    assert_eq!(copied.compressed_size, original.compressed_size);
    assert_eq!(copied.method, original.method);

    let mut reopened = driver.open_input(ContainerFormat::Zip, &dst_path).unwrap();
    let mut stream = reopened.open_entry("big.txt").unwrap();
    let mut content = Vec::new();
    stream.read_to_end(&mut content).unwrap();
    assert_eq!(content, payload.as_bytes());
    assert_eq!(stream.close().unwrap(), VerifyOutcome::Verified);
}

#[test]
fn test_cross_format_copy_decodes_and_reencodes() {
    let dir = tempdir().unwrap();
    let zip_path = dir.path().join("src.zip");
    let tar_path = dir.path().join("dst.tar");
    let driver = Driver::new(DriverConfig::default());

    build_zip(&driver, &zip_path, &[("data/report.csv", b"a,b,c\n1,2,3\n")]);

    let mut source = driver.open_input(ContainerFormat::Zip, &zip_path).unwrap();
    let mut dest = driver
        .create_output(ContainerFormat::Tar, &tar_path, None)
        .unwrap();
    let copied = driver
        .copy_entry(source.as_mut(), dest.as_ref(), "data/report.csv")
        .unwrap();
    dest.finish().unwrap();
    source.close().unwrap();

    // The sequential format stores plain bytes.
    assert_eq!(copied.method, CompressionMethod::Stored);
    assert_eq!(copied.size, Some(12));

    let mut reopened = driver.open_input(ContainerFormat::Tar, &tar_path).unwrap();
    let mut stream = reopened.open_entry("data/report.csv").unwrap();
    let mut content = Vec::new();
    stream.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"a,b,c\n1,2,3\n");
    // No stored checksum to verify against in this family.
    assert_eq!(stream.close().unwrap(), VerifyOutcome::Skipped);
}

#[test]
fn test_chained_rewrite_preserves_side_data() {
    let dir = tempdir().unwrap();
    let plain_path = dir.path().join("plain.zip");
    let sfx_path = dir.path().join("sfx.zip");
    let out_path = dir.path().join("rewritten.zip");

    let strict = Driver::new(DriverConfig::default());
    build_zip(&strict, &plain_path, &[("app.cfg", b"mode=fast\n")]);

    // Wrap the container in self-extractor style side data.
    let preamble = b"#!/bin/launcher\n";
    let postamble = b"LOADER-BLOB";
    let mut image = preamble.to_vec();
    image.extend_from_slice(&fs::read(&plain_path).unwrap());
    image.extend_from_slice(postamble);
    fs::write(&sfx_path, &image).unwrap();

    // Strict configuration refuses the extra bytes outright.
    assert!(strict.open_input(ContainerFormat::Zip, &sfx_path).is_err());

    let tolerant = Driver::new(
        DriverConfig::default()
            .with_preamble(true)
            .with_postamble(true),
    );
    let mut source = tolerant.open_input(ContainerFormat::Zip, &sfx_path).unwrap();
    let mut dest = tolerant
        .create_output(ContainerFormat::Zip, &out_path, Some(source.as_mut()))
        .unwrap();
    tolerant
        .copy_entry(source.as_mut(), dest.as_ref(), "app.cfg")
        .unwrap();
    dest.finish().unwrap();
    dest.close().unwrap();

    let rewritten = fs::read(&out_path).unwrap();
    assert!(rewritten.starts_with(preamble));
    assert!(rewritten.ends_with(postamble));

    let mut reopened = tolerant.open_input(ContainerFormat::Zip, &out_path).unwrap();
    let mut stream = reopened.open_entry("app.cfg").unwrap();
    let mut content = Vec::new();
    stream.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"mode=fast\n");
    assert_eq!(stream.close().unwrap(), VerifyOutcome::Verified);
}

#[test]
fn test_rewrite_pads_before_postamble() {
    let dir = tempdir().unwrap();
    let tolerant = Driver::new(
        DriverConfig::default()
            .with_preamble(true)
            .with_postamble(true),
    );
    let postamble = b"LOADER-BLOB";
    let eocd_sig = [0x50u8, 0x4B, 0x05, 0x06];

    // Sweep the preamble length so the closing record lands on every
    // possible 4-byte alignment.
    let mut pads = Vec::new();
    for extra in 0..4usize {
        let plain_path = dir.path().join(format!("plain-{extra}.zip"));
        let sfx_path = dir.path().join(format!("sfx-{extra}.zip"));
        let out_path = dir.path().join(format!("out-{extra}.zip"));
        build_zip(&tolerant, &plain_path, &[("app.cfg", b"mode=fast\n")]);

        let mut image = b"#!/bin/launcher\n".to_vec();
        image.extend_from_slice(&vec![b'#'; extra]);
        image.extend_from_slice(&fs::read(&plain_path).unwrap());
        image.extend_from_slice(postamble);
        fs::write(&sfx_path, &image).unwrap();

        let mut source = tolerant.open_input(ContainerFormat::Zip, &sfx_path).unwrap();
        let mut dest = tolerant
            .create_output(ContainerFormat::Zip, &out_path, Some(source.as_mut()))
            .unwrap();
        tolerant
            .copy_entry(source.as_mut(), dest.as_ref(), "app.cfg")
            .unwrap();
        dest.finish().unwrap();

        // The rewrite dropped the source's postamble from its body, so its
        // length differs from the source's and the alignment rule applies:
        // exactly `end-of-index mod 4` zero bytes sit between the closing
        // record and the carried postamble.
        let rewritten = fs::read(&out_path).unwrap();
        let body = &rewritten[..rewritten.len() - postamble.len()];
        let sig_pos = body.windows(4).rposition(|w| w == eocd_sig).unwrap();
        let comment_len =
            u16::from_le_bytes([body[sig_pos + 20], body[sig_pos + 21]]) as usize;
        let eocd_end = sig_pos + 22 + comment_len;
        let pad = eocd_end % 4;

        assert_eq!(rewritten.len(), eocd_end + pad + postamble.len());
        assert!(rewritten[eocd_end..eocd_end + pad].iter().all(|&b| b == 0));
        assert!(rewritten.ends_with(postamble));
        pads.push(pad);
    }
    // The sweep must have exercised the padded case, not just pad zero.
    assert!(pads.iter().any(|&p| p > 0));
}

#[test]
fn test_sequential_writer_busy_protocol_end_to_end() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ordered.tar");
    let driver = Driver::new(DriverConfig::default());

    let mut output = driver
        .create_output(ContainerFormat::Tar, &path, None)
        .unwrap();

    let mut direct = output
        .create_entry(Entry::file("first.log", 9), None)
        .unwrap();
    direct.write_all(b"123456789").unwrap();

    // A second sized entry needs the sink immediately: refused while the
    // direct stream holds it.
    assert!(matches!(
        output
            .create_entry(Entry::file("refused.log", 1), None)
            .map(|_| ()),
        Err(CofferError::Busy { .. })
    ));

    // Unknown-size entries spool and wait for the sink.
    let mut spooled = output.create_entry(Entry::draft("second.log"), None).unwrap();
    spooled.write_all(b"spooled bytes").unwrap();
    let second = spooled.close().unwrap();
    assert_eq!(second.size, Some(13));

    direct.close().unwrap();
    drop(direct);
    drop(spooled);
    output.finish().unwrap();

    let input = driver.open_input(ContainerFormat::Tar, &path).unwrap();
    let names: Vec<&str> = input.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["first.log", "second.log"]);
}

#[test]
fn test_sequential_reader_cleans_spool_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("spooled.tar");
    let driver = Driver::new(DriverConfig::default());

    let mut output = driver
        .create_output(ContainerFormat::Tar, &path, None)
        .unwrap();
    {
        let mut stream = output.create_entry(Entry::file("a.txt", 3), None).unwrap();
        stream.write_all(b"abc").unwrap();
        stream.close().unwrap();
    }
    output.finish().unwrap();

    let mut input = driver.open_input(ContainerFormat::Tar, &path).unwrap();
    {
        let mut stream = input.open_entry("a.txt").unwrap();
        let mut content = Vec::new();
        stream.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"abc");
    }
    input.close().unwrap();
    // Nothing was left behind for the caller to clean up later.
    assert!(input.deferred().is_empty());
    // The index stays browsable after close; only entry data is gone.
    assert!(input.open_entry("a.txt").is_err());
}

#[test]
fn test_missing_entry_reports_not_found() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("small.zip");
    let driver = Driver::new(DriverConfig::default());
    build_zip(&driver, &path, &[("present.txt", b"x")]);

    let mut input = driver.open_input(ContainerFormat::Zip, &path).unwrap();
    match input.open_entry("absent.txt") {
        Err(CofferError::NotFound { name }) => assert_eq!(name, "absent.txt"),
        other => panic!("expected not-found, got {:?}", other.map(|_| ())),
    };
}
