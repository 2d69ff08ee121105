mod support;

use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use support::{TestResult, populate};
use wim_core::error::status;
use wim_core::{
    ALL_IMAGES, AddFlags, CompressionType, Destination, ExportFlags, ExtractFlags, ImageSelector,
    IterateFlags, Library, NO_IMAGE, OpenFlags, ProgressContext, ProgressInfo, ProgressMsg,
    ProgressStatus, RefFlags, ResourceEntry, ResourceRef, VerifyFlags, WimError, WimFile,
    WriteFlags, WriteOptions,
};

const TREE: [&str; 4] = [
    "readme.txt",
    "docs/copy.txt",
    "docs/empty.bin",
    "docs/nested/big.bin",
];

fn assert_same_tree(expected: &Path, actual: &Path) {
    for rel in TREE {
        let want = fs::read(expected.join(rel)).unwrap();
        let got = fs::read(actual.join(rel)).unwrap_or_else(|e| panic!("{rel}: {e}"));
        assert_eq!(got, want, "{rel} differs after extraction");
    }
}

/// Captures `src` as image "first" into a new LZX archive at `out`.
fn write_captured(lib: &Library, src: &Path, out: &Path) -> Result<(), WimError> {
    let wim = lib.create(CompressionType::Lzx)?;
    wim.add_image(src, "first", AddFlags::NONE)?;
    wim.write_to(out)
}

fn resources(wim: &WimFile) -> Result<Vec<ResourceEntry>, WimError> {
    let mut out = Vec::new();
    wim.iterate_resources(IterateFlags::NONE, |entry| {
        out.push(entry.clone());
        ControlFlow::Continue(())
    })?;
    Ok(out)
}

type Seen = Vec<ProgressMsg>;

fn recorder(msg: ProgressMsg, _: &ProgressInfo, seen: &mut Seen) -> Option<ProgressStatus> {
    seen.push(msg);
    None
}

#[test]
fn empty_archive_survives_a_write_and_reopen() -> TestResult {
    let dir = tempfile::tempdir()?;
    let lib = Library::portable();
    let wim = lib.create(CompressionType::Lzx)?;
    assert!(!wim.has_backing_file());
    assert_eq!(wim.path(), None);
    assert_eq!(wim.images().count()?, 0);
    assert!(wim.images().is_empty()?);

    let out = dir.path().join("out.wim");
    wim.write_to(&out)?;

    let reopened = lib.open(&out, OpenFlags::NONE)?;
    assert!(reopened.has_backing_file());
    assert_eq!(reopened.path(), Some(out.as_path()));
    let info = reopened.info()?;
    assert_eq!(info.image_count(), 0);
    assert_eq!(info.compression_type(), Some(CompressionType::Lzx));
    assert!(info.opened_from_file());
    assert_eq!((info.part_number(), info.total_parts()), (1, 1));
    Ok(())
}

#[test]
fn opening_a_missing_file_reports_an_archive_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let lib = Library::portable();
    let err = lib.open(&dir.path().join("nope.wim"), OpenFlags::NONE).unwrap_err();
    match err {
        WimError::Archive { code, message } => {
            assert_eq!(code, status::OPEN);
            assert!(!message.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn opening_a_foreign_file_is_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("plain.txt");
    fs::write(&path, b"just some text, no archive here")?;
    let err = Library::portable().open(&path, OpenFlags::NONE).unwrap_err();
    assert_eq!(err.code(), Some(status::NOT_A_WIM_FILE));
    Ok(())
}

#[test]
fn sentinel_indices_never_name_an_image() -> TestResult {
    let lib = Library::portable();
    let wim = lib.create(CompressionType::Xpress)?;
    wim.add_empty_image("only")?;
    for index in [ALL_IMAGES, NO_IMAGE, 2] {
        match wim.images().get(index) {
            Err(WimError::IndexOutOfRange { index: got, count }) => {
                assert_eq!(got, i64::from(index));
                assert_eq!(count, 1);
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(image) => panic!("index {index} resolved to image {}", image.index()),
        }
    }
    assert_eq!(wim.images().get(1)?.name()?.as_deref(), Some("only"));
    Ok(())
}

#[test]
fn concrete_selectors_never_widen_to_every_image() -> TestResult {
    let dir = tempfile::tempdir()?;
    let lib = Library::portable();
    let wim = lib.create(CompressionType::Xpress)?;
    wim.add_empty_image("first")?;
    wim.add_empty_image("second")?;
    let dest = lib.create(CompressionType::Xpress)?;

    let target = dir.path().join("out");
    for index in [u32::MAX, 0, 1 << 31, 3] {
        let selector = ImageSelector::Index(index);
        let results = [
            wim.extract_image(selector, &target, ExtractFlags::NONE),
            wim.delete_image(selector),
            wim.export_image(selector, &dest, None, None, ExportFlags::NONE),
        ];
        for result in results {
            match result {
                Err(WimError::IndexOutOfRange { index: got, count }) => {
                    assert_eq!(got, i64::from(index));
                    assert_eq!(count, 2);
                }
                other => panic!("index {index}: unexpected result {other:?}"),
            }
        }
    }
    assert!(!target.exists());
    assert_eq!(wim.images().count()?, 2);
    assert_eq!(dest.images().count()?, 0);
    Ok(())
}

#[test]
fn corrupt_resource_size_is_rejected_on_open() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let out = dir.path().join("out.wim");
    let lib = Library::portable();
    write_captured(&lib, &src, &out)?;

    // superblock keeps the manifest length at 24..32; the table follows the
    // manifest and each entry stores its uncompressed size at 36..44
    let mut bytes = fs::read(&out)?;
    let manifest_len = u64::from_le_bytes(bytes[24..32].try_into()?) as usize;
    let entry = 48 + manifest_len;
    bytes[entry + 36..entry + 44].copy_from_slice(&u64::MAX.to_le_bytes());
    fs::write(&out, &bytes)?;

    match lib.open(&out, OpenFlags::NONE) {
        Err(WimError::Archive { code, .. }) => {
            assert_eq!(code, status::INVALID_LOOKUP_TABLE_ENTRY)
        }
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("corrupt archive opened"),
    }
    Ok(())
}

#[test]
fn in_memory_archive_needs_a_destination() -> TestResult {
    let wim = Library::portable().create(CompressionType::Lzx)?;
    match wim.write(None, WriteOptions::default()) {
        Err(WimError::Configuration { .. }) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    match wim.write(Some(Destination::from("")), WriteOptions::default()) {
        Err(WimError::Configuration { .. }) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn captured_tree_extracts_byte_for_byte() -> TestResult {
    support::init_tracing();
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let lib = Library::portable();
    let out = dir.path().join("out.wim");
    write_captured(&lib, &src, &out)?;

    let wim = lib.open(&out, OpenFlags::CHECK_INTEGRITY)?;
    assert_eq!(wim.images().count()?, 1);
    let image = wim.images().get(1)?;
    assert_eq!(image.name()?.as_deref(), Some("first"));
    assert_eq!(image.description()?, None);

    let target = dir.path().join("target");
    image.extract(&target, ExtractFlags::NONE)?;
    assert_same_tree(&src, &target);

    // identical files share one resource; the empty file has none
    let entries = resources(&wim)?;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| !e.is_missing));
    assert!(entries.iter().any(|e| e.reference_count == 2));
    let big = entries
        .iter()
        .find(|e| e.uncompressed_size == 200_000)
        .expect("big.bin resource");
    assert!(big.is_compressed);
    assert!(big.compressed_size < big.uncompressed_size);
    Ok(())
}

#[test]
fn capture_and_extract_report_progress_in_order() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let lib = Library::portable();
    let wim = lib.create(CompressionType::Xpress)?;

    let mut handler = recorder;
    let mut seen = Seen::new();
    let mut ctx = ProgressContext::new(&mut handler, &mut seen);
    let count = wim.add_image_with_progress(&src, "first", AddFlags::NONE, &mut ctx)?;
    assert_eq!(count, 1);
    assert!(ctx.events_delivered() >= 3);
    assert_eq!(seen.first(), Some(&ProgressMsg::ScanBegin));
    assert_eq!(seen.last(), Some(&ProgressMsg::ScanEnd));
    assert!(seen.contains(&ProgressMsg::ScanDentry));

    let mut seen = Seen::new();
    let mut ctx = ProgressContext::new(&mut handler, &mut seen);
    let target = dir.path().join("target");
    wim.images()
        .get(1)?
        .extract_with_progress(&target, ExtractFlags::NONE, &mut ctx)?;
    assert_eq!(
        &seen[..2],
        &[ProgressMsg::ExtractImageBegin, ProgressMsg::ExtractFileStructure]
    );
    assert_eq!(
        &seen[seen.len() - 2..],
        &[ProgressMsg::ExtractMetadata, ProgressMsg::ExtractImageEnd]
    );
    // one streams event per non-empty file
    let streams = seen.iter().filter(|m| **m == ProgressMsg::ExtractStreams).count();
    assert_eq!(streams, 3);
    assert_same_tree(&src, &target);
    Ok(())
}

#[test]
fn extracting_every_image_uses_one_directory_per_image() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let lib = Library::portable();
    let wim = lib.create(CompressionType::Lzx)?;
    assert_eq!(wim.add_image(&src, "first", AddFlags::NONE)?, 1);
    assert_eq!(wim.add_image(&src, "second", AddFlags::BOOT)?, 2);
    assert_eq!(wim.info()?.boot_index(), 2);

    let target = dir.path().join("all");
    wim.extract_image(ImageSelector::All, &target, ExtractFlags::NONE)?;
    assert_same_tree(&src, &target.join("first"));
    assert_same_tree(&src, &target.join("second"));
    Ok(())
}

#[test]
fn clashing_image_directories_fall_back_to_indices() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let wim = Library::portable().create(CompressionType::Xpress)?;
    wim.add_image(&src, "2", AddFlags::NONE)?;
    wim.add_image(&src, "", AddFlags::NONE)?;

    let target = dir.path().join("all");
    wim.extract_image(ImageSelector::All, &target, ExtractFlags::NONE)?;
    let mut dirs: Vec<String> = fs::read_dir(&target)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()?;
    dirs.sort();
    assert_eq!(dirs, ["1", "2"]);
    assert_same_tree(&src, &target.join("1"));
    assert_same_tree(&src, &target.join("2"));
    Ok(())
}

#[test]
fn image_names_must_be_unique() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let wim = Library::portable().create(CompressionType::Lzx)?;
    wim.add_empty_image("taken")?;
    let err = wim.add_image(&src, "taken", AddFlags::NONE).unwrap_err();
    assert_eq!(err.code(), Some(status::IMAGE_NAME_COLLISION));

    let second = wim.add_empty_image("other")?;
    let err = wim.images().get(second as i32)?.set_name("taken").unwrap_err();
    assert_eq!(err.code(), Some(status::IMAGE_NAME_COLLISION));
    // unnamed images never collide
    wim.add_empty_image("")?;
    wim.add_empty_image("")?;
    assert_eq!(wim.images().count()?, 4);
    Ok(())
}

#[test]
fn capturing_a_missing_directory_fails() -> TestResult {
    let dir = tempfile::tempdir()?;
    let wim = Library::portable().create(CompressionType::Lzx)?;
    match wim.add_image(&dir.path().join("absent"), "x", AddFlags::NONE) {
        Err(WimError::Archive { .. }) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(wim.images().count()?, 0);
    Ok(())
}

#[test]
fn deleting_images_reindexes_the_rest() -> TestResult {
    let wim = Library::portable().create(CompressionType::Lzms)?;
    for name in ["a", "b", "c"] {
        wim.add_empty_image(name)?;
    }
    wim.delete_image(ImageSelector::Index(1))?;
    let names: Vec<Option<String>> = wim
        .images()
        .iter()?
        .map(|image| image.name())
        .collect::<Result<_, _>>()?;
    assert_eq!(names, vec![Some("b".to_string()), Some("c".to_string())]);

    match wim.delete_image(ImageSelector::Index(5)) {
        Err(WimError::IndexOutOfRange { index: 5, count: 2 }) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    wim.delete_image(ImageSelector::All)?;
    assert!(wim.images().is_empty()?);
    Ok(())
}

#[test]
fn properties_show_up_in_the_xml_document() -> TestResult {
    let wim = Library::portable().create(CompressionType::Lzx)?;
    let index = wim.add_empty_image("x & y")?;
    let image = wim.images().get(index as i32)?;
    image.set_description("a test image")?;
    image.set_property("WINDOWS/EDITIONID", "Pro")?;
    assert_eq!(image.description()?.as_deref(), Some("a test image"));
    assert_eq!(image.property("WINDOWS/EDITIONID")?.as_deref(), Some("Pro"));

    let xml = wim.xml_data()?;
    assert_eq!(&xml[..2], &[0xff, 0xfe]);
    let units: Vec<u16> = xml[2..]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let text = String::from_utf16(&units)?;
    assert!(text.starts_with("<WIM>"));
    assert!(text.contains("<NAME>x &amp; y</NAME>"));
    assert!(text.contains("<DESCRIPTION>a test image</DESCRIPTION>"));
    assert!(text.contains("<WINDOWS><EDITIONID>Pro</EDITIONID></WINDOWS>"));

    let mut copy = Vec::new();
    wim.extract_xml_data(&mut copy)?;
    assert_eq!(copy, xml.to_vec());

    // an empty value removes the property
    image.set_property("WINDOWS/EDITIONID", "")?;
    assert_eq!(image.property("WINDOWS/EDITIONID")?, None);
    match image.set_property("not valid", "v") {
        Err(WimError::Archive { code, .. }) => assert_eq!(code, status::INVALID_PARAM),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn verify_walks_images_then_streams() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let lib = Library::portable();
    let out = dir.path().join("out.wim");
    write_captured(&lib, &src, &out)?;
    let wim = lib.open(&out, OpenFlags::NONE)?;

    wim.verify(VerifyFlags::NONE)?;

    let mut handler = recorder;
    let mut seen = Seen::new();
    let mut ctx = ProgressContext::new(&mut handler, &mut seen);
    wim.verify_with_progress(VerifyFlags::NONE, &mut ctx)?;
    assert_eq!(
        seen,
        vec![
            ProgressMsg::BeginVerifyImage,
            ProgressMsg::EndVerifyImage,
            ProgressMsg::VerifyStreams,
            ProgressMsg::VerifyStreams,
            ProgressMsg::VerifyStreams,
        ]
    );
    Ok(())
}

#[test]
fn aborting_from_progress_stops_the_operation() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let lib = Library::portable();
    let out = dir.path().join("out.wim");
    write_captured(&lib, &src, &out)?;
    let wim = lib.open(&out, OpenFlags::NONE)?;

    let mut handler = |msg: ProgressMsg, _: &ProgressInfo, seen: &mut Seen| {
        seen.push(msg);
        (msg == ProgressMsg::BeginVerifyImage).then_some(ProgressStatus::Abort)
    };
    let mut seen = Seen::new();
    let mut ctx = ProgressContext::new(&mut handler, &mut seen);
    let err = wim.verify_with_progress(VerifyFlags::NONE, &mut ctx).unwrap_err();
    assert_eq!(ctx.last_status(), ProgressStatus::Abort);
    match err {
        WimError::Integrity { code, .. } => assert_eq!(code, status::ABORTED_BY_PROGRESS),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(seen, vec![ProgressMsg::BeginVerifyImage]);

    // an unrecognized status is not treated as an abort
    let mut odd = |_: ProgressMsg, _: &ProgressInfo, _: &mut ()| Some(ProgressStatus::Other(5));
    let mut unit = ();
    let mut ctx = ProgressContext::new(&mut odd, &mut unit);
    let err = wim.verify_with_progress(VerifyFlags::NONE, &mut ctx).unwrap_err();
    assert_eq!(err.code(), Some(status::UNKNOWN_PROGRESS_STATUS));
    Ok(())
}

#[test]
fn writing_to_a_new_file_gets_a_new_guid_unless_retained() -> TestResult {
    let dir = tempfile::tempdir()?;
    let lib = Library::portable();
    let wim = lib.create(CompressionType::Xpress)?;
    wim.add_empty_image("one")?;
    let guid = wim.info()?.guid();

    let fresh = dir.path().join("fresh.wim");
    wim.write_to(&fresh)?;
    assert_ne!(lib.open(&fresh, OpenFlags::NONE)?.info()?.guid(), guid);

    let kept = dir.path().join("kept.wim");
    let options = WriteOptions {
        flags: WriteFlags::RETAIN_GUID | WriteFlags::CHECK_INTEGRITY,
        threads: 1,
        ..WriteOptions::default()
    };
    wim.write(Some(Destination::from(&kept)), options)?;
    let reopened = lib.open(&kept, OpenFlags::CHECK_INTEGRITY)?;
    let info = reopened.info()?;
    assert_eq!(info.guid(), guid);
    assert_eq!(info.guid_hex().len(), 32);
    assert!(info.has_integrity_table());
    Ok(())
}

#[test]
fn overwrite_in_place_commits_header_changes() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let lib = Library::portable();
    let out = dir.path().join("out.wim");
    write_captured(&lib, &src, &out)?;

    let wim = lib.open(&out, OpenFlags::WRITE_ACCESS)?;
    let mut info = wim.info()?;
    let guid = info.guid();
    assert_eq!(info.boot_index(), 0);
    info.set_boot_index(1);
    info.set_rpfix(true);
    wim.set_info(&info)?;
    wim.add_empty_image("second")?;
    // a backing file means the destination is ignored and the file rewritten
    wim.write(None, WriteOptions::default())?;
    assert_eq!(wim.info()?.image_count(), 2);

    let reopened = lib.open(&out, OpenFlags::CHECK_INTEGRITY)?;
    let info = reopened.info()?;
    assert_eq!(info.guid(), guid);
    assert_eq!(info.boot_index(), 1);
    assert!(info.has_rpfix());
    assert_eq!(info.image_count(), 2);
    let target = dir.path().join("target");
    reopened.extract_image(ImageSelector::Index(1), &target, ExtractFlags::NONE)?;
    assert_same_tree(&src, &target);
    Ok(())
}

#[test]
fn boot_index_past_the_last_image_is_rejected() -> TestResult {
    let wim = Library::portable().create(CompressionType::Lzx)?;
    wim.add_empty_image("only")?;
    let mut info = wim.info()?;
    info.set_boot_index(4);
    let err = wim.set_info(&info).unwrap_err();
    assert_eq!(err.code(), Some(status::INVALID_IMAGE));
    Ok(())
}

#[test]
fn info_snapshot_is_bound_to_its_engine() -> TestResult {
    let a = Library::portable().create(CompressionType::Lzx)?;
    let b = Library::portable().create(CompressionType::Lzx)?;
    let mut info = a.info()?;
    info.set_boot_index(0);
    match b.set_info(&info) {
        Err(WimError::TypeMismatch { .. }) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn readonly_flag_blocks_overwrite_unless_ignored() -> TestResult {
    let dir = tempfile::tempdir()?;
    let lib = Library::portable();
    let out = dir.path().join("out.wim");
    let wim = lib.create(CompressionType::Lzx)?;
    wim.add_empty_image("one")?;
    wim.write_to(&out)?;

    let wim = lib.open(&out, OpenFlags::NONE)?;
    let mut info = wim.info()?;
    info.set_marked_readonly(true);
    wim.set_info(&info)?;
    let options = WriteOptions {
        flags: WriteFlags::IGNORE_READONLY_FLAG,
        ..WriteOptions::default()
    };
    wim.write(None, options)?;

    let reopened = lib.open(&out, OpenFlags::NONE)?;
    let info = reopened.info()?;
    assert!(info.is_marked_readonly());
    assert!(info.is_readonly());
    match reopened.write(None, WriteOptions::default()) {
        Err(WimError::Archive { code, .. }) => assert_eq!(code, status::WIM_IS_READONLY),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn export_shares_resources_with_the_destination() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let lib = Library::portable();
    let a_path = dir.path().join("a.wim");
    write_captured(&lib, &src, &a_path)?;

    let mut source = lib.open(&a_path, OpenFlags::NONE)?;
    let dest = lib.create(CompressionType::Xpress)?;
    source.export_image(
        ImageSelector::Index(1),
        &dest,
        Some("copy"),
        Some("exported"),
        ExportFlags::BOOT,
    )?;
    let err = source
        .export_image(ImageSelector::Index(1), &dest, Some("copy"), None, ExportFlags::NONE)
        .unwrap_err();
    assert_eq!(err.code(), Some(status::IMAGE_NAME_COLLISION));

    // the destination keeps the source alive after the handle goes away
    source.release();
    assert!(source.is_released());

    let image = dest.images().get(1)?;
    assert_eq!(image.name()?.as_deref(), Some("copy"));
    assert_eq!(image.description()?.as_deref(), Some("exported"));
    assert_eq!(dest.info()?.boot_index(), 1);

    let d_path = dir.path().join("d.wim");
    dest.write_to(&d_path)?;
    let target = dir.path().join("target");
    lib.open(&d_path, OpenFlags::NONE)?
        .extract_image(ImageSelector::Index(1), &target, ExtractFlags::NONE)?;
    assert_same_tree(&src, &target);
    Ok(())
}

#[test]
fn export_can_drop_names_and_descriptions() -> TestResult {
    let lib = Library::portable();
    let source = lib.create(CompressionType::Lzx)?;
    let index = source.add_empty_image("named")?;
    source.images().get(index as i32)?.set_description("described")?;
    let dest = lib.create(CompressionType::Lzx)?;
    source.export_image(
        ImageSelector::All,
        &dest,
        None,
        None,
        ExportFlags::NO_NAMES | ExportFlags::NO_DESCRIPTIONS,
    )?;
    let image = dest.images().get(1)?;
    assert_eq!(image.name()?, None);
    assert_eq!(image.description()?, None);

    match source.export_image(ImageSelector::Index(1), &source, None, None, ExportFlags::NONE) {
        Err(WimError::Archive { code, .. }) => assert_eq!(code, status::INVALID_PARAM),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn delta_archive_resolves_resources_through_references() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let lib = Library::portable();
    let base_path = dir.path().join("base.wim");
    write_captured(&lib, &src, &base_path)?;
    let base = lib.open(&base_path, OpenFlags::NONE)?;

    // unchanged files are matched against the template and left out
    let delta = lib.create(CompressionType::Lzx)?;
    delta.add_image(&src, "delta", AddFlags::NONE)?;
    delta.reference_template(1, (1, &base), 0)?;
    let delta_path = dir.path().join("delta.wim");
    let options = WriteOptions {
        flags: WriteFlags::SKIP_EXTERNAL_WIMS,
        ..WriteOptions::default()
    };
    delta.write(Some(Destination::from(&delta_path)), options)?;
    assert!(fs::metadata(&delta_path)?.len() < fs::metadata(&base_path)?.len());

    let reopened = lib.open(&delta_path, OpenFlags::NONE)?;
    let entries = resources(&reopened)?;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.is_missing));
    match reopened.verify(VerifyFlags::NONE) {
        Err(WimError::Integrity { code, .. }) => assert_eq!(code, status::RESOURCE_NOT_FOUND),
        other => panic!("unexpected result: {other:?}"),
    }

    reopened.reference_resources(
        &[ResourceRef::from(base_path.as_path())],
        RefFlags::NONE,
        OpenFlags::NONE,
    )?;
    assert!(resources(&reopened)?.iter().all(|e| !e.is_missing));
    reopened.verify(VerifyFlags::NONE)?;
    let target = dir.path().join("target");
    reopened.extract_image(ImageSelector::Index(1), &target, ExtractFlags::NONE)?;
    assert_same_tree(&src, &target);
    Ok(())
}

#[test]
fn glob_references_follow_the_no_match_flag() -> TestResult {
    let dir = tempfile::tempdir()?;
    let lib = Library::portable();
    let wim = lib.create(CompressionType::Lzx)?;
    let pattern: PathBuf = dir.path().join("*.swm");

    wim.reference_resources(
        &[ResourceRef::from(pattern.clone())],
        RefFlags::GLOB_ENABLE,
        OpenFlags::NONE,
    )?;
    match wim.reference_resources(
        &[ResourceRef::from(pattern)],
        RefFlags::GLOB_ENABLE | RefFlags::GLOB_ERR_ON_NOMATCH,
        OpenFlags::NONE,
    ) {
        Err(WimError::ResourceResolution { code, .. }) => {
            assert_eq!(code, status::GLOB_HAD_NO_MATCHES)
        }
        other => panic!("unexpected result: {other:?}"),
    }
    match wim.reference_resources(&[ResourceRef::from(&wim)], RefFlags::NONE, OpenFlags::NONE) {
        Err(WimError::ResourceResolution { code, .. }) => assert_eq!(code, status::INVALID_PARAM),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn resource_walk_stops_on_a_non_zero_break() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    populate(&src)?;
    let lib = Library::portable();
    let out = dir.path().join("out.wim");
    write_captured(&lib, &src, &out)?;
    let wim = lib.open(&out, OpenFlags::NONE)?;

    let mut visited = 0;
    let err = wim
        .iterate_resources(IterateFlags::NONE, |_| {
            visited += 1;
            ControlFlow::Break(99)
        })
        .unwrap_err();
    assert_eq!(visited, 1);
    assert_eq!(err.code(), Some(99));

    // a zero break keeps going
    let mut visited = 0;
    wim.iterate_resources(IterateFlags::NONE, |_| {
        visited += 1;
        ControlFlow::Break(0)
    })?;
    assert_eq!(visited, 2);
    Ok(())
}

fn noise_file(path: &Path, len: usize, mut seed: u64) -> std::io::Result<()> {
    let bytes: Vec<u8> = (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed >> 24) as u8
        })
        .collect();
    fs::write(path, bytes)
}

#[test]
fn split_writes_numbered_parts() -> TestResult {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("noise");
    fs::create_dir_all(&src)?;
    noise_file(&src.join("a.bin"), 24 * 1024, 0x1234_5678_9abc_def1)?;
    noise_file(&src.join("b.bin"), 24 * 1024, 0x0fed_cba9_8765_4321)?;

    let lib = Library::portable();
    let wim = lib.create(CompressionType::Lzx)?;
    wim.add_image(&src, "noise", AddFlags::NONE)?;

    match wim.split(&dir.path().join("zero.swm"), 0, WriteFlags::NONE) {
        Err(WimError::Configuration { .. }) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    let mut handler = recorder;
    let mut seen = Seen::new();
    let mut ctx = ProgressContext::new(&mut handler, &mut seen);
    let swm = dir.path().join("out.swm");
    wim.split_with_progress(&swm, 16 * 1024, WriteFlags::NONE, &mut ctx)?;
    assert_eq!(
        seen,
        vec![
            ProgressMsg::SplitBeginPart,
            ProgressMsg::SplitEndPart,
            ProgressMsg::SplitBeginPart,
            ProgressMsg::SplitEndPart,
        ]
    );
    assert!(swm.exists());
    assert!(dir.path().join("out2.swm").exists());
    assert!(!dir.path().join("out3.swm").exists());

    match lib.open(&swm, OpenFlags::ERROR_IF_SPLIT) {
        Err(WimError::Archive { code, .. }) => assert_eq!(code, status::IS_SPLIT_WIM),
        other => panic!("unexpected result: {other:?}"),
    }
    let first = lib.open(&swm, OpenFlags::NONE)?;
    let info = first.info()?;
    assert_eq!((info.part_number(), info.total_parts()), (1, 2));
    assert!(info.is_spanned());
    assert!(info.is_readonly());
    Ok(())
}

#[test]
fn output_settings_are_validated_and_applied() -> TestResult {
    let dir = tempfile::tempdir()?;
    let lib = Library::portable();
    let wim = lib.create(CompressionType::Lzx)?;
    wim.add_empty_image("one")?;

    match wim.set_output_chunk_size(1000) {
        Err(WimError::Configuration { code, .. }) => assert_eq!(code, status::INVALID_CHUNK_SIZE),
        other => panic!("unexpected result: {other:?}"),
    }
    wim.set_output_compression_type(CompressionType::Lzms)?;
    wim.set_output_chunk_size(1 << 17)?;
    wim.set_output_pack_compression_type(CompressionType::Xpress)?;
    wim.set_output_pack_chunk_size(1 << 16)?;

    let out = dir.path().join("out.wim");
    wim.write_to(&out)?;
    let info = lib.open(&out, OpenFlags::NONE)?.info()?;
    assert_eq!(info.compression_type(), Some(CompressionType::Lzms));
    assert_eq!(info.chunk_size(), 1 << 17);
    Ok(())
}

#[test]
fn released_handle_rejects_further_calls() -> TestResult {
    let mut wim = Library::portable().create(CompressionType::Lzx)?;
    wim.release();
    wim.release();
    assert!(wim.is_released());
    match wim.info() {
        Err(WimError::Archive { code, .. }) => assert_eq!(code, status::INVALID_PARAM),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}
