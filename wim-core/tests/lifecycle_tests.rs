mod support;

use std::path::Path;
use std::sync::Arc;

use support::{CountingEngine, TestResult};
use wim_core::error::status;
use wim_core::{
    CompressionType, Destination, Engine, InitFlags, Library, OpenFlags, ProgressContext,
    ProgressInfo, ProgressMsg, ProgressStatus, RefFlags, ResourceRef, Version, VerifyFlags,
    WimError, WriteOptions, status_to_message,
};

const SCRIPT: [ProgressMsg; 3] = [
    ProgressMsg::ScanBegin,
    ProgressMsg::ScanDentry,
    ProgressMsg::ScanEnd,
];

fn stub() -> (Arc<CountingEngine>, Library) {
    let engine = Arc::new(CountingEngine::scripted(SCRIPT.to_vec()));
    let lib = Library::with_engine(engine.clone());
    (engine, lib)
}

#[test]
fn write_without_destination_never_reaches_the_engine() -> TestResult {
    let (engine, lib) = stub();
    let wim = lib.create(CompressionType::Lzx)?;
    match wim.write(None, WriteOptions::default()) {
        Err(WimError::Configuration { code, .. }) => assert_eq!(code, status::INVALID_PARAM),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(CountingEngine::count(&engine.writes), 0);

    wim.write(Some(Destination::from("out.wim")), WriteOptions::default())?;
    assert_eq!(CountingEngine::count(&engine.writes), 1);
    assert_eq!(CountingEngine::count(&engine.overwrites), 0);
    Ok(())
}

#[test]
fn opened_archive_is_rewritten_in_place() -> TestResult {
    let (engine, lib) = stub();
    let wim = lib.open(Path::new("existing.wim"), OpenFlags::NONE)?;
    assert!(wim.has_backing_file());
    wim.write(Some(Destination::from("elsewhere.wim")), WriteOptions::default())?;
    wim.write(None, WriteOptions::default())?;
    assert_eq!(CountingEngine::count(&engine.overwrites), 2);
    assert_eq!(CountingEngine::count(&engine.writes), 0);
    Ok(())
}

#[test]
fn release_frees_the_session_once() -> TestResult {
    let (engine, lib) = stub();
    let mut wim = lib.create(CompressionType::Xpress)?;
    wim.release();
    wim.release();
    assert!(wim.is_released());
    drop(wim);
    assert_eq!(CountingEngine::count(&engine.frees), 1);

    let other = lib.create(CompressionType::Xpress)?;
    drop(other);
    assert_eq!(CountingEngine::count(&engine.frees), 2);
    Ok(())
}

#[test]
fn codec_sessions_are_freed_once() -> TestResult {
    let (engine, lib) = stub();
    let mut compressor = lib.compressor(CompressionType::Lzx, 4096, 0)?;
    let mut decompressor = lib.decompressor(CompressionType::Xpress, 4096)?;
    assert!(compressor.is_live() && decompressor.is_live());

    compressor.release();
    compressor.release();
    decompressor.release();
    decompressor.release();
    drop(compressor);
    drop(decompressor);
    assert_eq!(CountingEngine::count(&engine.compressor_frees), 1);
    assert_eq!(CountingEngine::count(&engine.decompressor_frees), 1);

    // dropping a live session frees it; a deferred one never reached the engine
    drop(lib.compressor(CompressionType::Lzx, 4096, 0)?);
    drop(lib.deferred_decompressor(CompressionType::Lzx, 4096)?);
    assert_eq!(CountingEngine::count(&engine.compressor_frees), 2);
    assert_eq!(CountingEngine::count(&engine.decompressor_frees), 1);
    Ok(())
}

#[test]
fn referenced_archive_outlives_its_handle() -> TestResult {
    let (engine, lib) = stub();
    let base = lib.create(CompressionType::Lzx)?;
    let delta = lib.create(CompressionType::Lzx)?;
    delta.reference_resources(&[ResourceRef::from(&base)], RefFlags::NONE, OpenFlags::NONE)?;

    drop(base);
    assert_eq!(CountingEngine::count(&engine.frees), 0);
    drop(delta);
    // the referencing session goes first, then what it was holding
    assert_eq!(*engine.freed.lock().unwrap(), vec![2, 1]);
    Ok(())
}

#[test]
fn init_and_cleanup_each_run_once() -> TestResult {
    let (engine, lib) = stub();
    assert!(!lib.is_initialized());
    lib.init(InitFlags::NONE)?;
    lib.init(InitFlags::DONT_ACQUIRE_PRIVILEGES)?;
    assert!(lib.is_initialized());
    assert_eq!(CountingEngine::count(&engine.inits), 1);

    lib.cleanup();
    lib.cleanup();
    assert!(!lib.is_initialized());
    assert_eq!(CountingEngine::count(&engine.cleanups), 1);

    match lib.init(InitFlags::NONE) {
        Err(WimError::Configuration { .. }) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(lib.create(CompressionType::Lzx).is_err());
    assert_eq!(CountingEngine::count(&engine.inits), 1);
    Ok(())
}

#[test]
fn first_use_initializes_lazily() -> TestResult {
    let (engine, lib) = stub();
    let _wim = lib.create(CompressionType::Lzms)?;
    let _again = lib.open(Path::new("x.wim"), OpenFlags::NONE)?;
    assert_eq!(CountingEngine::count(&engine.inits), 1);
    assert!(lib.is_initialized());
    Ok(())
}

#[test]
fn cleanup_before_init_releases_nothing() {
    let (engine, lib) = stub();
    lib.cleanup();
    assert_eq!(CountingEngine::count(&engine.cleanups), 0);
    assert!(lib.init(InitFlags::NONE).is_err());
}

#[test]
fn version_is_decoded_from_the_packed_form() {
    let (_engine, lib) = stub();
    let version = lib.version();
    assert_eq!(
        version,
        Version {
            major: 1,
            minor: 14,
            patch: 4
        }
    );
    assert_eq!(version.to_string(), "1.14.4");
}

#[cfg(not(feature = "native"))]
#[test]
fn global_library_defaults_to_the_portable_engine() -> TestResult {
    wim_core::initialize(InitFlags::NONE)?;
    wim_core::initialize(InitFlags::NONE)?;
    assert_eq!(wim_core::library().engine().name(), "portable");
    assert_eq!(wim_core::version().to_string(), "0.1.0");
    Ok(())
}

#[test]
fn progress_events_arrive_in_engine_order() -> TestResult {
    let (engine, lib) = stub();
    let wim = lib.create(CompressionType::Lzx)?;

    let mut handler = |msg: ProgressMsg,
                       info: &ProgressInfo,
                       seen: &mut Vec<ProgressMsg>|
     -> Option<ProgressStatus> {
        assert_eq!(info, &ProgressInfo::Empty);
        seen.push(msg);
        None
    };
    let mut seen = Vec::new();
    let mut ctx = ProgressContext::new(&mut handler, &mut seen);
    wim.verify_with_progress(VerifyFlags::NONE, &mut ctx)?;
    assert_eq!(ctx.events_delivered(), 3);
    assert_eq!(ctx.last_status(), ProgressStatus::Continue);
    assert_eq!(seen, SCRIPT.to_vec());
    assert_eq!(*engine.delivered.lock().unwrap(), SCRIPT.to_vec());
    Ok(())
}

#[test]
fn abort_stops_delivery_and_fails_the_call() -> TestResult {
    let (engine, lib) = stub();
    let wim = lib.create(CompressionType::Lzx)?;

    let mut handler = |msg: ProgressMsg, _: &ProgressInfo, seen: &mut Vec<ProgressMsg>| {
        seen.push(msg);
        (msg == ProgressMsg::ScanDentry).then_some(ProgressStatus::Abort)
    };
    let mut seen = Vec::new();
    let mut ctx = ProgressContext::new(&mut handler, &mut seen);
    let err = wim.verify_with_progress(VerifyFlags::NONE, &mut ctx).unwrap_err();
    match err {
        WimError::Integrity { code, message } => {
            assert_eq!(code, status::ABORTED_BY_PROGRESS);
            assert_eq!(message, status::describe(status::ABORTED_BY_PROGRESS));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(seen, vec![ProgressMsg::ScanBegin, ProgressMsg::ScanDentry]);
    assert_eq!(engine.delivered.lock().unwrap().len(), 2);
    Ok(())
}

#[test]
fn other_statuses_are_passed_through_verbatim() -> TestResult {
    let (_engine, lib) = stub();
    let wim = lib.create(CompressionType::Lzx)?;
    let mut handler =
        |_: ProgressMsg, _: &ProgressInfo, _: &mut ()| Some(ProgressStatus::Other(7));
    let mut unit = ();
    let mut ctx = ProgressContext::new(&mut handler, &mut unit);
    let err = wim.verify_with_progress(VerifyFlags::NONE, &mut ctx).unwrap_err();
    assert_eq!(ctx.last_status(), ProgressStatus::Other(7));
    assert_eq!(err.code(), Some(status::UNKNOWN_PROGRESS_STATUS));
    Ok(())
}

#[test]
fn no_handler_means_no_events() -> TestResult {
    let (engine, lib) = stub();
    let wim = lib.create(CompressionType::Lzx)?;
    wim.verify(VerifyFlags::NONE)?;
    assert!(engine.delivered.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn image_views_follow_the_engine_count() -> TestResult {
    let engine = Arc::new(CountingEngine::with_images(3));
    let lib = Library::with_engine(engine);
    let wim = lib.create(CompressionType::Lzx)?;
    assert_eq!(wim.images().count()?, 3);
    let indices: Vec<u32> = wim.images().iter()?.map(|image| image.index()).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    match wim.images().get(4) {
        Err(WimError::IndexOutOfRange { index: 4, count: 3 }) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(image) => panic!("resolved image {}", image.index()),
    }
    Ok(())
}

#[test]
fn messages_fall_back_to_the_built_in_table() {
    let engine = CountingEngine::default();
    assert_eq!(
        status_to_message(&engine, status::OPEN),
        "Failed to open a file"
    );
    assert_eq!(status_to_message(&engine, 12345), "Unknown error");
    assert_eq!(
        engine.error_string(status::WIM_IS_READONLY),
        status::describe(status::WIM_IS_READONLY)
    );
}

#[test]
fn unsupported_operations_surface_as_typed_errors() -> TestResult {
    let (_engine, lib) = stub();
    match lib.set_print_errors(true) {
        Err(WimError::Configuration { code, .. }) => assert_eq!(code, status::UNSUPPORTED),
        other => panic!("unexpected result: {other:?}"),
    }
    let file = tempfile::tempfile()?;
    match lib.set_error_file_handle(&file) {
        Err(WimError::NotSupported(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    match lib.compressor(CompressionType::Lzms, 4096, 0) {
        Err(WimError::Configuration { code, .. }) => assert_eq!(code, status::UNSUPPORTED),
        other => panic!("unexpected result: {:?}", other.map(|c| c.is_live())),
    }
    let wim = lib.create(CompressionType::Lzx)?;
    match wim.xml_data() {
        Err(WimError::Archive { code, .. }) => assert_eq!(code, status::UNSUPPORTED),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}
