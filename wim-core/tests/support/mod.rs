#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use wim_core::engine::{
    Engine, ProgressSink, RawCompressor, RawDecompressor, RawWim, RawWimInfo,
};
use wim_core::error::status;
use wim_core::{ProgressInfo, ProgressMsg};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

const LZMS: i32 = 3;

/// Engine stub that counts lifecycle calls and fires a fixed script of
/// progress events from `verify`.
#[derive(Default)]
pub struct CountingEngine {
    pub inits: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub frees: AtomicUsize,
    /// Raw ids in the order they were freed.
    pub freed: Mutex<Vec<u64>>,
    pub writes: AtomicUsize,
    pub overwrites: AtomicUsize,
    pub compressor_frees: AtomicUsize,
    pub decompressor_frees: AtomicUsize,
    pub image_count: u32,
    pub script: Vec<ProgressMsg>,
    /// Messages the stub actually delivered, in order.
    pub delivered: Mutex<Vec<ProgressMsg>>,
    next: AtomicU64,
}

impl CountingEngine {
    pub fn with_images(image_count: u32) -> Self {
        Self {
            image_count,
            ..Self::default()
        }
    }

    pub fn scripted(script: Vec<ProgressMsg>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl Engine for CountingEngine {
    fn name(&self) -> &'static str {
        "counting-stub"
    }

    fn version(&self) -> u32 {
        (1 << 20) | (14 << 10) | 4
    }

    fn global_init(&self, _flags: u32) -> i32 {
        self.inits.fetch_add(1, Ordering::SeqCst);
        status::SUCCESS
    }

    fn global_cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn open(
        &self,
        _path: &Path,
        _open_flags: u32,
        _progress: Option<&mut ProgressSink<'_>>,
    ) -> Result<RawWim, i32> {
        Ok(RawWim(self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn create_new(&self, _compression_type: i32) -> Result<RawWim, i32> {
        Ok(RawWim(self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn free(&self, wim: RawWim) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.freed.lock().unwrap().push(wim.0);
    }

    fn write(
        &self,
        _wim: RawWim,
        _path: &Path,
        _image: i32,
        _write_flags: u32,
        _num_threads: u32,
        _progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        self.writes.fetch_add(1, Ordering::SeqCst);
        status::SUCCESS
    }

    fn overwrite(
        &self,
        _wim: RawWim,
        _write_flags: u32,
        _num_threads: u32,
        _progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        self.overwrites.fetch_add(1, Ordering::SeqCst);
        status::SUCCESS
    }

    fn reference_resources(&self, _wim: RawWim, _resource_wims: &[RawWim], _ref_flags: u32) -> i32 {
        status::SUCCESS
    }

    fn get_info(&self, _wim: RawWim) -> Result<RawWimInfo, i32> {
        Ok(RawWimInfo {
            image_count: self.image_count,
            part_number: 1,
            total_parts: 1,
            ..RawWimInfo::default()
        })
    }

    fn verify(
        &self,
        _wim: RawWim,
        _verify_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        let Some(sink) = progress else {
            return status::SUCCESS;
        };
        for msg in &self.script {
            self.delivered.lock().unwrap().push(*msg);
            match sink(*msg, &ProgressInfo::Empty) {
                0 => {}
                1 => return status::ABORTED_BY_PROGRESS,
                _ => return status::UNKNOWN_PROGRESS_STATUS,
            }
        }
        status::SUCCESS
    }

    // LZMS sessions are refused; every other type gets a fresh id
    fn create_compressor(
        &self,
        compression_type: i32,
        _max_block_size: usize,
        _level: u32,
    ) -> Result<RawCompressor, i32> {
        if compression_type == LZMS {
            return Err(status::UNSUPPORTED);
        }
        Ok(RawCompressor(self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn compress(&self, _compressor: RawCompressor, _input: &[u8], _output: &mut [u8]) -> usize {
        0
    }

    fn free_compressor(&self, _compressor: RawCompressor) {
        self.compressor_frees.fetch_add(1, Ordering::SeqCst);
    }

    fn create_decompressor(
        &self,
        compression_type: i32,
        _max_block_size: usize,
    ) -> Result<RawDecompressor, i32> {
        if compression_type == LZMS {
            return Err(status::UNSUPPORTED);
        }
        Ok(RawDecompressor(self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn decompress(&self, _decompressor: RawDecompressor, input: &[u8], output: &mut [u8]) -> i32 {
        if input.len() != output.len() {
            return status::DECOMPRESSION;
        }
        output.copy_from_slice(input);
        status::SUCCESS
    }

    fn free_decompressor(&self, _decompressor: RawDecompressor) {
        self.decompressor_frees.fetch_add(1, Ordering::SeqCst);
    }

    fn compressor_needed_memory(&self, _ctype: i32, _max_block_size: usize, _level: u32) -> u64 {
        0
    }
}

/// Lays out a small tree: two files with identical contents, one empty file
/// and one larger, compressible file in a subdirectory.
pub fn populate(root: &Path) -> std::io::Result<()> {
    fs::create_dir_all(root.join("docs/nested"))?;
    fs::write(root.join("readme.txt"), b"portable archive test\n".repeat(20))?;
    fs::write(root.join("docs/copy.txt"), b"portable archive test\n".repeat(20))?;
    fs::write(root.join("docs/empty.bin"), b"")?;
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(root.join("docs/nested/big.bin"), big)?;
    Ok(())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
