//! Standalone compressor and decompressor sessions.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::engine::{Engine, RawCompressor, RawDecompressor};
use crate::error::{ErrorChannel, ErrorKind, Result, WimError, status};
use crate::global::library;

/// Set in the compressor flags to allow the engine to clobber its input.
pub const COMPRESSOR_FLAG_DESTRUCTIVE: u32 = 0x8000_0000;

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionType {
    None = 0,
    Xpress = 1,
    Lzx = 2,
    Lzms = 3,
}

impl CompressionType {
    pub const ALL: [Self; 4] = [Self::None, Self::Xpress, Self::Lzx, Self::Lzms];

    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Xpress),
            2 => Some(Self::Lzx),
            3 => Some(Self::Lzms),
            _ => None,
        }
    }

    /// Chunk size archives use for this type unless told otherwise.
    pub const fn default_chunk_size(self) -> u32 {
        match self {
            Self::None | Self::Xpress | Self::Lzx => 32 * 1024,
            Self::Lzms => 128 * 1024,
        }
    }
}

impl TryFrom<i32> for CompressionType {
    type Error = WimError;

    fn try_from(raw: i32) -> Result<Self> {
        Self::from_raw(raw).ok_or_else(|| WimError::Configuration {
            code: status::INVALID_COMPRESSION_TYPE,
            message: format!(
                "{} (got {raw})",
                status::describe(status::INVALID_COMPRESSION_TYPE)
            ),
        })
    }
}

/// Outcome of compressing one block.
///
/// The engine reports zero bytes written when the block would not shrink.
/// That case is [`CompressedBlock::Stored`]: the block must be kept verbatim,
/// and a payload as long as the original is read back as stored data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompressedBlock {
    Compressed(Vec<u8>),
    Stored,
}

impl CompressedBlock {
    /// Bytes the engine wrote; zero for a stored block.
    pub fn written_size(&self) -> usize {
        match self {
            Self::Compressed(bytes) => bytes.len(),
            Self::Stored => 0,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored)
    }

    /// The bytes to keep for this block given the input it came from.
    pub fn payload<'a>(&'a self, input: &'a [u8]) -> &'a [u8] {
        match self {
            Self::Compressed(bytes) => bytes,
            Self::Stored => input,
        }
    }
}

/// One compressor session, parameterized by type, block size and level.
pub struct Compressor {
    engine: Arc<dyn Engine>,
    raw: Option<RawCompressor>,
    compression_type: CompressionType,
    block_size: usize,
    level: u32,
    _not_sync: PhantomData<Cell<()>>,
}

impl Compressor {
    /// Creates the session on the global library's engine.
    pub fn new(compression_type: CompressionType, block_size: usize, level: u32) -> Result<Self> {
        library().compressor(compression_type, block_size, level)
    }

    /// Records the parameters without creating the session; call
    /// [`Compressor::create`] before compressing.
    pub fn deferred(compression_type: CompressionType, block_size: usize, level: u32) -> Self {
        Self::with_engine(library().engine().clone(), compression_type, block_size, level)
    }

    pub(crate) fn with_engine(
        engine: Arc<dyn Engine>,
        compression_type: CompressionType,
        block_size: usize,
        level: u32,
    ) -> Self {
        Self {
            engine,
            raw: None,
            compression_type,
            block_size,
            level,
            _not_sync: PhantomData,
        }
    }

    /// Creates the engine session. A live session is kept as is.
    pub fn create(&mut self) -> Result<()> {
        if self.raw.is_some() {
            return Ok(());
        }
        let raw = self
            .engine
            .create_compressor(self.compression_type.as_raw(), self.block_size, self.level)
            .map_err(|code| session_error(self.engine.as_ref(), ErrorKind::Compression, code))?;
        debug!(
            ctype = ?self.compression_type,
            block_size = self.block_size,
            level = self.level,
            "created compressor"
        );
        self.raw = Some(raw);
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.raw.is_some()
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Compresses one block of at most `block_size` bytes.
    pub fn compress(&self, data: &[u8]) -> Result<CompressedBlock> {
        let raw = self.raw.ok_or_else(|| WimError::Compression {
            code: status::INVALID_PARAM,
            message: "compressor session is not live".to_string(),
        })?;
        if data.len() > self.block_size {
            return Err(WimError::Compression {
                code: status::INVALID_PARAM,
                message: format!(
                    "block of {} bytes exceeds the session block size of {}",
                    data.len(),
                    self.block_size
                ),
            });
        }
        let mut out = vec![0u8; self.block_size];
        let written = self.engine.compress(raw, data, &mut out);
        // a block that did not shrink is stored; keeps the length rule for readers unambiguous
        if written == 0 || written >= data.len() {
            return Ok(CompressedBlock::Stored);
        }
        out.truncate(written);
        Ok(CompressedBlock::Compressed(out))
    }

    pub fn needed_memory(&self) -> Result<u64> {
        needed_memory_with(
            self.engine.as_ref(),
            self.compression_type,
            self.block_size,
            self.level,
        )
    }

    /// Frees the session. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            debug!(ctype = ?self.compression_type, "releasing compressor");
            self.engine.free_compressor(raw);
        }
    }
}

impl Drop for Compressor {
    fn drop(&mut self) {
        self.release();
    }
}

/// One decompressor session.
pub struct Decompressor {
    engine: Arc<dyn Engine>,
    raw: Option<RawDecompressor>,
    compression_type: CompressionType,
    block_size: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl Decompressor {
    pub fn new(compression_type: CompressionType, block_size: usize) -> Result<Self> {
        library().decompressor(compression_type, block_size)
    }

    pub fn deferred(compression_type: CompressionType, block_size: usize) -> Self {
        Self::with_engine(library().engine().clone(), compression_type, block_size)
    }

    pub(crate) fn with_engine(
        engine: Arc<dyn Engine>,
        compression_type: CompressionType,
        block_size: usize,
    ) -> Self {
        Self {
            engine,
            raw: None,
            compression_type,
            block_size,
            _not_sync: PhantomData,
        }
    }

    pub fn create(&mut self) -> Result<()> {
        if self.raw.is_some() {
            return Ok(());
        }
        let raw = self
            .engine
            .create_decompressor(self.compression_type.as_raw(), self.block_size)
            .map_err(|code| session_error(self.engine.as_ref(), ErrorKind::Decompression, code))?;
        debug!(ctype = ?self.compression_type, block_size = self.block_size, "created decompressor");
        self.raw = Some(raw);
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.raw.is_some()
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Restores a block to exactly `original_size` bytes. A payload already
    /// that long is a stored block and comes back unchanged.
    pub fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        let raw = self.raw.ok_or_else(|| WimError::Decompression {
            code: status::INVALID_PARAM,
            message: "decompressor session is not live".to_string(),
        })?;
        if original_size > self.block_size {
            return Err(WimError::Decompression {
                code: status::INVALID_PARAM,
                message: format!(
                    "original size {original_size} exceeds the session block size of {}",
                    self.block_size
                ),
            });
        }
        if data.len() == original_size {
            return Ok(data.to_vec());
        }
        let mut out = vec![0u8; original_size];
        let code = self.engine.decompress(raw, data, &mut out);
        ErrorChannel::new(self.engine.as_ref()).check(ErrorKind::Decompression, code)?;
        Ok(out)
    }

    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            debug!(ctype = ?self.compression_type, "releasing decompressor");
            self.engine.free_decompressor(raw);
        }
    }
}

impl Drop for Decompressor {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) fn needed_memory_with(
    engine: &dyn Engine,
    compression_type: CompressionType,
    block_size: usize,
    level: u32,
) -> Result<u64> {
    match engine.compressor_needed_memory(compression_type.as_raw(), block_size, level) {
        0 => Err(WimError::Configuration {
            code: status::INVALID_PARAM,
            message: format!(
                "compression type {} cannot be used with block size {block_size} at level {level}",
                engine.compression_type_string(compression_type.as_raw())
            ),
        }),
        bytes => Ok(bytes),
    }
}

/// Estimated memory a compressor with these parameters needs.
pub fn needed_memory(compression_type: CompressionType, block_size: usize, level: u32) -> Result<u64> {
    needed_memory_with(library().engine().as_ref(), compression_type, block_size, level)
}

/// Sets the level used when a compressor is created with level 0; `None`
/// applies it to every type.
pub fn set_default_compression_level(
    compression_type: Option<CompressionType>,
    level: u32,
) -> Result<()> {
    library().set_default_compression_level(compression_type, level)
}

pub fn compression_type_name(compression_type: CompressionType) -> &'static str {
    library()
        .engine()
        .compression_type_string(compression_type.as_raw())
}

/// Failure to open a codec session. A rejected type or block size is a
/// configuration problem, anything else belongs to the codec.
fn session_error(engine: &dyn Engine, kind: ErrorKind, code: i32) -> WimError {
    let kind = match code {
        status::INVALID_PARAM | status::UNSUPPORTED | status::INVALID_COMPRESSION_TYPE => {
            ErrorKind::Configuration
        }
        _ => kind,
    };
    ErrorChannel::new(engine).error(kind, code)
}
