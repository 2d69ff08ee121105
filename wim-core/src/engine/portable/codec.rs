//! Block codecs for the portable engine.
//!
//! Each compression family maps onto zstd at its own level band, so the
//! families keep their usual speed/ratio ordering: XPRESS fastest, LZMS
//! strongest. `None` never compresses.

use crate::error::status;

pub(crate) const NONE: i32 = 0;
pub(crate) const XPRESS: i32 = 1;
pub(crate) const LZX: i32 = 2;
pub(crate) const LZMS: i32 = 3;

pub(crate) const DEFAULT_LEVEL: u32 = 50;

pub(crate) fn is_valid_type(ctype: i32) -> bool {
    (NONE..=LZMS).contains(&ctype)
}

/// Largest block a compressor of this family accepts; 0 for `None`.
pub(crate) fn max_block_size(ctype: i32) -> usize {
    match ctype {
        XPRESS => 1 << 16,
        LZX => 1 << 21,
        LZMS => 1 << 30,
        _ => 0,
    }
}

/// Power-of-two chunk sizes an archive may use with this family.
pub(crate) fn chunk_size_range(ctype: i32) -> (u32, u32) {
    match ctype {
        XPRESS => (1 << 12, 1 << 16),
        LZX => (1 << 15, 1 << 21),
        LZMS => (1 << 15, 1 << 30),
        _ => (1 << 12, 1 << 30),
    }
}

pub(crate) fn default_chunk_size(ctype: i32) -> u32 {
    match ctype {
        LZMS => 1 << 17,
        _ => 1 << 15,
    }
}

pub(crate) fn is_valid_chunk_size(ctype: i32, chunk_size: u32) -> bool {
    let (min, max) = chunk_size_range(ctype);
    chunk_size.is_power_of_two() && (min..=max).contains(&chunk_size)
}

pub(crate) fn zstd_level(ctype: i32, level: u32) -> i32 {
    let level = level.min(1000) as i32;
    match ctype {
        XPRESS => (1 + level / 25).clamp(1, 6),
        LZX => (3 + level / 10).clamp(3, 15),
        _ => (9 + level / 10).clamp(9, 22),
    }
}

/// Compresses `input` into `output`. Returns 0 when the result would not fit
/// or when `ctype` stores verbatim.
pub(crate) fn compress_block(ctype: i32, level: u32, input: &[u8], output: &mut [u8]) -> usize {
    if ctype == NONE || input.is_empty() {
        return 0;
    }
    zstd::bulk::compress_to_buffer(input, output, zstd_level(ctype, level)).unwrap_or(0)
}

/// Restores exactly `output.len()` bytes from `input`.
pub(crate) fn decompress_block(ctype: i32, input: &[u8], output: &mut [u8]) -> Result<(), i32> {
    if ctype == NONE {
        if input.len() != output.len() {
            return Err(status::DECOMPRESSION);
        }
        output.copy_from_slice(input);
        return Ok(());
    }
    match zstd::bulk::decompress_to_buffer(input, output) {
        Ok(n) if n == output.len() => Ok(()),
        _ => Err(status::DECOMPRESSION),
    }
}

/// Rough upper bound on memory held by one compressor. Zero marks an
/// invalid combination.
pub(crate) fn needed_memory(ctype: i32, block: usize, level: u32) -> u64 {
    if !matches!(ctype, XPRESS | LZX | LZMS) {
        return 0;
    }
    if block == 0 || block > max_block_size(ctype) {
        return 0;
    }
    let zl = zstd_level(ctype, level.max(1)) as u64;
    let window = (block as u64).next_power_of_two();
    // input copy + output buffer + match finder tables that grow with level
    window * 2 + (window / 4) * zl + 64 * 1024
}

pub(crate) fn type_name(ctype: i32) -> &'static str {
    match ctype {
        NONE => "None",
        XPRESS => "XPRESS",
        LZX => "LZX",
        LZMS => "LZMS",
        _ => "Invalid",
    }
}
