//! Small primitives for binary data processing.
//!
//! This module provides:
//! - Unaligned little/big-endian reads (using byteorder)
//! - SIMD-accelerated terminator searches (via memchr)
//! - ULEB128 decoding for export tries
//! - Overflow-checked shifts for size fields read from untrusted headers
//! - Read-only file mapping

use std::fs::File;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::error::{Error, Result};

// =============================================================================
// Fast Unaligned Reads
// =============================================================================

/// Reads a little-endian u32 from a byte slice at the given offset.
///
/// # Panics
///
/// Panics if `offset + 4 > data.len()`.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&data[offset..])
}

/// Reads a big-endian u32 from a byte slice at the given offset.
///
/// Fat headers are always stored big-endian.
///
/// # Panics
///
/// Panics if `offset + 4 > data.len()`.
#[inline(always)]
pub fn read_u32_be_at(data: &[u8], offset: usize) -> u32 {
    BigEndian::read_u32(&data[offset..])
}

/// Reads a big-endian u64 from a byte slice at the given offset.
///
/// # Panics
///
/// Panics if `offset + 8 > data.len()`.
#[inline(always)]
pub fn read_u64_be_at(data: &[u8], offset: usize) -> u64 {
    BigEndian::read_u64(&data[offset..])
}

// =============================================================================
// SIMD-Accelerated Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Returns `data.len()` when the slice holds no terminator.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Returns the bytes of the C string starting at `offset`, without the terminator.
///
/// Returns `None` if `offset` is out of bounds.
#[inline]
pub fn c_str_at(data: &[u8], offset: usize) -> Option<&[u8]> {
    let bytes = data.get(offset..)?;
    Some(&bytes[..memchr_null(bytes)])
}

// =============================================================================
// ULEB128
// =============================================================================

/// Reads an unsigned LEB128 value with fast paths for common cases.
///
/// - 1-byte values (0-127): single comparison, no loop
/// - 2-byte values (128-16383): two comparisons, no loop
/// - Larger values: fall back to loop
///
/// # Returns
///
/// `(value, bytes_consumed)` or `None` if the encoding is truncated or overflows.
#[inline(always)]
pub fn read_uleb128_fast(data: &[u8]) -> Option<(u64, usize)> {
    let &b0 = data.first()?;
    if b0 < 0x80 {
        return Some((b0 as u64, 1));
    }

    let &b1 = data.get(1)?;
    if b1 < 0x80 {
        let value = ((b0 & 0x7F) as u64) | ((b1 as u64) << 7);
        return Some((value, 2));
    }

    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        let bits = shift_left_u64((byte & 0x7F) as u64, shift)?;
        result |= bits;
        shift += 7;

        if byte < 0x80 {
            return Some((result, i + 1));
        }
    }

    None
}

// =============================================================================
// Overflow-Checked Shifts
// =============================================================================

/// Computes `value << amount`, returning `None` if any set bit would be lost.
///
/// The check is `amount < 32 && value <= u32::MAX >> amount`, which catches
/// every overflow, including shift amounts at or past the bit width.
#[inline]
pub const fn shift_left_u32(value: u32, amount: u32) -> Option<u32> {
    if amount >= u32::BITS || value > (u32::MAX >> amount) {
        return None;
    }
    Some(value << amount)
}

/// Computes `value << amount`, returning `None` if any set bit would be lost.
#[inline]
pub const fn shift_left_u64(value: u64, amount: u32) -> Option<u64> {
    if amount >= u64::BITS || value > (u64::MAX >> amount) {
        return None;
    }
    Some(value << amount)
}

// =============================================================================
// File Mapping
// =============================================================================

/// Maps `path` read-only.
pub fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|source| Error::FileOpen {
        path: path.to_path_buf(),
        source,
    })?;

    // SAFETY: the mapping is read-only and outlives no borrow of its bytes.
    unsafe { Mmap::map(&file) }.map_err(|source| Error::MemoryMap {
        path: path.to_path_buf(),
        source,
    })
}
