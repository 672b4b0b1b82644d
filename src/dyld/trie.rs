//! Export trie parsing.
//!
//! The export trie is a compact representation of exported symbols in a Mach-O file.
//! It uses a trie (prefix tree) structure where each node can contain:
//! - Terminal information (flags, then kind-specific payload)
//! - Children edges (label prefix + offset to child node)
//!
//! Cache images reference their trie through `LC_DYLD_INFO(_ONLY)` or
//! `LC_DYLD_EXPORTS_TRIE`; only the exported names and flags are needed to
//! build a stub, so the payload after the flags is skipped.

use crate::error::{Error, Result};
use crate::util::read_uleb128_fast;

// =============================================================================
// Export Flags
// =============================================================================

/// Export symbol kind mask.
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;

/// Thread-local variable.
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;

/// Weak definition.
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;

/// Re-export from another dylib.
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;

/// Reads an unsigned LEB128 value at `offset` within `data`.
#[inline(always)]
fn read_uleb128(data: &[u8], offset: usize) -> Result<(u64, usize)> {
    data.get(offset..)
        .and_then(read_uleb128_fast)
        .ok_or(Error::InvalidUleb128 { offset })
}

// =============================================================================
// Export Info
// =============================================================================

/// An exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Symbol name
    pub name: Vec<u8>,
    /// Export flags
    pub flags: u64,
}

impl ExportInfo {
    /// Returns true if this is a weak definition.
    #[inline]
    pub fn is_weak(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION) != 0
    }

    /// Returns true if this is a re-export of a symbol from another dylib.
    #[inline]
    pub fn is_reexport(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0
    }

    /// Returns true if this is a thread-local variable.
    #[inline]
    pub fn is_thread_local(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK) == EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL
    }
}

// =============================================================================
// Export Trie Parser
// =============================================================================

/// Parser for export tries.
pub struct ExportTrieParser<'a> {
    data: &'a [u8],
}

impl<'a> ExportTrieParser<'a> {
    /// Creates a new parser for the given export trie data.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Parses all exports from the trie, in depth-first edge order.
    ///
    /// Each node may be visited at most once per byte of trie data, which
    /// bounds the walk on malformed (cyclic) input.
    pub fn parse_all(&self) -> Result<Vec<ExportInfo>> {
        let mut exports = Vec::new();
        if self.data.is_empty() {
            return Ok(exports);
        }

        let mut budget = self.data.len();
        let mut stack = vec![(0usize, Vec::new())];

        while let Some((offset, prefix)) = stack.pop() {
            budget = budget
                .checked_sub(1)
                .ok_or(Error::InvalidExportTrie { offset })?;

            let children = self.parse_node(offset, prefix, &mut exports)?;
            // Pushed in reverse so the first edge is walked first.
            stack.extend(children.into_iter().rev());
        }

        Ok(exports)
    }

    /// Parses one node, recording its export and returning its children.
    fn parse_node(
        &self,
        offset: usize,
        prefix: Vec<u8>,
        exports: &mut Vec<ExportInfo>,
    ) -> Result<Vec<(usize, Vec<u8>)>> {
        if offset >= self.data.len() {
            return Err(Error::InvalidExportTrie { offset });
        }

        let (terminal_size, bytes_read) = read_uleb128(self.data, offset)?;
        let mut cursor = offset + bytes_read;

        let children_start = usize::try_from(terminal_size)
            .ok()
            .and_then(|size| cursor.checked_add(size))
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::InvalidExportTrie { offset })?;

        if terminal_size > 0 {
            let (flags, _) = read_uleb128(self.data, cursor)?;
            exports.push(ExportInfo {
                name: prefix.clone(),
                flags,
            });
        }
        cursor = children_start;

        let Some(&child_count) = self.data.get(cursor) else {
            return Ok(Vec::new());
        };
        cursor += 1;

        let mut children = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            let rest = &self.data[cursor.min(self.data.len())..];
            let label_len =
                memchr::memchr(0, rest).ok_or(Error::InvalidExportTrie { offset: cursor })?;

            let mut name = prefix.clone();
            name.extend_from_slice(&rest[..label_len]);
            cursor += label_len + 1;

            let (child_offset, bytes) = read_uleb128(self.data, cursor)?;
            cursor += bytes;

            let child_offset = usize::try_from(child_offset)
                .map_err(|_| Error::InvalidExportTrie { offset: cursor })?;
            children.push((child_offset, name));
        }

        Ok(children)
    }
}
