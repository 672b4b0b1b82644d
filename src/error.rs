//! Error types for stub generation.
//!
//! This module provides error handling for every stage of the pipeline:
//! path resolution, output materialization, Mach-O and dyld cache parsing,
//! and descriptor emission.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for stub generation.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read directory '{path}': {source}")]
    DirectoryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Path & Output Errors ====================
    #[error("failed to retrieve current directory: {0}")]
    WorkingDirectoryUnavailable(#[source] std::io::Error),

    #[error("failed to create output file '{path}': {source}")]
    OutputCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output file '{path}' already exists")]
    OutputExists { path: PathBuf },

    #[error("failed to write output file '{path}': {source}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path contains an interior NUL byte: {0}")]
    InteriorNul(String),

    #[error("'{path}' is a directory; pass --recurse to parse its contents")]
    IsADirectory { path: PathBuf },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("big-endian Mach-O images are not supported (magic {0:#x})")]
    UnsupportedMachoEndian(u32),

    #[error("unsupported cpu type {cputype:#x} (subtype {cpusubtype:#x})")]
    UnsupportedArchitecture { cputype: u32, cpusubtype: u32 },

    #[error("fat header lists no architectures")]
    EmptyFatFile,

    #[error("fat architecture at index {index} lies outside the file")]
    FatArchOutOfBounds { index: usize },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("Mach-O image is not a dynamic library (filetype {0:#x})")]
    NotADylib(u32),

    #[error("dynamic library has no LC_ID_DYLIB install name")]
    MissingInstallName,

    #[error("symbol table not found in Mach-O")]
    SymbolTableNotFound,

    #[error("string table offset {offset} out of bounds (size: {size})")]
    StringTableOverflow { offset: u32, size: u32 },

    #[error("arithmetic overflow while computing {what}")]
    Overflow { what: &'static str },

    // ==================== Cache Format Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("invalid export trie at offset {offset:#x}")]
    InvalidExportTrie { offset: usize },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: usize },

    #[error("image not found: {name}")]
    ImageNotFound { name: String },

    // ==================== Stub Errors ====================
    #[error("architecture slices disagree on {field}")]
    ConflictingSlices { field: &'static str },

    #[error("architecture {0} appears more than once")]
    DuplicateArchitecture(&'static str),

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("unrecognized file format")]
    UnrecognizedFormat,
}

/// A specialized Result type for stub generation.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error only affects the file being processed.
    ///
    /// Directory walks log these and move on to the next file; anything else
    /// aborts the run.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::WorkingDirectoryUnavailable(_))
    }

    /// Returns true if the input simply was not something we parse.
    ///
    /// Directory walks skip such files silently.
    #[inline]
    pub fn is_unrecognized(&self) -> bool {
        matches!(
            self,
            Error::UnrecognizedFormat | Error::InvalidMachoMagic(_) | Error::InvalidMagic(_)
        )
    }

    /// Returns the OS error code behind this error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(source)
            | Error::FileOpen { source, .. }
            | Error::MemoryMap { source, .. }
            | Error::DirectoryRead { source, .. }
            | Error::WorkingDirectoryUnavailable(source)
            | Error::OutputCreate { source, .. }
            | Error::OutputWrite { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }

    /// Creates an overflow error for the named computation.
    #[inline]
    pub fn overflow(what: &'static str) -> Self {
        Error::Overflow { what }
    }
}
