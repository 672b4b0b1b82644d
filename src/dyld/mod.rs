//! Dyld shared cache handling.
//!
//! The shared cache packs most system dylibs into one archive. Stubs only
//! need each image's load commands and export trie, so this module covers
//! the header, the mapping tables, the image list and subcache loading.
//!
//! # Sub-caches
//!
//! Starting with iOS 15 / macOS 12, caches can be split into multiple files:
//! - Main cache: `dyld_shared_cache_arm64e`
//! - Sub-caches: `dyld_shared_cache_arm64e.1`, `.2`, or with newer entries
//!   an explicit suffix such as `.01`

mod context;
mod structs;
#[cfg(test)]
pub(crate) mod test_support;
pub mod trie;

pub use context::*;
pub use structs::*;
pub use trie::*;
