//! tbd - text-based stub generator for Mach-O dynamic libraries.
//!
//! Reads dylibs (thin or fat) and images of Apple's dyld shared cache and
//! writes `tapi-tbd-v2` descriptors listing what each library exports, so
//! that code can be linked against it without the binary itself.
//!
//! # Features
//!
//! - Memory-mapped parsing of 32- and 64-bit Mach-O images and fat files
//! - Shared cache images, including split caches
//! - Export trie and symbol table sources for exports
//! - Output directories mirrored from the input hierarchy, with rollback of
//!   partially created paths
//!
//! # Example
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use tbd::driver::{Context, Options};
//!
//! fn main() -> tbd::Result<()> {
//!     let ctx = Context::new(Options {
//!         output: Some(PathBuf::from("stubs")),
//!         recurse: true,
//!         recurse_subdirectories: true,
//!         preserve_subdirectories: true,
//!         ..Options::default()
//!     });
//!
//!     let summary = ctx.parse_path(Path::new("/usr/lib"))?;
//!     println!("wrote {} descriptors", summary.written);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod path;
pub mod recursive;
pub mod tbd;
pub mod util;

// Re-export main types
pub use driver::{Context, Options, Summary};
pub use dyld::{DyldContext, ImageEntry, MappingEntry};
pub use error::{Error, Result};
pub use macho::MachOContext;
pub use tbd::{write_tbd, TbdCreateInfo};

/// Lists the images of `cache` whose path contains `filter`, or all of them.
pub fn find_images<'a>(
    cache: &'a DyldContext,
    filter: Option<&'a str>,
) -> impl Iterator<Item = &'a ImageEntry> {
    cache
        .iter_images()
        .filter(move |image| filter.map_or(true, |filter| image.matches_filter(filter)))
}
