//! Mach-O file format handling.
//!
//! Reads thin images and fat containers far enough to describe a dynamic
//! library: its identification, re-exports, platform and exported symbols.

mod constants;
mod context;
mod structs;
#[cfg(test)]
pub(crate) mod test_support;

pub use constants::*;
pub use context::*;
pub use structs::*;
