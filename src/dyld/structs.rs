//! Dyld shared cache on-disk structures.
//!
//! Only the parts of the format needed to enumerate images and reach their
//! load commands and export tries are described here. Field names follow
//! dyld's own headers.

#![allow(missing_docs)]

use std::fmt;
use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The magic string prefix for all dyld caches.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

// =============================================================================
// Header
// =============================================================================

/// The dyld shared cache header.
///
/// The header has grown over time. `mapping_offset` doubles as the size of
/// the header actually present in a given cache, so every field past the
/// legacy prefix must be checked with [`DyldCacheHeader::contains_field`]
/// before use.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheHeader {
    /// e.g. `"dyld_v1   arm64e"`
    pub magic: [u8; 16],
    pub mapping_offset: u32,
    pub mapping_count: u32,
    /// Image array location before subcaches existed
    pub images_offset_old: u32,
    pub images_count_old: u32,
    pub dyld_base_address: u64,
    pub code_signature_offset: u64,
    pub code_signature_size: u64,
    pub slide_info_offset_unused: u64,
    pub slide_info_size_unused: u64,
    pub local_symbols_offset: u64,
    pub local_symbols_size: u64,
    pub uuid: [u8; 16],
    pub cache_type: u64,
    pub branch_pools_offset: u32,
    pub branch_pools_count: u32,
    pub dyld_in_cache_mh: u64,
    pub dyld_in_cache_entry: u64,
    pub images_text_offset: u64,
    pub images_text_count: u64,
    pub patch_info_addr: u64,
    pub patch_info_size: u64,
    pub other_image_group_addr_unused: u64,
    pub other_image_group_size_unused: u64,
    pub prog_closures_addr: u64,
    pub prog_closures_size: u64,
    pub prog_closures_trie_addr: u64,
    pub prog_closures_trie_size: u64,
    /// Same numbering as `LC_BUILD_VERSION` platforms
    pub platform: u32,
    pub format_version_and_flags: u32,
    pub shared_region_start: u64,
    pub shared_region_size: u64,
    pub max_slide: u64,
    pub dylibs_image_array_addr: u64,
    pub dylibs_image_array_size: u64,
    pub dylibs_trie_addr: u64,
    pub dylibs_trie_size: u64,
    pub other_image_array_addr: u64,
    pub other_image_array_size: u64,
    pub other_trie_addr: u64,
    pub other_trie_size: u64,
    /// Extended mappings, which carry slide info and flags
    pub mapping_with_slide_offset: u32,
    pub mapping_with_slide_count: u32,
    pub dylibs_pbl_state_array_addr_unused: u64,
    pub dylibs_pbl_set_addr: u64,
    pub programs_pbl_set_pool_addr: u64,
    pub programs_pbl_set_pool_size: u64,
    pub program_trie_addr: u64,
    pub program_trie_size: u32,
    pub os_version: u32,
    pub alt_platform: u32,
    pub alt_os_version: u32,
    pub swift_opts_offset: u64,
    pub swift_opts_size: u64,
    pub sub_cache_array_offset: u32,
    pub sub_cache_array_count: u32,
    pub symbol_file_uuid: [u8; 16],
    pub rosetta_read_only_addr: u64,
    pub rosetta_read_only_size: u64,
    pub rosetta_read_write_addr: u64,
    pub rosetta_read_write_size: u64,
    /// Image array location once subcaches exist
    pub images_offset: u32,
    pub images_count: u32,
}

impl DyldCacheHeader {
    /// Returns the architecture from the magic string.
    pub fn architecture(&self) -> &str {
        let magic_str = std::str::from_utf8(&self.magic).unwrap_or("");
        magic_str
            .trim_end_matches('\0')
            .trim_start_matches("dyld_v0")
            .trim_start_matches("dyld_v1")
            .trim()
    }

    /// Checks if a header field exists based on mapping_offset.
    #[inline]
    pub fn contains_field(&self, field_offset: usize) -> bool {
        field_offset < self.mapping_offset as usize
    }

    /// Returns true if this cache has subcaches.
    pub fn has_subcaches(&self) -> bool {
        self.contains_field(offset_of!(Self, sub_cache_array_count))
            && self.sub_cache_array_count > 0
    }

    /// Returns true if the extended mapping array is present.
    pub fn has_extended_mappings(&self) -> bool {
        self.contains_field(offset_of!(Self, mapping_with_slide_count))
            && self.mapping_with_slide_offset != 0
    }

    /// Returns the platform recorded in the header, if the field exists.
    pub fn platform(&self) -> Option<u32> {
        (self.contains_field(offset_of!(Self, platform)) && self.platform != 0)
            .then_some(self.platform)
    }

    /// Returns true if this cache uses the new images location.
    fn uses_new_images_offset(&self) -> bool {
        self.contains_field(offset_of!(Self, images_count)) && self.images_offset != 0
    }

    /// Returns the images offset (new or legacy location).
    pub fn actual_images_offset(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_offset as u64
        } else {
            self.images_offset_old as u64
        }
    }

    /// Returns the images count (new or legacy location).
    pub fn actual_images_count(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_count as u64
        } else {
            self.images_count_old as u64
        }
    }
}

// =============================================================================
// Mappings
// =============================================================================

/// Basic mapping entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

/// Extended mapping entry with per-mapping slide info.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingAndSlideInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub slide_info_file_offset: u64,
    pub slide_info_file_size: u64,
    pub flags: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

// =============================================================================
// Images
// =============================================================================

/// Image list entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageInfo {
    /// Address of the Mach-O header
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    /// File offset of the install path, in the main cache
    pub path_file_offset: u32,
    pub pad: u32,
}

// =============================================================================
// Subcaches
// =============================================================================

/// Subcache entry without an explicit file suffix (suffix is `.N`).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldSubcacheEntry {
    pub uuid: [u8; 16],
    pub cache_vm_offset: u64,
}

/// Subcache entry carrying its file suffix (e.g. `".01"`).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldSubcacheEntry2 {
    pub uuid: [u8; 16],
    pub cache_vm_offset: u64,
    pub file_suffix: [u8; 32],
}

impl DyldSubcacheEntry2 {
    /// Returns the file suffix as a string.
    pub fn suffix_str(&self) -> &str {
        let end = crate::util::memchr_null(&self.file_suffix);
        std::str::from_utf8(&self.file_suffix[..end]).unwrap_or("")
    }
}

impl fmt::Display for DyldCacheHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DyldCache {{ arch: {}, uuid: {}, mappings: {}, images: {} }}",
            self.architecture(),
            uuid_to_string(&self.uuid),
            self.mapping_count,
            self.actual_images_count()
        )
    }
}

/// Formats a UUID in the canonical 8-4-4-4-12 form.
pub fn uuid_to_string(uuid: &[u8; 16]) -> String {
    let hex: Vec<String> = uuid.iter().map(|b| format!("{b:02X}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[..4].concat(),
        hex[4..6].concat(),
        hex[6..8].concat(),
        hex[8..10].concat(),
        hex[10..].concat()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_to_string() {
        let uuid = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB,
            0xCD, 0xEF,
        ];
        assert_eq!(uuid_to_string(&uuid), "01234567-89AB-CDEF-0123-456789ABCDEF");
    }

    #[test]
    fn test_header_field_gating() {
        let mut bytes = vec![0u8; std::mem::size_of::<DyldCacheHeader>()];
        bytes[..16].copy_from_slice(b"dyld_v1   arm64e");
        // A legacy header that ends right before `platform`.
        let legacy_end = offset_of!(DyldCacheHeader, platform) as u32;
        bytes[16..20].copy_from_slice(&legacy_end.to_le_bytes());

        let (header, _) = DyldCacheHeader::read_from_prefix(&bytes).unwrap();
        assert_eq!(header.architecture(), "arm64e");
        assert!(!header.has_subcaches());
        assert!(!header.has_extended_mappings());
        assert_eq!(header.platform(), None);
    }
}
