//! Synthetic shared caches for tests.

use std::fs;
use std::path::{Path, PathBuf};

use zerocopy::{FromZeros, IntoBytes};

use super::structs::*;
use crate::macho::test_support::DylibBuilder;
use crate::macho::{CPU_SUBTYPE_ARM64E, CPU_TYPE_ARM64};

/// Load address of the first mapping.
pub(crate) const CACHE_BASE: u64 = 0x1_8000_0000;

/// Virtual distance between the main cache and its subcache.
const SUBCACHE_VM_OFFSET: u64 = 0x1000_0000;

const PAGE: usize = 0x1000;

fn align(len: usize, to: usize) -> usize {
    (len + to - 1) & !(to - 1)
}

fn encode_padded_uleb(value: usize) -> [u8; 2] {
    debug_assert!(value < 0x4000);
    [0x80 | (value & 0x7F) as u8, (value >> 7) as u8]
}

/// Builds a one-level export trie: the root has one edge per symbol.
pub(crate) fn flat_trie(exports: &[(&str, u64)]) -> Vec<u8> {
    let root_size = 2 + exports.iter().map(|(name, _)| name.len() + 3).sum::<usize>();

    let mut out = vec![0x00, exports.len() as u8];
    for (index, (name, _)) in exports.iter().enumerate() {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(&encode_padded_uleb(root_size + index * 4));
    }
    for (_, flags) in exports {
        // Terminal of two bytes: flags, then address 0. No children.
        out.extend_from_slice(&[0x02, *flags as u8, 0x00, 0x00]);
    }
    out
}

struct CacheImage {
    path: String,
    exports: Vec<(String, u64)>,
    reexports: Vec<String>,
}

/// Writes a shared cache with arm64e dylibs to disk.
pub(crate) struct CacheBuilder {
    platform: u32,
    split: Option<bool>,
    images: Vec<CacheImage>,
}

impl CacheBuilder {
    pub(crate) fn new(platform: u32) -> Self {
        Self {
            platform,
            split: None,
            images: Vec::new(),
        }
    }

    pub(crate) fn image(mut self, path: &str, exports: &[(&str, u64)]) -> Self {
        self.images.push(CacheImage {
            path: path.to_string(),
            exports: exports
                .iter()
                .map(|(name, flags)| (name.to_string(), *flags))
                .collect(),
            reexports: Vec::new(),
        });
        self
    }

    /// Adds a re-export to the most recently added image.
    pub(crate) fn reexport(mut self, path: &str) -> Self {
        if let Some(image) = self.images.last_mut() {
            image.reexports.push(path.to_string());
        }
        self
    }

    /// Moves image contents into one subcache. `v2` selects subcache
    /// entries that carry their file suffix.
    pub(crate) fn split(mut self, v2: bool) -> Self {
        self.split = Some(v2);
        self
    }

    fn dylib(image: &CacheImage, at: usize, vm_base: u64, trie_len: usize) -> DylibBuilder {
        let mut builder = DylibBuilder::new(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E)
            .install_name(&image.path)
            .versions(0x0001_0000, 0x0001_0000)
            .base_address(vm_base + at as u64);
        for reexport in &image.reexports {
            builder = builder.reexport(reexport);
        }
        // Measure with a placeholder, then point the trie right after the
        // image's load commands.
        let len = builder.clone().exports_trie(0, 0, 0).build().len();
        let trie_at = at + align(len, 8);
        builder.exports_trie(vm_base + trie_at as u64, trie_at as u32, trie_len as u32)
    }

    /// Lays out the image contents of one cache file starting at `start`.
    /// Returns the file bytes and each image's file offset.
    fn content(&self, start: usize, vm_base: u64) -> (Vec<u8>, Vec<usize>) {
        let mut out = vec![0u8; start];
        let mut offsets = Vec::new();
        for image in &self.images {
            let at = align(out.len(), PAGE);
            out.resize(at, 0);

            let exports: Vec<(&str, u64)> = image
                .exports
                .iter()
                .map(|(name, flags)| (name.as_str(), *flags))
                .collect();
            let trie = flat_trie(&exports);
            let macho = Self::dylib(image, at, vm_base, trie.len()).build();

            out.extend_from_slice(&macho);
            out.resize(at + align(macho.len(), 8), 0);
            out.extend_from_slice(&trie);
            offsets.push(at);
        }
        (out, offsets)
    }

    fn header(&self, uuid: u8, mapping_count: u32) -> DyldCacheHeader {
        let mut header = DyldCacheHeader::new_zeroed();
        header.magic = *b"dyld_v1  arm64e\0";
        header.mapping_offset = std::mem::size_of::<DyldCacheHeader>() as u32;
        header.mapping_count = mapping_count;
        header.uuid = [uuid; 16];
        header.platform = self.platform;
        header
    }

    /// Writes the cache as `dir/name` (and `dir/name.01` or `dir/name.1`
    /// when split). Returns the main cache path.
    pub(crate) fn write(&self, dir: &Path, name: &str) -> PathBuf {
        let header_size = std::mem::size_of::<DyldCacheHeader>();
        let mapping_size = std::mem::size_of::<DyldCacheMappingInfo>();
        let image_size = std::mem::size_of::<DyldCacheImageInfo>();
        let entry_size = match self.split {
            Some(true) => std::mem::size_of::<DyldSubcacheEntry2>(),
            Some(false) => std::mem::size_of::<DyldSubcacheEntry>(),
            None => 0,
        };

        let mappings_at = header_size;
        let subcaches_at = mappings_at + mapping_size;
        let images_at = subcaches_at + entry_size;
        let paths_at = images_at + self.images.len() * image_size;
        let paths_len: usize = self.images.iter().map(|i| i.path.len() + 1).sum();
        let table_end = paths_at + paths_len;

        let (mut main, sub, vm_base, offsets) = match self.split {
            None => {
                let (content, offsets) = self.content(table_end, CACHE_BASE);
                (content, None, CACHE_BASE, offsets)
            }
            Some(_) => {
                let sub_base = CACHE_BASE + SUBCACHE_VM_OFFSET;
                let start = align(header_size + mapping_size, PAGE);
                let (mut content, offsets) = self.content(start, sub_base);

                let header = self.header(2, 1);
                content[..header_size].copy_from_slice(header.as_bytes());
                let mapping = DyldCacheMappingInfo {
                    address: sub_base,
                    size: content.len() as u64,
                    file_offset: 0,
                    max_prot: 1,
                    init_prot: 1,
                };
                content[header_size..header_size + mapping_size]
                    .copy_from_slice(mapping.as_bytes());

                (vec![0u8; table_end], Some(content), sub_base, offsets)
            }
        };
        let addresses = offsets.iter().map(|at| vm_base + *at as u64);

        let mut header = self.header(1, 1);
        header.images_offset = images_at as u32;
        header.images_count = self.images.len() as u32;
        if let Some(v2) = self.split {
            header.sub_cache_array_offset = subcaches_at as u32;
            header.sub_cache_array_count = 1;
            let entry = if v2 {
                let mut entry = DyldSubcacheEntry2::new_zeroed();
                entry.uuid = [2; 16];
                entry.cache_vm_offset = SUBCACHE_VM_OFFSET;
                entry.file_suffix[..3].copy_from_slice(b".01");
                entry.as_bytes().to_vec()
            } else {
                DyldSubcacheEntry {
                    uuid: [2; 16],
                    cache_vm_offset: SUBCACHE_VM_OFFSET,
                }
                .as_bytes()
                .to_vec()
            };
            main[subcaches_at..images_at].copy_from_slice(&entry);
        }
        main[..header_size].copy_from_slice(header.as_bytes());

        let mapping = DyldCacheMappingInfo {
            address: CACHE_BASE,
            size: main.len() as u64,
            file_offset: 0,
            max_prot: 5,
            init_prot: 5,
        };
        main[mappings_at..subcaches_at].copy_from_slice(mapping.as_bytes());

        let mut path_at = paths_at;
        for (index, (image, address)) in self.images.iter().zip(addresses).enumerate() {
            let info = DyldCacheImageInfo {
                address,
                mod_time: 0,
                inode: 0,
                path_file_offset: path_at as u32,
                pad: 0,
            };
            let at = images_at + index * image_size;
            main[at..at + image_size].copy_from_slice(info.as_bytes());
            main[path_at..path_at + image.path.len()].copy_from_slice(image.path.as_bytes());
            path_at += image.path.len() + 1;
        }

        let path = dir.join(name);
        fs::write(&path, &main).unwrap();
        if let (Some(v2), Some(sub)) = (self.split, sub) {
            let suffix = if v2 { ".01" } else { ".1" };
            fs::write(dir.join(format!("{name}{suffix}")), sub).unwrap();
        }
        path
    }
}
