//! Dyld shared cache context and file handling.
//!
//! Maps the main cache and its subcaches, and translates virtual addresses
//! into bytes of whichever file backs them.

use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;
use zerocopy::FromBytes;

use super::structs::*;
use crate::error::{Error, Result};
use crate::macho::MachOContext;
use crate::util::{c_str_at, map_file};

/// Returns true if `data` starts like a shared cache.
pub fn is_cache(data: &[u8]) -> bool {
    data.starts_with(b"dyld_v")
}

fn read_at<T: FromBytes>(data: &[u8], at: usize, what: &str) -> Result<T> {
    data.get(at..)
        .and_then(|rest| T::read_from_prefix(rest).ok())
        .map(|(value, _)| value)
        .ok_or_else(|| Error::parse(at, format!("failed to parse {what}")))
}

/// Offset of entry `index` in a table of `T` starting at `base`.
fn entry_offset<T>(base: usize, index: usize) -> Result<usize> {
    index
        .checked_mul(std::mem::size_of::<T>())
        .and_then(|delta| base.checked_add(delta))
        .ok_or_else(|| Error::overflow("cache table offset"))
}

// =============================================================================
// Mapping Entry
// =============================================================================

/// A mapping from either the basic or the extended mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset within the owning cache file
    pub file_offset: u64,
    /// Index of the owning cache file (0 = main cache)
    pub subcache_index: usize,
}

impl MappingEntry {
    fn from_basic(info: &DyldCacheMappingInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            subcache_index,
        }
    }

    fn from_extended(info: &DyldCacheMappingAndSlideInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            subcache_index,
        }
    }

    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr - self.address < self.size
    }

    /// Converts a contained virtual address to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        self.contains_addr(addr)
            .then(|| self.file_offset.checked_add(addr - self.address))
            .flatten()
    }

    fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }
}

// =============================================================================
// Image Entry
// =============================================================================

/// A dylib listed in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Index in the images array
    pub index: usize,
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Install path (e.g. "/usr/lib/libc.dylib")
    pub path: String,
}

impl ImageEntry {
    /// Returns the basename of the path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path or basename contains `filter`.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

// =============================================================================
// Dyld Context
// =============================================================================

/// An open dyld shared cache, including all of its subcaches.
#[derive(Debug)]
pub struct DyldContext {
    mmap: Mmap,
    path: PathBuf,
    /// Header of the main cache
    pub header: DyldCacheHeader,
    /// Mappings of every cache file, sorted by address
    pub mappings: Vec<MappingEntry>,
    /// Images in cache order
    pub images: Vec<ImageEntry>,
    subcaches: Vec<Mmap>,
}

impl DyldContext {
    /// Opens the shared cache at `path` along with any subcaches next to it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mmap = map_file(&path)?;
        let header = Self::parse_header(&mmap)?;
        let mappings = Self::parse_mappings(&mmap, &header, 0)?;

        let mut ctx = Self {
            mmap,
            path,
            header,
            mappings,
            images: Vec::new(),
            subcaches: Vec::new(),
        };

        ctx.load_subcaches()?;
        ctx.mappings.sort_by_key(|m| m.address);
        ctx.images = ctx.parse_images()?;

        debug!(
            "Opened {} with {} mappings, {} subcaches and {} images",
            ctx.header,
            ctx.mappings.len(),
            ctx.subcaches.len(),
            ctx.images.len()
        );

        Ok(ctx)
    }

    /// Parses and validates the cache header.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        if data.len() < 4 || !data.starts_with(DYLD_CACHE_MAGIC_PREFIX) {
            let mut magic = [0u8; 4];
            let len = data.len().min(4);
            magic[..len].copy_from_slice(&data[..len]);
            return Err(Error::InvalidMagic(magic));
        }

        DyldCacheHeader::read_from_prefix(data)
            .map(|(header, _)| header)
            .map_err(|_| {
                Error::buffer_too_small(std::mem::size_of::<DyldCacheHeader>(), data.len())
            })
    }

    /// Reads the mapping table of one cache file.
    fn parse_mappings(
        data: &[u8],
        header: &DyldCacheHeader,
        subcache_index: usize,
    ) -> Result<Vec<MappingEntry>> {
        if header.has_extended_mappings() {
            let base = header.mapping_with_slide_offset as usize;
            return (0..header.mapping_with_slide_count as usize)
                .map(|i| {
                    let at = entry_offset::<DyldCacheMappingAndSlideInfo>(base, i)?;
                    let info: DyldCacheMappingAndSlideInfo = read_at(data, at, "extended mapping")?;
                    Ok(MappingEntry::from_extended(&info, subcache_index))
                })
                .collect();
        }

        let base = header.mapping_offset as usize;
        (0..header.mapping_count as usize)
            .map(|i| {
                let at = entry_offset::<DyldCacheMappingInfo>(base, i)?;
                let info: DyldCacheMappingInfo = read_at(data, at, "mapping")?;
                Ok(MappingEntry::from_basic(&info, subcache_index))
            })
            .collect()
    }

    /// Returns true if subcache entries carry their own file suffix.
    fn has_v2_subcache_entries(&self) -> bool {
        let at = self.header.sub_cache_array_offset as usize;
        read_at::<DyldSubcacheEntry2>(&self.mmap, at, "subcache entry")
            .is_ok_and(|entry| entry.file_suffix[0] == b'.')
    }

    /// Maps every subcache listed in the header and checks its UUID.
    fn load_subcaches(&mut self) -> Result<()> {
        if !self.header.has_subcaches() {
            return Ok(());
        }

        let parent = self.path.parent().unwrap_or(Path::new("."));
        let main_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let v2 = self.has_v2_subcache_entries();
        let base = self.header.sub_cache_array_offset as usize;

        for i in 0..self.header.sub_cache_array_count as usize {
            let (uuid, suffix) = if v2 {
                let at = entry_offset::<DyldSubcacheEntry2>(base, i)?;
                let entry: DyldSubcacheEntry2 = read_at(&self.mmap, at, "subcache entry")?;
                (entry.uuid, entry.suffix_str().to_string())
            } else {
                let at = entry_offset::<DyldSubcacheEntry>(base, i)?;
                let entry: DyldSubcacheEntry = read_at(&self.mmap, at, "subcache entry")?;
                (entry.uuid, format!(".{}", i + 1))
            };

            let path = parent.join(format!("{main_name}{suffix}"));
            if !path.exists() {
                return Err(Error::SubcacheNotFound { path });
            }

            let mmap = map_file(&path)?;
            let header = Self::parse_header(&mmap)?;
            if header.uuid != uuid {
                return Err(Error::SubcacheUuidMismatch {
                    path,
                    expected: uuid_to_string(&uuid),
                    actual: uuid_to_string(&header.uuid),
                });
            }

            debug!("Loaded subcache {}", path.display());
            self.mappings
                .extend(Self::parse_mappings(&mmap, &header, i + 1)?);
            self.subcaches.push(mmap);
        }

        Ok(())
    }

    /// Reads the image list from the main cache.
    fn parse_images(&self) -> Result<Vec<ImageEntry>> {
        let base = usize::try_from(self.header.actual_images_offset())
            .map_err(|_| Error::overflow("images offset"))?;
        let count = self.header.actual_images_count() as usize;

        (0..count)
            .map(|index| {
                let at = entry_offset::<DyldCacheImageInfo>(base, index)?;
                let info: DyldCacheImageInfo = read_at(&self.mmap, at, "image info")?;
                Ok(ImageEntry {
                    index,
                    address: info.address,
                    path: self.read_string(info.path_file_offset as usize)?,
                })
            })
            .collect()
    }

    /// Reads a NUL-terminated string at a main cache file offset.
    pub fn read_string(&self, offset: usize) -> Result<String> {
        let bytes = c_str_at(&self.mmap, offset)
            .ok_or_else(|| Error::parse(offset, "string offset out of bounds"))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::parse(offset, "invalid UTF-8 string"))
    }

    /// Returns the mapping containing `addr`.
    pub fn mapping_for_addr(&self, addr: u64) -> Option<&MappingEntry> {
        let idx = self.mappings.partition_point(|m| m.end() <= addr);
        self.mappings.get(idx).filter(|m| m.contains_addr(addr))
    }

    /// Returns the bytes of a cache file.
    pub fn data_for_subcache(&self, index: usize) -> &[u8] {
        match index {
            0 => &self.mmap[..],
            _ => self
                .subcaches
                .get(index - 1)
                .map_or(&[][..], |mmap| &mmap[..]),
        }
    }

    /// Returns the bytes mapped at `addr` up to the end of its mapping.
    pub fn data_from_addr(&self, addr: u64) -> Result<&[u8]> {
        let mapping = self
            .mapping_for_addr(addr)
            .ok_or(Error::AddressNotFound { addr })?;
        let data = self.data_for_subcache(mapping.subcache_index);

        let start = mapping
            .addr_to_offset(addr)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| Error::overflow("mapping file offset"))?;
        let end = mapping
            .file_offset
            .checked_add(mapping.size)
            .and_then(|end| usize::try_from(end).ok())
            .ok_or_else(|| Error::overflow("mapping end"))?
            .min(data.len());

        data.get(start..end)
            .ok_or_else(|| Error::buffer_too_small(start, data.len()))
    }

    /// Returns `len` bytes mapped at `addr`.
    pub fn data_at_addr(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let data = self.data_from_addr(addr)?;
        data.get(..len)
            .ok_or_else(|| Error::buffer_too_small(len, data.len()))
    }

    /// Parses the Mach-O header and load commands of a cache image.
    ///
    /// File offsets inside the returned context are cache file offsets, not
    /// offsets into the returned slice.
    pub fn image_macho(&self, image: &ImageEntry) -> Result<MachOContext<'_>> {
        MachOContext::new(self.data_from_addr(image.address)?)
    }

    /// Returns the export trie of a cache image, if it has one.
    ///
    /// The trie is located through `__LINKEDIT`, since its file offset is
    /// relative to whichever cache file holds that segment.
    pub fn export_trie(&self, macho: &MachOContext<'_>) -> Result<Option<&[u8]>> {
        let Some((offset, size)) = macho.export_trie() else {
            return Ok(None);
        };

        let linkedit = macho
            .linkedit_segment()
            .ok_or_else(|| Error::parse(0, "export trie without a __LINKEDIT segment"))?;
        let addr = u64::from(offset)
            .checked_sub(linkedit.command.fileoff)
            .and_then(|delta| linkedit.command.vmaddr.checked_add(delta))
            .ok_or_else(|| Error::overflow("export trie address"))?;

        self.data_at_addr(addr, size as usize).map(Some)
    }

    /// Returns an iterator over all images.
    pub fn iter_images(&self) -> impl Iterator<Item = &ImageEntry> {
        self.images.iter()
    }

    /// Finds an image by its exact install path.
    pub fn find_image(&self, path: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|img| img.path == path)
    }

    /// Returns the number of images in the cache.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Returns the number of subcaches that were loaded.
    pub fn subcache_count(&self) -> usize {
        self.subcaches.len()
    }

    /// Returns the architecture of this cache.
    pub fn architecture(&self) -> &str {
        self.header.architecture()
    }

    /// Returns the platform recorded in the cache header.
    pub fn platform(&self) -> Option<u32> {
        self.header.platform()
    }

    /// Returns the path the main cache was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
