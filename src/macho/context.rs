//! Mach-O context for reading thin images and fat containers.

use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::{c_str_at, read_u32_be_at, read_u32_le_at, read_u64_be_at, shift_left_u64};

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command, widened to 64 bits
    pub command: SegmentCommand64,
    /// Sections in this segment, widened to 64 bits
    pub sections: Vec<Section64>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&Section64> {
        self.sections.iter().find(|s| s.name() == name)
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
///
/// The variant names correspond to the load command types. Commands that
/// stubs do not need are kept as `Unknown`.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab(SymtabCommand),
    DyldInfo(DyldInfoCommand),
    ExportsTrie(LinkeditDataCommand),
    Dylib { command: DylibCommand, name: Vec<u8> },
    SubFramework { umbrella: Vec<u8> },
    BuildVersion(BuildVersionCommand),
    VersionMin(VersionMinCommand),
    Unknown { cmd: u32, cmdsize: u32 },
}

/// An exported symbol from the nlist symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlistExport<'a> {
    /// Symbol name, without terminator
    pub name: &'a [u8],
    /// Marked `N_WEAK_DEF`
    pub weak: bool,
    /// Defined in a thread-local variables section
    pub thread_local: bool,
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Context for reading a single Mach-O image.
///
/// The image bytes are borrowed; everything returned from symbol and string
/// accessors points into them.
#[derive(Debug)]
pub struct MachOContext<'a> {
    /// The Mach-O header, widened to 64 bits
    pub header: MachHeader64,
    /// Parsed load commands
    pub load_commands: Vec<LoadCommandInfo>,
    data: &'a [u8],
    is_64: bool,
}

impl<'a> MachOContext<'a> {
    /// Parses the thin image at the start of `data`.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let (header, is_64) = Self::parse_header(data)?;

        let mut ctx = Self {
            header,
            load_commands: Vec::new(),
            data,
            is_64,
        };

        ctx.parse_load_commands()?;

        Ok(ctx)
    }

    /// Parses and validates the header.
    fn parse_header(data: &[u8]) -> Result<(MachHeader64, bool)> {
        if data.len() < 4 {
            return Err(Error::UnrecognizedFormat);
        }

        match read_u32_le_at(data, 0) {
            MH_MAGIC_64 => {
                let header = MachHeader64::read_from_prefix(data)
                    .map_err(|_| Error::buffer_too_small(MachHeader64::SIZE, data.len()))?
                    .0;
                Ok((header, true))
            }
            MH_MAGIC => {
                let header = MachHeader::read_from_prefix(data)
                    .map_err(|_| Error::buffer_too_small(MachHeader::SIZE, data.len()))?
                    .0;
                Ok((header.into(), false))
            }
            magic @ (MH_CIGAM | MH_CIGAM_64) => Err(Error::UnsupportedMachoEndian(magic)),
            magic => Err(Error::InvalidMachoMagic(magic)),
        }
    }

    /// Size of the header actually present in the image.
    #[inline]
    fn header_size(&self) -> usize {
        if self.is_64 {
            MachHeader64::SIZE
        } else {
            MachHeader::SIZE
        }
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self) -> Result<()> {
        let mut offset = self.header_size();
        let end_offset = offset
            .checked_add(self.header.sizeofcmds as usize)
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::LoadCommandOverflow { offset })?;

        self.load_commands.reserve(self.header.ncmds as usize);
        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&self.data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;

            let cmdsize = lc.cmdsize as usize;
            if cmdsize < LoadCommand::SIZE {
                return Err(Error::parse(offset, "load command smaller than its header"));
            }
            if cmdsize > end_offset - offset {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let cmd_data = &self.data[offset..offset + cmdsize];
            let cmd_info = self.parse_load_command(lc.cmd, cmd_data, offset)?;

            self.load_commands.push(cmd_info);
            offset += cmdsize;
        }

        Ok(())
    }

    /// Parses a single load command.
    fn parse_load_command(&self, cmd: u32, data: &[u8], offset: usize) -> Result<LoadCommandInfo> {
        fn read<T: FromBytes>(data: &[u8], offset: usize, what: &str) -> Result<T> {
            T::read_from_prefix(data)
                .map(|(value, _)| value)
                .map_err(|_| Error::parse(offset, format!("failed to parse {what} command")))
        }

        fn string(data: &[u8], at: u32, min: usize, offset: usize) -> Result<Vec<u8>> {
            let at = at as usize;
            if at < min {
                return Err(Error::parse(offset, "string offset points inside the command"));
            }
            c_str_at(data, at)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Error::parse(offset, "string offset past end of command"))
        }

        let info = match cmd {
            LC_SEGMENT_64 => {
                let seg: SegmentCommand64 = read(data, offset, "segment")?;
                let sections = Self::parse_sections::<Section64>(
                    data,
                    SegmentCommand64::SIZE,
                    seg.nsects,
                    offset,
                )?;
                LoadCommandInfo::Segment(SegmentInfo {
                    command: seg,
                    sections,
                })
            }

            LC_SEGMENT => {
                let seg: SegmentCommand = read(data, offset, "segment")?;
                let sections = Self::parse_sections::<Section>(
                    data,
                    SegmentCommand::SIZE,
                    seg.nsects,
                    offset,
                )?;
                LoadCommandInfo::Segment(SegmentInfo {
                    command: seg.into(),
                    sections,
                })
            }

            LC_SYMTAB => LoadCommandInfo::Symtab(read(data, offset, "symtab")?),

            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                LoadCommandInfo::DyldInfo(read(data, offset, "dyld info")?)
            }

            LC_DYLD_EXPORTS_TRIE => LoadCommandInfo::ExportsTrie(read(data, offset, "exports trie")?),

            LC_ID_DYLIB | LC_REEXPORT_DYLIB => {
                let command: DylibCommand = read(data, offset, "dylib")?;
                let name = string(data, command.dylib.name_offset, DylibCommand::SIZE, offset)?;
                LoadCommandInfo::Dylib { command, name }
            }

            LC_SUB_FRAMEWORK => {
                let command: SubFrameworkCommand = read(data, offset, "sub framework")?;
                let umbrella = string(data, command.umbrella_offset, 12, offset)?;
                LoadCommandInfo::SubFramework { umbrella }
            }

            LC_BUILD_VERSION => LoadCommandInfo::BuildVersion(read(data, offset, "build version")?),

            LC_VERSION_MIN_MACOSX
            | LC_VERSION_MIN_IPHONEOS
            | LC_VERSION_MIN_TVOS
            | LC_VERSION_MIN_WATCHOS => LoadCommandInfo::VersionMin(read(data, offset, "version min")?),

            _ => LoadCommandInfo::Unknown {
                cmd,
                cmdsize: data.len() as u32,
            },
        };

        Ok(info)
    }

    /// Parses the section array that follows a segment command.
    fn parse_sections<S>(data: &[u8], start: usize, nsects: u32, offset: usize) -> Result<Vec<Section64>>
    where
        S: FromBytes + Into<Section64>,
    {
        let size = std::mem::size_of::<S>();
        let table = (nsects as usize)
            .checked_mul(size)
            .and_then(|len| start.checked_add(len))
            .filter(|&end| end <= data.len())
            .ok_or_else(|| Error::parse(offset, "sections extend past segment command"))?;

        data[start..table]
            .chunks_exact(size)
            .map(|chunk| {
                S::read_from_bytes(chunk)
                    .map(Into::into)
                    .map_err(|_| Error::parse(offset, "failed to parse section"))
            })
            .collect()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns true for 64-bit images.
    #[inline]
    pub fn is_64(&self) -> bool {
        self.is_64
    }

    /// Returns the raw image bytes.
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the stub architecture name for this image.
    pub fn arch_name(&self) -> Result<&'static str> {
        self.header
            .arch_name()
            .ok_or(Error::UnsupportedArchitecture {
                cputype: self.header.cputype,
                cpusubtype: self.header.cpusubtype,
            })
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns the __LINKEDIT segment.
    pub fn linkedit_segment(&self) -> Option<&SegmentInfo> {
        self.segments().find(|seg| seg.command.is_linkedit())
    }

    /// Returns the section at a 1-based `n_sect` index, counting across segments.
    pub fn section_by_index(&self, n_sect: u8) -> Option<&Section64> {
        let index = (n_sect as usize).checked_sub(1)?;
        self.segments().flat_map(|seg| seg.sections.iter()).nth(index)
    }

    /// Returns the `__objc_imageinfo` section, whichever segment holds it.
    pub fn objc_image_info_section(&self) -> Option<&Section64> {
        self.segments()
            .find_map(|seg| seg.section("__objc_imageinfo"))
    }

    /// Returns the symbol table command.
    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Symtab(command) = lc {
                Some(command)
            } else {
                None
            }
        })
    }

    /// Returns the file offset and size of the export trie, if there is one.
    pub fn export_trie(&self) -> Option<(u32, u32)> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::DyldInfo(command) if command.export_size != 0 => {
                Some((command.export_off, command.export_size))
            }
            LoadCommandInfo::ExportsTrie(command) if command.datasize != 0 => {
                Some((command.dataoff, command.datasize))
            }
            _ => None,
        })
    }

    /// Returns the install name and version info from `LC_ID_DYLIB`.
    pub fn install_name(&self) -> Option<(&[u8], &Dylib)> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name } if command.cmd == LC_ID_DYLIB => {
                Some((name.as_slice(), &command.dylib))
            }
            _ => None,
        })
    }

    /// Returns the install names of re-exported libraries, in load order.
    pub fn reexports(&self) -> impl Iterator<Item = &[u8]> {
        self.load_commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name } if command.cmd == LC_REEXPORT_DYLIB => {
                Some(name.as_slice())
            }
            _ => None,
        })
    }

    /// Returns the umbrella framework from `LC_SUB_FRAMEWORK`.
    pub fn parent_umbrella(&self) -> Option<&[u8]> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::SubFramework { umbrella } => Some(umbrella.as_slice()),
            _ => None,
        })
    }

    /// Returns the raw platform number.
    ///
    /// `LC_BUILD_VERSION` takes precedence over `LC_VERSION_MIN_*`.
    pub fn platform(&self) -> Option<u32> {
        let build = self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::BuildVersion(command) => Some(command.platform),
            _ => None,
        });

        build.or_else(|| {
            self.load_commands.iter().find_map(|lc| match lc {
                LoadCommandInfo::VersionMin(command) => command.platform(),
                _ => None,
            })
        })
    }

    /// Returns `size` bytes at file offset `offset` within this image.
    pub fn file_range(&self, offset: u64, size: u64) -> Result<&'a [u8]> {
        let start = usize::try_from(offset).map_err(|_| Error::overflow("file offset"))?;
        let len = usize::try_from(size).map_err(|_| Error::overflow("file range size"))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::overflow("file range end"))?;

        self.data
            .get(start..end)
            .ok_or_else(|| Error::buffer_too_small(end, self.data.len()))
    }

    /// Reads the nlist symbol table and returns the symbols this image exports.
    ///
    /// Exported means external, defined, not private-external and not a
    /// debugging entry. Order follows the symbol table.
    pub fn exported_symbols(&self) -> Result<Vec<NlistExport<'a>>> {
        let symtab = self.symtab().ok_or(Error::SymbolTableNotFound)?;

        let entry_size = if self.is_64 { Nlist64::SIZE } else { Nlist::SIZE };
        let table_size = (symtab.nsyms as u64)
            .checked_mul(entry_size as u64)
            .ok_or_else(|| Error::overflow("symbol table size"))?;
        let table = self.file_range(symtab.symoff.into(), table_size)?;
        let strings = self.file_range(symtab.stroff.into(), symtab.strsize.into())?;

        let mut exports = Vec::new();
        for chunk in table.chunks_exact(entry_size) {
            let bad_entry = || Error::parse(symtab.symoff as usize, "failed to parse nlist");
            let entry: Nlist64 = if self.is_64 {
                Nlist64::read_from_bytes(chunk).map_err(|_| bad_entry())?
            } else {
                Nlist::read_from_bytes(chunk).map_err(|_| bad_entry())?.into()
            };

            if entry.is_debug()
                || !entry.is_external()
                || entry.is_private_external()
                || !entry.is_defined()
            {
                continue;
            }

            let name = c_str_at(strings, entry.n_strx as usize)
                .filter(|_| entry.n_strx < symtab.strsize)
                .ok_or(Error::StringTableOverflow {
                    offset: entry.n_strx,
                    size: symtab.strsize,
                })?;

            let thread_local = (entry.n_type & N_TYPE) == N_SECT
                && self
                    .section_by_index(entry.n_sect)
                    .is_some_and(|sect| sect.section_type() == S_THREAD_LOCAL_VARIABLES);

            exports.push(NlistExport {
                name,
                weak: entry.is_weak_def(),
                thread_local,
            });
        }

        Ok(exports)
    }
}

// =============================================================================
// Fat Containers
// =============================================================================

/// Decodes the slice table of a fat container.
///
/// Returns `Ok(None)` when `data` does not start with a fat magic.
pub fn fat_archs(data: &[u8]) -> Result<Option<Vec<FatArch>>> {
    if data.len() < 4 {
        return Ok(None);
    }

    let is_64 = match read_u32_be_at(data, 0) {
        FAT_MAGIC => false,
        FAT_MAGIC_64 => true,
        _ => return Ok(None),
    };

    if data.len() < FatArch::HEADER_SIZE {
        return Err(Error::buffer_too_small(FatArch::HEADER_SIZE, data.len()));
    }

    let nfat = read_u32_be_at(data, 4);
    if nfat == 0 {
        return Err(Error::EmptyFatFile);
    }
    if nfat > MAX_FAT_ARCHS {
        return Err(Error::UnrecognizedFormat);
    }

    let entry_size = if is_64 { FatArch::SIZE_64 } else { FatArch::SIZE };
    let table_end = FatArch::HEADER_SIZE + nfat as usize * entry_size;
    if table_end > data.len() {
        return Err(Error::buffer_too_small(table_end, data.len()));
    }

    let mut archs = Vec::with_capacity(nfat as usize);
    for index in 0..nfat as usize {
        let at = FatArch::HEADER_SIZE + index * entry_size;
        let arch = if is_64 {
            FatArch {
                cputype: read_u32_be_at(data, at),
                cpusubtype: read_u32_be_at(data, at + 4),
                offset: read_u64_be_at(data, at + 8),
                size: read_u64_be_at(data, at + 16),
                align: read_u32_be_at(data, at + 24),
            }
        } else {
            FatArch {
                cputype: read_u32_be_at(data, at),
                cpusubtype: read_u32_be_at(data, at + 4),
                offset: read_u32_be_at(data, at + 8).into(),
                size: read_u32_be_at(data, at + 12).into(),
                align: read_u32_be_at(data, at + 16),
            }
        };

        let alignment =
            shift_left_u64(1, arch.align).ok_or_else(|| Error::overflow("fat slice alignment"))?;
        if arch.offset % alignment != 0 {
            return Err(Error::parse(at, "fat slice offset is not aligned"));
        }

        let in_bounds = arch
            .offset
            .checked_add(arch.size)
            .is_some_and(|end| end <= data.len() as u64);
        if !in_bounds || arch.size == 0 {
            return Err(Error::FatArchOutOfBounds { index });
        }

        archs.push(arch);
    }

    Ok(Some(archs))
}

/// Parses every slice in `data`: the image itself if thin, or each slice of
/// a fat container.
pub fn slices(data: &[u8]) -> Result<Vec<MachOContext<'_>>> {
    let Some(archs) = fat_archs(data)? else {
        return Ok(vec![MachOContext::new(data)?]);
    };

    archs
        .iter()
        .map(|arch| {
            // Bounds were checked by `fat_archs`.
            let slice = &data[arch.offset as usize..(arch.offset + arch.size) as usize];
            let ctx = MachOContext::new(slice)?;
            if ctx.header.cputype != arch.cputype {
                return Err(Error::parse(
                    arch.offset as usize,
                    "fat entry cpu type does not match its slice",
                ));
            }
            Ok(ctx)
        })
        .collect()
}
