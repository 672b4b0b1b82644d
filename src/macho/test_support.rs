//! Synthetic Mach-O images for tests.

use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::constants::*;
use super::structs::*;

const TEXT_SECTION: u8 = 1;
const THREAD_VARS_SECTION: u8 = 2;

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

fn push<T: IntoBytes + Immutable>(out: &mut Vec<u8>, value: &T) {
    out.extend_from_slice(value.as_bytes());
}

/// Appends a command whose fixed part is followed by a string.
fn push_with_string<T: IntoBytes + Immutable>(out: &mut Vec<u8>, value: &T, string: &str) {
    let start = out.len();
    push(out, value);
    out.extend_from_slice(string.as_bytes());
    out.push(0);
    out.resize(start + align8(out.len() - start), 0);
}

#[derive(Clone)]
struct SymbolSpec {
    name: String,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
}

/// Builds a dylib with a single segment, a symbol table and the optional
/// identification commands stubs read.
#[derive(Clone)]
pub(crate) struct DylibBuilder {
    cputype: u32,
    cpusubtype: u32,
    is_64: bool,
    flags: u32,
    install_name: Option<String>,
    current_version: u32,
    compatibility_version: u32,
    reexports: Vec<String>,
    umbrella: Option<String>,
    platform: Option<u32>,
    swift_version: u8,
    exports_trie: Option<ExportsTrie>,
    base_address: u64,
    symbols: Vec<SymbolSpec>,
}

/// Where a cache image's export trie lives, in cache coordinates.
#[derive(Clone, Copy)]
struct ExportsTrie {
    vmaddr: u64,
    fileoff: u32,
    size: u32,
}

impl DylibBuilder {
    pub(crate) fn new(cputype: u32, cpusubtype: u32) -> Self {
        Self {
            cputype,
            cpusubtype,
            is_64: true,
            flags: (MachOFlags::TWOLEVEL | MachOFlags::APP_EXTENSION_SAFE).bits(),
            install_name: None,
            current_version: 0x0001_0000,
            compatibility_version: 0x0001_0000,
            reexports: Vec::new(),
            umbrella: None,
            platform: None,
            swift_version: 0,
            exports_trie: None,
            base_address: 0,
            symbols: Vec::new(),
        }
    }

    pub(crate) fn new_32(cputype: u32, cpusubtype: u32) -> Self {
        Self {
            is_64: false,
            ..Self::new(cputype, cpusubtype)
        }
    }

    pub(crate) fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn install_name(mut self, name: &str) -> Self {
        self.install_name = Some(name.to_string());
        self
    }

    pub(crate) fn versions(mut self, current: u32, compatibility: u32) -> Self {
        self.current_version = current;
        self.compatibility_version = compatibility;
        self
    }

    pub(crate) fn reexport(mut self, name: &str) -> Self {
        self.reexports.push(name.to_string());
        self
    }

    pub(crate) fn umbrella(mut self, name: &str) -> Self {
        self.umbrella = Some(name.to_string());
        self
    }

    pub(crate) fn platform(mut self, platform: u32) -> Self {
        self.platform = Some(platform);
        self
    }

    pub(crate) fn swift_version(mut self, version: u8) -> Self {
        self.swift_version = version;
        self
    }

    /// Sets the address `__TEXT` is linked at.
    pub(crate) fn base_address(mut self, address: u64) -> Self {
        self.base_address = address;
        self
    }

    /// Adds a `__LINKEDIT` segment mapping `size` bytes at `fileoff` to
    /// `vmaddr`, and an `LC_DYLD_EXPORTS_TRIE` pointing at them.
    pub(crate) fn exports_trie(mut self, vmaddr: u64, fileoff: u32, size: u32) -> Self {
        self.exports_trie = Some(ExportsTrie {
            vmaddr,
            fileoff,
            size,
        });
        self
    }

    fn push_symbol(mut self, name: &str, n_type: u8, n_sect: u8, n_desc: u16) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            n_type,
            n_sect,
            n_desc,
        });
        self
    }

    pub(crate) fn symbol(self, name: &str) -> Self {
        self.push_symbol(name, N_SECT | N_EXT, TEXT_SECTION, 0)
    }

    pub(crate) fn weak_symbol(self, name: &str) -> Self {
        self.push_symbol(name, N_SECT | N_EXT, TEXT_SECTION, N_WEAK_DEF)
    }

    pub(crate) fn thread_local_symbol(self, name: &str) -> Self {
        self.push_symbol(name, N_SECT | N_EXT, THREAD_VARS_SECTION, 0)
    }

    pub(crate) fn private_symbol(self, name: &str) -> Self {
        self.push_symbol(name, N_SECT | N_EXT | N_PEXT, TEXT_SECTION, 0)
    }

    pub(crate) fn local_symbol(self, name: &str) -> Self {
        self.push_symbol(name, N_SECT, TEXT_SECTION, 0)
    }

    pub(crate) fn undefined_symbol(self, name: &str) -> Self {
        self.push_symbol(name, N_UNDF | N_EXT, 0, 0)
    }

    fn header_size(&self) -> usize {
        if self.is_64 {
            MachHeader64::SIZE
        } else {
            MachHeader::SIZE
        }
    }

    fn nlist_size(&self) -> usize {
        if self.is_64 {
            Nlist64::SIZE
        } else {
            Nlist::SIZE
        }
    }

    /// File offset of the eight `__objc_imageinfo` bytes.
    fn image_info_offset(&self) -> usize {
        let (commands, _) = self.load_commands(0, 0, 0);
        align8(self.header_size() + commands.len())
    }

    /// File offset of the first nlist entry.
    pub(crate) fn symbol_table_offset(&self) -> usize {
        self.image_info_offset() + 8
    }

    fn segment(&self, image_info_offset: u32) -> Vec<u8> {
        let sections = [
            ("__text", "__TEXT", 0u32, 0u32),
            ("__thread_vars", "__DATA", 0, S_THREAD_LOCAL_VARIABLES),
            ("__objc_imageinfo", "__DATA", image_info_offset, 0),
        ];

        let mut out = Vec::new();
        if self.is_64 {
            push(
                &mut out,
                &SegmentCommand64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize: (SegmentCommand64::SIZE + sections.len() * Section64::SIZE) as u32,
                    segname: name16("__TEXT"),
                    vmaddr: self.base_address,
                    vmsize: 0x4000,
                    fileoff: 0,
                    filesize: 0x4000,
                    maxprot: 5,
                    initprot: 5,
                    nsects: sections.len() as u32,
                    flags: 0,
                },
            );
            for (sect, seg, offset, flags) in sections {
                push(
                    &mut out,
                    &Section64 {
                        sectname: name16(sect),
                        segname: name16(seg),
                        addr: self.base_address + u64::from(offset),
                        size: 8,
                        offset,
                        align: 0,
                        reloff: 0,
                        nreloc: 0,
                        flags,
                        reserved1: 0,
                        reserved2: 0,
                        reserved3: 0,
                    },
                );
            }
        } else {
            push(
                &mut out,
                &SegmentCommand {
                    cmd: LC_SEGMENT,
                    cmdsize: (SegmentCommand::SIZE + sections.len() * Section::SIZE) as u32,
                    segname: name16("__TEXT"),
                    vmaddr: self.base_address as u32,
                    vmsize: 0x4000,
                    fileoff: 0,
                    filesize: 0x4000,
                    maxprot: 5,
                    initprot: 5,
                    nsects: sections.len() as u32,
                    flags: 0,
                },
            );
            for (sect, seg, offset, flags) in sections {
                push(
                    &mut out,
                    &Section {
                        sectname: name16(sect),
                        segname: name16(seg),
                        addr: self.base_address as u32 + offset,
                        size: 8,
                        offset,
                        align: 0,
                        reloff: 0,
                        nreloc: 0,
                        flags,
                        reserved1: 0,
                        reserved2: 0,
                    },
                );
            }
        }
        out
    }

    fn push_linkedit(&self, out: &mut Vec<u8>, trie: ExportsTrie) {
        if self.is_64 {
            push(
                out,
                &SegmentCommand64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize: SegmentCommand64::SIZE as u32,
                    segname: name16("__LINKEDIT"),
                    vmaddr: trie.vmaddr,
                    vmsize: trie.size.into(),
                    fileoff: trie.fileoff.into(),
                    filesize: trie.size.into(),
                    maxprot: 1,
                    initprot: 1,
                    nsects: 0,
                    flags: 0,
                },
            );
        } else {
            push(
                out,
                &SegmentCommand {
                    cmd: LC_SEGMENT,
                    cmdsize: SegmentCommand::SIZE as u32,
                    segname: name16("__LINKEDIT"),
                    vmaddr: trie.vmaddr as u32,
                    vmsize: trie.size,
                    fileoff: trie.fileoff,
                    filesize: trie.size,
                    maxprot: 1,
                    initprot: 1,
                    nsects: 0,
                    flags: 0,
                },
            );
        }
    }

    fn load_commands(&self, image_info_offset: u32, symoff: u32, stroff: u32) -> (Vec<u8>, u32) {
        let mut out = self.segment(image_info_offset);
        let mut ncmds = 1;

        if let Some(trie) = self.exports_trie {
            self.push_linkedit(&mut out, trie);
            push(
                &mut out,
                &LinkeditDataCommand {
                    cmd: LC_DYLD_EXPORTS_TRIE,
                    cmdsize: 16,
                    dataoff: trie.fileoff,
                    datasize: trie.size,
                },
            );
            ncmds += 2;
        }

        let dylibs = self
            .install_name
            .iter()
            .map(|name| (LC_ID_DYLIB, name, self.current_version, self.compatibility_version))
            .chain(
                self.reexports
                    .iter()
                    .map(|name| (LC_REEXPORT_DYLIB, name, 0x0001_0000, 0x0001_0000)),
            );
        for (cmd, name, current_version, compatibility_version) in dylibs {
            let command = DylibCommand {
                cmd,
                cmdsize: align8(DylibCommand::SIZE + name.len() + 1) as u32,
                dylib: Dylib {
                    name_offset: DylibCommand::SIZE as u32,
                    timestamp: 2,
                    current_version,
                    compatibility_version,
                },
            };
            push_with_string(&mut out, &command, name);
            ncmds += 1;
        }

        if let Some(umbrella) = &self.umbrella {
            let command = SubFrameworkCommand {
                cmd: LC_SUB_FRAMEWORK,
                cmdsize: align8(12 + umbrella.len() + 1) as u32,
                umbrella_offset: 12,
            };
            push_with_string(&mut out, &command, umbrella);
            ncmds += 1;
        }

        if let Some(platform) = self.platform {
            push(
                &mut out,
                &BuildVersionCommand {
                    cmd: LC_BUILD_VERSION,
                    cmdsize: 24,
                    platform,
                    minos: 0x000E_0000,
                    sdk: 0x000E_0000,
                    ntools: 0,
                },
            );
            ncmds += 1;
        }

        push(
            &mut out,
            &SymtabCommand {
                cmd: LC_SYMTAB,
                cmdsize: SymtabCommand::SIZE as u32,
                symoff,
                nsyms: self.symbols.len() as u32,
                stroff,
                strsize: self.string_table().0.len() as u32,
            },
        );
        ncmds += 1;

        (out, ncmds)
    }

    /// Returns the string table and each symbol's index into it.
    fn string_table(&self) -> (Vec<u8>, Vec<u32>) {
        let mut table = vec![0u8];
        let mut indices = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            indices.push(table.len() as u32);
            table.extend_from_slice(symbol.name.as_bytes());
            table.push(0);
        }
        (table, indices)
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let image_info_offset = self.image_info_offset();
        let symoff = image_info_offset + 8;
        let stroff = symoff + self.symbols.len() * self.nlist_size();
        let (commands, ncmds) =
            self.load_commands(image_info_offset as u32, symoff as u32, stroff as u32);

        let mut out = Vec::new();
        if self.is_64 {
            push(
                &mut out,
                &MachHeader64 {
                    magic: MH_MAGIC_64,
                    cputype: self.cputype,
                    cpusubtype: self.cpusubtype,
                    filetype: MH_DYLIB,
                    ncmds,
                    sizeofcmds: commands.len() as u32,
                    flags: self.flags,
                    reserved: 0,
                },
            );
        } else {
            push(
                &mut out,
                &MachHeader {
                    magic: MH_MAGIC,
                    cputype: self.cputype,
                    cpusubtype: self.cpusubtype,
                    filetype: MH_DYLIB,
                    ncmds,
                    sizeofcmds: commands.len() as u32,
                    flags: self.flags,
                },
            );
        }
        out.extend_from_slice(&commands);
        out.resize(image_info_offset, 0);

        // objc_image_info { version, flags }, Swift ABI version in bits 8..16.
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(u32::from(self.swift_version) << 8).to_le_bytes());

        let (strings, indices) = self.string_table();
        for (symbol, n_strx) in self.symbols.iter().zip(indices) {
            if self.is_64 {
                push(
                    &mut out,
                    &Nlist64 {
                        n_strx,
                        n_type: symbol.n_type,
                        n_sect: symbol.n_sect,
                        n_desc: symbol.n_desc,
                        n_value: 0,
                    },
                );
            } else {
                push(
                    &mut out,
                    &Nlist {
                        n_strx,
                        n_type: symbol.n_type,
                        n_sect: symbol.n_sect,
                        n_desc: symbol.n_desc,
                        n_value: 0,
                    },
                );
            }
        }
        out.extend_from_slice(&strings);
        out
    }
}

/// Wraps thin images in a fat container, each slice aligned to 4 KiB.
pub(crate) fn fat(slices: &[&[u8]]) -> Vec<u8> {
    const ALIGN: u32 = 12;

    let mut out = Vec::new();
    out.extend_from_slice(&FAT_MAGIC.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = 1usize << ALIGN;
    let mut placed = Vec::new();
    for slice in slices {
        let header = MachHeader64::read_from_prefix(slice).map(|(h, _)| h);
        let (cputype, cpusubtype) = header.map(|h| (h.cputype, h.cpusubtype)).unwrap_or((0, 0));
        out.extend_from_slice(&cputype.to_be_bytes());
        out.extend_from_slice(&cpusubtype.to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(slice.len() as u32).to_be_bytes());
        out.extend_from_slice(&ALIGN.to_be_bytes());
        placed.push(offset);
        offset += (slice.len() + (1 << ALIGN) - 1) & !((1 << ALIGN) - 1);
    }

    for (slice, at) in slices.iter().zip(placed) {
        out.resize(at, 0);
        out.extend_from_slice(slice);
    }
    out
}
