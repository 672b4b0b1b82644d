//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (big-endian, needs byte swap)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

/// 32-bit Mach-O magic (big-endian)
pub const MH_CIGAM: u32 = 0xCEFAEDFE;

/// Fat container magic, as read big-endian
pub const FAT_MAGIC: u32 = 0xCAFEBABE;

/// Fat container with 64-bit offsets, as read big-endian
pub const FAT_MAGIC_64: u32 = 0xCAFEBABF;

/// Fat headers listing more slices than this are treated as some other
/// format. Java class files share `FAT_MAGIC`, and their version field lands
/// where `nfat_arch` would be.
pub const MAX_FAT_ARCHS: u32 = 20;

// =============================================================================
// File Types
// =============================================================================

/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Shared library stub
pub const MH_DYLIB_STUB: u32 = 0x9;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// ILP32 on a 64-bit architecture
pub const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
/// ARM64 with 32-bit pointers
pub const CPU_TYPE_ARM64_32: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;

// =============================================================================
// CPU Subtypes
// =============================================================================

/// Capability bits in the high byte of a subtype
pub const CPU_SUBTYPE_MASK: u32 = 0xFF00_0000;

/// i386 all
pub const CPU_SUBTYPE_I386_ALL: u32 = 3;
/// x86_64 all
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
/// x86_64 Haswell
pub const CPU_SUBTYPE_X86_64_H: u32 = 8;

/// ARMv7
pub const CPU_SUBTYPE_ARM_V7: u32 = 9;
/// ARMv7s (Swift)
pub const CPU_SUBTYPE_ARM_V7S: u32 = 11;
/// ARMv7k (Kirkwood40)
pub const CPU_SUBTYPE_ARM_V7K: u32 = 12;

/// ARM64 all
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
/// ARM64e (pointer authentication)
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

/// Returns the architecture name used in stub files.
///
/// Returns `None` for cpu types and subtypes that stubs cannot describe.
pub fn arch_name(cputype: u32, cpusubtype: u32) -> Option<&'static str> {
    let subtype = cpusubtype & !CPU_SUBTYPE_MASK;
    let name = match (cputype, subtype) {
        (CPU_TYPE_X86, _) => "i386",
        (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H) => "x86_64h",
        (CPU_TYPE_X86_64, _) => "x86_64",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7) => "armv7",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7S) => "armv7s",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7K) => "armv7k",
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E) => "arm64e",
        (CPU_TYPE_ARM64, _) => "arm64",
        (CPU_TYPE_ARM64_32, _) => "arm64_32",
        _ => return None,
    };
    Some(name)
}

/// Returns true if `name` is an architecture [`arch_name`] can produce.
pub fn is_known_arch(name: &str) -> bool {
    matches!(
        name,
        "i386"
            | "x86_64"
            | "x86_64h"
            | "armv7"
            | "armv7s"
            | "armv7k"
            | "arm64"
            | "arm64e"
            | "arm64_32"
    )
}

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Segment of this file
pub const LC_SEGMENT: u32 = 0x1;
/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Dynamically linked shared lib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Sub framework
pub const LC_SUB_FRAMEWORK: u32 = 0x12;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// Load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Build for macOS min version
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
/// Build for iOS min version
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
/// Build for tvOS min version
pub const LC_VERSION_MIN_TVOS: u32 = 0x2F;
/// Build for watchOS min version
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
/// Build for platform min version
pub const LC_BUILD_VERSION: u32 = 0x32;
/// Used with linkedit_data_command, payload is trie
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;

// =============================================================================
// Platforms
// =============================================================================

/// macOS
pub const PLATFORM_MACOS: u32 = 1;
/// iOS
pub const PLATFORM_IOS: u32 = 2;
/// tvOS
pub const PLATFORM_TVOS: u32 = 3;
/// watchOS
pub const PLATFORM_WATCHOS: u32 = 4;
/// bridgeOS
pub const PLATFORM_BRIDGEOS: u32 = 5;
/// Mac Catalyst
pub const PLATFORM_MACCATALYST: u32 = 6;
/// iOS simulator
pub const PLATFORM_IOSSIMULATOR: u32 = 7;
/// tvOS simulator
pub const PLATFORM_TVOSSIMULATOR: u32 = 8;
/// watchOS simulator
pub const PLATFORM_WATCHOSSIMULATOR: u32 = 9;
/// DriverKit
pub const PLATFORM_DRIVERKIT: u32 = 10;

// =============================================================================
// Section Types
// =============================================================================

/// Section types mask
pub const SECTION_TYPE: u32 = 0x0000_00FF;
/// Thread local variable section
pub const S_THREAD_LOCAL_VARIABLES: u32 = 0x13;

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xE0;
/// Private external symbol bit
pub const N_PEXT: u8 = 0x10;
/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;

/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Absolute symbol
pub const N_ABS: u8 = 0x2;
/// Indirect
pub const N_INDR: u8 = 0xA;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

/// Weak definition (`n_desc`)
pub const N_WEAK_DEF: u16 = 0x0080;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// The subset of Mach-O header flags that stubs record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// The code was linked for use in an application extension
        const APP_EXTENSION_SAFE = 0x0200_0000;
    }
}
