//! Text-based stub (tbd) descriptors.
//!
//! A descriptor names a dynamic library and lists, per group of
//! architectures, what the library exports. [`TbdCreateInfo`] is filled from
//! one or more Mach-O slices (or a cache image) and written out as a
//! `tapi-tbd-v2` document with [`write_tbd`].

use std::fmt;

use bitflags::bitflags;

use crate::macho::*;

mod create;
mod group;
mod writer;
pub mod yaml;

pub use group::ArchitectureGroup;
pub use writer::write_tbd;

// =============================================================================
// Symbols
// =============================================================================

/// Which list of a group a symbol is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymbolKind {
    /// Plain exported symbol
    Normal,
    /// Objective-C class, named without its `_OBJC_CLASS_$` prefix
    ObjcClass,
    /// Objective-C instance variable, named without its `_OBJC_IVAR_$` prefix
    ObjcIvar,
    /// Weak definition
    WeakDef,
    /// Thread-local variable
    ThreadLocal,
}

/// An exported symbol as it appears in a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    /// Name as written, prefix already stripped for Objective-C kinds
    pub name: Vec<u8>,
    /// Target list
    pub kind: SymbolKind,
}

const OBJC_CLASS_PREFIXES: [&[u8]; 2] = [b"_OBJC_CLASS_$", b"_OBJC_METACLASS_$"];
const OBJC_IVAR_PREFIX: &[u8] = b"_OBJC_IVAR_$";

impl Symbol {
    /// Creates a symbol of a known kind.
    pub fn new(name: &[u8], kind: SymbolKind) -> Self {
        Self {
            name: name.to_vec(),
            kind,
        }
    }

    /// Classifies an exported name.
    ///
    /// Objective-C classes and metaclasses collapse to one class entry.
    /// Objective-C names win over the weak and thread-local attributes.
    pub fn classify(name: &[u8], weak: bool, thread_local: bool) -> Self {
        if let Some(class) = OBJC_CLASS_PREFIXES
            .iter()
            .find_map(|prefix| name.strip_prefix(*prefix))
        {
            return Self::new(class, SymbolKind::ObjcClass);
        }
        if let Some(ivar) = name.strip_prefix(OBJC_IVAR_PREFIX) {
            return Self::new(ivar, SymbolKind::ObjcIvar);
        }

        let kind = if weak {
            SymbolKind::WeakDef
        } else if thread_local {
            SymbolKind::ThreadLocal
        } else {
            SymbolKind::Normal
        };
        Self::new(name, kind)
    }
}

// =============================================================================
// Platform & Versions
// =============================================================================

/// Target platform as named in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// macOS
    Macos,
    /// iOS and its simulator
    Ios,
    /// tvOS and its simulator
    Tvos,
    /// watchOS and its simulator
    Watchos,
    /// bridgeOS
    Bridgeos,
    /// Mac Catalyst
    Iosmac,
    /// DriverKit
    Driverkit,
}

impl Platform {
    /// Maps an `LC_BUILD_VERSION` platform number.
    pub fn from_raw(raw: u32) -> Option<Self> {
        let platform = match raw {
            PLATFORM_MACOS => Platform::Macos,
            PLATFORM_IOS | PLATFORM_IOSSIMULATOR => Platform::Ios,
            PLATFORM_TVOS | PLATFORM_TVOSSIMULATOR => Platform::Tvos,
            PLATFORM_WATCHOS | PLATFORM_WATCHOSSIMULATOR => Platform::Watchos,
            PLATFORM_BRIDGEOS => Platform::Bridgeos,
            PLATFORM_MACCATALYST => Platform::Iosmac,
            PLATFORM_DRIVERKIT => Platform::Driverkit,
            _ => return None,
        };
        Some(platform)
    }

    /// Name used for the `platform` key.
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Macos => "macosx",
            Platform::Ios => "ios",
            Platform::Tvos => "tvos",
            Platform::Watchos => "watchos",
            Platform::Bridgeos => "bridgeos",
            Platform::Iosmac => "iosmac",
            Platform::Driverkit => "driverkit",
        }
    }
}

/// A dylib version packed as `xxxx.yy.zz`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackedVersion(pub u32);

impl fmt::Display for PackedVersion {
    /// Trailing zero components are left out: `1.0.0` prints as `1`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = self.0 >> 16;
        let minor = (self.0 >> 8) & 0xFF;
        let patch = self.0 & 0xFF;

        write!(f, "{major}")?;
        if minor != 0 || patch != 0 {
            write!(f, ".{minor}")?;
        }
        if patch != 0 {
            write!(f, ".{patch}")?;
        }
        Ok(())
    }
}

/// Swift ABI version from `__objc_imageinfo`, as a descriptor spells it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwiftVersion(pub u32);

impl fmt::Display for SwiftVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            1 => f.write_str("1.0"),
            2 => f.write_str("1.1"),
            3 => f.write_str("2.0"),
            4 => f.write_str("3.0"),
            other => write!(f, "{other}"),
        }
    }
}

bitflags! {
    /// Values of the top-level `flags` key.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TbdFlags: u8 {
        /// Image does not use two-level namespace bindings
        const FLAT_NAMESPACE = 1 << 0;
        /// Image is not safe for use in application extensions
        const NOT_APP_EXTENSION_SAFE = 1 << 1;
    }
}

impl TbdFlags {
    /// Derives descriptor flags from Mach-O header flags.
    pub fn from_macho(flags: MachOFlags) -> Self {
        let mut out = TbdFlags::empty();
        out.set(TbdFlags::FLAT_NAMESPACE, !flags.contains(MachOFlags::TWOLEVEL));
        out.set(
            TbdFlags::NOT_APP_EXTENSION_SAFE,
            !flags.contains(MachOFlags::APP_EXTENSION_SAFE),
        );
        out
    }

    /// Names of the set flags, in document order.
    pub fn names(self) -> impl Iterator<Item = &'static [u8]> {
        [
            (TbdFlags::FLAT_NAMESPACE, &b"flat_namespace"[..]),
            (TbdFlags::NOT_APP_EXTENSION_SAFE, &b"not_app_extension_safe"[..]),
        ]
        .into_iter()
        .filter(move |(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
    }
}

// =============================================================================
// Descriptor
// =============================================================================

/// Everything written to one descriptor.
#[derive(Debug, Clone, Default)]
pub struct TbdCreateInfo {
    /// `LC_ID_DYLIB` install name
    pub install_name: Vec<u8>,
    /// Current version of the library
    pub current_version: PackedVersion,
    /// Compatibility version of the library
    pub compatibility_version: PackedVersion,
    /// Swift ABI version, 0 when the image has none
    pub swift_version: SwiftVersion,
    /// Target platform, if any slice named one
    pub platform: Option<Platform>,
    /// Umbrella framework from `LC_SUB_FRAMEWORK`
    pub parent_umbrella: Option<Vec<u8>>,
    /// Top-level flags
    pub flags: TbdFlags,
    /// Every architecture, in slice order
    pub archs: Vec<&'static str>,
    /// Export groups, in order of first appearance
    pub groups: Vec<ArchitectureGroup>,
}

impl TbdCreateInfo {
    /// Creates an empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no slice has been added yet.
    pub fn is_empty(&self) -> bool {
        self.archs.is_empty()
    }

    /// Adds the exports of one architecture, merging them into a group with
    /// an identical export set when there is one.
    pub fn add_group(&mut self, group: ArchitectureGroup) {
        let existing = self.groups.iter_mut().find(|g| g.has_same_exports(&group));
        match existing {
            Some(existing) => {
                for arch in group.architectures() {
                    existing.add_architecture(*arch);
                }
            }
            None => self.groups.push(group),
        }
    }
}
