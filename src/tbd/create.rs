//! Filling a descriptor from parsed images.

use tracing::debug;

use super::*;
use crate::dyld::{DyldContext, ExportTrieParser, ImageEntry};
use crate::error::{Error, Result};
use crate::util::read_u32_le_at;

/// Size of `objc_image_info`: a version word, then a flags word.
const IMAGE_INFO_SIZE: u64 = 8;

/// Swift ABI version lives in bits 8..16 of the image info flags.
fn swift_version(image_info: &[u8]) -> u32 {
    (read_u32_le_at(image_info, 4) >> 8) & 0xFF
}

fn add_trie_exports(group: &mut ArchitectureGroup, trie: &[u8]) -> Result<()> {
    for export in ExportTrieParser::new(trie).parse_all()? {
        group.add_symbol(Symbol::classify(
            &export.name,
            export.is_weak(),
            export.is_thread_local(),
        ));
    }
    Ok(())
}

fn agree<T: PartialEq>(current: T, incoming: T, field: &'static str) -> Result<()> {
    if current == incoming {
        Ok(())
    } else {
        Err(Error::ConflictingSlices { field })
    }
}

impl TbdCreateInfo {
    /// Adds one Mach-O slice.
    ///
    /// Exports come from the nlist symbol table, or from the export trie for
    /// images stripped of one.
    pub fn add_macho(&mut self, macho: &MachOContext<'_>) -> Result<()> {
        let arch = macho.arch_name()?;

        let swift = match macho.objc_image_info_section() {
            Some(section) if section.size >= IMAGE_INFO_SIZE => {
                swift_version(macho.file_range(section.offset.into(), IMAGE_INFO_SIZE)?)
            }
            _ => 0,
        };

        let mut group = ArchitectureGroup::new(vec![arch]);
        for reexport in macho.reexports() {
            group.add_reexport(reexport);
        }

        match macho.exported_symbols() {
            Ok(exports) => {
                for export in exports {
                    group.add_symbol(Symbol::classify(
                        export.name,
                        export.weak,
                        export.thread_local,
                    ));
                }
            }
            Err(Error::SymbolTableNotFound) => {
                if let Some((offset, size)) = macho.export_trie() {
                    let trie = macho.file_range(offset.into(), size.into())?;
                    add_trie_exports(&mut group, trie)?;
                }
            }
            Err(err) => return Err(err),
        }

        self.add_identity(macho, arch, swift, None)?;
        debug!(
            "Added {} slice with {} symbols and {} re-exports",
            arch,
            group.symbols().len(),
            group.reexports().len()
        );
        self.add_group(group);
        Ok(())
    }

    /// Adds one image of a shared cache.
    ///
    /// Cache images carry no usable symbol table, so exports come from the
    /// export trie. The cache header supplies the platform when the image's
    /// load commands do not.
    pub fn add_cache_image(&mut self, cache: &DyldContext, image: &ImageEntry) -> Result<()> {
        let macho = cache.image_macho(image)?;
        let arch = macho.arch_name()?;

        let swift = match macho.objc_image_info_section() {
            Some(section) if section.size >= IMAGE_INFO_SIZE => {
                swift_version(cache.data_at_addr(section.addr, IMAGE_INFO_SIZE as usize)?)
            }
            _ => 0,
        };

        let mut group = ArchitectureGroup::new(vec![arch]);
        for reexport in macho.reexports() {
            group.add_reexport(reexport);
        }
        if let Some(trie) = cache.export_trie(&macho)? {
            add_trie_exports(&mut group, trie)?;
        }

        self.add_identity(&macho, arch, swift, cache.platform())?;
        debug!(
            "Added cache image {} with {} symbols",
            image.path,
            group.symbols().len()
        );
        self.add_group(group);
        Ok(())
    }

    /// Records the identification of a slice, checking it against the
    /// slices already added.
    fn add_identity(
        &mut self,
        macho: &MachOContext<'_>,
        arch: &'static str,
        swift: u32,
        fallback_platform: Option<u32>,
    ) -> Result<()> {
        if !macho.header.is_dylib() {
            return Err(Error::NotADylib(macho.header.filetype));
        }
        if self.archs.contains(&arch) {
            return Err(Error::DuplicateArchitecture(arch));
        }

        let (install_name, dylib) = macho.install_name().ok_or(Error::MissingInstallName)?;
        let current_version = PackedVersion(dylib.current_version);
        let compatibility_version = PackedVersion(dylib.compatibility_version);
        let platform = macho
            .platform()
            .or(fallback_platform)
            .and_then(Platform::from_raw);
        let umbrella = macho.parent_umbrella();
        let swift = SwiftVersion(swift);

        if self.is_empty() {
            self.install_name = install_name.to_vec();
            self.current_version = current_version;
            self.compatibility_version = compatibility_version;
            self.swift_version = swift;
            self.platform = platform;
            self.parent_umbrella = umbrella.map(<[u8]>::to_vec);
        } else {
            agree(self.install_name.as_slice(), install_name, "install name")?;
            agree(self.current_version, current_version, "current version")?;
            agree(
                self.compatibility_version,
                compatibility_version,
                "compatibility version",
            )?;
            agree(self.parent_umbrella.as_deref(), umbrella, "parent umbrella")?;

            match (self.platform, platform) {
                (Some(current), Some(incoming)) => agree(current, incoming, "platform")?,
                (None, incoming) => self.platform = incoming,
                (Some(_), None) => {}
            }
            match (self.swift_version.0, swift.0) {
                (0, _) => self.swift_version = swift,
                (_, 0) => {}
                (current, incoming) => agree(current, incoming, "swift version")?,
            }
        }

        self.flags |= TbdFlags::from_macho(macho.header.flags());
        self.archs.push(arch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dyld::test_support::CacheBuilder;
    use crate::dyld::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION;
    use crate::macho::test_support::{fat, DylibBuilder};
    use crate::macho::slices;

    fn dylib(cputype: u32, cpusubtype: u32) -> DylibBuilder {
        DylibBuilder::new(cputype, cpusubtype)
            .install_name("/usr/lib/libfoo.dylib")
            .versions(0x0002_0100, 0x0001_0000)
            .platform(PLATFORM_MACOS)
    }

    fn names(group: &ArchitectureGroup, kind: SymbolKind) -> Vec<String> {
        group
            .symbols()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| String::from_utf8(s.name.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_single_slice() {
        let data = dylib(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL)
            .umbrella("System")
            .reexport("/usr/lib/libbar.dylib")
            .swift_version(5)
            .symbol("_foo")
            .weak_symbol("_weak")
            .thread_local_symbol("_tlv")
            .symbol("_OBJC_CLASS_$_Foo")
            .symbol("_OBJC_METACLASS_$_Foo")
            .symbol("_OBJC_IVAR_$_Foo._bar")
            .build();
        let macho = MachOContext::new(&data).unwrap();

        let mut info = TbdCreateInfo::new();
        info.add_macho(&macho).unwrap();

        assert_eq!(info.install_name, b"/usr/lib/libfoo.dylib");
        assert_eq!(info.current_version.to_string(), "2.1");
        assert_eq!(info.compatibility_version.to_string(), "1");
        assert_eq!(info.platform, Some(Platform::Macos));
        assert_eq!(info.parent_umbrella.as_deref(), Some(&b"System"[..]));
        assert_eq!(info.swift_version, SwiftVersion(5));
        assert!(info.flags.is_empty());
        assert_eq!(info.archs, vec!["x86_64"]);

        let group = &info.groups[0];
        assert_eq!(group.reexports(), &[b"/usr/lib/libbar.dylib".to_vec()]);
        assert_eq!(names(group, SymbolKind::Normal), vec!["_foo"]);
        assert_eq!(names(group, SymbolKind::WeakDef), vec!["_weak"]);
        assert_eq!(names(group, SymbolKind::ThreadLocal), vec!["_tlv"]);
        assert_eq!(names(group, SymbolKind::ObjcClass), vec!["_Foo"]);
        assert_eq!(names(group, SymbolKind::ObjcIvar), vec!["_Foo._bar"]);
    }

    #[test]
    fn test_fat_slices_share_group() {
        let arm64 = dylib(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL).symbol("_a").build();
        let x86 = dylib(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL).symbol("_a").build();
        let arm64e = dylib(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E)
            .symbol("_a")
            .symbol("_ptrauth_only")
            .build();
        let data = fat(&[&x86, &arm64, &arm64e]);

        let mut info = TbdCreateInfo::new();
        for slice in slices(&data).unwrap() {
            info.add_macho(&slice).unwrap();
        }

        assert_eq!(info.archs, vec!["x86_64", "arm64", "arm64e"]);
        assert_eq!(info.groups.len(), 2);
        assert_eq!(info.groups[0].architectures(), &["x86_64", "arm64"]);
        assert_eq!(info.groups[1].architectures(), &["arm64e"]);
    }

    #[test]
    fn test_conflicting_install_names() {
        let arm64 = dylib(CPU_TYPE_ARM64, 0).build();
        let x86 = DylibBuilder::new(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL)
            .install_name("/usr/lib/libother.dylib")
            .build();

        let mut info = TbdCreateInfo::new();
        info.add_macho(&MachOContext::new(&arm64).unwrap()).unwrap();
        let err = info
            .add_macho(&MachOContext::new(&x86).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::ConflictingSlices { field: "install name" }));
    }

    #[test]
    fn test_duplicate_architecture() {
        let data = dylib(CPU_TYPE_ARM64, 0).build();
        let macho = MachOContext::new(&data).unwrap();

        let mut info = TbdCreateInfo::new();
        info.add_macho(&macho).unwrap();
        assert!(matches!(
            info.add_macho(&macho),
            Err(Error::DuplicateArchitecture("arm64"))
        ));
    }

    #[test]
    fn test_rejects_non_dylib_and_missing_install_name() {
        let mut data = dylib(CPU_TYPE_ARM64, 0).build();
        // filetype lives at offset 12; 2 is MH_EXECUTE.
        data[12..16].copy_from_slice(&2u32.to_le_bytes());
        let err = TbdCreateInfo::new()
            .add_macho(&MachOContext::new(&data).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::NotADylib(2)));

        let data = DylibBuilder::new(CPU_TYPE_ARM64, 0).build();
        let err = TbdCreateInfo::new()
            .add_macho(&MachOContext::new(&data).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::MissingInstallName));
    }

    #[test]
    fn test_flat_namespace_flags() {
        let data = dylib(CPU_TYPE_ARM64, 0).flags(0).build();
        let mut info = TbdCreateInfo::new();
        info.add_macho(&MachOContext::new(&data).unwrap()).unwrap();
        assert_eq!(
            info.flags,
            TbdFlags::FLAT_NAMESPACE | TbdFlags::NOT_APP_EXTENSION_SAFE
        );
    }

    #[test]
    fn test_cache_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = CacheBuilder::new(PLATFORM_IOS)
            .image(
                "/usr/lib/libfoo.dylib",
                &[
                    ("_foo", 0),
                    ("_weak", EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION),
                    ("_OBJC_CLASS_$_Foo", 0),
                ],
            )
            .reexport("/usr/lib/libbar.dylib")
            .write(dir.path(), "dyld_shared_cache_arm64e");
        let cache = DyldContext::open(&path).unwrap();

        let mut info = TbdCreateInfo::new();
        info.add_cache_image(&cache, &cache.images[0]).unwrap();

        assert_eq!(info.install_name, b"/usr/lib/libfoo.dylib");
        // The image has no LC_BUILD_VERSION; the cache header supplies it.
        assert_eq!(info.platform, Some(Platform::Ios));
        assert_eq!(info.archs, vec!["arm64e"]);

        let group = &info.groups[0];
        assert_eq!(group.reexports(), &[b"/usr/lib/libbar.dylib".to_vec()]);
        assert_eq!(names(group, SymbolKind::Normal), vec!["_foo"]);
        assert_eq!(names(group, SymbolKind::WeakDef), vec!["_weak"]);
        assert_eq!(names(group, SymbolKind::ObjcClass), vec!["_Foo"]);
    }
}
