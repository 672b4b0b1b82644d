//! `tapi-tbd-v2` document emission.

use std::io::{self, Write};

use super::yaml::{scalar_width, write_scalar};
use super::{ArchitectureGroup, SymbolKind, TbdCreateInfo};

/// Column at which values start, counted from the key's indentation.
const VALUE_COLUMN: usize = 17;

/// Lists wrap before an item would run past this column.
const MAX_LINE_WIDTH: usize = 80;

const TOP_LEVEL: &str = "";
const GROUP_FIRST: &str = "  - ";
const GROUP_REST: &str = "    ";

/// Group lists in document order.
const SYMBOL_LISTS: [(SymbolKind, &str); 5] = [
    (SymbolKind::Normal, "symbols"),
    (SymbolKind::ObjcClass, "objc-classes"),
    (SymbolKind::ObjcIvar, "objc-ivars"),
    (SymbolKind::WeakDef, "weak-def-symbols"),
    (SymbolKind::ThreadLocal, "thread-local-symbols"),
];

/// Writes `prefix`, `key:` and padding. Returns the column the value starts at.
fn write_key<W: Write>(out: &mut W, prefix: &str, key: &str) -> io::Result<usize> {
    let padding = VALUE_COLUMN.saturating_sub(key.len() + 1).max(1);
    write!(out, "{prefix}{key}:{:padding$}", "")?;
    Ok(prefix.len() + key.len() + 1 + padding)
}

fn write_value<W: Write>(out: &mut W, prefix: &str, key: &str, value: &[u8]) -> io::Result<()> {
    write_key(out, prefix, key)?;
    write_scalar(out, value)?;
    out.write_all(b"\n")
}

/// Writes a flow list, continuing wrapped lines under the first item.
fn write_list<'a, W, I>(out: &mut W, prefix: &str, key: &str, items: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a [u8]>,
{
    let align = write_key(out, prefix, key)? + 2;
    out.write_all(b"[ ")?;

    let mut column = align;
    for (index, item) in items.into_iter().enumerate() {
        let width = scalar_width(item);
        if index != 0 {
            if column + 2 + width > MAX_LINE_WIDTH {
                write!(out, ",\n{:align$}", "")?;
                column = align;
            } else {
                out.write_all(b", ")?;
                column += 2;
            }
        }
        write_scalar(out, item)?;
        column += width;
    }

    out.write_all(b" ]\n")
}

fn write_group<W: Write>(out: &mut W, group: &ArchitectureGroup) -> io::Result<()> {
    write_list(
        out,
        GROUP_FIRST,
        "archs",
        group.architectures().iter().map(|arch| arch.as_bytes()),
    )?;

    if !group.reexports().is_empty() {
        write_list(
            out,
            GROUP_REST,
            "re-exports",
            group.reexports().iter().map(Vec::as_slice),
        )?;
    }

    for (kind, key) in SYMBOL_LISTS {
        let names: Vec<&[u8]> = group
            .symbols()
            .iter()
            .filter(|symbol| symbol.kind == kind)
            .map(|symbol| symbol.name.as_slice())
            .collect();
        if !names.is_empty() {
            write_list(out, GROUP_REST, key, names)?;
        }
    }
    Ok(())
}

/// Writes `info` as a `tapi-tbd-v2` document.
pub fn write_tbd<W: Write>(info: &TbdCreateInfo, out: &mut W) -> io::Result<()> {
    out.write_all(b"--- !tapi-tbd-v2\n")?;
    write_list(
        out,
        TOP_LEVEL,
        "archs",
        info.archs.iter().map(|arch| arch.as_bytes()),
    )?;

    if let Some(platform) = info.platform {
        write_value(out, TOP_LEVEL, "platform", platform.as_str().as_bytes())?;
    }
    if !info.flags.is_empty() {
        write_list(out, TOP_LEVEL, "flags", info.flags.names())?;
    }

    write_value(out, TOP_LEVEL, "install-name", &info.install_name)?;
    write_value(
        out,
        TOP_LEVEL,
        "current-version",
        info.current_version.to_string().as_bytes(),
    )?;
    write_value(
        out,
        TOP_LEVEL,
        "compatibility-version",
        info.compatibility_version.to_string().as_bytes(),
    )?;
    if info.swift_version.0 != 0 {
        write_value(
            out,
            TOP_LEVEL,
            "swift-version",
            info.swift_version.to_string().as_bytes(),
        )?;
    }
    if let Some(umbrella) = &info.parent_umbrella {
        write_value(out, TOP_LEVEL, "parent-umbrella", umbrella)?;
    }

    if !info.groups.is_empty() {
        out.write_all(b"exports:\n")?;
        for group in &info.groups {
            write_group(out, group)?;
        }
    }

    out.write_all(b"...\n")
}
