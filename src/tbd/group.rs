//! Per-architecture export accumulator.

use std::collections::HashSet;

use super::Symbol;

/// The symbols and re-exports shared by one set of architectures.
///
/// Symbols and re-exports are kept unique and in first-seen order, which is
/// also the order they are written in.
#[derive(Debug, Clone, Default)]
pub struct ArchitectureGroup {
    archs: Vec<&'static str>,
    symbols: Vec<Symbol>,
    symbol_set: HashSet<Symbol>,
    reexports: Vec<Vec<u8>>,
    reexport_set: HashSet<Vec<u8>>,
}

impl ArchitectureGroup {
    /// Creates an empty group for `archs`.
    pub fn new(archs: Vec<&'static str>) -> Self {
        Self {
            archs,
            ..Self::default()
        }
    }

    /// Adds `symbol` unless an equal symbol is already present.
    pub fn add_symbol(&mut self, symbol: Symbol) {
        if !self.symbol_set.contains(&symbol) {
            self.symbol_set.insert(symbol.clone());
            self.symbols.push(symbol);
        }
    }

    /// Adds a re-exported install name unless it is already present.
    pub fn add_reexport(&mut self, reexport: &[u8]) {
        if !self.reexport_set.contains(reexport) {
            self.reexport_set.insert(reexport.to_vec());
            self.reexports.push(reexport.to_vec());
        }
    }

    /// Adds an architecture that shares this group's exports.
    pub fn add_architecture(&mut self, arch: &'static str) {
        if !self.archs.contains(&arch) {
            self.archs.push(arch);
        }
    }

    /// Returns true if both groups export exactly the same symbols and
    /// re-exports, in any order.
    pub fn has_same_exports(&self, other: &ArchitectureGroup) -> bool {
        self.symbol_set == other.symbol_set && self.reexport_set == other.reexport_set
    }

    /// Architectures in this group.
    pub fn architectures(&self) -> &[&'static str] {
        &self.archs
    }

    /// Symbols in first-seen order.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Re-exported install names in first-seen order.
    pub fn reexports(&self) -> &[Vec<u8>] {
        &self.reexports
    }
}
