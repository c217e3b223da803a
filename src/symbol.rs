/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Global and local symbols, and the resolution rank lattice.
//!
//! Global symbols are interned by name into a single table owned by the
//! link context, so every reference to a name anywhere in the link sees the
//! same `Symbol`. Resolution state lives behind a per-symbol mutex: the
//! resolver runs file-parallel and races to claim symbols, and the lock
//! makes each rank comparison-and-update atomic. The `flags` byte is
//! updated with `fetch_or` by the (also parallel) relocation scanner.

use rustc_hash::FxHashMap;
use std::sync::atomic::AtomicU8;
use std::sync::{Mutex, MutexGuard};

pub const NEEDS_GOT: u8 = 1 << 0;
pub const NEEDS_STUB: u8 = 1 << 1;
pub const NEEDS_THREAD_PTR: u8 = 1 << 2;
pub const NEEDS_OBJC_STUB: u8 = 1 << 3;
pub const NEEDS_RANGE_EXTN_THUNK: u8 = 1 << 4;

/// Who can see a symbol. `Local` never escapes its file, `Module` is
/// output-file visibility (not exported), `Global` is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Visibility {
    Local,
    Module,
    Global,
}

/// Reference to an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileRef {
    Obj(u32),
    Dylib(u32),
}

/// Reference to a subsection: `(file index, index into that file's
/// subsection vector)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubsecRef {
    pub file: u32,
    pub idx: u32,
}

/// Reference to a symbol: interned global, or a local in some object file's
/// private table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymRef {
    Global(u32),
    Local { file: u32, idx: u32 },
}

/// The mutable half of a symbol. Frozen (except the output index fields)
/// once resolution finishes.
#[derive(Debug, Clone)]
pub struct SymbolDef {
    pub file: Option<FileRef>,
    pub subsec: Option<SubsecRef>,
    pub value: u64,
    pub visibility: Visibility,
    pub is_common: bool,
    pub is_weak: bool,
    pub is_abs: bool,
    pub is_tlv: bool,
    pub no_dead_strip: bool,
    pub is_imported: bool,
    pub is_exported: bool,
    pub stub_idx: i32,
    pub got_idx: i32,
    pub tlv_idx: i32,
    pub thunk_idx: i32,
    pub thunk_sym_idx: i32,
    pub fixup_ordinal: i32,
    pub output_symtab_idx: i32,
}

impl Default for SymbolDef {
    fn default() -> SymbolDef {
        SymbolDef {
            file: None,
            subsec: None,
            value: 0,
            visibility: Visibility::Local,
            is_common: false,
            is_weak: false,
            is_abs: false,
            is_tlv: false,
            no_dead_strip: false,
            is_imported: false,
            is_exported: false,
            stub_idx: -1,
            got_idx: -1,
            tlv_idx: -1,
            thunk_idx: -1,
            thunk_sym_idx: -1,
            fixup_ordinal: -1,
            output_symtab_idx: -1,
        }
    }
}

impl SymbolDef {
    /// Reset everything the defining file contributed. Used when an archive
    /// member that provisionally claimed symbols turns out to be dead.
    pub fn clear(&mut self) {
        *self = SymbolDef::default();
    }
}

pub struct Symbol {
    pub name: Box<str>,
    def: Mutex<SymbolDef>,
    pub flags: AtomicU8,
}

impl Symbol {
    pub fn new(name: &str) -> Symbol {
        Symbol {
            name: name.into(),
            def: Mutex::new(SymbolDef::default()),
            flags: AtomicU8::new(0),
        }
    }

    pub fn def(&self) -> MutexGuard<'_, SymbolDef> {
        self.def.lock().unwrap()
    }
}

/// The interned global symbol table. Lookup by name happens in the serial
/// glue steps between parallel loops; the parallel phases address symbols
/// by index and mutate them through the per-symbol lock, so the map itself
/// needs no synchronization.
#[derive(Default)]
pub struct SymbolTable {
    map: FxHashMap<Box<str>, u32>,
    pub syms: Vec<Symbol>,
}

impl SymbolTable {
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.map.get(name) {
            return idx;
        }
        let idx = self.syms.len() as u32;
        self.syms.push(Symbol::new(name));
        self.map.insert(name.into(), idx);
        idx
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.map.get(name).copied()
    }
}

/// Symbols with higher priorities overwrite symbols with lower priorities.
/// The list of priorities, from the highest to the lowest:
///
///  1. Strong defined symbol
///  2. Weak defined symbol
///  3. Strong defined symbol in a DSO/archive
///  4. Weak defined symbol in a DSO/archive
///  5. Common symbol
///  6. Common symbol in an archive
///  7. Unclaimed (nonexistent) symbol
///
/// Ties are broken by file priority. A lower combined value wins.
pub fn get_rank(
    priority: u32,
    is_dylib: bool,
    is_in_archive: bool,
    is_common: bool,
    is_weak: bool,
) -> u64 {
    let sym_rank: u64 = if is_common {
        debug_assert!(!is_dylib);
        if is_in_archive {
            6
        } else {
            5
        }
    } else if is_dylib || is_in_archive {
        if is_weak {
            4
        } else {
            3
        }
    } else if is_weak {
        2
    } else {
        1
    };
    (sym_rank << 24) + priority as u64
}

pub const UNCLAIMED_RANK: u64 = 7 << 24;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_lattice_order() {
        let strong_obj = get_rank(10, false, false, false, false);
        let weak_obj = get_rank(10, false, false, false, true);
        let strong_archive = get_rank(10, false, true, false, false);
        let strong_dylib = get_rank(10, true, false, false, false);
        let weak_archive = get_rank(10, false, true, false, true);
        let common_obj = get_rank(10, false, false, true, false);
        let common_archive = get_rank(10, false, true, true, false);

        assert!(strong_obj < weak_obj);
        assert!(weak_obj < strong_archive);
        assert_eq!(strong_archive, strong_dylib);
        assert!(strong_archive < weak_archive);
        assert!(weak_archive < common_obj);
        assert!(common_obj < common_archive);
        assert!(common_archive < UNCLAIMED_RANK);
    }

    #[test]
    fn rank_ties_break_by_priority() {
        // An earlier file (lower priority number) wins a tie.
        assert!(get_rank(1, false, false, false, false) < get_rank(2, false, false, false, false));
        // But a better kind beats any priority.
        assert!(get_rank(9999, false, false, false, false) < get_rank(1, false, false, false, true));
    }

    #[test]
    fn interning_is_stable() {
        let mut table = SymbolTable::default();
        let a = table.intern("_foo");
        let b = table.intern("_bar");
        assert_ne!(a, b);
        assert_eq!(table.intern("_foo"), a);
        assert_eq!(table.get("_bar"), Some(b));
        assert_eq!(table.get("_baz"), None);
        assert_eq!(&*table.syms[a as usize].name, "_foo");
    }
}
