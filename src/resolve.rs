/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Symbol resolution.
//!
//! Every file offers its global definitions; the best offer per name wins
//! according to the rank lattice (see [crate::symbol::get_rank]), with
//! command-line order as the tiebreaker. Claiming runs file-parallel under
//! the per-symbol locks, then archive members are pulled to a fixed point:
//! an alive object's unresolved reference to a symbol defined by a dead
//! archive member wakes that member up, which may reference further
//! members, and so on. Files that stay dead get their provisional claims
//! cleared at the end.

use crate::context::Context;
use crate::macho;
use crate::object::ObjectFile;
use crate::symbol::{self, get_rank, FileRef, SubsecRef, SymRef, SymbolDef, Visibility};
use rayon::prelude::*;
use std::sync::atomic::Ordering;

fn current_rank(ctx: &Context, def: &SymbolDef) -> u64 {
    match def.file {
        None => symbol::UNCLAIMED_RANK,
        Some(FileRef::Obj(idx)) => {
            let file = &ctx.objs[idx as usize];
            get_rank(file.priority, false, !file.alive(), def.is_common, def.is_weak)
        }
        Some(FileRef::Dylib(idx)) => {
            let file = &ctx.dylibs[idx as usize];
            get_rank(file.priority, true, false, def.is_common, def.is_weak)
        }
    }
}

fn resolve_object(ctx: &Context, file: &ObjectFile) {
    for i in 0..file.syms.len() {
        let msym = file.mach_syms[i];
        if !msym.is_extern() || msym.is_undef() {
            continue;
        }

        // Global symbols in a discarded segment (e.g. __LLVM) are silently
        // ignored.
        if msym.typ() == macho::N_SECT && file.sym_to_subsec[i].is_none() {
            continue;
        }

        let SymRef::Global(id) = file.syms[i] else {
            continue;
        };
        let sym = &ctx.symtab.syms[id as usize];
        let mut def = sym.def();
        let is_weak = msym.desc & macho::N_WEAK_DEF != 0;

        let rank = get_rank(
            file.priority,
            false,
            !file.alive(),
            msym.is_common(),
            is_weak,
        );
        if rank >= current_rank(ctx, &def) {
            continue;
        }

        def.file = Some(FileRef::Obj(file.file_idx));
        def.visibility = Visibility::Module;
        def.is_weak = is_weak;
        def.no_dead_strip = msym.desc & macho::N_NO_DEAD_STRIP != 0;

        match msym.typ() {
            macho::N_UNDF => {
                assert!(msym.is_common());
                def.subsec = None;
                def.value = msym.value;
                def.is_common = true;
                def.is_abs = false;
                def.is_tlv = false;
            }
            macho::N_ABS => {
                def.subsec = None;
                def.value = msym.value;
                def.is_common = false;
                def.is_abs = true;
                def.is_tlv = false;
            }
            macho::N_SECT => {
                let subsec = file.sym_to_subsec[i].unwrap();
                def.subsec = Some(SubsecRef {
                    file: file.file_idx,
                    idx: subsec,
                });
                def.value = msym.value - file.subsections[subsec as usize].input_addr as u64;
                def.is_common = false;
                def.is_abs = false;
                def.is_tlv =
                    file.subsec_isec(subsec).hdr.type_ == macho::S_THREAD_LOCAL_VARIABLES;
            }
            _ => {
                drop(def);
                fatal!(ctx, "{}: unknown symbol type: {}", sym.name, msym.typ());
            }
        }
    }
}

fn resolve_dylib(ctx: &Context, dylib: &crate::dylib::DylibFile) {
    for (i, (_, &flags)) in dylib.exports.iter().enumerate() {
        let sym = &ctx.symtab.syms[dylib.syms[i] as usize];
        let mut def = sym.def();

        let rank = get_rank(dylib.priority, true, false, false, false);
        if rank >= current_rank(ctx, &def) {
            continue;
        }

        def.file = Some(FileRef::Dylib(dylib.file_idx));
        def.visibility = Visibility::Global;
        def.is_weak =
            dylib.is_weak || flags & macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0;
        def.no_dead_strip = false;
        def.subsec = None;
        def.value = 0;
        def.is_common = false;
        def.is_abs = false;
        def.is_tlv = flags & macho::EXPORT_SYMBOL_FLAGS_KIND_MASK
            == macho::EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL;
    }
}

/// Promote visibilities contributed by this file and wake up the files
/// that provide its unresolved references. Newly woken objects are fed
/// back into the worklist.
fn mark_live_objects(ctx: &Context, file: &ObjectFile, feeder: &mut Vec<u32>) {
    assert!(file.alive());

    let is_module_local = |msym: &macho::MachSym| {
        file.is_hidden
            || msym.is_private_extern()
            || (msym.desc & macho::N_WEAK_REF != 0 && msym.desc & macho::N_WEAK_DEF != 0)
    };

    for i in 0..file.syms.len() {
        let msym = file.mach_syms[i];
        if !msym.is_extern() {
            continue;
        }
        let SymRef::Global(id) = file.syms[i] else {
            continue;
        };
        let sym = &ctx.symtab.syms[id as usize];
        let mut def = sym.def();

        // If at least one object defines it as non-hidden, the result is
        // GLOBAL instead of MODULE, so that the symbol is exported.
        if !msym.is_undef() && !is_module_local(&msym) {
            def.visibility = Visibility::Global;
        }

        if let Some(file_ref) = def.file {
            if msym.is_undef() || (msym.is_common() && !def.is_common) {
                wake(ctx, file_ref, feeder);
            }
        }
    }

    for subsec in &file.subsections {
        let recs = &file.unwind_records
            [subsec.unwind_offset as usize..(subsec.unwind_offset + subsec.nunwind) as usize];
        for rec in recs {
            if let Some(personality) = rec.personality {
                if let SymRef::Global(id) = personality {
                    let def = ctx.symtab.syms[id as usize].def();
                    if let Some(file_ref) = def.file {
                        wake(ctx, file_ref, feeder);
                    }
                }
            }
        }
    }
}

fn wake(ctx: &Context, file_ref: FileRef, feeder: &mut Vec<u32>) {
    match file_ref {
        FileRef::Obj(idx) => {
            if !ctx.objs[idx as usize].is_alive.swap(true, Ordering::AcqRel) {
                feeder.push(idx);
            }
        }
        FileRef::Dylib(idx) => {
            ctx.dylibs[idx as usize].is_alive.store(true, Ordering::Release);
        }
    }
}

/// The resolver driver: claim, pull archive members to a fixed point, and
/// drop the claims of everything that stayed dead.
pub fn resolve_symbols(ctx: &mut Context) {
    // -ObjC loads archive members that define Objective-C things even if
    // nothing references them.
    if ctx.arg.objc {
        for file in &ctx.objs {
            if !file.alive() && file.is_objc_object(&ctx.symtab) {
                file.is_alive.store(true, Ordering::Release);
            }
        }
    }

    {
        let ctx_ref = &*ctx;
        ctx_ref
            .objs
            .par_iter()
            .for_each(|file| resolve_object(ctx_ref, file));
        ctx_ref
            .dylibs
            .par_iter()
            .for_each(|dylib| resolve_dylib(ctx_ref, dylib));
    }

    // Seed the worklist with alive objects plus whatever the entry point
    // and -u force-undefined names pull in.
    let mut worklist: Vec<u32> = ctx
        .objs
        .iter()
        .filter(|f| f.alive())
        .map(|f| f.file_idx)
        .collect();

    let mut forced: Vec<String> = ctx.arg.forced_undefined.clone();
    if ctx.arg.output_type == macho::MH_EXECUTE {
        forced.push(ctx.arg.entry.clone());
    }
    for name in forced {
        let id = ctx.symtab.intern(&name);
        let def = ctx.symtab.syms[id as usize].def();
        if let Some(file_ref) = def.file {
            drop(def);
            let ctx_ref = &*ctx;
            wake(ctx_ref, file_ref, &mut worklist);
        }
    }

    let mut pos = 0;
    while pos < worklist.len() {
        let idx = worklist[pos];
        pos += 1;
        let ctx_ref = &*ctx;
        let mut feeder = Vec::new();
        mark_live_objects(ctx_ref, &ctx_ref.objs[idx as usize], &mut feeder);
        worklist.extend(feeder);
    }

    // Claims made by files that stayed dead are void.
    for file in &ctx.objs {
        if !file.alive() {
            clear_file_symbols(ctx, FileRef::Obj(file.file_idx), &file.syms);
        }
    }
    for dylib in &ctx.dylibs {
        if !dylib.alive() {
            let syms: Vec<SymRef> = dylib.syms.iter().map(|&id| SymRef::Global(id)).collect();
            clear_file_symbols(ctx, FileRef::Dylib(dylib.file_idx), &syms);
        }
    }
}

fn clear_file_symbols(ctx: &Context, file_ref: FileRef, syms: &[SymRef]) {
    for &sym_ref in syms {
        let SymRef::Global(id) = sym_ref else { continue };
        let mut def = ctx.symtab.syms[id as usize].def();
        if def.file == Some(file_ref) {
            def.clear();
        }
    }
}

/// Create the internal file that synthesizes linker-provided symbols.
pub fn create_internal_file(ctx: &mut Context) {
    let idx = ctx.add_object(
        "<internal>".to_string(),
        String::new(),
        crate::input::FileData::empty(),
        true,
        false,
    );
    // The internal file sorts before all command-line inputs.
    ctx.objs[idx as usize].priority = 1;
    ctx.internal_obj = idx as usize;

    let mut claim = |ctx: &mut Context, id: u32, visibility: Visibility| {
        let sym = &ctx.symtab.syms[id as usize];
        let mut def = sym.def();
        if def.file.is_none() {
            def.file = Some(FileRef::Obj(idx));
            def.visibility = visibility;
            def.is_abs = false;
            def.value = 0;
            drop(def);
            ctx.objs[idx as usize].syms.push(SymRef::Global(id));
        }
    };

    match ctx.arg.output_type {
        macho::MH_EXECUTE => {
            claim(ctx, ctx.mh_execute_header, Visibility::Global);
        }
        macho::MH_DYLIB => {
            claim(ctx, ctx.mh_dylib_header, Visibility::Module);
        }
        macho::MH_BUNDLE => {
            claim(ctx, ctx.mh_bundle_header, Visibility::Module);
        }
        _ => {}
    }
    claim(ctx, ctx.dso_handle, Visibility::Module);
    claim(ctx, ctx.dyld_private, Visibility::Module);

    if ctx.arg.output_type == macho::MH_EXECUTE {
        ctx.entry_sym = Some(ctx.symtab.intern(&ctx.arg.entry.clone()));
    }
}

/// Give the sentinels their final addresses. Runs after layout.
pub fn fix_synthetic_symbols(ctx: &Context) {
    let header_addr = ctx.chunks[ctx.mach_hdr].hdr.addr;
    let data_addr = ctx.chunks[ctx.data].hdr.addr;

    let fix = |id: u32, value: u64| {
        let mut def = ctx.symtab.syms[id as usize].def();
        if matches!(def.file, Some(FileRef::Obj(idx)) if idx as usize == ctx.internal_obj) {
            def.value = value;
        }
    };

    fix(ctx.mh_execute_header, header_addr);
    fix(ctx.mh_dylib_header, header_addr);
    fix(ctx.mh_bundle_header, header_addr);
    fix(ctx.dso_handle, header_addr);
    fix(ctx.dyld_private, data_addr);

    // `_objc_msgSend$foo` resolves to its `__objc_stubs` entry.
    if let Some(objc_stubs) = ctx.objc_stubs {
        let base = ctx.chunks[objc_stubs].hdr.addr;
        let entry_size = crate::arch::info(ctx.arg.arch).objc_stub_size;
        for (i, &id) in ctx.objc_stub_syms.iter().enumerate() {
            let mut def = ctx.symtab.syms[id as usize].def();
            def.value = base + i as u64 * entry_size;
        }
    }
}

/// After resolution, surviving common symbols become zero-initialized
/// subsections in a synthetic `__DATA,__common` zerofill section.
pub fn convert_common_symbols(ctx: &mut Context) {
    for file_idx in 0..ctx.objs.len() {
        if file_idx == ctx.internal_obj || !ctx.objs[file_idx].alive() {
            continue;
        }
        let mut common_isec: Option<u32> = None;

        for i in 0..ctx.objs[file_idx].syms.len() {
            let SymRef::Global(id) = ctx.objs[file_idx].syms[i] else {
                continue;
            };
            let (is_ours, size, p2align, no_dead_strip) = {
                let def = ctx.symtab.syms[id as usize].def();
                let msym = ctx.objs[file_idx].mach_syms[i];
                (
                    def.file == Some(FileRef::Obj(file_idx as u32)) && def.is_common,
                    msym.value,
                    msym.common_p2align(),
                    msym.desc & macho::N_NO_DEAD_STRIP != 0,
                )
            };
            if !is_ours {
                continue;
            }

            let isec_idx = match common_isec {
                Some(idx) => idx,
                None => {
                    let osec = ctx.common;
                    let file = &mut ctx.objs[file_idx];
                    let secidx = file.sections.len() as u32;
                    let hdr = macho::MachSection {
                        segname: "__DATA".to_string(),
                        sectname: "__common".to_string(),
                        type_: macho::S_ZEROFILL,
                        ..Default::default()
                    };
                    let mut isec = crate::object::InputSection::new(hdr, secidx);
                    isec.osec = osec;
                    file.sections.push(Some(isec));
                    common_isec = Some(secidx);
                    secidx
                }
            };

            let file = &mut ctx.objs[file_idx];
            let subsec_idx = file.subsections.len() as u32;
            file.subsections.push(crate::object::Subsection::new(
                isec_idx,
                0,
                size as u32,
                p2align,
                !ctx.arg.dead_strip,
            ));
            // The common section's alignment reflects the max over its
            // contributing symbols.
            if let Some(isec) = file.sections[isec_idx as usize].as_mut() {
                isec.hdr.p2align = isec.hdr.p2align.max(p2align as u32);
            }

            let mut def = ctx.symtab.syms[id as usize].def();
            def.is_weak = false;
            def.no_dead_strip = no_dead_strip;
            def.subsec = Some(SubsecRef {
                file: file_idx as u32,
                idx: subsec_idx,
            });
            def.value = 0;
            def.is_common = false;
            def.is_abs = false;
            def.is_tlv = false;
        }
    }
}

/// A strong, non-weak definition of one name by two different files is an
/// error (but not fatal, so that all duplicates get reported).
pub fn check_duplicate_symbols(ctx: &Context) {
    for file in &ctx.objs {
        if !file.alive() || file.file_idx as usize == ctx.internal_obj {
            continue;
        }
        for i in 0..file.syms.len() {
            let SymRef::Global(id) = file.syms[i] else {
                continue;
            };
            let msym = file.mach_syms[i];
            if msym.is_undef() || msym.is_common() || msym.desc & macho::N_WEAK_DEF != 0 {
                continue;
            }
            // Symbols in discarded sections never claimed anything.
            if msym.typ() == macho::N_SECT && file.sym_to_subsec[i].is_none() {
                continue;
            }
            let def = ctx.symtab.syms[id as usize].def();
            if let Some(owner) = def.file {
                if owner != FileRef::Obj(file.file_idx) {
                    let owner_name = match owner {
                        FileRef::Obj(idx) => ctx.objs[idx as usize].display_name(),
                        FileRef::Dylib(idx) => ctx.dylibs[idx as usize].name.clone(),
                    };
                    drop(def);
                    error!(
                        ctx,
                        "duplicate symbol: {}: {}: {}",
                        file.display_name(),
                        owner_name,
                        ctx.symtab.syms[id as usize].name
                    );
                }
            }
        }
    }
}

/// Decide, for every global symbol, whether it is bound by dyld at load
/// time (`is_imported`) and/or published in the export trie
/// (`is_exported`).
pub fn compute_import_export(ctx: &Context) {
    for sym in &ctx.symtab.syms {
        let mut def = sym.def();
        match def.file {
            Some(FileRef::Dylib(_)) => def.is_imported = true,
            Some(FileRef::Obj(_)) => {
                if def.visibility == Visibility::Global {
                    def.is_exported = true;
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    // Build a context with two objects that both define `_foo`; the second
    // is a dead archive member with a weak definition. Resolution must be
    // a pure function of (rank, priority).
    #[test]
    fn strong_object_beats_weak_archive_member() {
        let mut ctx = Context::new(Options::default());

        let strong = ctx.add_object(
            "b.o".to_string(),
            String::new(),
            crate::input::FileData::empty(),
            true,
            false,
        );
        let weak = ctx.add_object(
            "a.o".to_string(),
            "libA.a".to_string(),
            crate::input::FileData::empty(),
            false,
            false,
        );

        let id = ctx.symtab.intern("_foo");

        // Simulate both files offering a definition, in reverse priority
        // order to prove ordering doesn't matter.
        for (file_idx, is_weak, alive) in [(weak, true, false), (strong, false, true)] {
            let sym = &ctx.symtab.syms[id as usize];
            let mut def = sym.def();
            let rank = get_rank(
                ctx.objs[file_idx as usize].priority,
                false,
                !alive,
                false,
                is_weak,
            );
            if rank < current_rank(&ctx, &def) {
                def.file = Some(FileRef::Obj(file_idx));
                def.is_weak = is_weak;
            }
        }

        let def = ctx.symtab.syms[id as usize].def();
        assert_eq!(def.file, Some(FileRef::Obj(strong)));
        assert!(!def.is_weak);
        // The archive member was not claimed.
        assert!(!ctx.objs[weak as usize].alive());
    }
}
