/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Relocation scanning and synthesized-entry materialization.
//!
//! The scanner walks every relocation of every live subsection and flags
//! the referenced symbols with what they will need in the output: a GOT
//! slot, a stub, a thread-pointer slot. Flags accumulate atomically; the
//! entries themselves are assigned afterwards in a deterministic order
//! (file priority, then symbol order within the file).
//!
//! It is also the place where `_objc_msgSend$<selector>` references are
//! given substance: the selector is interned as a cstring, a selref slot
//! is added, and the symbol becomes an `__objc_stubs` entry.

use crate::context::Context;
use crate::layout::ChunkKind;
use crate::macho;
use crate::object::{InputSection, Relocation, RelocTarget, SectionData, Subsection};
use crate::symbol::{self, FileRef, SubsecRef, SymRef, Visibility};
use rayon::prelude::*;
use std::sync::atomic::Ordering;

pub fn scan_relocations(ctx: &mut Context) {
    {
        let ctx_ref = &*ctx;
        ctx_ref.objs.par_iter().for_each(|file| {
            for (i, subsec) in file.subsections.iter().enumerate() {
                if subsec.alive() {
                    crate::arch::scan_relocations(
                        ctx_ref,
                        SubsecRef {
                            file: file.file_idx,
                            idx: i as u32,
                        },
                    );
                }
            }
        });
    }
    ctx.checkpoint();

    claim_objc_msgsend_symbols(ctx);
    flag_personalities(ctx);
    materialize_entries(ctx);

    // Scanning may have brought more dylibs to life; ordinals are final
    // only now.
    crate::dylib::assign_dylib_ordinals(ctx);
}

/// Synthesize `__objc_stubs` entries for references to undefined
/// `_objc_msgSend$<selector>` symbols.
fn claim_objc_msgsend_symbols(ctx: &mut Context) {
    const PREFIX: &str = "_objc_msgSend$";

    let mut claimed: Vec<u32> = Vec::new();
    for (id, sym) in ctx.symtab.syms.iter().enumerate() {
        if sym.name.starts_with(PREFIX) && sym.def().file.is_none() {
            claimed.push(id as u32);
        }
    }
    if claimed.is_empty() {
        return;
    }

    if ctx.objc_stubs.is_none() {
        let idx = crate::layout::add_chunk(ctx, "__TEXT", "__objc_stubs", false, ChunkKind::ObjcStubs);
        let hdr = &mut ctx.chunks[idx].hdr;
        hdr.p2align = 5;
        hdr.attr = macho::S_ATTR_SOME_INSTRUCTIONS | macho::S_ATTR_PURE_INSTRUCTIONS;
        ctx.objc_stubs = Some(idx);
    }

    // Calling through the stubs needs _objc_msgSend's GOT slot.
    ctx.symtab.syms[ctx.objc_msgsend as usize]
        .flags
        .fetch_or(symbol::NEEDS_GOT, Ordering::Relaxed);

    for id in claimed {
        let selector = ctx.symtab.syms[id as usize].name[PREFIX.len()..].to_string();

        let methname = add_methname_string(ctx, &selector);
        let selref = add_selref(ctx, methname);
        ctx.objc_methnames.push(methname);
        ctx.objc_selrefs.push(selref);
        ctx.objc_stub_syms.push(id);

        let internal = ctx.internal_obj;
        {
            let mut def = ctx.symtab.syms[id as usize].def();
            def.file = Some(FileRef::Obj(internal as u32));
            def.visibility = Visibility::Local;
        }
        ctx.objs[internal].syms.push(SymRef::Global(id));
    }
}

/// Append a section to the internal file and return its index.
fn add_internal_section(
    ctx: &mut Context,
    segname: &str,
    sectname: &str,
    type_: u8,
    attr: u32,
    contents: Vec<u8>,
) -> u32 {
    let internal = ctx.internal_obj;
    let addr = ctx.objs[internal]
        .sections
        .iter()
        .flatten()
        .map(|isec| isec.hdr.addr + isec.hdr.size)
        .max()
        .unwrap_or(0);

    let osec = crate::layout::get_output_section(ctx, segname, sectname);
    let file = &mut ctx.objs[internal];
    let secidx = file.sections.len() as u32;
    let hdr = macho::MachSection {
        segname: segname.to_string(),
        sectname: sectname.to_string(),
        addr,
        size: contents.len() as u64,
        type_,
        attr,
        ..Default::default()
    };
    let mut isec = InputSection::new(hdr, secidx);
    isec.osec = osec;
    isec.contents = SectionData::Owned(contents);
    file.sections.push(Some(isec));
    secidx
}

fn add_methname_string(ctx: &mut Context, selector: &str) -> SubsecRef {
    let mut contents = selector.as_bytes().to_vec();
    contents.push(0);
    let size = contents.len() as u32;

    let secidx = add_internal_section(
        ctx,
        "__TEXT",
        "__objc_methname",
        macho::S_CSTRING_LITERALS,
        0,
        contents,
    );

    let internal = ctx.internal_obj;
    let file = &mut ctx.objs[internal];
    let addr = file.sections[secidx as usize].as_ref().unwrap().hdr.addr;
    let idx = file.subsections.len() as u32;
    file.subsections.push(Subsection::new(
        secidx,
        addr as u32,
        size,
        0,
        true,
    ));
    SubsecRef {
        file: internal as u32,
        idx,
    }
}

fn add_selref(ctx: &mut Context, methname: SubsecRef) -> SubsecRef {
    let secidx = add_internal_section(
        ctx,
        "__DATA",
        "__objc_selrefs",
        macho::S_LITERAL_POINTERS,
        macho::S_ATTR_NO_DEAD_STRIP,
        vec![0; 8],
    );

    let internal = ctx.internal_obj;
    let file = &mut ctx.objs[internal];
    let addr = file.sections[secidx as usize].as_ref().unwrap().hdr.addr;

    let abs_rel = crate::arch::info(ctx.arg.arch).abs_rel;
    file.sections[secidx as usize]
        .as_mut()
        .unwrap()
        .rels
        .push(Relocation {
            offset: 0,
            type_: abs_rel,
            size: 8,
            is_pcrel: false,
            is_subtracted: false,
            addend: 0,
            target: RelocTarget::Subsec(methname.idx),
            thunk_idx: -1,
            thunk_sym_idx: -1,
        });

    let idx = file.subsections.len() as u32;
    let mut subsec = Subsection::new(secidx, addr as u32, 8, 3, true);
    subsec.rel_offset = 0;
    subsec.nrels = 1;
    file.subsections.push(subsec);
    SubsecRef {
        file: internal as u32,
        idx,
    }
}

/// Personality functions are reached through the GOT, both from
/// `__unwind_info` and from re-emitted CIEs, so every surviving
/// personality needs a slot.
fn flag_personalities(ctx: &Context) {
    for file in &ctx.objs {
        if !file.alive() {
            continue;
        }
        for subsec in &file.subsections {
            if !subsec.alive() {
                continue;
            }
            let recs = &file.unwind_records[subsec.unwind_offset as usize
                ..(subsec.unwind_offset + subsec.nunwind) as usize];
            for rec in recs {
                if let Some(personality) = rec.personality {
                    ctx.sym(personality)
                        .flags
                        .fetch_or(symbol::NEEDS_GOT, Ordering::Relaxed);
                }
            }
        }
        for cie in &file.cies {
            if let Some(personality) = cie.personality {
                ctx.sym(personality)
                    .flags
                    .fetch_or(symbol::NEEDS_GOT, Ordering::Relaxed);
            }
        }
    }
}

/// Turn the accumulated NEEDS_* flags into GOT / stub / thread-pointer
/// slots, in deterministic (file, symbol) order.
fn materialize_entries(ctx: &mut Context) {
    // When everything goes through chained fixups there is no lazy-bind
    // path, so stubs jump through GOT entries.
    let stubs_need_got = ctx.arg.fixup_chains;

    // dyld_stub_binder backs the lazy-binding scheme.
    let needs_stub_binder = ctx.stub_helper.is_some();

    // Locals can be flagged too (a GOT-load against a static function
    // arrives as an extern relocation against a non-extern symbol), so the
    // walk covers both tables.
    let mut order: Vec<SymRef> = Vec::new();
    let mut seen = rustc_hash::FxHashSet::default();
    for file in &ctx.objs {
        for &sym_ref in &file.syms {
            match sym_ref {
                SymRef::Global(id) => {
                    if seen.insert(id) {
                        order.push(sym_ref);
                    }
                }
                SymRef::Local { .. } => order.push(sym_ref),
            }
        }
    }

    let mut any_stub = false;
    for &sym_ref in &order {
        let flags = ctx.sym(sym_ref).flags.load(Ordering::Relaxed);
        if flags == 0 {
            continue;
        }

        if flags & symbol::NEEDS_STUB != 0 {
            any_stub = true;
            let assigned = {
                let mut def = ctx.sym(sym_ref).def();
                if def.stub_idx == -1 {
                    def.stub_idx = ctx.stub_syms.len() as i32;
                    true
                } else {
                    false
                }
            };
            if assigned {
                ctx.stub_syms.push(sym_ref);
            }
            if stubs_need_got {
                ctx.sym(sym_ref)
                    .flags
                    .fetch_or(symbol::NEEDS_GOT, Ordering::Relaxed);
            }
        }

        let flags = ctx.sym(sym_ref).flags.load(Ordering::Relaxed);
        if flags & symbol::NEEDS_GOT != 0 {
            let assigned = {
                let mut def = ctx.sym(sym_ref).def();
                if def.got_idx == -1 {
                    def.got_idx = ctx.got_syms.len() as i32;
                    true
                } else {
                    false
                }
            };
            if assigned {
                ctx.got_syms.push(sym_ref);
            }
        }
        if flags & symbol::NEEDS_THREAD_PTR != 0 {
            let assigned = {
                let mut def = ctx.sym(sym_ref).def();
                if def.tlv_idx == -1 {
                    def.tlv_idx = ctx.tlv_syms.len() as i32;
                    true
                } else {
                    false
                }
            };
            if assigned {
                ctx.tlv_syms.push(sym_ref);
            }
        }
    }

    // _objc_msgSend's GOT slot (referenced by the objc stubs) and the
    // lazy-binding runtime's own entries.
    if !ctx.objc_stub_syms.is_empty() {
        let sym = &ctx.symtab.syms[ctx.objc_msgsend as usize];
        let mut def = sym.def();
        if def.got_idx == -1 {
            def.got_idx = ctx.got_syms.len() as i32;
            drop(def);
            ctx.got_syms.push(SymRef::Global(ctx.objc_msgsend));
        }
    }

    if needs_stub_binder && any_stub {
        let sym = &ctx.symtab.syms[ctx.dyld_stub_binder as usize];
        {
            let def = sym.def();
            if def.file.is_none() {
                drop(def);
                error!(
                    ctx,
                    "undefined symbol: dyld_stub_binder (required for lazy binding)"
                );
            }
        }
        let mut def = sym.def();
        if def.got_idx == -1 {
            def.got_idx = ctx.got_syms.len() as i32;
            drop(def);
            ctx.got_syms.push(SymRef::Global(ctx.dyld_stub_binder));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    #[test]
    fn msgsend_selector_synthesis() {
        let mut ctx = Context::new(Options::default());
        crate::resolve::create_internal_file(&mut ctx);

        let id = ctx.symtab.intern("_objc_msgSend$alloc");
        claim_objc_msgsend_symbols(&mut ctx);

        assert_eq!(ctx.objc_methnames.len(), 1);
        assert_eq!(ctx.objc_selrefs.len(), 1);
        assert_eq!(ctx.objc_stub_syms, vec![id]);
        assert!(ctx.objc_stubs.is_some());

        // The symbol now belongs to the internal file.
        let def = ctx.symtab.syms[id as usize].def();
        assert_eq!(def.file, Some(FileRef::Obj(ctx.internal_obj as u32)));

        // The methname subsection holds the NUL-terminated selector.
        let methname = ctx.objc_methnames[0];
        let file = &ctx.objs[methname.file as usize];
        let subsec = &file.subsections[methname.idx as usize];
        let isec = file.subsec_isec(methname.idx);
        assert_eq!(isec.hdr.sectname, "__objc_methname");
        assert_eq!(subsec.input_size, 6); // "alloc\0"

        // The selref carries one absolute relocation to the methname.
        let selref = ctx.objc_selrefs[0];
        let file = &ctx.objs[selref.file as usize];
        let isec = file.subsec_isec(selref.idx);
        assert_eq!(isec.rels.len(), 1);
        assert_eq!(isec.rels[0].target, RelocTarget::Subsec(methname.idx));

        // _objc_msgSend itself is flagged for a GOT slot.
        let flags = ctx.symtab.syms[ctx.objc_msgsend as usize]
            .flags
            .load(Ordering::Relaxed);
        assert!(flags & symbol::NEEDS_GOT != 0);
    }
}
