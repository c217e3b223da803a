/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Dead stripping: mark/sweep over subsections.
//!
//! With `-dead_strip`, every subsection starts dead and only those
//! reachable from a root set survive. Edges are relocation targets and
//! unwind-record references (the record's function, its LSDA, the
//! personality's subsection, and the FDE's function/LSDA for DWARF-backed
//! records). Liveness is a test-and-set flag, so the concurrent mark
//! visits each subsection at most once.
//!
//! `S_ATTR_LIVE_SUPPORT` sections are kept only if something they point at
//! is live; that needs a fixed point on top of the plain mark.

use crate::context::Context;
use crate::macho;
use crate::object::ObjectFile;
use crate::symbol::{FileRef, SubsecRef, SymRef};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

fn collect_root_set(ctx: &Context) -> Vec<SubsecRef> {
    let subsec_of = |sym_ref: SymRef| -> Option<SubsecRef> { ctx.sym(sym_ref).def().subsec };

    let keep = |sym_ref: SymRef, file: &ObjectFile| -> bool {
        let def = ctx.sym(sym_ref).def();
        if def.file != Some(FileRef::Obj(file.file_idx)) {
            return false;
        }
        if def.no_dead_strip {
            return true;
        }
        if ctx.arg.output_type == macho::MH_DYLIB || ctx.arg.output_type == macho::MH_BUNDLE {
            if def.visibility == crate::symbol::Visibility::Global {
                return true;
            }
        }
        false
    };

    let mut rootset: Vec<Vec<SubsecRef>> = ctx
        .objs
        .par_iter()
        .map(|file| {
            let mut roots = Vec::new();
            if !file.alive() {
                return roots;
            }

            for &sym_ref in &file.syms {
                if keep(sym_ref, file) {
                    if let Some(subsec) = subsec_of(sym_ref) {
                        roots.push(subsec);
                    }
                }
            }

            for &sym_ref in &file.init_functions {
                if let Some(subsec) = subsec_of(sym_ref) {
                    roots.push(subsec);
                }
            }

            for i in 0..file.subsections.len() {
                let hdr = &file.subsec_isec(i as u32).hdr;
                if hdr.attr & macho::S_ATTR_NO_DEAD_STRIP != 0
                    || hdr.type_ == macho::S_MOD_INIT_FUNC_POINTERS
                    || hdr.type_ == macho::S_MOD_TERM_FUNC_POINTERS
                {
                    roots.push(SubsecRef {
                        file: file.file_idx,
                        idx: i as u32,
                    });
                }
            }

            for cie in &file.cies {
                if let Some(personality) = cie.personality {
                    if let Some(subsec) = subsec_of(personality) {
                        roots.push(subsec);
                    }
                }
            }

            roots
        })
        .collect();

    let mut roots: Vec<SubsecRef> = rootset.drain(..).flatten().collect();

    for name in &ctx.arg.forced_undefined {
        if let Some(id) = ctx.symtab.get(name) {
            if let Some(subsec) = subsec_of(SymRef::Global(id)) {
                roots.push(subsec);
            }
        }
    }

    if let Some(entry) = ctx.entry_sym {
        if let Some(subsec) = subsec_of(SymRef::Global(entry)) {
            roots.push(subsec);
        }
    }

    if ctx.stub_helper.is_some() {
        if let Some(subsec) = subsec_of(SymRef::Global(ctx.dyld_stub_binder)) {
            roots.push(subsec);
        }
    }

    roots
}

/// Depth-first walk from one root. The test-and-set on `is_alive` makes
/// concurrent walks share the visited set.
fn visit(ctx: &Context, root: SubsecRef) {
    let mut stack = vec![root];

    while let Some(r) = stack.pop() {
        let subsec = ctx.subsec(r);
        if subsec.is_alive.swap(true, Ordering::AcqRel) {
            continue;
        }

        let file = &ctx.objs[r.file as usize];
        let isec = file.subsec_isec(r.idx);
        let s = &file.subsections[r.idx as usize];

        let mut push = |subsec: Option<SubsecRef>| {
            if let Some(subsec) = subsec {
                stack.push(subsec);
            }
        };

        for rel in &isec.rels[s.rel_offset as usize..(s.rel_offset + s.nrels) as usize] {
            match rel.sym() {
                Some(sym_ref) => push(ctx.sym(sym_ref).def().subsec),
                None => push(rel.subsec().map(|idx| SubsecRef { file: r.file, idx })),
            }
        }

        for rec in
            &file.unwind_records[s.unwind_offset as usize..(s.unwind_offset + s.nunwind) as usize]
        {
            push(rec.subsec.map(|idx| SubsecRef { file: r.file, idx }));
            push(rec.lsda.map(|idx| SubsecRef { file: r.file, idx }));
            if let Some(personality) = rec.personality {
                push(ctx.sym(personality).def().subsec);
            }
            if let Some(fde_idx) = rec.fde {
                let fde = &file.fdes[fde_idx as usize];
                push(Some(SubsecRef {
                    file: r.file,
                    idx: fde.subsec,
                }));
                push(fde.lsda.map(|idx| SubsecRef { file: r.file, idx }));
            }
        }
    }
}

fn refers_to_live_subsection(ctx: &Context, r: SubsecRef) -> bool {
    let file = &ctx.objs[r.file as usize];
    let isec = file.subsec_isec(r.idx);
    let s = &file.subsections[r.idx as usize];

    for rel in &isec.rels[s.rel_offset as usize..(s.rel_offset + s.nrels) as usize] {
        let live = match rel.sym() {
            Some(sym_ref) => ctx
                .sym(sym_ref)
                .def()
                .subsec
                .map_or(false, |subsec| ctx.subsec(subsec).alive()),
            None => rel
                .subsec()
                .map_or(false, |idx| file.subsections[idx as usize].alive()),
        };
        if live {
            return true;
        }
    }
    false
}

fn mark(ctx: &Context, rootset: &[SubsecRef]) {
    rootset.par_iter().for_each(|&root| visit(ctx, root));

    // Live-support sections are kept only if they reference something
    // live, which may itself be another live-support section: iterate to
    // a fixed point.
    loop {
        let repeat = AtomicBool::new(false);
        ctx.objs.par_iter().for_each(|file| {
            if !file.alive() {
                return;
            }
            for i in 0..file.subsections.len() {
                let r = SubsecRef {
                    file: file.file_idx,
                    idx: i as u32,
                };
                if file.subsec_isec(i as u32).hdr.attr & macho::S_ATTR_LIVE_SUPPORT != 0
                    && !file.subsections[i].alive()
                    && refers_to_live_subsection(ctx, r)
                {
                    visit(ctx, r);
                    repeat.store(true, Ordering::Relaxed);
                }
            }
        });
        if !repeat.load(Ordering::Relaxed) {
            break;
        }
    }
}

/// Null out the definitions whose subsection died. The subsections
/// themselves stay in their vectors (indices must remain stable); every
/// consumer filters on liveness.
fn sweep(ctx: &Context) {
    ctx.symtab.syms.par_iter().for_each(|sym| {
        let mut def = sym.def();
        if let Some(subsec) = def.subsec {
            if !ctx.subsec(subsec).alive() {
                def.clear();
            }
        }
    });

    ctx.objs.par_iter().for_each(|file| {
        for sym in &file.local_syms {
            let mut def = sym.def();
            if let Some(subsec) = def.subsec {
                if !ctx.subsec(subsec).alive() {
                    def.clear();
                }
            }
        }
    });
}

pub fn dead_strip(ctx: &mut Context) {
    let rootset = collect_root_set(ctx);
    mark(ctx, &rootset);
    sweep(ctx);
}
