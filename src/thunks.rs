/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! ARM64 range-extension thunks.
//!
//! ARM64 call/jump instructions take a 27-bit displacement, so they reach
//! only ±128 MiB. If a branch target is further away, the branch has to go
//! through a linker-synthesized sequence that builds the full target
//! address in a register and jumps there. Those sequences are "thunks".
//!
//! Offsets within a code section are assigned in an incremental sweep with
//! four cursors A ≤ B ≤ C ≤ D into the member list: D is pushed forward as
//! far as B can reach, C trails D by one 10 MiB batch, A trails C by the
//! maximum branch distance (thunks behind A can no longer be reused and
//! are reset). Each round emits one thunk serving the members in [B, C).

use crate::context::Context;
use crate::layout::ChunkKind;
use crate::macho::{self, MachSection};
use crate::symbol::{self, SubsecRef, SymRef};
use std::sync::atomic::Ordering;

// We create a thunk no further than 100 MiB from any section.
const MAX_DISTANCE: u64 = 100 * 1024 * 1024;

// We create a thunk for each 10 MiB of input sections.
const GROUP_SIZE: u64 = 10 * 1024 * 1024;

pub struct RangeExtensionThunk {
    pub thunk_idx: usize,
    pub offset: u64,
    pub symbols: Vec<SymRef>,
}

impl RangeExtensionThunk {
    pub const ENTRY_SIZE: u64 = 12;

    pub fn size(&self) -> u64 {
        self.symbols.len() as u64 * Self::ENTRY_SIZE
    }

    pub fn entry_addr(&self, osec_hdr: &MachSection, idx: usize) -> u64 {
        osec_hdr.addr + self.offset + idx as u64 * Self::ENTRY_SIZE
    }
}

fn reset_thunk(ctx: &Context, thunk: &RangeExtensionThunk) {
    for &sym_ref in &thunk.symbols {
        let sym = ctx.sym(sym_ref);
        let mut def = sym.def();
        def.thunk_idx = -1;
        def.thunk_sym_idx = -1;
        sym.flags
            .fetch_and(!symbol::NEEDS_RANGE_EXTN_THUNK, Ordering::Relaxed);
    }
}

fn is_reachable(ctx: &Context, sym_ref: SymRef, osec_idx: usize, pc: u64, addend: i64) -> bool {
    let def = ctx.sym(sym_ref).def();

    // Pessimistically assume stub entries are unreachable; stubs have not
    // been placed yet when this runs.
    if def.stub_idx != -1 {
        return false;
    }

    // Same story for anything outside this output section.
    let Some(subsec) = def.subsec else {
        return false;
    };
    if ctx.subsec_osec(subsec) != osec_idx {
        return false;
    }
    if ctx.subsec(subsec).output_offset() == u32::MAX {
        return false;
    }

    let addr = ctx.chunks[osec_idx].hdr.addr
        + ctx.subsec(subsec).output_offset() as u64
        + def.value;
    let val = addr as i64 + addend - pc as i64;
    (-(1 << 27)..1 << 27).contains(&val)
}

/// Assign output offsets to the members of a code section, interleaving
/// thunks so that every BRANCH26 relocation can reach its target (possibly
/// through a thunk entry). Also sets the section's final size.
pub fn create_range_extension_thunks(ctx: &mut Context, osec_idx: usize) {
    let members: Vec<SubsecRef> = match &ctx.chunks[osec_idx].kind {
        ChunkKind::Output { members, .. } => members.clone(),
        _ => unreachable!(),
    };
    if members.is_empty() {
        ctx.chunks[osec_idx].hdr.size = 0;
        return;
    }

    // Members start with a dummy offset so assigned and unassigned ones
    // can be told apart.
    ctx.subsec(members[0]).output_offset.store(0, Ordering::Relaxed);
    for &m in &members[1..] {
        ctx.subsec(m).output_offset.store(u32::MAX, Ordering::Relaxed);
    }

    let off_of = |ctx: &Context, m: SubsecRef| -> u64 { ctx.subsec(m).output_offset() as u64 };

    let mut thunks: Vec<RangeExtensionThunk> = Vec::new();
    let mut a = 0usize;
    let mut b = 0usize;
    let mut c = 0usize;
    let mut d = 0usize;
    let mut offset: u64 = 0;

    while b < members.len() {
        // Move D forward as far as we can jump from B to D.
        while d < members.len() && offset - off_of(ctx, members[b]) < MAX_DISTANCE {
            let subsec = ctx.subsec(members[d]);
            offset = macho::align_to(offset, 1 << subsec.p2align);
            subsec.output_offset.store(offset as u32, Ordering::Relaxed);
            offset += subsec.input_size as u64;
            d += 1;
        }

        // Move C forward so that C is apart from B by GROUP_SIZE.
        while c < members.len()
            && off_of(ctx, members[c]).wrapping_sub(off_of(ctx, members[b])) < GROUP_SIZE
        {
            c += 1;
        }

        // Move A forward so that A is reachable from C.
        if c > 0 {
            let c_end = off_of(ctx, members[c - 1]) + ctx.subsec(members[c - 1]).input_size as u64;
            while a < thunks.len() && thunks[a].offset < c_end.saturating_sub(MAX_DISTANCE) {
                reset_thunk(ctx, &thunks[a]);
                a += 1;
            }
        }

        // Create a thunk for the members between B and C and place it at
        // the current end of the section.
        let thunk_idx = thunks.len();
        thunks.push(RangeExtensionThunk {
            thunk_idx,
            offset,
            symbols: Vec::new(),
        });

        // Scan relocations between B and C to collect symbols that need
        // thunk entries.
        for &m in &members[b..c] {
            let (rel_offset, nrels, isec_idx) = {
                let subsec = ctx.subsec(m);
                (subsec.rel_offset, subsec.nrels, subsec.isec)
            };
            for k in rel_offset..rel_offset + nrels {
                let (type_, sym_ref, rel_pc_off, addend) = {
                    let r = &ctx.objs[m.file as usize].sections[isec_idx as usize]
                        .as_ref()
                        .unwrap()
                        .rels[k as usize];
                    (r.type_, r.sym(), r.offset, r.addend)
                };
                if type_ != macho::ARM64_RELOC_BRANCH26 {
                    continue;
                }
                let Some(sym_ref) = sym_ref else { continue };
                if ctx.sym(sym_ref).def().file.is_none() {
                    continue;
                }

                let pc = ctx.chunks[osec_idx].hdr.addr + off_of(ctx, m) + rel_pc_off as u64;
                if is_reachable(ctx, sym_ref, osec_idx, pc, addend) {
                    continue;
                }

                // If the symbol is already in a reachable thunk, reuse it.
                let (sym_thunk_idx, sym_thunk_sym_idx) = {
                    let def = ctx.sym(sym_ref).def();
                    (def.thunk_idx, def.thunk_sym_idx)
                };
                let rel = &mut ctx.objs[m.file as usize].sections[isec_idx as usize]
                    .as_mut()
                    .unwrap()
                    .rels[k as usize];
                if sym_thunk_idx != -1 {
                    rel.thunk_idx = sym_thunk_idx;
                    rel.thunk_sym_idx = sym_thunk_sym_idx;
                    continue;
                }

                // Otherwise the symbol goes into this thunk, once.
                rel.thunk_idx = thunk_idx as i32;
                rel.thunk_sym_idx = -1;

                let sym = ctx.sym(sym_ref);
                if sym.flags.fetch_or(symbol::NEEDS_RANGE_EXTN_THUNK, Ordering::Relaxed)
                    & symbol::NEEDS_RANGE_EXTN_THUNK
                    == 0
                {
                    thunks[thunk_idx].symbols.push(sym_ref);
                }
            }
        }

        // The thunk's size is now known.
        offset += thunks[thunk_idx].size();

        // Sort the thunk's symbols to make the output deterministic.
        thunks[thunk_idx].symbols.sort_by_key(|&s| {
            let def = ctx.sym(s).def();
            let priority = match def.file {
                Some(symbol::FileRef::Obj(idx)) => ctx.objs[idx as usize].priority,
                Some(symbol::FileRef::Dylib(idx)) => ctx.dylibs[idx as usize].priority,
                None => u32::MAX,
            };
            (priority, def.value)
        });

        // Assign entries within the thunk.
        for (i, &sym_ref) in thunks[thunk_idx].symbols.iter().enumerate() {
            let mut def = ctx.sym(sym_ref).def();
            def.thunk_idx = thunk_idx as i32;
            def.thunk_sym_idx = i as i32;
        }

        // Fix the symbol slots on the relocations that picked this thunk.
        for &m in &members[b..c] {
            let (rel_offset, nrels, isec_idx) = {
                let subsec = ctx.subsec(m);
                (subsec.rel_offset, subsec.nrels, subsec.isec)
            };
            for k in rel_offset..rel_offset + nrels {
                let (rel_thunk_idx, sym_ref) = {
                    let r = &ctx.objs[m.file as usize].sections[isec_idx as usize]
                        .as_ref()
                        .unwrap()
                        .rels[k as usize];
                    (r.thunk_idx, r.sym())
                };
                if rel_thunk_idx == thunk_idx as i32 {
                    let sym_thunk_sym_idx = ctx.sym(sym_ref.unwrap()).def().thunk_sym_idx;
                    ctx.objs[m.file as usize].sections[isec_idx as usize]
                        .as_mut()
                        .unwrap()
                        .rels[k as usize]
                        .thunk_sym_idx = sym_thunk_sym_idx;
                }
            }
        }

        b = c;
    }

    while a < thunks.len() {
        reset_thunk(ctx, &thunks[a]);
        a += 1;
    }

    ctx.chunks[osec_idx].hdr.size = offset;
    match &mut ctx.chunks[osec_idx].kind {
        ChunkKind::Output { thunks: slot, .. } => *slot = thunks,
        _ => unreachable!(),
    }
}
