/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Dynamic relocations: the classic rebase / bind / lazy-bind opcode
//! streams, or chained fixups.
//!
//! Exactly one of the two schemes is emitted per link. The classic scheme
//! describes every rebased or bound pointer in separate `__LINKEDIT`
//! byte-code streams that dyld interprets on startup. With chained fixups
//! the records live in place: each fixup location holds a packed 64-bit
//! record with a `next` link to the following fixup on the same page, and
//! the kernel applies them as pages come in.

use crate::context::Context;
use crate::macho;
use crate::symbol::{FileRef, SymRef};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use rayon::prelude::*;

/// A location that dyld has to fix on load: a rebase (sym is None) or a
/// bind against an imported symbol.
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    pub addr: u64,
    pub sym: Option<SymRef>,
    pub addend: u64,
    /// True if the location's bytes came from an 8-byte UNSIGNED
    /// relocation; only then does the in-place value's top byte carry
    /// meaning for `high8`.
    pub from_reloc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddend {
    pub sym: SymRef,
    pub addend: u64,
}

#[derive(Default)]
pub struct ChainedState {
    pub fixups: Vec<Fixup>,
    pub dynsyms: Vec<SymbolAddend>,
    pub contents: Vec<u8>,
}

fn dylib_ordinal(ctx: &Context, sym_ref: SymRef) -> i64 {
    let def = ctx.sym(sym_ref).def();
    assert!(def.is_imported);
    match def.file {
        Some(FileRef::Dylib(idx)) => ctx.dylibs[idx as usize].dylib_idx as i64,
        _ => macho::BIND_SPECIAL_DYLIB_FLAT_LOOKUP,
    }
}

/// Would this relocation produce a rebase record? Only absolute pointers
/// to non-imported, non-TLS targets that aren't halves of a subtraction.
fn needs_rebasing(ctx: &Context, rel: &crate::object::Relocation) -> bool {
    let abs_rel = crate::arch::info(ctx.arg.arch).abs_rel;
    if rel.type_ != abs_rel || rel.is_subtracted {
        return false;
    }
    if let Some(sym_ref) = rel.sym() {
        if ctx.sym(sym_ref).def().is_imported {
            return false;
        }
        // A pointer into a TLS block is thread-pointer-relative already.
        if ctx.refers_to_tls(sym_ref) {
            return false;
        }
    }
    true
}

fn is_imported_bind(ctx: &Context, rel: &crate::object::Relocation) -> Option<SymRef> {
    let abs_rel = crate::arch::info(ctx.arg.arch).abs_rel;
    if rel.type_ != abs_rel {
        return None;
    }
    let sym_ref = rel.sym()?;
    if ctx.sym(sym_ref).def().is_imported {
        Some(sym_ref)
    } else {
        None
    }
}

/// The subset of stub targets that go through the lazy-binding machinery:
/// stubs whose symbol also has a GOT slot jump through that instead.
pub fn lazy_stub_syms(ctx: &Context) -> Vec<SymRef> {
    ctx.stub_syms
        .iter()
        .copied()
        .filter(|&sym_ref| ctx.sym(sym_ref).def().got_idx == -1)
        .collect()
}

// ---------------------------------------------------------------------------
// Classic scheme
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RebaseEntry {
    seg_idx: i32,
    offset: i64,
}

fn encode_rebase_entries(mut rebases: Vec<RebaseEntry>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(macho::REBASE_OPCODE_SET_TYPE_IMM | macho::REBASE_TYPE_POINTER);

    // Sorting lets consecutive word-stride runs collapse into a single
    // DO_REBASE_*_TIMES.
    rebases.sort();

    let mut i = 0;
    while i < rebases.len() {
        let cur = rebases[i];
        let last = if i == 0 { None } else { Some(rebases[i - 1]) };

        match last {
            Some(last) if last.seg_idx == cur.seg_idx && cur.offset - last.offset - 8 >= 0 => {
                let dist = cur.offset - last.offset - 8;
                if dist % 8 == 0 && dist < 128 {
                    buf.push(macho::REBASE_OPCODE_ADD_ADDR_IMM_SCALED | (dist >> 3) as u8);
                } else {
                    buf.push(macho::REBASE_OPCODE_ADD_ADDR_ULEB);
                    macho::write_uleb(&mut buf, dist as u64);
                }
            }
            _ => {
                buf.push(macho::REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | cur.seg_idx as u8);
                macho::write_uleb(&mut buf, cur.offset as u64);
            }
        }

        // Extend the run over consecutive word-stride entries.
        let mut j = i + 1;
        while j < rebases.len()
            && rebases[j - 1].seg_idx == rebases[j].seg_idx
            && rebases[j - 1].offset + 8 == rebases[j].offset
        {
            j += 1;
        }

        if j - i < 16 {
            buf.push(macho::REBASE_OPCODE_DO_REBASE_IMM_TIMES | (j - i) as u8);
        } else {
            buf.push(macho::REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
            macho::write_uleb(&mut buf, (j - i) as u64);
        }

        i = j;
    }

    buf.push(macho::REBASE_OPCODE_DONE);
    buf.resize(macho::align_to(buf.len() as u64, 8) as usize, 0);
    buf
}

pub fn compute_rebase_size(ctx: &mut Context, chunk_idx: usize) {
    let mut vec: Vec<Vec<RebaseEntry>> = ctx
        .objs
        .par_iter()
        .map(|file| {
            let mut entries = Vec::new();
            if !file.alive() {
                return entries;
            }
            for (i, subsec) in file.subsections.iter().enumerate() {
                if !subsec.alive() {
                    continue;
                }
                let r = crate::symbol::SubsecRef {
                    file: file.file_idx,
                    idx: i as u32,
                };
                let isec = file.subsec_isec(i as u32);
                let seg = ctx.chunks[isec.osec].seg;
                let base = ctx.subsec_addr(r) as i64 - ctx.segments[seg].vmaddr as i64;
                let seg_idx = ctx.segments[seg].seg_idx;

                for rel in &isec.rels
                    [subsec.rel_offset as usize..(subsec.rel_offset + subsec.nrels) as usize]
                {
                    if needs_rebasing(ctx, rel) {
                        entries.push(RebaseEntry {
                            seg_idx,
                            offset: base + rel.offset as i64,
                        });
                    }
                }
            }
            entries
        })
        .collect();

    let mut rebases: Vec<RebaseEntry> = vec.drain(..).flatten().collect();

    // Lazy symbol pointers point into __stub_helper and are rebased.
    if let Some(lazy_ptr) = ctx.lazy_symbol_ptr {
        let seg = ctx.chunks[lazy_ptr].seg;
        let seg_idx = ctx.segments[seg].seg_idx;
        let base = ctx.chunks[lazy_ptr].hdr.addr as i64 - ctx.segments[seg].vmaddr as i64;
        for i in 0..lazy_stub_syms(ctx).len() {
            rebases.push(RebaseEntry {
                seg_idx,
                offset: base + i as i64 * 8,
            });
        }
    }

    // Non-imported GOT and thread-pointer slots hold absolute addresses.
    for list in [(ctx.got, &ctx.got_syms), (ctx.thread_ptrs, &ctx.tlv_syms)] {
        let (chunk, syms) = list;
        let seg = ctx.chunks[chunk].seg;
        let seg_idx = ctx.segments[seg].seg_idx;
        let base = ctx.chunks[chunk].hdr.addr as i64 - ctx.segments[seg].vmaddr as i64;
        for (i, &sym_ref) in syms.iter().enumerate() {
            if !ctx.sym(sym_ref).def().is_imported {
                rebases.push(RebaseEntry {
                    seg_idx,
                    offset: base + i as i64 * 8,
                });
            }
        }
    }

    ctx.rebase_contents = encode_rebase_entries(rebases);
    ctx.chunks[chunk_idx].hdr.size = ctx.rebase_contents.len() as u64;
}

struct BindEntry {
    sym: SymRef,
    seg_idx: i32,
    offset: i64,
    addend: i64,
}

fn encode_bind_entries(ctx: &Context, mut bindings: Vec<BindEntry>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(macho::BIND_OPCODE_SET_TYPE_IMM | macho::BIND_TYPE_POINTER);

    // Sort to maximize run sharing in the encoded stream.
    bindings.sort_by(|a, b| {
        (ctx.sym_name(a.sym), a.seg_idx, a.offset, a.addend).cmp(&(
            ctx.sym_name(b.sym),
            b.seg_idx,
            b.offset,
            b.addend,
        ))
    });

    for i in 0..bindings.len() {
        let b = &bindings[i];
        let last = if i == 0 { None } else { Some(&bindings[i - 1]) };

        let file_changed = match last {
            None => true,
            Some(last) => ctx.sym(last.sym).def().file != ctx.sym(b.sym).def().file,
        };
        if file_changed {
            let idx = dylib_ordinal(ctx, b.sym);
            if idx < 0 {
                buf.push(
                    macho::BIND_OPCODE_SET_DYLIB_SPECIAL_IMM
                        | (idx as u8 & macho::BIND_IMMEDIATE_MASK),
                );
            } else if idx < 16 {
                buf.push(macho::BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | idx as u8);
            } else {
                buf.push(macho::BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
                macho::write_uleb(&mut buf, idx as u64);
            }
        }

        let name_changed = match last {
            None => true,
            Some(last) => {
                ctx.sym_name(last.sym) != ctx.sym_name(b.sym)
                    || ctx.sym(last.sym).def().is_weak != ctx.sym(b.sym).def().is_weak
            }
        };
        if name_changed {
            let flags = if ctx.sym(b.sym).def().is_weak {
                macho::BIND_SYMBOL_FLAGS_WEAK_IMPORT
            } else {
                0
            };
            buf.push(macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
            buf.extend_from_slice(ctx.sym_name(b.sym).as_bytes());
            buf.push(0);
        }

        if last.map_or(true, |last| {
            last.seg_idx != b.seg_idx || last.offset != b.offset
        }) {
            assert!(b.seg_idx < 16);
            buf.push(macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | b.seg_idx as u8);
            macho::write_uleb(&mut buf, b.offset as u64);
        }

        if last.map_or(true, |last| last.addend != b.addend) {
            buf.push(macho::BIND_OPCODE_SET_ADDEND_SLEB);
            macho::write_sleb(&mut buf, b.addend);
        }

        buf.push(macho::BIND_OPCODE_DO_BIND);
    }

    buf.push(macho::BIND_OPCODE_DONE);
    buf.resize(macho::align_to(buf.len() as u64, 8) as usize, 0);
    buf
}

pub fn compute_bind_size(ctx: &mut Context, chunk_idx: usize) {
    let mut vec: Vec<Vec<BindEntry>> = ctx
        .objs
        .par_iter()
        .map(|file| {
            let mut entries = Vec::new();
            if !file.alive() {
                return entries;
            }
            for (i, subsec) in file.subsections.iter().enumerate() {
                if !subsec.alive() {
                    continue;
                }
                let r = crate::symbol::SubsecRef {
                    file: file.file_idx,
                    idx: i as u32,
                };
                let isec = file.subsec_isec(i as u32);
                let seg = ctx.chunks[isec.osec].seg;
                let base = ctx.subsec_addr(r) as i64 - ctx.segments[seg].vmaddr as i64;
                let seg_idx = ctx.segments[seg].seg_idx;

                for rel in &isec.rels
                    [subsec.rel_offset as usize..(subsec.rel_offset + subsec.nrels) as usize]
                {
                    if let Some(sym_ref) = is_imported_bind(ctx, rel) {
                        entries.push(BindEntry {
                            sym: sym_ref,
                            seg_idx,
                            offset: base + rel.offset as i64,
                            addend: rel.addend,
                        });
                    }
                }
            }
            entries
        })
        .collect();

    let mut bindings: Vec<BindEntry> = vec.drain(..).flatten().collect();

    for list in [(ctx.got, &ctx.got_syms), (ctx.thread_ptrs, &ctx.tlv_syms)] {
        let (chunk, syms) = list;
        let seg = ctx.chunks[chunk].seg;
        let seg_idx = ctx.segments[seg].seg_idx;
        let base = ctx.chunks[chunk].hdr.addr as i64 - ctx.segments[seg].vmaddr as i64;
        for (i, &sym_ref) in syms.iter().enumerate() {
            if ctx.sym(sym_ref).def().is_imported {
                bindings.push(BindEntry {
                    sym: sym_ref,
                    seg_idx,
                    offset: base + i as i64 * 8,
                    addend: 0,
                });
            }
        }
    }

    ctx.bind_contents = encode_bind_entries(ctx, bindings);
    ctx.chunks[chunk_idx].hdr.size = ctx.bind_contents.len() as u64;
}

/// The lazy-bind stream is a sequence of tiny per-symbol programs;
/// `__stub_helper` pushes the program's offset and jumps to
/// `dyld_stub_binder`.
pub fn compute_lazy_bind_size(ctx: &mut Context, chunk_idx: usize) {
    let mut contents = Vec::new();
    let mut bind_offsets = Vec::new();

    let lazy_ptr = ctx.lazy_symbol_ptr.unwrap();
    let seg = ctx.chunks[lazy_ptr].seg;
    let seg_idx = ctx.segments[seg].seg_idx;
    let seg_vmaddr = ctx.segments[seg].vmaddr;
    let lazy_addr = ctx.chunks[lazy_ptr].hdr.addr;

    for (i, sym_ref) in lazy_stub_syms(ctx).into_iter().enumerate() {
        bind_offsets.push(contents.len() as u32);

        let ordinal = dylib_ordinal(ctx, sym_ref);
        if ordinal < 0 {
            contents.push(
                macho::BIND_OPCODE_SET_DYLIB_SPECIAL_IMM
                    | (ordinal as u8 & macho::BIND_IMMEDIATE_MASK),
            );
        } else if ordinal < 16 {
            contents.push(macho::BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal as u8);
        } else {
            contents.push(macho::BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
            macho::write_uleb(&mut contents, ordinal as u64);
        }

        let flags = if ctx.sym(sym_ref).def().is_weak {
            macho::BIND_SYMBOL_FLAGS_WEAK_IMPORT
        } else {
            0
        };
        contents.push(macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
        contents.extend_from_slice(ctx.sym_name(sym_ref).as_bytes());
        contents.push(0);

        contents.push(macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg_idx as u8);
        macho::write_uleb(&mut contents, lazy_addr + i as u64 * 8 - seg_vmaddr);

        contents.push(macho::BIND_OPCODE_DO_BIND);
        contents.push(macho::BIND_OPCODE_DONE);
    }

    let p2align = ctx.chunks[chunk_idx].hdr.p2align;
    contents.resize(macho::align_to(contents.len() as u64, 1 << p2align) as usize, 0);

    ctx.lazy_bind_offsets = bind_offsets;
    ctx.lazy_bind_contents = contents;
    ctx.chunks[chunk_idx].hdr.size = ctx.lazy_bind_contents.len() as u64;
}

// ---------------------------------------------------------------------------
// Chained fixups
// ---------------------------------------------------------------------------

/// A chained fixup can carry its addend inline only up to 255.
const MAX_INLINE_ADDEND: u64 = 255;

fn collect_fixups(ctx: &Context) -> Vec<Fixup> {
    let mut vec: Vec<Vec<Fixup>> = ctx
        .objs
        .par_iter()
        .map(|file| {
            let mut fixups = Vec::new();
            if !file.alive() {
                return fixups;
            }
            for (i, subsec) in file.subsections.iter().enumerate() {
                if !subsec.alive() {
                    continue;
                }
                let r = crate::symbol::SubsecRef {
                    file: file.file_idx,
                    idx: i as u32,
                };
                let isec = file.subsec_isec(i as u32);
                let base = ctx.subsec_addr(r);

                for rel in &isec.rels
                    [subsec.rel_offset as usize..(subsec.rel_offset + subsec.nrels) as usize]
                {
                    if let Some(sym_ref) = is_imported_bind(ctx, rel) {
                        fixups.push(Fixup {
                            addr: base + rel.offset as u64,
                            sym: Some(sym_ref),
                            addend: rel.addend as u64,
                            from_reloc: true,
                        });
                    } else if needs_rebasing(ctx, rel) {
                        fixups.push(Fixup {
                            addr: base + rel.offset as u64,
                            sym: None,
                            addend: 0,
                            from_reloc: true,
                        });
                    }
                }
            }
            fixups
        })
        .collect();

    let mut fixups: Vec<Fixup> = vec.drain(..).flatten().collect();

    for (chunk, syms) in [(ctx.got, &ctx.got_syms), (ctx.thread_ptrs, &ctx.tlv_syms)] {
        let base = ctx.chunks[chunk].hdr.addr;
        for (i, &sym_ref) in syms.iter().enumerate() {
            let imported = ctx.sym(sym_ref).def().is_imported;
            fixups.push(Fixup {
                addr: base + i as u64 * 8,
                sym: if imported { Some(sym_ref) } else { None },
                addend: 0,
                from_reloc: false,
            });
        }
    }

    fixups.sort_by_key(|f| f.addr);
    fixups
}

/// Dynamic relocations with a large addend get a `(symbol, addend)` import
/// entry of their own; the import-table format is the smallest one that
/// fits the largest addend in use.
fn get_dynsyms(ctx: &Context, fixups: &[Fixup]) -> (Vec<SymbolAddend>, u32) {
    let mut syms: Vec<SymbolAddend> = fixups
        .iter()
        .filter_map(|f| {
            f.sym.map(|sym| SymbolAddend {
                sym,
                addend: if f.addend <= MAX_INLINE_ADDEND {
                    0
                } else {
                    f.addend
                },
            })
        })
        .collect();

    syms.sort_by(|a, b| {
        let (pa, va) = sym_order_key(ctx, a.sym);
        let (pb, vb) = sym_order_key(ctx, b.sym);
        (pa, va, a.addend).cmp(&(pb, vb, b.addend))
    });
    syms.dedup();

    // Point every symbol at its first import-table entry.
    for i in (0..syms.len()).rev() {
        ctx.sym(syms[i].sym).def().fixup_ordinal = i as i32;
    }

    let max = syms.iter().map(|s| s.addend).max().unwrap_or(0);
    let format = if max == 0 {
        macho::DYLD_CHAINED_IMPORT
    } else if max <= u32::MAX as u64 {
        macho::DYLD_CHAINED_IMPORT_ADDEND
    } else {
        macho::DYLD_CHAINED_IMPORT_ADDEND64
    };

    (syms, format)
}

fn sym_order_key(ctx: &Context, sym_ref: SymRef) -> (u32, u64) {
    let def = ctx.sym(sym_ref).def();
    let priority = match def.file {
        Some(FileRef::Obj(idx)) => ctx.objs[idx as usize].priority,
        Some(FileRef::Dylib(idx)) => ctx.dylibs[idx as usize].priority,
        None => u32::MAX,
    };
    (priority, def.value)
}

pub fn compute_chained_fixups_size(ctx: &mut Context, chunk_idx: usize) {
    let fixups = collect_fixups(ctx);
    if fixups.is_empty() {
        ctx.chained = ChainedState::default();
        ctx.chunks[chunk_idx].hdr.size = 0;
        return;
    }

    let page_size = crate::arch::info(ctx.arg.arch).page_size;
    let mut contents: Vec<u8> = Vec::new();

    // Header; offsets are patched in as the blob grows.
    let hdr_size = macho::align_to(7 * 4, 8) as usize;
    contents.resize(hdr_size, 0);
    LittleEndian::write_u32(&mut contents[4..], hdr_size as u32); // starts_offset

    // First-level page table: one DyldChainedStartsInSegment per segment
    // that has fixups.
    let seg_count = ctx.segments.last().map_or(0, |seg| seg.seg_idx + 1) as usize;
    let starts_offset = contents.len();
    let starts_size = macho::align_to((4 + seg_count * 4) as u64, 8) as usize;
    contents.resize(starts_offset + starts_size, 0);
    LittleEndian::write_u32(&mut contents[starts_offset..], seg_count as u32);

    for seg_pos in 0..ctx.segments.len() {
        let seg = &ctx.segments[seg_pos];
        let begin = fixups.partition_point(|f| f.addr < seg.vmaddr);
        let end = fixups.partition_point(|f| f.addr < seg.vmaddr + seg.vmsize);
        if begin == end {
            continue;
        }
        let fx = &fixups[begin..end];

        let seg_info_off = contents.len() - starts_offset;
        let slot = starts_offset + 4 + seg.seg_idx as usize * 4;
        LittleEndian::write_u32(&mut contents[slot..], seg_info_off as u32);

        let npages = (macho::align_to(fx.last().unwrap().addr + 1 - seg.vmaddr, page_size)
            / page_size) as usize;
        let rec_size = macho::align_to((24 + npages * 2) as u64, 8) as usize;
        let rec_off = contents.len();
        contents.resize(rec_off + rec_size, 0);

        let rec = &mut contents[rec_off..];
        LittleEndian::write_u32(&mut rec[0..], rec_size as u32);
        LittleEndian::write_u16(&mut rec[4..], page_size as u16);
        LittleEndian::write_u16(&mut rec[6..], macho::DYLD_CHAINED_PTR_64);
        LittleEndian::write_u64(
            &mut rec[8..],
            seg.vmaddr - ctx.chunks[ctx.mach_hdr].hdr.addr,
        );
        LittleEndian::write_u32(&mut rec[16..], 0); // max_valid_pointer
        LittleEndian::write_u16(&mut rec[20..], npages as u16);

        let mut j = 0usize;
        for page in 0..npages {
            let page_addr = seg.vmaddr + page as u64 * page_size;
            while j < fx.len() && fx[j].addr < page_addr {
                j += 1;
            }
            let start = if j < fx.len() && fx[j].addr < page_addr + page_size {
                (fx[j].addr & (page_size - 1)) as u16
            } else {
                macho::DYLD_CHAINED_PTR_START_NONE
            };
            LittleEndian::write_u16(&mut contents[rec_off + 22 + page * 2..], start);
        }
    }

    // Import table and name pool.
    let (dynsyms, import_format) = get_dynsyms(ctx, &fixups);
    LittleEndian::write_u32(&mut contents[16..], dynsyms.len() as u32); // imports_count
    LittleEndian::write_u32(&mut contents[20..], import_format); // imports_format
    let imports_offset = contents.len();
    LittleEndian::write_u32(&mut contents[8..], imports_offset as u32);

    let mut nameoff = 0u32;
    for (i, entry) in dynsyms.iter().enumerate() {
        let def = ctx.sym(entry.sym).def();
        let lib_ordinal = match def.file {
            Some(FileRef::Dylib(idx)) => ctx.dylibs[idx as usize].dylib_idx as u32,
            _ => macho::BIND_SPECIAL_DYLIB_WEAK_LOOKUP as u32,
        };
        let weak = def.is_weak;
        drop(def);

        match import_format {
            macho::DYLD_CHAINED_IMPORT => {
                contents
                    .write_u32::<LittleEndian>(macho::pack_chained_import(
                        lib_ordinal as u8,
                        weak,
                        nameoff,
                    ))
                    .unwrap();
            }
            macho::DYLD_CHAINED_IMPORT_ADDEND => {
                contents
                    .write_u32::<LittleEndian>(macho::pack_chained_import(
                        lib_ordinal as u8,
                        weak,
                        nameoff,
                    ))
                    .unwrap();
                contents.write_u32::<LittleEndian>(entry.addend as u32).unwrap();
            }
            _ => {
                contents
                    .write_u64::<LittleEndian>(macho::pack_chained_import64(
                        lib_ordinal as u16,
                        weak,
                        nameoff,
                    ))
                    .unwrap();
                contents.write_u64::<LittleEndian>(entry.addend).unwrap();
            }
        }

        let is_last_of_sym = i + 1 == dynsyms.len() || dynsyms[i + 1].sym != entry.sym;
        if is_last_of_sym {
            nameoff += ctx.sym_name(entry.sym).len() as u32 + 1;
        }
    }

    // Symbol names.
    let symbols_offset = contents.len();
    LittleEndian::write_u32(&mut contents[12..], symbols_offset as u32);
    for (i, entry) in dynsyms.iter().enumerate() {
        if i == 0 || dynsyms[i - 1].sym != entry.sym {
            contents.extend_from_slice(ctx.sym_name(entry.sym).as_bytes());
            contents.push(0);
        }
    }

    contents.resize(macho::align_to(contents.len() as u64, 8) as usize, 0);

    ctx.chunks[chunk_idx].hdr.size = contents.len() as u64;
    ctx.chained = ChainedState {
        fixups,
        dynsyms,
        contents,
    };
}

/// Overwrite every fixup location in the copied output with its in-place
/// chained record. Runs after all section contents are in the buffer.
pub fn write_fixup_chains(ctx: &Context, buf: &mut [u8]) {
    const STRIDE: u64 = 4;
    let page_size = crate::arch::info(ctx.arg.arch).page_size;
    let page_of = |addr: u64| addr & !(page_size - 1);

    let fixups = &ctx.chained.fixups;
    let dynsyms = &ctx.chained.dynsyms;

    for seg in &ctx.segments {
        let begin = fixups.partition_point(|f| f.addr < seg.vmaddr);
        let end = fixups.partition_point(|f| f.addr < seg.vmaddr + seg.vmsize);
        let fx = &fixups[begin..end];

        for i in 0..fx.len() {
            let next = if i + 1 < fx.len() && page_of(fx[i + 1].addr) == page_of(fx[i].addr) {
                ((fx[i + 1].addr - fx[i].addr) / STRIDE) as u32
            } else {
                0
            };

            if fx[i].addr % STRIDE != 0 {
                error!(
                    ctx,
                    "unaligned fixup at address {:#x}; re-link with -no_fixup_chains",
                    fx[i].addr
                );
                continue;
            }

            let loc = (seg.fileoff + (fx[i].addr - seg.vmaddr)) as usize;

            if let Some(sym_ref) = fx[i].sym {
                let ordinal = if fx[i].addend <= MAX_INLINE_ADDEND {
                    ctx.sym(sym_ref).def().fixup_ordinal
                } else {
                    let first = ctx.sym(sym_ref).def().fixup_ordinal as usize;
                    let mut found = None;
                    for (j, entry) in dynsyms.iter().enumerate().skip(first) {
                        if entry.sym == sym_ref && entry.addend == fx[i].addend {
                            found = Some(j as i32);
                            break;
                        }
                    }
                    found.unwrap()
                };
                let addend = if fx[i].addend <= MAX_INLINE_ADDEND {
                    fx[i].addend as u8
                } else {
                    0
                };
                LittleEndian::write_u64(
                    &mut buf[loc..],
                    macho::pack_chained_bind(ordinal as u32, addend, next),
                );
            } else {
                let val = LittleEndian::read_u64(&buf[loc..]);
                if val & 0x00ff_fff0_0000_0000 != 0 {
                    error!(
                        ctx,
                        "{}: rebase addend too large; re-link with -no_fixup_chains",
                        seg.segname
                    );
                    continue;
                }
                // Only a value written by an 8-byte UNSIGNED relocation
                // can carry a meaningful top byte.
                let high8 = if fx[i].from_reloc { (val >> 56) as u8 } else { 0 };
                LittleEndian::write_u64(
                    &mut buf[loc..],
                    macho::pack_chained_rebase(val, high8, next),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_run_coalescing() {
        // Eight consecutive words rebase as one DO_REBASE_IMM_TIMES.
        let entries: Vec<RebaseEntry> = (0..8)
            .map(|i| RebaseEntry {
                seg_idx: 2,
                offset: 0x100 + i * 8,
            })
            .collect();
        let buf = encode_rebase_entries(entries);

        assert_eq!(
            buf[0],
            macho::REBASE_OPCODE_SET_TYPE_IMM | macho::REBASE_TYPE_POINTER
        );
        assert_eq!(buf[1], macho::REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2);
        // ULEB(0x100) = 0x80 0x02
        assert_eq!(&buf[2..4], &[0x80, 0x02]);
        assert_eq!(buf[4], macho::REBASE_OPCODE_DO_REBASE_IMM_TIMES | 8);
        assert_eq!(buf[5], macho::REBASE_OPCODE_DONE);
    }

    #[test]
    fn rebase_entries_are_sorted_before_encoding() {
        let buf = encode_rebase_entries(vec![
            RebaseEntry {
                seg_idx: 2,
                offset: 0x10,
            },
            RebaseEntry {
                seg_idx: 2,
                offset: 0x8,
            },
        ]);
        // One run of two entries, not two runs.
        assert_eq!(buf[3], macho::REBASE_OPCODE_DO_REBASE_IMM_TIMES | 2);
    }

    #[test]
    fn chained_fixup_chain_walk_covers_every_fixup() {
        // Synthesize a page of fixups, write the chain, then follow the
        // `next` links and check each fixup is visited exactly once.
        let addrs: Vec<u64> = vec![0x0, 0x8, 0x20, 0xff8];
        let mut words: Vec<(u64, u32)> = Vec::new();
        for (i, &addr) in addrs.iter().enumerate() {
            let next = if i + 1 < addrs.len() {
                ((addrs[i + 1] - addr) / 4) as u32
            } else {
                0
            };
            words.push((addr, next));
        }

        let mut visited = Vec::new();
        let mut pos = 0usize; // page_start
        loop {
            let (addr, next) = words[pos];
            visited.push(addr);
            if next == 0 {
                break;
            }
            let target = addr + next as u64 * 4;
            pos = words.iter().position(|&(a, _)| a == target).unwrap();
        }
        assert_eq!(visited, addrs);
    }
}
