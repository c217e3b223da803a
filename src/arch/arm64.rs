/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! ARM64 relocations and synthesized code.

use crate::context::Context;
use crate::layout::ChunkKind;
use crate::macho::{self, bits, sign_extend, MachRel, MachSection};
use crate::object::{ObjectFile, RelocTarget, Relocation};
use crate::symbol::{self, SubsecRef};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::atomic::Ordering;

fn page(val: u64) -> u64 {
    val & 0xffff_ffff_ffff_f000
}

/// The combined immediate fields of an ADRP for `page(hi) - page(lo)`.
fn page_offset(hi: u64, lo: u64) -> u32 {
    let val = page(hi).wrapping_sub(page(lo));
    (bits(val, 13, 12) << 29) | (bits(val, 32, 14) << 5)
}

/// Write an immediate to an ADD, LDR or STR instruction.
fn write_add_ldst(loc: &mut [u8], val: u64) {
    let insn = LittleEndian::read_u32(loc);
    let mut scale = 0;

    if insn & 0x3b000000 == 0x39000000 {
        // LDR/STR accesses an aligned 1, 2, 4, 8 or 16 byte datum; its
        // immediate is scaled by the data size, which usually lives in the
        // top two bits of the instruction.
        scale = bits(insn as u64, 31, 30);

        // Vector and byte LDR/STR share the same scale bits; other bits
        // tell them apart.
        if scale == 0 && insn & 0x04800000 == 0x04800000 {
            scale = 4;
        }
    }

    LittleEndian::write_u32(loc, insn | (bits(val, 11, scale) << 10));
}

fn or32(loc: &mut [u8], val: u32) {
    let insn = LittleEndian::read_u32(loc);
    LittleEndian::write_u32(loc, insn | val);
}

pub fn read_relocations(ctx: &Context, file: &ObjectFile, hdr: &MachSection) -> Vec<Relocation> {
    let file_data = file.data.clone();
    let data = file_data.bytes();
    let mut vec = Vec::with_capacity(hdr.nreloc as usize);

    let rels: Vec<MachRel> = (0..hdr.nreloc as usize)
        .map(|i| MachRel::parse(&data[hdr.reloff as usize + i * MachRel::SIZE..]))
        .collect();

    let mut i = 0;
    while i < rels.len() {
        // Mach-O relocations don't contain an addend. UNSIGNED relocs keep
        // theirs in the bytes they relocate; other types can be given one
        // by a preceding ADDEND pseudo-relocation.
        let mut addend: i64 = 0;
        match rels[i].type_ {
            macho::ARM64_RELOC_UNSIGNED => {
                let size = 1u32 << rels[i].p2size;
                let off = hdr.offset as usize + rels[i].offset as usize;
                addend = match size {
                    4 => LittleEndian::read_i32(&data[off..]) as i64,
                    8 => LittleEndian::read_i64(&data[off..]),
                    _ => {
                        fatal!(ctx, "{}: invalid UNSIGNED relocation size", file.display_name());
                    }
                };
            }
            macho::ARM64_RELOC_ADDEND => {
                addend = sign_extend(rels[i].idx as u64, 23);
                i += 1;
                if i == rels.len() {
                    fatal!(ctx, "{}: dangling ARM64_RELOC_ADDEND", file.display_name());
                }
            }
            macho::ARM64_RELOC_POINTER_TO_GOT => {
                if !rels[i].is_pcrel {
                    fatal!(ctx, "{}: non-pcrel POINTER_TO_GOT", file.display_name());
                }
            }
            _ => {}
        }

        let r = rels[i];
        let is_subtracted = i > 0 && rels[i - 1].type_ == macho::ARM64_RELOC_SUBTRACTOR;

        let (target, addend) = if r.is_extern {
            if r.idx as usize >= file.syms.len() {
                fatal!(ctx, "{}: bad relocation symbol index: {}", file.display_name(), r.idx);
            }
            (RelocTarget::Sym(file.syms[r.idx as usize]), addend)
        } else {
            let addr = if r.is_pcrel {
                hdr.addr as i64 + r.offset as i64 + addend
            } else {
                addend
            };
            let Some(subsec) = file.find_subsection(addr as u32) else {
                fatal!(ctx, "{}: bad relocation: {}", file.display_name(), r.offset);
            };
            let subsec_addr = file.subsections[subsec as usize].input_addr;
            (RelocTarget::Subsec(subsec), addr - subsec_addr as i64)
        };

        vec.push(Relocation {
            offset: r.offset,
            type_: r.type_,
            size: 1 << r.p2size,
            is_pcrel: r.is_pcrel,
            is_subtracted,
            addend,
            target,
            thunk_idx: -1,
            thunk_sym_idx: -1,
        });
        i += 1;
    }

    vec
}

pub fn scan_relocations(ctx: &Context, subsec_ref: SubsecRef) {
    let file = &ctx.objs[subsec_ref.file as usize];
    let subsec = &file.subsections[subsec_ref.idx as usize];
    let isec = file.subsec_isec(subsec_ref.idx);
    let rels =
        &isec.rels[subsec.rel_offset as usize..(subsec.rel_offset + subsec.nrels) as usize];

    for r in rels {
        let Some(sym_ref) = r.sym() else { continue };
        let sym = ctx.sym(sym_ref);
        let def = sym.def();

        if def.is_imported {
            if let Some(symbol::FileRef::Dylib(dylib)) = def.file {
                ctx.dylibs[dylib as usize]
                    .is_alive
                    .store(true, Ordering::Release);
            }
        }

        match r.type_ {
            macho::ARM64_RELOC_BRANCH26 => {
                if def.is_imported {
                    sym.flags.fetch_or(symbol::NEEDS_STUB, Ordering::Relaxed);
                }
            }
            macho::ARM64_RELOC_GOT_LOAD_PAGE21
            | macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12
            | macho::ARM64_RELOC_POINTER_TO_GOT => {
                sym.flags.fetch_or(symbol::NEEDS_GOT, Ordering::Relaxed);
            }
            macho::ARM64_RELOC_TLVP_LOAD_PAGE21 | macho::ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => {
                if !def.is_tlv {
                    error!(
                        ctx,
                        "illegal thread local variable reference to regular symbol `{}`",
                        sym.name
                    );
                }
                sym.flags
                    .fetch_or(symbol::NEEDS_THREAD_PTR, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

pub fn apply_reloc(ctx: &Context, subsec_ref: SubsecRef, buf: &mut [u8]) {
    let file = &ctx.objs[subsec_ref.file as usize];
    let subsec = &file.subsections[subsec_ref.idx as usize];
    let isec = file.subsec_isec(subsec_ref.idx);
    let osec = isec.osec;
    let rels =
        &isec.rels[subsec.rel_offset as usize..(subsec.rel_offset + subsec.nrels) as usize];
    let subsec_addr = ctx.subsec_addr(subsec_ref);
    let got_base = ctx.chunks[ctx.got].hdr.addr;

    let target_addr = |r: &Relocation| -> u64 {
        match r.target {
            RelocTarget::Sym(sym) => ctx.sym_addr(sym),
            RelocTarget::Subsec(idx) => ctx.subsec_addr(SubsecRef {
                file: subsec_ref.file,
                idx,
            }),
        }
    };

    let mut i = 0;
    while i < rels.len() {
        let r = &rels[i];

        if let Some(sym_ref) = r.sym() {
            if ctx.sym(sym_ref).def().file.is_none() {
                error!(
                    ctx,
                    "undefined symbol: {}: {}",
                    file.display_name(),
                    ctx.sym_name(sym_ref)
                );
                i += 1;
                continue;
            }
        }

        let loc = &mut buf[r.offset as usize..];
        let s = target_addr(r);
        let a = r.addend as u64;
        let p = subsec_addr + r.offset as u64;
        let g = r
            .sym()
            .map_or(0, |sym| {
                let got_idx = ctx.sym(sym).def().got_idx;
                if got_idx == -1 {
                    0
                } else {
                    got_idx as u64 * 8
                }
            });

        match r.type_ {
            macho::ARM64_RELOC_UNSIGNED => {
                assert_eq!(r.size, 8);
                // An imported target gets a bind record or chained fixup
                // instead of a link-time value.
                let imported = r.sym().map_or(false, |sym| ctx.sym(sym).def().is_imported);
                if imported {
                    i += 1;
                    continue;
                }
                // __thread_vars holds TP-relative addresses into the TLS
                // initialization image.
                let tls = r.sym().map_or(false, |sym| ctx.refers_to_tls(sym));
                if tls {
                    LittleEndian::write_u64(loc, s.wrapping_add(a).wrapping_sub(ctx.tls_begin));
                } else {
                    LittleEndian::write_u64(loc, s.wrapping_add(a));
                }
            }
            macho::ARM64_RELOC_SUBTRACTOR => {
                // A SUBTRACTOR is always followed by an UNSIGNED; the pair
                // materializes the distance between two locations.
                assert!(r.size == 4 || r.size == 8);
                i += 1;
                let minuend = &rels[i];
                assert_eq!(minuend.type_, macho::ARM64_RELOC_UNSIGNED);
                let val = target_addr(minuend)
                    .wrapping_add(minuend.addend as u64)
                    .wrapping_sub(s);
                if r.size == 4 {
                    LittleEndian::write_u32(loc, val as u32);
                } else {
                    LittleEndian::write_u64(loc, val);
                }
            }
            macho::ARM64_RELOC_BRANCH26 => {
                let mut val = s.wrapping_add(a).wrapping_sub(p) as i64;
                if val < -(1 << 27) || val >= 1 << 27 {
                    let thunk_addr = match &ctx.chunks[osec].kind {
                        ChunkKind::Output { thunks, .. } => {
                            thunks[r.thunk_idx as usize].entry_addr(
                                &ctx.chunks[osec].hdr,
                                r.thunk_sym_idx as usize,
                            )
                        }
                        _ => unreachable!(),
                    };
                    val = thunk_addr.wrapping_sub(p) as i64;
                }
                or32(loc, bits(val as u64, 27, 2));
            }
            macho::ARM64_RELOC_PAGE21 => {
                or32(loc, page_offset(s.wrapping_add(a), p));
            }
            macho::ARM64_RELOC_PAGEOFF12 => {
                write_add_ldst(loc, s.wrapping_add(a));
            }
            macho::ARM64_RELOC_GOT_LOAD_PAGE21 => {
                or32(loc, page_offset(g + got_base + a, p));
            }
            macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12 => {
                write_add_ldst(loc, g + got_base + a);
            }
            macho::ARM64_RELOC_POINTER_TO_GOT => {
                assert_eq!(r.size, 4);
                LittleEndian::write_u32(loc, (g + got_base + a).wrapping_sub(p) as u32);
            }
            macho::ARM64_RELOC_TLVP_LOAD_PAGE21 => {
                let tlv = ctx.tlv_addr(&ctx.sym(r.sym().unwrap()).def());
                or32(loc, page_offset(tlv + a, p));
            }
            macho::ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => {
                let tlv = ctx.tlv_addr(&ctx.sym(r.sym().unwrap()).def());
                write_add_ldst(loc, tlv + a);
            }
            _ => {
                fatal!(
                    ctx,
                    "{}: unknown relocation type: {}",
                    file.display_name(),
                    r.type_
                );
            }
        }
        i += 1;
    }
}

pub fn write_stubs(ctx: &Context, buf: &mut [u8]) {
    const INSN: [u32; 3] = [
        0x90000010, // adrp x16, $ptr@PAGE
        0xf9400210, // ldr  x16, [x16, $ptr@PAGEOFF]
        0xd61f0200, // br   x16
    ];

    let hdr_addr = ctx.chunks[ctx.stubs].hdr.addr;
    let mut lazy_idx = 0u64;

    for (i, &sym_ref) in ctx.stub_syms.iter().enumerate() {
        let this_addr = hdr_addr + 12 * i as u64;
        let def = ctx.sym(sym_ref).def();

        let ptr_addr = if def.got_idx != -1 {
            ctx.got_addr(&def)
        } else {
            let lazy = ctx.lazy_symbol_ptr.unwrap();
            let addr = ctx.chunks[lazy].hdr.addr + 8 * lazy_idx;
            lazy_idx += 1;
            addr
        };

        let loc = &mut buf[i * 12..];
        LittleEndian::write_u32(&mut loc[0..], INSN[0] | page_offset(ptr_addr, this_addr));
        LittleEndian::write_u32(&mut loc[4..], INSN[1] | (bits(ptr_addr, 11, 3) << 10));
        LittleEndian::write_u32(&mut loc[8..], INSN[2]);
    }
}

/// `__stub_helper` contains the code that calls the dynamic symbol
/// resolver on the first use of each lazily bound symbol.
pub fn write_stub_helper(ctx: &Context, buf: &mut [u8]) {
    const HDR: [u32; 6] = [
        0x90000011, // adrp x17, $__dyld_private@PAGE
        0x91000231, // add  x17, x17, $__dyld_private@PAGEOFF
        0xa9bf47f0, // stp  x16, x17, [sp, #-16]!
        0x90000010, // adrp x16, $dyld_stub_binder@PAGE
        0xf9400210, // ldr  x16, [x16, $dyld_stub_binder@PAGEOFF]
        0xd61f0200, // br   x16
    ];

    let this_addr = ctx.chunks[ctx.stub_helper.unwrap()].hdr.addr;
    let dyld_private = ctx.sym_addr(crate::symbol::SymRef::Global(ctx.dyld_private));
    let stub_binder = ctx.got_addr(
        &ctx.symtab.syms[ctx.dyld_stub_binder as usize].def(),
    );

    for (i, &insn) in HDR.iter().enumerate() {
        LittleEndian::write_u32(&mut buf[i * 4..], insn);
    }
    or32(&mut buf[0..], page_offset(dyld_private, this_addr));
    or32(&mut buf[4..], bits(dyld_private, 11, 0) << 10);
    or32(&mut buf[12..], page_offset(stub_binder, this_addr + 12));
    or32(&mut buf[16..], bits(stub_binder, 11, 3) << 10);

    let mut pos = 24usize;
    let mut lazy_idx = 0usize;
    for &sym_ref in &ctx.stub_syms {
        if ctx.sym(sym_ref).def().got_idx != -1 {
            continue;
        }
        const INSN: [u32; 3] = [
            0x18000050, // ldr  w16, addr
            0x14000000, // b    stub_helper_header
            0x00000000, // addr: .long <bind offset>
        ];
        let loc = &mut buf[pos..];
        let branch_back = 0u64.wrapping_sub((pos + 4) as u64);
        LittleEndian::write_u32(&mut loc[0..], INSN[0]);
        LittleEndian::write_u32(&mut loc[4..], INSN[1] | bits(branch_back, 27, 2));
        LittleEndian::write_u32(&mut loc[8..], ctx.lazy_bind_offsets[lazy_idx]);
        pos += 12;
        lazy_idx += 1;
    }
}

/// Each `_objc_msgSend$<sel>` entry loads the interned selector and tail
/// calls `_objc_msgSend` through its GOT slot.
pub fn write_objc_stubs(ctx: &Context, buf: &mut [u8]) {
    const INSN: [u32; 8] = [
        0x90000001, // adrp  x1, @selector("foo")@PAGE
        0xf9400021, // ldr   x1, [x1, @selector("foo")@PAGEOFF]
        0x90000010, // adrp  x16, _objc_msgSend@GOTPAGE
        0xf9400210, // ldr   x16, [x16, _objc_msgSend@GOTPAGEOFF]
        0xd61f0200, // br    x16
        0xd4200020, // brk   #0x1
        0xd4200020, // brk   #0x1
        0xd4200020, // brk   #0x1
    ];

    let hdr_addr = ctx.chunks[ctx.objc_stubs.unwrap()].hdr.addr;
    let msgsend_got =
        ctx.got_addr(&ctx.symtab.syms[ctx.objc_msgsend as usize].def());

    for i in 0..ctx.objc_selrefs.len() {
        let sel_addr = ctx.subsec_addr(ctx.objc_selrefs[i]);
        let ent_addr = hdr_addr + 32 * i as u64;
        let loc = &mut buf[i * 32..];
        for (j, &insn) in INSN.iter().enumerate() {
            LittleEndian::write_u32(&mut loc[j * 4..], insn);
        }
        or32(&mut loc[0..], page_offset(sel_addr, ent_addr));
        or32(&mut loc[4..], bits(sel_addr, 11, 3) << 10);
        or32(&mut loc[8..], page_offset(msgsend_got, ent_addr + 8));
        or32(&mut loc[12..], bits(msgsend_got, 11, 3) << 10);
    }
}

/// A range-extension thunk entry: load the 33-bit page-relative target
/// address into x16 and jump.
pub fn write_thunk_entry(ctx: &Context, target: u64, pc: u64, loc: &mut [u8]) {
    const INSN: [u32; 3] = [
        0x90000010, // adrp x16, 0
        0x91000210, // add  x16, x16
        0xd61f0200, // br   x16
    ];
    let _ = ctx;
    LittleEndian::write_u32(&mut loc[0..], INSN[0] | page_offset(target, pc));
    LittleEndian::write_u32(&mut loc[4..], INSN[1] | (bits(target, 11, 0) << 10));
    LittleEndian::write_u32(&mut loc[8..], INSN[2]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adrp_immediate_encoding() {
        // Same page: zero immediate.
        assert_eq!(page_offset(0x1000, 0x1000), 0);
        // One page forward: immlo = 1 (bits 30:29), immhi = 0.
        assert_eq!(page_offset(0x2000, 0x1000), 1 << 29);
        // Four pages: immhi bit 0 (bit 5).
        assert_eq!(page_offset(0x5000, 0x1000), 1 << 5);
    }

    #[test]
    fn add_immediate_write() {
        // add x16, x16, #0 -> immediate goes to bits 21:10 unscaled
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, 0x91000210);
        write_add_ldst(&mut buf, 0xabc);
        assert_eq!(LittleEndian::read_u32(&buf), 0x91000210 | (0xabc << 10));
    }

    #[test]
    fn ldr64_immediate_is_scaled() {
        // ldr x16, [x16, #imm]: scale 3, so #0x18 becomes 3 in the field.
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, 0xf9400210);
        write_add_ldst(&mut buf, 0x18);
        assert_eq!(LittleEndian::read_u32(&buf), 0xf9400210 | (3 << 10));
    }
}
