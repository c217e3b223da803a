/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! x86-64 relocations and synthesized code.

use crate::context::Context;
use crate::macho::{self, MachRel, MachSection};
use crate::object::{ObjectFile, RelocTarget, Relocation};
use crate::symbol::{self, SubsecRef};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::atomic::Ordering;

/// SIGNED_{1,2,4} carry their number as an extra implicit addend.
fn implicit_addend(type_: u8) -> i64 {
    match type_ {
        macho::X86_64_RELOC_SIGNED_1 => 1,
        macho::X86_64_RELOC_SIGNED_2 => 2,
        macho::X86_64_RELOC_SIGNED_4 => 4,
        _ => 0,
    }
}

pub fn read_relocations(ctx: &Context, file: &ObjectFile, hdr: &MachSection) -> Vec<Relocation> {
    let file_data = file.data.clone();
    let data = file_data.bytes();
    let mut vec = Vec::with_capacity(hdr.nreloc as usize);

    let rels: Vec<MachRel> = (0..hdr.nreloc as usize)
        .map(|i| MachRel::parse(&data[hdr.reloff as usize + i * MachRel::SIZE..]))
        .collect();

    for (i, r) in rels.iter().enumerate() {
        // Unlike ARM64, every x86-64 relocation has an in-place addend.
        let off = hdr.offset as usize + r.offset as usize;
        let in_place = match r.p2size {
            2 => LittleEndian::read_i32(&data[off..]) as i64,
            3 => LittleEndian::read_i64(&data[off..]),
            _ => {
                fatal!(ctx, "{}: invalid relocation size", file.display_name());
            }
        };
        let addend = in_place + implicit_addend(r.type_);
        let is_subtracted = i > 0 && rels[i - 1].type_ == macho::X86_64_RELOC_SUBTRACTOR;

        let (target, addend) = if r.is_extern {
            if r.idx as usize >= file.syms.len() {
                fatal!(ctx, "{}: bad relocation symbol index: {}", file.display_name(), r.idx);
            }
            (RelocTarget::Sym(file.syms[r.idx as usize]), addend)
        } else {
            // PC-relative additions are measured from the end of the
            // 4-byte instruction operand.
            let addr = if r.is_pcrel {
                hdr.addr as i64 + r.offset as i64 + addend + 4
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
            macho::X86_64_RELOC_GOT | macho::X86_64_RELOC_GOT_LOAD => {
                sym.flags.fetch_or(symbol::NEEDS_GOT, Ordering::Relaxed);
            }
            macho::X86_64_RELOC_TLV => {
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

        if def.is_imported {
            sym.flags.fetch_or(symbol::NEEDS_STUB, Ordering::Relaxed);
        }
    }
}

pub fn apply_reloc(ctx: &Context, subsec_ref: SubsecRef, buf: &mut [u8]) {
    let file = &ctx.objs[subsec_ref.file as usize];
    let subsec = &file.subsections[subsec_ref.idx as usize];
    let isec = file.subsec_isec(subsec_ref.idx);
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
        let g = r.sym().map_or(0, |sym| {
            let got_idx = ctx.sym(sym).def().got_idx;
            if got_idx == -1 {
                0
            } else {
                got_idx as u64 * 8
            }
        });

        match r.type_ {
            macho::X86_64_RELOC_UNSIGNED => {
                assert!(!r.is_pcrel);
                assert_eq!(r.size, 8);
                let imported = r.sym().map_or(false, |sym| ctx.sym(sym).def().is_imported);
                if imported {
                    i += 1;
                    continue;
                }
                let tls = r.sym().map_or(false, |sym| ctx.refers_to_tls(sym));
                if tls {
                    LittleEndian::write_u64(loc, s.wrapping_add(a).wrapping_sub(ctx.tls_begin));
                } else {
                    LittleEndian::write_u64(loc, s.wrapping_add(a));
                }
            }
            macho::X86_64_RELOC_SUBTRACTOR => {
                assert!(r.size == 4 || r.size == 8);
                i += 1;
                let minuend = &rels[i];
                assert_eq!(minuend.type_, macho::X86_64_RELOC_UNSIGNED);
                let val = target_addr(minuend)
                    .wrapping_add(minuend.addend as u64)
                    .wrapping_sub(s);
                if r.size == 4 {
                    LittleEndian::write_u32(loc, val as u32);
                } else {
                    LittleEndian::write_u64(loc, val);
                }
            }
            macho::X86_64_RELOC_SIGNED
            | macho::X86_64_RELOC_SIGNED_1
            | macho::X86_64_RELOC_SIGNED_2
            | macho::X86_64_RELOC_SIGNED_4 => {
                assert!(r.is_pcrel);
                assert_eq!(r.size, 4);
                let val = s
                    .wrapping_add(a)
                    .wrapping_sub(p)
                    .wrapping_sub(4)
                    .wrapping_sub(implicit_addend(r.type_) as u64);
                LittleEndian::write_u32(loc, val as u32);
            }
            macho::X86_64_RELOC_BRANCH => {
                assert!(r.is_pcrel);
                assert_eq!(r.size, 4);
                LittleEndian::write_u32(loc, s.wrapping_add(a).wrapping_sub(p + 4) as u32);
            }
            macho::X86_64_RELOC_GOT_LOAD | macho::X86_64_RELOC_GOT => {
                assert!(r.is_pcrel);
                assert_eq!(r.size, 4);
                LittleEndian::write_u32(loc, (g + got_base + a).wrapping_sub(p + 4) as u32);
            }
            macho::X86_64_RELOC_TLV => {
                assert!(r.is_pcrel);
                assert_eq!(r.size, 4);
                let tlv = ctx.tlv_addr(&ctx.sym(r.sym().unwrap()).def());
                LittleEndian::write_u32(loc, tlv.wrapping_add(a).wrapping_sub(p + 4) as u32);
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
    // jmp *imm(%rip)
    const INSN: [u8; 6] = [0xff, 0x25, 0, 0, 0, 0];

    let hdr_addr = ctx.chunks[ctx.stubs].hdr.addr;
    let mut lazy_idx = 0u64;

    for (i, &sym_ref) in ctx.stub_syms.iter().enumerate() {
        let def = ctx.sym(sym_ref).def();
        let dest = if def.got_idx != -1 {
            ctx.got_addr(&def)
        } else {
            let lazy = ctx.lazy_symbol_ptr.unwrap();
            let addr = ctx.chunks[lazy].hdr.addr + 8 * lazy_idx;
            lazy_idx += 1;
            addr
        };
        let src = hdr_addr + 6 * i as u64 + 6;
        let loc = &mut buf[i * 6..];
        loc[..6].copy_from_slice(&INSN);
        LittleEndian::write_u32(&mut loc[2..], dest.wrapping_sub(src) as u32);
    }
}

pub fn write_stub_helper(ctx: &Context, buf: &mut [u8]) {
    const HDR: [u8; 16] = [
        0x4c, 0x8d, 0x1d, 0, 0, 0, 0, // lea $__dyld_private(%rip), %r11
        0x41, 0x53, // push %r11
        0xff, 0x25, 0, 0, 0, 0, // jmp *$dyld_stub_binder@GOT(%rip)
        0x90, // nop
    ];

    let this_addr = ctx.chunks[ctx.stub_helper.unwrap()].hdr.addr;
    let dyld_private = ctx.sym_addr(crate::symbol::SymRef::Global(ctx.dyld_private));
    let stub_binder = ctx.got_addr(&ctx.symtab.syms[ctx.dyld_stub_binder as usize].def());

    buf[..16].copy_from_slice(&HDR);
    LittleEndian::write_u32(&mut buf[3..], dyld_private.wrapping_sub(this_addr + 7) as u32);
    LittleEndian::write_u32(&mut buf[11..], stub_binder.wrapping_sub(this_addr + 15) as u32);

    let mut pos = 16usize;
    let mut lazy_idx = 0usize;
    for &sym_ref in &ctx.stub_syms {
        if ctx.sym(sym_ref).def().got_idx != -1 {
            continue;
        }
        // push $bind_offset; jmp $__stub_helper
        let loc = &mut buf[pos..];
        loc[0] = 0x68;
        LittleEndian::write_u32(&mut loc[1..], ctx.lazy_bind_offsets[lazy_idx]);
        loc[5] = 0xe9;
        LittleEndian::write_u32(&mut loc[6..], 0u32.wrapping_sub(pos as u32 + 10));
        pos += 10;
        lazy_idx += 1;
    }
}

pub fn write_objc_stubs(ctx: &Context, buf: &mut [u8]) {
    const INSN: [u8; 16] = [
        0x48, 0x8b, 0x35, 0, 0, 0, 0, // mov @selector("foo")(%rip), %rsi
        0xff, 0x25, 0, 0, 0, 0, // jmp *_objc_msgSend@GOT(%rip)
        0xcc, 0xcc, 0xcc, // (padding)
    ];

    let hdr_addr = ctx.chunks[ctx.objc_stubs.unwrap()].hdr.addr;
    let msgsend_got = ctx.got_addr(&ctx.symtab.syms[ctx.objc_msgsend as usize].def());

    for i in 0..ctx.objc_selrefs.len() {
        let sel_addr = ctx.subsec_addr(ctx.objc_selrefs[i]);
        let ent_addr = hdr_addr + 16 * i as u64;
        let loc = &mut buf[i * 16..];
        loc[..16].copy_from_slice(&INSN);
        LittleEndian::write_u32(&mut loc[3..], sel_addr.wrapping_sub(ent_addr + 7) as u32);
        LittleEndian::write_u32(&mut loc[9..], msgsend_got.wrapping_sub(ent_addr + 13) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_n_implicit_addends() {
        assert_eq!(implicit_addend(macho::X86_64_RELOC_SIGNED), 0);
        assert_eq!(implicit_addend(macho::X86_64_RELOC_SIGNED_1), 1);
        assert_eq!(implicit_addend(macho::X86_64_RELOC_SIGNED_2), 2);
        assert_eq!(implicit_addend(macho::X86_64_RELOC_SIGNED_4), 4);
        assert_eq!(implicit_addend(macho::X86_64_RELOC_BRANCH), 0);
    }
}
