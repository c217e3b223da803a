/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! `__TEXT,__eh_frame` handling.
//!
//! An `__eh_frame` section contains variable-sized CIE and FDE records.
//! There is usually one CIE followed by one FDE per function of the file.
//! A CIE carries one PC-relative GOT-referencing relocation (its
//! personality); FDEs usually carry none, but objects produced by `ld -r`
//! carry many, which we apply in place before walking the records.
//!
//! FDEs matter twice: functions that have no native compact-unwind record
//! get a synthesized one pointing at their FDE, and the surviving records
//! are re-emitted into the output `__eh_frame` with their CIE offsets,
//! function pointers and LSDA references rewritten.

use crate::context::Context;
use crate::macho::{self, read_uleb, MachRel};
use crate::object::{CieRecord, FdeRecord, ObjectFile};
use crate::symbol::SubsecRef;
use byteorder::{ByteOrder, LittleEndian};

/// Apply in-place `SUBTRACTOR`+`UNSIGNED` pairs so that the record walk
/// sees final bytes, and copy the section contents (the mapping itself is
/// read-only).
fn apply_eh_frame_relocs(ctx: &Context, file: &mut ObjectFile) {
    let hdr = file.eh_frame_sec.clone().unwrap();
    let file_data = file.data.clone();
    let data = file_data.bytes();
    let mut buf = data[hdr.offset as usize..(hdr.offset + hdr.size as u32) as usize].to_vec();

    let info = crate::arch::info(ctx.arg.arch);

    let mut i = 0;
    while i < hdr.nreloc as usize {
        let r1 = MachRel::parse(&data[hdr.reloff as usize + i * MachRel::SIZE..]);

        if r1.type_ == info.subtractor_rel {
            if i + 1 == hdr.nreloc as usize {
                fatal!(ctx, "{}: __eh_frame: invalid subtractor reloc", file.display_name());
            }
            i += 1;
            let r2 = MachRel::parse(&data[hdr.reloff as usize + i * MachRel::SIZE..]);
            if r2.type_ != info.abs_rel {
                fatal!(ctx, "{}: __eh_frame: invalid subtractor reloc pair", file.display_name());
            }

            let value_of = |r: &MachRel| -> u32 {
                if r.is_extern {
                    file.mach_syms[r.idx as usize].value as u32
                } else {
                    r.idx
                }
            };
            let target1 = value_of(&r1);
            let target2 = value_of(&r2);
            let delta = target2.wrapping_sub(target1);

            let off = r1.offset as usize;
            match r1.p2size {
                2 => {
                    let val = LittleEndian::read_u32(&buf[off..]).wrapping_add(delta);
                    LittleEndian::write_u32(&mut buf[off..], val);
                }
                3 => {
                    let val = LittleEndian::read_u64(&buf[off..])
                        .wrapping_add(delta as i32 as i64 as u64);
                    LittleEndian::write_u64(&mut buf[off..], val);
                }
                _ => {
                    fatal!(ctx, "{}: __eh_frame: invalid p2size", file.display_name());
                }
            }
        } else if r1.type_ != info.gotpc_rel {
            fatal!(ctx, "{}: __eh_frame: unknown relocation type", file.display_name());
        }
        i += 1;
    }

    file.eh_frame_data = buf;
}

/// Size (including the length word) of the record at `offset` within the
/// section.
fn record_size(data: &[u8], offset: u32) -> u32 {
    LittleEndian::read_u32(&data[offset as usize..]) + 4
}

pub fn parse(ctx: &Context, file: &mut ObjectFile) {
    if file.eh_frame_sec.is_none() {
        return;
    }
    apply_eh_frame_relocs(ctx, file);

    let hdr = file.eh_frame_sec.clone().unwrap();
    let data = std::mem::take(&mut file.eh_frame_data);

    // Split the section contents into CIE and FDE records. The record id
    // word distinguishes them: zero marks a CIE, anything else is a
    // back-offset from that word to the owning CIE.
    let mut pos: usize = 0;
    while pos < data.len() {
        let len = LittleEndian::read_u32(&data[pos..]);
        if len == 0xffff_ffff {
            fatal!(
                ctx,
                "{}: __eh_frame record with an extended length is not supported",
                file.display_name()
            );
        }
        if len == 0 {
            break;
        }

        let id = LittleEndian::read_u32(&data[pos + 4..]);
        if id == 0 {
            file.cies.push(CieRecord {
                input_addr: hdr.addr as u32 + pos as u32,
                personality: None,
                personality_offset: 0,
                has_lsda: false,
                output_offset: u32::MAX,
            });
        } else {
            let addr = (LittleEndian::read_i64(&data[pos + 8..])
                + hdr.addr as i64
                + pos as i64
                + 8) as u64;
            let Some(subsec) = file.find_subsection(addr as u32) else {
                fatal!(
                    ctx,
                    "{}: __eh_frame: FDE with invalid function reference at {:#x}",
                    file.display_name(),
                    pos
                );
            };
            if !file.subsections[subsec as usize].has_compact_unwind {
                file.fdes.push(FdeRecord {
                    subsec,
                    input_addr: hdr.addr as u32 + pos as u32,
                    output_offset: u32::MAX,
                    cie: u32::MAX,
                    lsda: None,
                    lsda_offset: 0,
                    lsda_field_off: 0,
                });
            }
        }

        pos += len as usize + 4;
    }

    file.fdes
        .sort_by_key(|fde| file.subsections[fde.subsec as usize].input_addr);

    // Parse each CIE's augmentation string.
    for cie in &mut file.cies {
        let off = (cie.input_addr - hdr.addr as u32) as usize;
        let aug = &data[off + 9..];
        for &c in aug.iter().take_while(|&&c| c != 0) {
            match c {
                b'L' => cie.has_lsda = true,
                b'z' | b'P' | b'R' => {}
                _ => {
                    fatal!(
                        ctx,
                        "{}: __eh_frame: unknown augmentation string character: {}",
                        file.display_name(),
                        c as char
                    );
                }
            }
        }
    }

    // Attach each CIE's personality through its GOT-referencing reloc.
    let file_data = file.data.clone();
    let raw = file_data.bytes();
    let info = crate::arch::info(ctx.arg.arch);
    for i in 0..hdr.nreloc as usize {
        let r = MachRel::parse(&raw[hdr.reloff as usize + i * MachRel::SIZE..]);
        if r.type_ != info.gotpc_rel {
            continue;
        }
        if r.p2size != 2 {
            fatal!(ctx, "{}: __eh_frame: unexpected p2size", file.display_name());
        }
        if !r.is_extern {
            fatal!(ctx, "{}: __eh_frame: unexpected is_extern value", file.display_name());
        }

        let addr = hdr.addr as u32 + r.offset;
        let pos = file.cies.iter().position(|cie| {
            cie.input_addr <= addr
                && addr < cie.input_addr + record_size(&data, cie.input_addr - hdr.addr as u32)
        });
        let Some(pos) = pos else {
            fatal!(ctx, "{}: __eh_frame: unexpected relocation offset", file.display_name());
        };
        file.cies[pos].personality = Some(file.syms[r.idx as usize]);
        file.cies[pos].personality_offset = addr - file.cies[pos].input_addr;
    }

    // Resolve each FDE's CIE back-reference and (if the CIE declares one)
    // its LSDA pointer.
    for i in 0..file.fdes.len() {
        let fde_input_addr = file.fdes[i].input_addr;
        let off = (fde_input_addr - hdr.addr as u32) as usize;
        let cie_back = LittleEndian::read_u32(&data[off + 4..]);
        let cie_addr = fde_input_addr + 4 - cie_back;
        let Some(cie_idx) = file.cies.iter().position(|cie| cie.input_addr == cie_addr) else {
            fatal!(
                ctx,
                "{}: cannot find a CIE for a FDE at address {:#x}",
                file.display_name(),
                fde_input_addr
            );
        };
        file.fdes[i].cie = cie_idx as u32;

        if file.cies[cie_idx].has_lsda {
            let mut aug_pos = off + 24;
            read_uleb(&data, &mut aug_pos); // augmentation data length
            let field = (aug_pos - off) as u32;
            let in_place = LittleEndian::read_u32(&data[aug_pos..]);
            let addr = in_place.wrapping_add(fde_input_addr).wrapping_add(field);

            let Some(lsda) = file.find_subsection(addr) else {
                fatal!(
                    ctx,
                    "{}: cannot find a LSDA for a FDE at address {:#x}",
                    file.display_name(),
                    fde_input_addr
                );
            };
            file.fdes[i].lsda = Some(lsda);
            file.fdes[i].lsda_offset = addr - file.subsections[lsda as usize].input_addr;
            file.fdes[i].lsda_field_off = field;
        }
    }

    file.eh_frame_data = data;
}

/// Assign output offsets to surviving CIEs and FDEs. Runs before layout;
/// the offsets are section-relative and feed both the section size and the
/// DWARF-mode compact-unwind encodings.
pub fn assign_offsets(ctx: &mut Context) {
    let mut offset: u32 = 0;

    for file in &mut ctx.objs {
        let has_live_fde = file.alive()
            && file
                .fdes
                .iter()
                .any(|fde| file.subsections[fde.subsec as usize].alive());
        if !has_live_fde {
            continue;
        }
        let hdr_addr = file.eh_frame_sec.as_ref().unwrap().addr as u32;

        for cie in &mut file.cies {
            cie.output_offset = offset;
            offset += record_size(&file.eh_frame_data, cie.input_addr - hdr_addr);
        }
        for fde in &mut file.fdes {
            if !file.subsections[fde.subsec as usize].alive() {
                continue;
            }
            fde.output_offset = offset;
            offset += record_size(&file.eh_frame_data, fde.input_addr - hdr_addr);
        }
    }

    ctx.eh_frame_size = offset as u64;
}

pub fn compute_size(ctx: &mut Context, chunk_idx: usize) {
    ctx.chunks[chunk_idx].hdr.size = ctx.eh_frame_size;
}

/// Copy the surviving records into the output section, rewriting the
/// pieces that moved: FDE→CIE back-offsets, function pointers, LSDA
/// pointers and the CIE personality word.
pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
    let out_addr = ctx.chunks[ctx.eh_frame].hdr.addr;

    for (file_idx, file) in ctx.objs.iter().enumerate() {
        let Some(hdr) = file.eh_frame_sec.as_ref() else {
            continue;
        };
        let hdr_addr = hdr.addr as u32;
        let data = &file.eh_frame_data;

        for cie in &file.cies {
            if cie.output_offset == u32::MAX {
                continue;
            }
            let off = (cie.input_addr - hdr_addr) as usize;
            let size = record_size(data, cie.input_addr - hdr_addr) as usize;
            let out = cie.output_offset as usize;
            buf[out..out + size].copy_from_slice(&data[off..off + size]);

            if let Some(personality) = cie.personality {
                let loc = out + cie.personality_offset as usize;
                let got = ctx.got_addr(&ctx.sym(personality).def());
                let val = got.wrapping_sub(out_addr + loc as u64);
                LittleEndian::write_u32(&mut buf[loc..], val as u32);
            }
        }

        for fde in &file.fdes {
            if fde.output_offset == u32::MAX {
                continue;
            }
            let off = (fde.input_addr - hdr_addr) as usize;
            let size = record_size(data, fde.input_addr - hdr_addr) as usize;
            let out = fde.output_offset as usize;
            buf[out..out + size].copy_from_slice(&data[off..off + size]);

            // Rewrite the CIE back-offset.
            let cie = &file.cies[fde.cie as usize];
            LittleEndian::write_u32(
                &mut buf[out + 4..],
                (fde.output_offset + 4).wrapping_sub(cie.output_offset),
            );

            // Rewrite the function pointer.
            let func_addr = ctx.subsec_addr(SubsecRef {
                file: file_idx as u32,
                idx: fde.subsec,
            });
            let output_addr = out_addr + fde.output_offset as u64;
            let val = func_addr.wrapping_sub(output_addr + 8) as i64 as i32;
            LittleEndian::write_u64(&mut buf[out + 8..], val as i64 as u64);

            // Rewrite the LSDA pointer if the CIE says there is one.
            if let Some(lsda) = fde.lsda {
                let field = fde.lsda_field_off as usize;
                let lsda_addr = ctx.subsec_addr(SubsecRef {
                    file: file_idx as u32,
                    idx: lsda,
                });
                let val = lsda_addr
                    .wrapping_sub(output_addr)
                    .wrapping_sub(field as u64)
                    .wrapping_add(fde.lsda_offset as u64);
                LittleEndian::write_u32(&mut buf[out + field..], val as u32);
            }
        }
    }
}
