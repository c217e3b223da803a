/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! `__TEXT,__unwind_info` synthesis.
//!
//! The section is a two-level lookup table over compact unwind records:
//! first-level pages cover address ranges, each pointing at a compressed
//! second-level page whose 32-bit entries pack a 24-bit function offset
//! with an 8-bit index into a page-local encoding table. Records that
//! survive input parsing are merged where possible (same encoding and
//! personality, no LSDA, contiguous PC ranges) before paging.
//!
//! Functions whose only unwind description is an FDE get a record in
//! DWARF mode whose low bits point at the FDE's offset in `__eh_frame`.

use crate::context::Context;
use crate::macho;
use crate::options::Arch;
use crate::symbol::{SubsecRef, SymRef};
use byteorder::{ByteOrder, LittleEndian};

/// An unwind record resolved to output terms, ready for sorting/merging.
#[derive(Debug, Clone)]
pub struct OutRecord {
    pub subsec: SubsecRef,
    pub input_offset: u32,
    pub code_len: u32,
    pub encoding: u32,
    pub personality: Option<SymRef>,
    pub lsda: Option<SubsecRef>,
    pub lsda_offset: u32,
}

#[derive(Default)]
pub struct UnwindState {
    pub personalities: Vec<SymRef>,
    pub records: Vec<OutRecord>,
    /// `(start, len)` ranges into `records`, one per second-level page.
    pub pages: Vec<(usize, usize)>,
    pub num_lsda: usize,
}

fn func_addr(ctx: &Context, rec: &OutRecord) -> u64 {
    ctx.subsec_addr(rec.subsec) + rec.input_offset as u64
}

/// Collect the surviving records of all live subsections, in output
/// address order, with DWARF-mode records synthesized from FDEs.
fn collect_records(ctx: &Context) -> Vec<OutRecord> {
    let dwarf_mode = crate::arch::info(ctx.arg.arch).unwind_mode_dwarf;
    let mut records = Vec::new();

    for seg in &ctx.segments {
        for &chunk_idx in &seg.chunks {
            for &member in ctx.chunks[chunk_idx].members() {
                let file = &ctx.objs[member.file as usize];
                let subsec = &file.subsections[member.idx as usize];
                let recs = &file.unwind_records[subsec.unwind_offset as usize
                    ..(subsec.unwind_offset + subsec.nunwind) as usize];

                for rec in recs {
                    let (encoding, personality) = match rec.fde {
                        Some(fde_idx) => {
                            let fde = &file.fdes[fde_idx as usize];
                            let personality = file.cies[fde.cie as usize].personality;
                            (dwarf_mode | (fde.output_offset & 0x00ff_ffff), personality)
                        }
                        None => (rec.encoding, rec.personality),
                    };
                    records.push(OutRecord {
                        subsec: SubsecRef {
                            file: member.file,
                            idx: rec.subsec.unwrap(),
                        },
                        input_offset: rec.input_offset,
                        code_len: rec.code_len,
                        encoding,
                        personality,
                        lsda: rec.lsda.map(|idx| SubsecRef {
                            file: member.file,
                            idx,
                        }),
                        lsda_offset: rec.lsda_offset,
                    });
                }
            }
        }
    }

    records
}

/// If two records cover adjacent functions and have identical contents
/// (same encoding, same personality, no LSDA), they merge into one.
fn merge_records(ctx: &Context, records: &mut Vec<OutRecord>) {
    let is_stack_ind = |rec: &OutRecord| {
        ctx.arg.arch == Arch::X86_64
            && rec.encoding & macho::UNWIND_MODE_MASK == macho::UNWIND_X86_64_MODE_STACK_IND
    };

    let mut i = 0;
    for j in 1..records.len() {
        let can_merge = {
            let a = &records[i];
            let b = &records[j];
            // STACK_IND records never merge: the effective encoding lives
            // in the instruction stream, so equal-looking encodings may
            // differ.
            !is_stack_ind(a)
                && !is_stack_ind(b)
                && func_addr(ctx, a) + a.code_len as u64 == func_addr(ctx, b)
                && a.encoding == b.encoding
                && a.personality == b.personality
                && a.lsda.is_none()
                && b.lsda.is_none()
        };
        if can_merge {
            records[i].code_len += records[j].code_len;
        } else {
            i += 1;
            records[i] = records[j].clone();
        }
    }
    records.truncate(i + 1);
}

/// Group records so that every group's PC span fits the 24-bit
/// second-level offsets and no group exceeds the page entry limit.
fn split_records(ctx: &Context, records: &[OutRecord]) -> Vec<(usize, usize)> {
    const MAX_GROUP_SIZE: usize = 200;
    let mut pages = Vec::new();

    let mut pos = 0;
    while pos < records.len() {
        let end_addr = func_addr(ctx, &records[pos]) + (1 << 24);
        let mut i = 1;
        while pos + i < records.len()
            && i < MAX_GROUP_SIZE
            && func_addr(ctx, &records[pos + i]) < end_addr
        {
            i += 1;
        }
        pages.push((pos, i));
        pos += i;
    }
    pages
}

pub fn compute_size(ctx: &mut Context, chunk_idx: usize) {
    let mut records = collect_records(ctx);
    if records.is_empty() {
        ctx.unwind = UnwindState::default();
        ctx.chunks[chunk_idx].hdr.size = 0;
        return;
    }

    // Assign the (at most three) personality slots; each record's
    // encoding carries a 2-bit personality index.
    let mut personalities: Vec<SymRef> = Vec::new();
    for rec in &mut records {
        let Some(personality) = rec.personality else {
            continue;
        };
        let idx = match personalities.iter().position(|&p| p == personality) {
            Some(idx) => idx,
            None => {
                if personalities.len() == 3 {
                    fatal!(ctx, "too many personality functions");
                }
                personalities.push(personality);
                personalities.len() - 1
            }
        };
        rec.encoding |= ((idx as u32) + 1) << macho::UNWIND_PERSONALITY_MASK.trailing_zeros();
    }

    let num_lsda = records.iter().filter(|rec| rec.lsda.is_some()).count();

    records.sort_by_key(|rec| func_addr(ctx, rec));
    merge_records(ctx, &mut records);
    let pages = split_records(ctx, &records);

    let state = UnwindState {
        personalities,
        records,
        pages,
        num_lsda,
    };
    let size = encode(ctx, &state).len() as u64;
    ctx.unwind = state;
    ctx.chunks[chunk_idx].hdr.size = size;
}

/// Serialize the whole section. Called once for sizing and again at copy
/// time, when the personality GOT slots and LSDA addresses are final.
pub fn encode(ctx: &Context, state: &UnwindState) -> Vec<u8> {
    let image_base = ctx.chunks[ctx.mach_hdr].hdr.addr;
    let pages = &state.pages;

    // An upper bound; the buffer is trimmed after writing.
    let mut size = 28 // section header
        + state.personalities.len() * 4
        + 12 * (pages.len() + 1)
        + 8 * state.num_lsda;
    for &(_, len) in pages {
        size += 12 + (4 + 4) * len;
    }
    let mut buf = vec![0u8; size];

    // Section header.
    LittleEndian::write_u32(&mut buf[0..], macho::UNWIND_SECTION_VERSION);
    LittleEndian::write_u32(&mut buf[4..], 28); // encoding_offset
    LittleEndian::write_u32(&mut buf[8..], 0); // encoding_count
    LittleEndian::write_u32(&mut buf[12..], 28); // personality_offset
    LittleEndian::write_u32(&mut buf[16..], state.personalities.len() as u32);
    let page_offset = 28 + state.personalities.len() * 4;
    LittleEndian::write_u32(&mut buf[20..], page_offset as u32);
    LittleEndian::write_u32(&mut buf[24..], (pages.len() + 1) as u32);

    // Personality pointers go through the GOT.
    let mut pos = 28;
    for &personality in &state.personalities {
        let got = ctx.got_addr(&ctx.sym(personality).def());
        LittleEndian::write_u32(&mut buf[pos..], (got - image_base) as u32);
        pos += 4;
    }

    // First-level pages, then the LSDA table, then second-level pages.
    let mut page1 = page_offset;
    let mut lsda_pos = page_offset + 12 * (pages.len() + 1);
    let mut page2 = lsda_pos + 8 * state.num_lsda;

    for &(start, len) in pages {
        let span = &state.records[start..start + len];

        LittleEndian::write_u32(
            &mut buf[page1..],
            (func_addr(ctx, &span[0]) - image_base) as u32,
        );
        LittleEndian::write_u32(&mut buf[page1 + 4..], page2 as u32);
        LittleEndian::write_u32(&mut buf[page1 + 8..], lsda_pos as u32);
        page1 += 12;

        for rec in span {
            if let Some(lsda) = rec.lsda {
                LittleEndian::write_u32(
                    &mut buf[lsda_pos..],
                    (func_addr(ctx, rec) - image_base) as u32,
                );
                LittleEndian::write_u32(
                    &mut buf[lsda_pos + 4..],
                    (ctx.subsec_addr(lsda) + rec.lsda_offset as u64 - image_base) as u32,
                );
                lsda_pos += 8;
            }
        }

        // The page-local encoding table: one slot per distinct encoding,
        // in first-appearance order.
        let mut encodings: Vec<u32> = Vec::new();
        for rec in span {
            if !encodings.contains(&rec.encoding) {
                encodings.push(rec.encoding);
            }
        }

        let page_base = func_addr(ctx, &span[0]);
        LittleEndian::write_u32(&mut buf[page2..], macho::UNWIND_SECOND_LEVEL_COMPRESSED);
        LittleEndian::write_u16(&mut buf[page2 + 4..], 12); // page_offset
        LittleEndian::write_u16(&mut buf[page2 + 6..], len as u16);

        let mut entry = page2 + 12;
        for rec in span {
            let func_off = (func_addr(ctx, rec) - page_base) as u32;
            let enc_idx = encodings.iter().position(|&e| e == rec.encoding).unwrap() as u32;
            LittleEndian::write_u32(&mut buf[entry..], func_off | (enc_idx << 24));
            entry += 4;
        }

        LittleEndian::write_u16(&mut buf[page2 + 8..], (entry - page2) as u16); // encoding_offset
        LittleEndian::write_u16(&mut buf[page2 + 10..], encodings.len() as u16);
        for &enc in &encodings {
            LittleEndian::write_u32(&mut buf[entry..], enc);
            entry += 4;
        }

        page2 = entry;
    }

    // Terminator page.
    let last = state.records.last().unwrap();
    let last_end = func_addr(ctx, last) + last.code_len as u64;
    LittleEndian::write_u32(&mut buf[page1..], (last_end + 1 - image_base) as u32);
    LittleEndian::write_u32(&mut buf[page1 + 4..], 0);
    LittleEndian::write_u32(&mut buf[page1 + 8..], lsda_pos as u32);

    buf.truncate(page2);
    buf
}

pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
    if ctx.unwind.records.is_empty() {
        return;
    }
    let encoded = encode(ctx, &ctx.unwind);
    assert_eq!(encoded.len() as u64, ctx.chunks[ctx.unwind_info].hdr.size);
    buf[..encoded.len()].copy_from_slice(&encoded);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Merging is pure record arithmetic; drive it with a tiny fake layout
    // where subsection addresses are synthesized through a real context.
    fn rec(input_offset: u32, code_len: u32, encoding: u32) -> OutRecord {
        OutRecord {
            subsec: SubsecRef { file: 0, idx: 0 },
            input_offset,
            code_len,
            encoding,
            personality: None,
            lsda: None,
            lsda_offset: 0,
        }
    }

    fn test_ctx_with_one_subsec() -> Context {
        use crate::input::FileData;
        let mut ctx = Context::new(crate::options::Options::default());
        let idx = ctx.add_object("a.o".into(), String::new(), FileData::empty(), true, false);
        let file = &mut ctx.objs[idx as usize];
        let hdr = macho::MachSection {
            segname: "__TEXT".into(),
            sectname: "__text".into(),
            size: 0x100,
            ..Default::default()
        };
        let mut isec = crate::object::InputSection::new(hdr, 0);
        isec.osec = ctx.text;
        file.sections.push(Some(isec));
        file.subsections
            .push(crate::object::Subsection::new(0, 0, 0x100, 2, true));
        file.subsections[0]
            .output_offset
            .store(0, std::sync::atomic::Ordering::Relaxed);
        ctx
    }

    #[test]
    fn adjacent_identical_records_merge() {
        let ctx = test_ctx_with_one_subsec();
        let mut records = vec![rec(0, 0x10, 0x04000000), rec(0x10, 0x20, 0x04000000)];
        merge_records(&ctx, &mut records);
        assert_eq!(records.len(), 1);
        // The merged entry covers the sum of the parts.
        assert_eq!(records[0].code_len, 0x30);
    }

    #[test]
    fn different_encodings_do_not_merge() {
        let ctx = test_ctx_with_one_subsec();
        let mut records = vec![rec(0, 0x10, 0x04000000), rec(0x10, 0x20, 0x02000000)];
        merge_records(&ctx, &mut records);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn non_contiguous_records_do_not_merge() {
        let ctx = test_ctx_with_one_subsec();
        let mut records = vec![rec(0, 0x10, 0x04000000), rec(0x20, 0x20, 0x04000000)];
        merge_records(&ctx, &mut records);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn page_split_respects_group_size() {
        let ctx = test_ctx_with_one_subsec();
        let records: Vec<OutRecord> = (0..450)
            .map(|i| rec(i as u32 * 4, 4, 0x04000000))
            .collect();
        let pages = split_records(&ctx, &records);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], (0, 200));
        assert_eq!(pages[1], (200, 200));
        assert_eq!(pages[2], (400, 50));
    }
}
