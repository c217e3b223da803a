/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Just enough DWARF to find a compile unit's source filename.
//!
//! Executables don't carry debug info directly; they carry "stab" symbols
//! that point the debugger back at the object files. The stab chain for an
//! object starts with an `N_SO` symbol naming the source file, and that
//! name comes from the `DW_AT_name` of the first DIE in `.debug_info`.
//! Nothing else of DWARF is interpreted here.

use crate::context::Context;
use crate::macho::read_uleb;
use crate::object::ObjectFile;
use byteorder::{ByteOrder, LittleEndian};

const DW_TAG_COMPILE_UNIT: u64 = 0x11;
const DW_TAG_SKELETON_UNIT: u64 = 0x4a;

const DW_AT_NAME: u64 = 0x03;

const DW_UT_COMPILE: u8 = 0x01;
const DW_UT_PARTIAL: u8 = 0x03;
const DW_UT_SKELETON: u8 = 0x04;
const DW_UT_SPLIT_COMPILE: u8 = 0x05;

const DW_FORM_ADDR: u64 = 0x01;
const DW_FORM_BLOCK2: u64 = 0x03;
const DW_FORM_BLOCK4: u64 = 0x04;
const DW_FORM_DATA2: u64 = 0x05;
const DW_FORM_DATA4: u64 = 0x06;
const DW_FORM_DATA8: u64 = 0x07;
const DW_FORM_STRING: u64 = 0x08;
const DW_FORM_BLOCK: u64 = 0x09;
const DW_FORM_BLOCK1: u64 = 0x0a;
const DW_FORM_DATA1: u64 = 0x0b;
const DW_FORM_FLAG: u64 = 0x0c;
const DW_FORM_SDATA: u64 = 0x0d;
const DW_FORM_STRP: u64 = 0x0e;
const DW_FORM_UDATA: u64 = 0x0f;
const DW_FORM_REF_ADDR: u64 = 0x10;
const DW_FORM_REF1: u64 = 0x11;
const DW_FORM_REF2: u64 = 0x12;
const DW_FORM_REF4: u64 = 0x13;
const DW_FORM_REF8: u64 = 0x14;
const DW_FORM_REF_UDATA: u64 = 0x15;
const DW_FORM_INDIRECT: u64 = 0x16;
const DW_FORM_SEC_OFFSET: u64 = 0x17;
const DW_FORM_EXPRLOC: u64 = 0x18;
const DW_FORM_FLAG_PRESENT: u64 = 0x19;
const DW_FORM_STRX: u64 = 0x1a;
const DW_FORM_ADDRX: u64 = 0x1b;
const DW_FORM_REF_SUP4: u64 = 0x1c;
const DW_FORM_STRP_SUP: u64 = 0x1d;
const DW_FORM_DATA16: u64 = 0x1e;
const DW_FORM_LINE_STRP: u64 = 0x1f;
const DW_FORM_IMPLICIT_CONST: u64 = 0x21;
const DW_FORM_LOCLISTX: u64 = 0x22;
const DW_FORM_RNGLISTX: u64 = 0x23;
const DW_FORM_REF_SUP8: u64 = 0x24;
const DW_FORM_STRX1: u64 = 0x25;
const DW_FORM_STRX2: u64 = 0x26;
const DW_FORM_STRX3: u64 = 0x27;
const DW_FORM_STRX4: u64 = 0x28;
const DW_FORM_ADDRX1: u64 = 0x29;
const DW_FORM_ADDRX2: u64 = 0x2a;
const DW_FORM_ADDRX3: u64 = 0x2b;
const DW_FORM_ADDRX4: u64 = 0x2c;

/// Read the value of the given DW_FORM_* at `*pos`. Non-scalar values are
/// skipped and read as 0.
fn read_form(ctx: &Context, file: &ObjectFile, data: &[u8], pos: &mut usize, form: u64) -> u64 {
    let take = |pos: &mut usize, n: usize| -> &[u8] {
        let slice = &data[*pos..*pos + n];
        *pos += n;
        slice
    };

    match form {
        DW_FORM_FLAG_PRESENT => 0,
        DW_FORM_BLOCK1 | DW_FORM_DATA1 | DW_FORM_FLAG | DW_FORM_STRX1 | DW_FORM_ADDRX1
        | DW_FORM_REF1 => take(pos, 1)[0] as u64,
        DW_FORM_BLOCK2 | DW_FORM_DATA2 | DW_FORM_STRX2 | DW_FORM_ADDRX2 | DW_FORM_REF2 => {
            LittleEndian::read_u16(take(pos, 2)) as u64
        }
        DW_FORM_STRX3 | DW_FORM_ADDRX3 => LittleEndian::read_u24(take(pos, 3)) as u64,
        DW_FORM_BLOCK4 | DW_FORM_DATA4 | DW_FORM_STRP | DW_FORM_SEC_OFFSET | DW_FORM_LINE_STRP
        | DW_FORM_STRX4 | DW_FORM_ADDRX4 | DW_FORM_REF4 | DW_FORM_REF_SUP4 | DW_FORM_STRP_SUP => {
            LittleEndian::read_u32(take(pos, 4)) as u64
        }
        DW_FORM_DATA8 | DW_FORM_REF8 | DW_FORM_REF_SUP8 => LittleEndian::read_u64(take(pos, 8)),
        DW_FORM_ADDR | DW_FORM_REF_ADDR => LittleEndian::read_u64(take(pos, 8)),
        DW_FORM_DATA16 => {
            *pos += 16;
            0
        }
        DW_FORM_SDATA => {
            // Skip an SLEB.
            while *pos < data.len() && data[*pos] & 0x80 != 0 {
                *pos += 1;
            }
            *pos += 1;
            0
        }
        DW_FORM_BLOCK | DW_FORM_STRX | DW_FORM_ADDRX | DW_FORM_UDATA | DW_FORM_REF_UDATA
        | DW_FORM_LOCLISTX | DW_FORM_RNGLISTX | DW_FORM_EXPRLOC | DW_FORM_INDIRECT => {
            read_uleb(data, pos)
        }
        DW_FORM_STRING => {
            while *pos < data.len() && data[*pos] != 0 {
                *pos += 1;
            }
            *pos += 1;
            0
        }
        _ => {
            fatal!(
                ctx,
                "{}: unhandled debug info form: {:#x}",
                file.display_name(),
                form
            );
        }
    }
}

fn section<'a>(file: &'a ObjectFile, range: Option<(u32, u32)>) -> &'a [u8] {
    let (off, size) = range.unwrap();
    &file.data.bytes()[off as usize..(off + size) as usize]
}

/// Find the first compilation unit in `.debug_info` and the matching
/// `.debug_abbrev` record. Returns `(info position, abbrev position)`.
fn find_compunit(ctx: &Context, file: &ObjectFile) -> (usize, usize) {
    let info = section(file, file.debug_info);
    let abbrev_sec = section(file, file.debug_abbrev);

    let dwarf_version = LittleEndian::read_u16(&info[4..]);
    let mut pos;
    let abbrev_offset;

    match dwarf_version {
        2..=4 => {
            abbrev_offset = LittleEndian::read_u32(&info[6..]) as usize;
            let address_size = info[10];
            if address_size != 8 {
                fatal!(
                    ctx,
                    "{}: unsupported DWARF address size {}",
                    file.display_name(),
                    address_size
                );
            }
            pos = 11;
        }
        5 => {
            abbrev_offset = LittleEndian::read_u32(&info[8..]) as usize;
            let address_size = info[7];
            if address_size != 8 {
                fatal!(
                    ctx,
                    "{}: unsupported DWARF address size {}",
                    file.display_name(),
                    address_size
                );
            }
            match info[6] {
                DW_UT_COMPILE | DW_UT_PARTIAL => pos = 12,
                DW_UT_SKELETON | DW_UT_SPLIT_COMPILE => pos = 20,
                unit_type => {
                    fatal!(
                        ctx,
                        "{}: unknown DWARF DW_UT_* value: {:#x}",
                        file.display_name(),
                        unit_type
                    );
                }
            }
        }
        _ => {
            fatal!(
                ctx,
                "{}: unknown DWARF version: {}",
                file.display_name(),
                dwarf_version
            );
        }
    }

    let abbrev_code = read_uleb(info, &mut pos);

    // We assume the .debug_info record at the start is a
    // DW_TAG_compile_unit describing the compunit.
    let mut apos = abbrev_offset;
    loop {
        let code = read_uleb(abbrev_sec, &mut apos);
        if code == 0 {
            fatal!(
                ctx,
                "{}: .debug_abbrev does not contain a record for the first .debug_info record",
                file.display_name()
            );
        }

        if code == abbrev_code {
            let tag = read_uleb(abbrev_sec, &mut apos);
            if tag != DW_TAG_COMPILE_UNIT && tag != DW_TAG_SKELETON_UNIT {
                fatal!(
                    ctx,
                    "{}: the first entry's tag is not DW_TAG_compile_unit/DW_TAG_skeleton_unit but {:#x}",
                    file.display_name(),
                    tag
                );
            }
            break;
        }

        // Skip an uninteresting record.
        read_uleb(abbrev_sec, &mut apos); // tag
        apos += 1; // has_children byte
        loop {
            let name = read_uleb(abbrev_sec, &mut apos);
            let form = read_uleb(abbrev_sec, &mut apos);
            if name == 0 && form == 0 {
                break;
            }
            if form == DW_FORM_IMPLICIT_CONST {
                read_uleb(abbrev_sec, &mut apos);
            }
        }
    }

    apos += 1; // skip has_children byte
    (pos, apos)
}

/// The source filename of the object's compile unit, for the `N_SO` stab.
pub fn get_source_filename(ctx: &Context, file: &ObjectFile) -> String {
    assert!(file.debug_info.is_some());

    let (mut pos, mut apos) = find_compunit(ctx, file);
    let info = section(file, file.debug_info);
    let abbrev = section(file, file.debug_abbrev);

    loop {
        let name = read_uleb(abbrev, &mut apos);
        let form = read_uleb(abbrev, &mut apos);
        if name == 0 && form == 0 {
            break;
        }

        let val = read_form(ctx, file, info, &mut pos, form);

        if name == DW_AT_NAME {
            let strtab = match form {
                DW_FORM_STRP => section(file, file.debug_str),
                DW_FORM_LINE_STRP => section(file, file.debug_line),
                _ => {
                    fatal!(
                        ctx,
                        "{}: unknown DWARF form for DW_AT_name: {:#x}",
                        file.display_name(),
                        form
                    );
                }
            };
            let bytes = &strtab[val as usize..];
            let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            return String::from_utf8_lossy(&bytes[..len]).into_owned();
        }
    }

    String::new()
}
