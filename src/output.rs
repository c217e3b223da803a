/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Output assembly: the mach header, load commands, symbol tables and the
//! final buffer.
//!
//! Everything here writes into one contiguous output buffer. Chunk
//! contents occupy disjoint byte ranges, so the copy loop hands each chunk
//! its own slice and runs them in parallel; only the symbol/string tables
//! are populated serially because each input file writes into both at
//! once.

use crate::context::Context;
use crate::layout::ChunkKind;
use crate::macho::{self, MachSym};
use crate::symbol::{FileRef, SubsecRef, SymRef, Visibility};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use rayon::prelude::*;
use sha2::{Digest, Sha256};

/// Layout of the output symbol table: stabs, then locals, then globals,
/// then undefs, each file contributing a contiguous run to every
/// partition.
#[derive(Default, Clone, Copy)]
pub struct SymtabState {
    pub globals_offset: u32,
    pub undefs_offset: u32,
    pub num_syms: u32,
}

// The string table begins with " \0-\0" so that offset 1 is the empty
// string, which stab end markers use.
const STRTAB_INIT: &[u8] = b" \0-\0";

fn align8(buf: &mut Vec<u8>) {
    buf.resize(macho::align_to(buf.len() as u64, 8) as usize, 0);
}

/// Load commands that carry one trailing string keep its offset in their
/// third word (nameoff / path_off / umbrella_off).
fn write_cstr_cmd(cmd: u32, payload_off: u32, text: &str) -> Vec<u8> {
    let size = macho::align_to((payload_off as usize + text.len() + 1) as u64, 8) as u32;
    let mut buf = Vec::with_capacity(size as usize);
    buf.write_u32::<LittleEndian>(cmd).unwrap();
    buf.write_u32::<LittleEndian>(size).unwrap();
    buf.write_u32::<LittleEndian>(payload_off).unwrap();
    buf.resize(payload_off as usize, 0);
    buf.extend_from_slice(text.as_bytes());
    buf.resize(size as usize, 0);
    buf
}

fn create_load_commands(ctx: &Context) -> Vec<Vec<u8>> {
    let mut cmds: Vec<Vec<u8>> = Vec::new();

    // __PAGEZERO
    if ctx.arg.pagezero_size > 0 {
        let seg = macho::SegmentCommand {
            segname: "__PAGEZERO".to_string(),
            vmsize: ctx.arg.pagezero_size,
            ..Default::default()
        };
        let mut buf = Vec::new();
        seg.write(&mut buf, macho::SegmentCommand::SIZE as u32);
        cmds.push(buf);
    }

    // LC_SEGMENT_64 for every output segment.
    for seg in &ctx.segments {
        let visible: Vec<usize> = seg
            .chunks
            .iter()
            .copied()
            .filter(|&c| !ctx.chunks[c].is_hidden)
            .collect();
        let cmdsize =
            (macho::SegmentCommand::SIZE + visible.len() * macho::MachSection::SIZE) as u32;
        let cmd = macho::SegmentCommand {
            segname: seg.segname.clone(),
            vmaddr: seg.vmaddr,
            vmsize: seg.vmsize,
            fileoff: seg.fileoff,
            filesize: seg.filesize,
            maxprot: seg.maxprot,
            initprot: seg.initprot,
            nsects: visible.len() as u32,
            flags: seg.flags,
        };
        let mut buf = Vec::new();
        cmd.write(&mut buf, cmdsize);
        for &c in &visible {
            ctx.chunks[c].hdr.write(&mut buf);
        }
        cmds.push(buf);
    }

    // The dynamic-linking info: chained fixups + exports trie, or the
    // classic dyld info.
    if let Some(chained) = ctx.chained_fixups {
        if ctx.chunks[chained].hdr.size > 0 {
            let mut buf = Vec::new();
            buf.write_u32::<LittleEndian>(macho::LC_DYLD_CHAINED_FIXUPS).unwrap();
            buf.write_u32::<LittleEndian>(16).unwrap();
            buf.write_u32::<LittleEndian>(ctx.chunks[chained].hdr.offset).unwrap();
            buf.write_u32::<LittleEndian>(ctx.chunks[chained].hdr.size as u32).unwrap();
            cmds.push(buf);
        }
        if ctx.chunks[ctx.export_chunk].hdr.size > 0 {
            let mut buf = Vec::new();
            buf.write_u32::<LittleEndian>(macho::LC_DYLD_EXPORTS_TRIE).unwrap();
            buf.write_u32::<LittleEndian>(16).unwrap();
            buf.write_u32::<LittleEndian>(ctx.chunks[ctx.export_chunk].hdr.offset).unwrap();
            buf.write_u32::<LittleEndian>(ctx.chunks[ctx.export_chunk].hdr.size as u32).unwrap();
            cmds.push(buf);
        }
    } else {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(macho::LC_DYLD_INFO_ONLY).unwrap();
        buf.write_u32::<LittleEndian>(48).unwrap();
        let mut put = |chunk: Option<usize>| {
            let (off, size) = chunk
                .map(|c| (ctx.chunks[c].hdr.offset, ctx.chunks[c].hdr.size as u32))
                .filter(|&(_, size)| size > 0)
                .unwrap_or((0, 0));
            buf.write_u32::<LittleEndian>(off).unwrap();
            buf.write_u32::<LittleEndian>(size).unwrap();
        };
        put(ctx.rebase);
        put(ctx.bind);
        put(None); // weak bind
        put(ctx.lazy_bind);
        put(Some(ctx.export_chunk));
        cmds.push(buf);
    }

    // LC_SYMTAB
    {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(macho::LC_SYMTAB).unwrap();
        buf.write_u32::<LittleEndian>(24).unwrap();
        buf.write_u32::<LittleEndian>(ctx.chunks[ctx.symtab_chunk].hdr.offset).unwrap();
        buf.write_u32::<LittleEndian>(ctx.outsym.num_syms).unwrap();
        buf.write_u32::<LittleEndian>(ctx.chunks[ctx.strtab_chunk].hdr.offset).unwrap();
        buf.write_u32::<LittleEndian>(ctx.chunks[ctx.strtab_chunk].hdr.size as u32).unwrap();
        cmds.push(buf);
    }

    // LC_DYSYMTAB
    {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(macho::LC_DYSYMTAB).unwrap();
        buf.write_u32::<LittleEndian>(80).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap(); // ilocalsym
        buf.write_u32::<LittleEndian>(ctx.outsym.globals_offset).unwrap(); // nlocalsym
        buf.write_u32::<LittleEndian>(ctx.outsym.globals_offset).unwrap(); // iextdefsym
        buf.write_u32::<LittleEndian>(ctx.outsym.undefs_offset - ctx.outsym.globals_offset)
            .unwrap();
        buf.write_u32::<LittleEndian>(ctx.outsym.undefs_offset).unwrap(); // iundefsym
        buf.write_u32::<LittleEndian>(ctx.outsym.num_syms - ctx.outsym.undefs_offset).unwrap();
        for _ in 0..6 {
            buf.write_u32::<LittleEndian>(0).unwrap(); // toc, modtab, extrefsyms
        }
        buf.write_u32::<LittleEndian>(ctx.chunks[ctx.indir_symtab].hdr.offset).unwrap();
        buf.write_u32::<LittleEndian>((ctx.chunks[ctx.indir_symtab].hdr.size / 4) as u32).unwrap();
        for _ in 0..4 {
            buf.write_u32::<LittleEndian>(0).unwrap(); // extrel, locrel
        }
        cmds.push(buf);
    }

    if ctx.arg.uuid != crate::options::UuidKind::None {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(macho::LC_UUID).unwrap();
        buf.write_u32::<LittleEndian>(24).unwrap();
        buf.extend_from_slice(&ctx.uuid);
        cmds.push(buf);
    }

    // LC_BUILD_VERSION with one tool entry.
    {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(macho::LC_BUILD_VERSION).unwrap();
        buf.write_u32::<LittleEndian>(32).unwrap();
        buf.write_u32::<LittleEndian>(ctx.arg.platform).unwrap();
        buf.write_u32::<LittleEndian>(ctx.arg.platform_min_version.encode()).unwrap();
        buf.write_u32::<LittleEndian>(ctx.arg.platform_sdk_version.encode()).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap(); // ntools
        buf.write_u32::<LittleEndian>(macho::TOOL_LD).unwrap();
        buf.write_u32::<LittleEndian>(1 << 16).unwrap();
        cmds.push(buf);
    }

    // LC_SOURCE_VERSION
    {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(macho::LC_SOURCE_VERSION).unwrap();
        buf.write_u32::<LittleEndian>(16).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();
        cmds.push(buf);
    }

    if let Some(fs) = ctx.function_starts {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(macho::LC_FUNCTION_STARTS).unwrap();
        buf.write_u32::<LittleEndian>(16).unwrap();
        buf.write_u32::<LittleEndian>(ctx.chunks[fs].hdr.offset).unwrap();
        buf.write_u32::<LittleEndian>(ctx.chunks[fs].hdr.size as u32).unwrap();
        cmds.push(buf);
    }

    // One load command per live dylib, in ordinal order.
    for dylib in &ctx.dylibs {
        if !dylib.alive()
            || dylib.dylib_idx == macho::BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE as i32
        {
            continue;
        }
        let cmd = if dylib.is_reexported {
            macho::LC_REEXPORT_DYLIB
        } else if dylib.is_weak {
            macho::LC_LOAD_WEAK_DYLIB
        } else {
            macho::LC_LOAD_DYLIB
        };
        let mut buf = write_cstr_cmd(cmd, 24, &dylib.install_name);
        LittleEndian::write_u32(&mut buf[12..], 2); // timestamp
        cmds.push(buf);
    }

    for rpath in &ctx.arg.rpaths {
        cmds.push(write_cstr_cmd(macho::LC_RPATH, 12, rpath));
    }

    if let Some(dic) = ctx.data_in_code {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(macho::LC_DATA_IN_CODE).unwrap();
        buf.write_u32::<LittleEndian>(16).unwrap();
        buf.write_u32::<LittleEndian>(ctx.chunks[dic].hdr.offset).unwrap();
        buf.write_u32::<LittleEndian>(ctx.chunks[dic].hdr.size as u32).unwrap();
        cmds.push(buf);
    }

    if !ctx.arg.umbrella.is_empty() {
        cmds.push(write_cstr_cmd(macho::LC_SUB_FRAMEWORK, 12, &ctx.arg.umbrella));
    }

    match ctx.arg.output_type {
        macho::MH_EXECUTE => {
            cmds.push(write_cstr_cmd(macho::LC_LOAD_DYLINKER, 12, "/usr/lib/dyld"));

            // An undefined entry point was already reported after
            // resolution; this only materializes the address.
            let entry_addr = match ctx.entry_sym {
                Some(id) => {
                    let def = ctx.symtab.syms[id as usize].def();
                    if def.file.is_none() {
                        0
                    } else {
                        ctx.def_addr(&def)
                    }
                }
                None => 0,
            };
            let mut buf = Vec::new();
            buf.write_u32::<LittleEndian>(macho::LC_MAIN).unwrap();
            buf.write_u32::<LittleEndian>(24).unwrap();
            buf.write_u64::<LittleEndian>(
                entry_addr.saturating_sub(ctx.chunks[ctx.mach_hdr].hdr.addr),
            )
            .unwrap();
            buf.write_u64::<LittleEndian>(ctx.arg.stack_size).unwrap();
            cmds.push(buf);
        }
        macho::MH_DYLIB => {
            let mut buf = write_cstr_cmd(macho::LC_ID_DYLIB, 24, &ctx.arg.install_name);
            LittleEndian::write_u32(&mut buf[16..], ctx.arg.current_version.encode());
            LittleEndian::write_u32(&mut buf[20..], ctx.arg.compatibility_version.encode());
            cmds.push(buf);
        }
        _ => {}
    }

    if let Some(cs) = ctx.code_sig {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(macho::LC_CODE_SIGNATURE).unwrap();
        buf.write_u32::<LittleEndian>(16).unwrap();
        buf.write_u32::<LittleEndian>(ctx.chunks[cs].hdr.offset).unwrap();
        buf.write_u32::<LittleEndian>(ctx.chunks[cs].hdr.size as u32).unwrap();
        cmds.push(buf);
    }

    cmds
}

pub fn load_commands_size(ctx: &mut Context) -> u64 {
    let cmds = create_load_commands(ctx);
    cmds.iter().map(|cmd| cmd.len() as u64).sum()
}

fn has_tlv(ctx: &Context) -> bool {
    ctx.chunks
        .iter()
        .any(|c| c.hdr.type_ == macho::S_THREAD_LOCAL_VARIABLES && c.hdr.size > 0)
}

fn write_mach_header(ctx: &Context, buf: &mut [u8]) {
    let cmds = create_load_commands(ctx);
    let sizeofcmds: usize = cmds.iter().map(|c| c.len()).sum();

    let info = crate::arch::info(ctx.arg.arch);
    let mut flags = macho::MH_TWOLEVEL | macho::MH_NOUNDEFS | macho::MH_DYLDLINK | macho::MH_PIE;
    if has_tlv(ctx) {
        flags |= macho::MH_HAS_TLV_DESCRIPTORS;
    }
    if ctx.arg.output_type == macho::MH_DYLIB
        && !ctx.dylibs.iter().any(|d| d.alive() && d.is_reexported)
    {
        flags |= macho::MH_NO_REEXPORTED_DYLIBS;
    }
    if ctx.arg.mark_dead_strippable_dylib {
        flags |= macho::MH_DEAD_STRIPPABLE_DYLIB;
    }
    if ctx.arg.application_extension {
        flags |= macho::MH_APP_EXTENSION_SAFE;
    }

    let hdr = macho::MachHeader {
        magic: macho::MH_MAGIC_64,
        cputype: info.cputype,
        cpusubtype: info.cpusubtype,
        filetype: ctx.arg.output_type,
        ncmds: cmds.len() as u32,
        sizeofcmds: sizeofcmds as u32,
        flags,
    };
    hdr.write(buf);

    let mut pos = macho::MachHeader::SIZE;
    for cmd in cmds {
        buf[pos..pos + cmd.len()].copy_from_slice(&cmd);
        pos += cmd.len();
    }
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

fn symtab_skip(ctx: &Context, sym_ref: SymRef, owner: FileRef) -> bool {
    let sym = ctx.sym(sym_ref);
    let def = sym.def();
    if def.file != Some(owner) {
        return true;
    }
    if let Some(subsec) = def.subsec {
        if !ctx.subsec(subsec).alive() {
            return true;
        }
    }
    // Symbols starting with l or L are compiler-generated private labels.
    if sym.name.starts_with('l') || sym.name.starts_with('L') {
        return true;
    }
    if ctx.arg.strip_locals && def.visibility == Visibility::Local && !def.is_imported {
        return true;
    }
    false
}

pub fn compute_symtab_size(ctx: &mut Context, chunk_idx: usize) {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    // Per-file counts.
    for i in 0..ctx.objs.len() {
        ctx.objs[i].symtab = Default::default();
        if !ctx.objs[i].alive() {
            continue;
        }

        let emit_debug = ctx.objs[i].debug_info.is_some() && !ctx.arg.strip_debug;
        if emit_debug {
            // Debug ("stab") symbols point the debugger back at the object
            // file; the N_OSO name is its absolute path.
            let file = &ctx.objs[i];
            let mut oso = if file.archive_name.is_empty() {
                if file.name.starts_with('/') {
                    file.name.clone()
                } else {
                    format!("{}/{}", cwd, file.name)
                }
            } else if file.archive_name.starts_with('/') {
                format!("{}({})", file.archive_name, file.name)
            } else {
                format!("{}/{}({})", cwd, file.archive_name, file.name)
            };
            if !ctx.arg.oso_prefix.is_empty() && oso.starts_with(&ctx.arg.oso_prefix) {
                oso = oso[ctx.arg.oso_prefix.len()..].to_string();
            }
            let source_len = file.source_name.len();
            let file = &mut ctx.objs[i];
            file.oso_name = oso;
            file.symtab.strtab_size += source_len as u32 + 1;
            file.symtab.strtab_size += file.oso_name.len() as u32 + 1;
            file.symtab.num_stabs = 3;
        }

        let owner = FileRef::Obj(i as u32);
        for j in 0..ctx.objs[i].syms.len() {
            let sym_ref = ctx.objs[i].syms[j];
            if symtab_skip(ctx, sym_ref, owner) {
                continue;
            }
            let def = ctx.sym(sym_ref).def();
            let name_len = ctx.sym(sym_ref).name.len() as u32;
            let is_text = def
                .subsec
                .map_or(false, |s| {
                    let file = &ctx.objs[s.file as usize];
                    file.subsec_isec(s.idx).hdr.is_text()
                });
            let class = if def.is_imported {
                2
            } else if def.visibility == Visibility::Global {
                1
            } else {
                0
            };
            let has_subsec = def.subsec.is_some();
            drop(def);

            let counts = &mut ctx.objs[i].symtab;
            match class {
                2 => counts.num_undefs += 1,
                1 => counts.num_globals += 1,
                _ => counts.num_locals += 1,
            }
            if emit_debug && has_subsec {
                counts.num_stabs += if is_text { 2 } else { 1 };
            }
            counts.strtab_size += name_len + 1;
            ctx.sym(sym_ref).def().output_symtab_idx = -2;
        }
    }

    for i in 0..ctx.dylibs.len() {
        ctx.dylibs[i].symtab = Default::default();
        if !ctx.dylibs[i].alive() {
            continue;
        }
        let owner = FileRef::Dylib(i as u32);
        for j in 0..ctx.dylibs[i].syms.len() {
            let id = ctx.dylibs[i].syms[j];
            let sym = &ctx.symtab.syms[id as usize];
            let def = sym.def();
            if def.file != Some(owner)
                || (def.stub_idx == -1 && def.got_idx == -1 && def.tlv_idx == -1)
            {
                continue;
            }
            let name_len = sym.name.len() as u32;
            drop(def);
            let counts = &mut ctx.dylibs[i].symtab;
            counts.num_undefs += 1;
            counts.strtab_size += name_len + 1;
            ctx.symtab.syms[id as usize].def().output_symtab_idx = -2;
        }
    }

    // Chain the per-file offsets: stabs, locals, globals, undefs; strings.
    let mut stab_off = 0u32;
    let mut strtab_off = STRTAB_INIT.len() as u32;
    let mut total = |counts: &mut crate::object::SymtabCounts| {
        counts.stabs_offset = stab_off;
        stab_off += counts.num_stabs;
        counts.strtab_offset = strtab_off;
        strtab_off += counts.strtab_size;
    };
    for file in &mut ctx.objs {
        total(&mut file.symtab);
    }
    for dylib in &mut ctx.dylibs {
        total(&mut dylib.symtab);
    }

    let mut local_off = stab_off;
    for file in &mut ctx.objs {
        file.symtab.locals_offset = local_off;
        local_off += file.symtab.num_locals;
    }
    for dylib in &mut ctx.dylibs {
        dylib.symtab.locals_offset = local_off;
        local_off += dylib.symtab.num_locals;
    }

    let globals_offset = local_off;
    let mut global_off = globals_offset;
    for file in &mut ctx.objs {
        file.symtab.globals_offset = global_off;
        global_off += file.symtab.num_globals;
    }
    for dylib in &mut ctx.dylibs {
        dylib.symtab.globals_offset = global_off;
        global_off += dylib.symtab.num_globals;
    }

    let undefs_offset = global_off;
    let mut undef_off = undefs_offset;
    for file in &mut ctx.objs {
        file.symtab.undefs_offset = undef_off;
        undef_off += file.symtab.num_undefs;
    }
    for dylib in &mut ctx.dylibs {
        dylib.symtab.undefs_offset = undef_off;
        undef_off += dylib.symtab.num_undefs;
    }

    ctx.outsym = SymtabState {
        globals_offset,
        undefs_offset,
        num_syms: undef_off,
    };
    ctx.chunks[chunk_idx].hdr.size = undef_off as u64 * MachSym::SIZE as u64;
    ctx.chunks[ctx.strtab_chunk].hdr.size = strtab_off as u64;

    // Assign each emitted symbol its output index.
    for i in 0..ctx.objs.len() {
        let counts = ctx.objs[i].symtab;
        let mut locals = counts.locals_offset;
        let mut globals = counts.globals_offset;
        let mut undefs = counts.undefs_offset;
        let owner = FileRef::Obj(i as u32);
        for j in 0..ctx.objs[i].syms.len() {
            let sym_ref = ctx.objs[i].syms[j];
            let mut def = ctx.sym(sym_ref).def();
            if def.file != Some(owner) || def.output_symtab_idx != -2 {
                continue;
            }
            def.output_symtab_idx = if def.is_imported {
                let idx = undefs;
                undefs += 1;
                idx as i32
            } else if def.visibility == Visibility::Global {
                let idx = globals;
                globals += 1;
                idx as i32
            } else {
                let idx = locals;
                locals += 1;
                idx as i32
            };
        }
    }
    for i in 0..ctx.dylibs.len() {
        let counts = ctx.dylibs[i].symtab;
        let mut undefs = counts.undefs_offset;
        let owner = FileRef::Dylib(i as u32);
        for j in 0..ctx.dylibs[i].syms.len() {
            let id = ctx.dylibs[i].syms[j];
            let mut def = ctx.symtab.syms[id as usize].def();
            if def.file != Some(owner) || def.output_symtab_idx != -2 {
                continue;
            }
            def.output_symtab_idx = undefs as i32;
            undefs += 1;
        }
    }
}

fn n_type(typ: u8, is_ext: bool) -> u8 {
    (typ << 1) | is_ext as u8
}

fn populate_symtabs(ctx: &Context, buf: &mut [u8]) {
    let symtab_off = ctx.chunks[ctx.symtab_chunk].hdr.offset as usize;
    let strtab_off = ctx.chunks[ctx.strtab_chunk].hdr.offset as usize;
    buf[strtab_off..strtab_off + STRTAB_INIT.len()].copy_from_slice(STRTAB_INIT);

    let put_sym = |buf: &mut [u8], idx: u32, msym: &MachSym| {
        let pos = symtab_off + idx as usize * MachSym::SIZE;
        msym.write(&mut buf[pos..pos + MachSym::SIZE]);
    };

    for (i, file) in ctx.objs.iter().enumerate() {
        if !file.alive() {
            continue;
        }
        let owner = FileRef::Obj(i as u32);
        let mut stroff = file.symtab.strtab_offset;

        // Names first; stabs reference them too.
        let mut name_offsets = vec![0u32; file.syms.len()];
        for (j, &sym_ref) in file.syms.iter().enumerate() {
            let def = ctx.sym(sym_ref).def();
            if def.file != Some(owner) || def.output_symtab_idx < 0 {
                continue;
            }
            drop(def);
            let name = ctx.sym_name(sym_ref);
            name_offsets[j] = stroff;
            let pos = strtab_off + stroff as usize;
            buf[pos..pos + name.len()].copy_from_slice(name.as_bytes());
            stroff += name.len() as u32 + 1;
        }

        // Debug stabs: N_SO (source file), N_OSO (object path), then
        // N_FUN/N_STSYM/N_GSYM per symbol, and a closing N_SO.
        let emit_debug = file.debug_info.is_some() && !ctx.arg.strip_debug;
        if emit_debug {
            let mut stab_idx = file.symtab.stabs_offset;

            let mut write_str = |buf: &mut [u8], s: &str, stroff: &mut u32| -> u32 {
                let off = *stroff;
                let pos = strtab_off + off as usize;
                buf[pos..pos + s.len()].copy_from_slice(s.as_bytes());
                *stroff += s.len() as u32 + 1;
                off
            };

            let so_off = write_str(buf, &file.source_name, &mut stroff);
            put_sym(
                buf,
                stab_idx,
                &MachSym {
                    stroff: so_off,
                    n_type: macho::N_SO,
                    ..Default::default()
                },
            );
            stab_idx += 1;

            let oso_off = write_str(buf, &file.oso_name, &mut stroff);
            put_sym(
                buf,
                stab_idx,
                &MachSym {
                    stroff: oso_off,
                    n_type: macho::N_OSO,
                    sect: crate::arch::info(ctx.arg.arch).cpusubtype as u8,
                    desc: 1,
                    ..Default::default()
                },
            );
            stab_idx += 1;

            for (j, &sym_ref) in file.syms.iter().enumerate() {
                let def = ctx.sym(sym_ref).def();
                if def.file != Some(owner) || def.output_symtab_idx < 0 {
                    continue;
                }
                let Some(subsec) = def.subsec else { continue };
                let addr = ctx.def_addr(&def);
                let sect = ctx.chunks[ctx.subsec_osec(subsec)].sect_idx as u8;
                let is_text = {
                    let f = &ctx.objs[subsec.file as usize];
                    f.subsec_isec(subsec.idx).hdr.is_text()
                };
                let visibility = def.visibility;
                let subsec_size = ctx.subsec(subsec).input_size;
                drop(def);

                if is_text {
                    put_sym(
                        buf,
                        stab_idx,
                        &MachSym {
                            stroff: name_offsets[j],
                            n_type: macho::N_FUN,
                            sect,
                            value: addr,
                            ..Default::default()
                        },
                    );
                    put_sym(
                        buf,
                        stab_idx + 1,
                        &MachSym {
                            stroff: 1,
                            n_type: macho::N_FUN,
                            value: subsec_size as u64,
                            ..Default::default()
                        },
                    );
                    stab_idx += 2;
                } else {
                    put_sym(
                        buf,
                        stab_idx,
                        &MachSym {
                            stroff: name_offsets[j],
                            n_type: if visibility == Visibility::Local {
                                macho::N_STSYM
                            } else {
                                macho::N_GSYM
                            },
                            sect,
                            value: addr,
                            ..Default::default()
                        },
                    );
                    stab_idx += 1;
                }
            }

            put_sym(
                buf,
                stab_idx,
                &MachSym {
                    stroff: 1,
                    n_type: macho::N_SO,
                    sect: 1,
                    ..Default::default()
                },
            );
        }

        // The regular symbols.
        for (j, &sym_ref) in file.syms.iter().enumerate() {
            let def = ctx.sym(sym_ref).def();
            if def.file != Some(owner) || def.output_symtab_idx < 0 {
                continue;
            }
            let idx = def.output_symtab_idx as u32;
            let is_ext = def.visibility == Visibility::Global;

            let msym = if let Some(subsec) = def.subsec {
                MachSym {
                    stroff: name_offsets[j],
                    n_type: n_type(macho::N_SECT, is_ext),
                    sect: ctx.chunks[ctx.subsec_osec(subsec)].sect_idx as u8,
                    value: ctx.def_addr(&def),
                    ..Default::default()
                }
            } else if i == ctx.internal_obj {
                // Linker-defined symbols get a section for the debugger's
                // sake: header sentinels and ObjC stubs live in __TEXT,
                // __dyld_private and friends in __DATA.
                let in_text = sym_ref == SymRef::Global(ctx.mh_execute_header)
                    || ctx.sym_name(sym_ref).starts_with("_objc_msgSend$");
                let sect = if in_text {
                    ctx.chunks[ctx.text].sect_idx
                } else {
                    ctx.chunks[ctx.data].sect_idx
                };
                MachSym {
                    stroff: name_offsets[j],
                    n_type: n_type(macho::N_SECT, is_ext),
                    sect: sect as u8,
                    value: def.value,
                    ..Default::default()
                }
            } else if def.is_imported {
                MachSym {
                    stroff: name_offsets[j],
                    n_type: n_type(macho::N_UNDF, true),
                    ..Default::default()
                }
            } else {
                MachSym {
                    stroff: name_offsets[j],
                    n_type: n_type(macho::N_ABS, is_ext),
                    value: def.value,
                    ..Default::default()
                }
            };
            put_sym(buf, idx, &msym);
        }
    }

    for (i, dylib) in ctx.dylibs.iter().enumerate() {
        if !dylib.alive() {
            continue;
        }
        let owner = FileRef::Dylib(i as u32);
        let mut stroff = dylib.symtab.strtab_offset;

        for &id in &dylib.syms {
            let def = ctx.symtab.syms[id as usize].def();
            if def.file != Some(owner) || def.output_symtab_idx < 0 {
                continue;
            }
            let idx = def.output_symtab_idx as u32;
            drop(def);

            let name = &*ctx.symtab.syms[id as usize].name;
            let pos = strtab_off + stroff as usize;
            buf[pos..pos + name.len()].copy_from_slice(name.as_bytes());

            put_sym(
                buf,
                idx,
                &MachSym {
                    stroff,
                    n_type: n_type(macho::N_UNDF, true),
                    desc: (dylib.dylib_idx as u16) << 8,
                    ..Default::default()
                },
            );
            stroff += name.len() as u32 + 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Indirect symbol table, function starts, data-in-code
// ---------------------------------------------------------------------------

pub fn compute_indir_symtab_size(ctx: &mut Context, chunk_idx: usize) {
    let n_got = ctx.got_syms.len() as u32;
    let n_tlv = ctx.tlv_syms.len() as u32;
    let n_stubs = ctx.stub_syms.len() as u32;
    let n_lazy = if ctx.lazy_symbol_ptr.is_some() {
        crate::fixups::lazy_stub_syms(ctx).len() as u32
    } else {
        0
    };

    ctx.chunks[ctx.got].hdr.reserved1 = 0;
    ctx.chunks[ctx.thread_ptrs].hdr.reserved1 = n_got;
    ctx.chunks[ctx.stubs].hdr.reserved1 = n_got + n_tlv;
    if let Some(lazy) = ctx.lazy_symbol_ptr {
        ctx.chunks[lazy].hdr.reserved1 = n_got + n_tlv + n_stubs;
    }

    ctx.chunks[chunk_idx].hdr.size = (n_got + n_tlv + n_stubs + n_lazy) as u64 * 4;
}

fn write_indir_symtab(ctx: &Context, buf: &mut [u8]) {
    let get_idx = |sym_ref: SymRef| -> u32 {
        let def = ctx.sym(sym_ref).def();
        match (def.is_abs, def.visibility == Visibility::Global) {
            (true, false) => macho::INDIRECT_SYMBOL_ABS | macho::INDIRECT_SYMBOL_LOCAL,
            (true, true) => macho::INDIRECT_SYMBOL_ABS,
            (false, false) => macho::INDIRECT_SYMBOL_LOCAL,
            (false, true) => def.output_symtab_idx.max(0) as u32,
        }
    };

    let mut pos = 0;
    let mut put = |val: u32| {
        LittleEndian::write_u32(&mut buf[pos..], val);
        pos += 4;
    };

    for &sym_ref in &ctx.got_syms {
        put(get_idx(sym_ref));
    }
    for &sym_ref in &ctx.tlv_syms {
        put(get_idx(sym_ref));
    }
    for &sym_ref in &ctx.stub_syms {
        put(get_idx(sym_ref));
    }
    if ctx.lazy_symbol_ptr.is_some() {
        for sym_ref in crate::fixups::lazy_stub_syms(ctx) {
            put(get_idx(sym_ref));
        }
    }
}

pub fn compute_function_starts(ctx: &mut Context, chunk_idx: usize) {
    let mut vec: Vec<Vec<u64>> = ctx
        .objs
        .par_iter()
        .map(|file| {
            let mut addrs = Vec::new();
            if !file.alive() {
                return addrs;
            }
            let owner = FileRef::Obj(file.file_idx);
            for &sym_ref in &file.syms {
                let def = ctx.sym(sym_ref).def();
                if def.file != Some(owner) {
                    continue;
                }
                let Some(subsec) = def.subsec else { continue };
                if ctx.subsec(subsec).alive() && ctx.subsec_osec(subsec) == ctx.text {
                    addrs.push(ctx.def_addr(&def));
                }
            }
            addrs
        })
        .collect();

    let mut addrs: Vec<u64> = vec.drain(..).flatten().collect();
    addrs.sort_unstable();

    let mut contents = Vec::new();
    let mut last = ctx.chunks[ctx.mach_hdr].hdr.addr;
    for addr in addrs {
        macho::write_uleb(&mut contents, addr - last);
        last = addr;
    }
    contents.push(0);
    align8(&mut contents);

    ctx.chunks[chunk_idx].hdr.size = contents.len() as u64;
    ctx.function_starts_data = contents;
}

pub fn compute_data_in_code(ctx: &mut Context, chunk_idx: usize) {
    let text_seg_vmaddr = ctx.segments[ctx.chunks[ctx.text].seg].vmaddr;
    let mut contents = Vec::new();

    for file in &ctx.objs {
        if !file.alive() {
            continue;
        }
        let Some((off, size)) = file.data_in_code else {
            continue;
        };
        let data = file.data.clone();
        let bytes = data.bytes();
        let entries: Vec<macho::DataInCodeEntry> = (0..size as usize
            / macho::DataInCodeEntry::SIZE)
            .map(|i| {
                macho::DataInCodeEntry::parse(
                    &bytes[off as usize + i * macho::DataInCodeEntry::SIZE..],
                )
            })
            .collect();

        let mut entry_idx = 0;
        for (i, subsec) in file.subsections[..file.num_sorted_subsections]
            .iter()
            .enumerate()
        {
            if entry_idx == entries.len() {
                break;
            }
            if !subsec.alive() {
                continue;
            }
            let subsec_end = subsec.input_addr + subsec.input_size;
            while entry_idx < entries.len() && entries[entry_idx].offset < subsec_end {
                let ent = entries[entry_idx];
                entry_idx += 1;
                if ent.offset < subsec.input_addr {
                    continue;
                }
                let out_addr = ctx.subsec_addr(SubsecRef {
                    file: file.file_idx,
                    idx: i as u32,
                }) + (ent.offset - subsec.input_addr) as u64;
                macho::DataInCodeEntry {
                    offset: (out_addr - text_seg_vmaddr) as u32,
                    length: ent.length,
                    kind: ent.kind,
                }
                .write(&mut contents);
            }
        }
    }

    ctx.chunks[chunk_idx].hdr.size = contents.len() as u64;
    ctx.data_in_code_data = contents;
}

/// Merge input `__objc_imageinfo` sections and create the output section
/// if any file carried one.
pub fn merge_image_info(ctx: &mut Context) {
    let mut merged: Option<crate::object::ObjcImageInfo> = None;
    let mut all_have_category_class = true;

    for file in &ctx.objs {
        if !file.alive() || file.file_idx as usize == ctx.internal_obj {
            continue;
        }
        let Some(info) = file.objc_image_info else {
            all_have_category_class = false;
            continue;
        };

        match &mut merged {
            None => merged = Some(info),
            Some(merged) => {
                // All objects must agree on the Swift version.
                if merged.swift_version == 0 {
                    merged.swift_version = info.swift_version;
                }
                if merged.swift_version != info.swift_version && info.swift_version != 0 {
                    log!(
                        "Warning: {}: object files have inconsistent Swift versions: {} and {}",
                        file.display_name(),
                        merged.swift_version,
                        info.swift_version
                    );
                }
                merged.swift_lang_version = merged.swift_lang_version.max(info.swift_lang_version);
            }
        }

        if info.flags & macho::OBJC_IMAGE_HAS_CATEGORY_CLASS_PROPERTIES == 0 {
            all_have_category_class = false;
        }
    }

    let Some(mut info) = merged else { return };
    if all_have_category_class {
        info.flags |= macho::OBJC_IMAGE_HAS_CATEGORY_CLASS_PROPERTIES;
    } else {
        info.flags &= !macho::OBJC_IMAGE_HAS_CATEGORY_CLASS_PROPERTIES;
    }

    let idx = crate::layout::add_chunk(
        ctx,
        "__DATA",
        "__objc_imageinfo",
        false,
        ChunkKind::ObjcImageInfo,
    );
    ctx.chunks[idx].hdr.p2align = 2;
    ctx.image_info = Some(idx);
    ctx.merged_image_info = Some(info);
}

// ---------------------------------------------------------------------------
// Code signature and UUID
// ---------------------------------------------------------------------------

fn signature_filename(ctx: &Context) -> String {
    let path = ctx.arg.final_output.as_ref().unwrap_or(&ctx.arg.output);
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn compute_code_signature_size(ctx: &mut Context, chunk_idx: usize) {
    let page_size = crate::arch::info(ctx.arg.arch).page_size;
    let filename_size = macho::align_to(signature_filename(ctx).len() as u64 + 1, 16);
    let offset = ctx.chunks[chunk_idx].hdr.offset as u64;
    let num_blocks = macho::align_to(offset, page_size) / page_size;
    // Header + one blob index + the code directory.
    ctx.chunks[chunk_idx].hdr.size =
        12 + 12 + 88 + filename_size + num_blocks * macho::SHA256_SIZE as u64;
}

/// The "ad-hoc" signature: no key, just SHA-256 page hashes in a code
/// directory. The loader rejects unsigned ARM64 binaries, so this is not
/// optional there.
fn write_code_signature(ctx: &Context, chunk_idx: usize, buf: &mut [u8]) {
    use byteorder::BigEndian;

    let page_size = crate::arch::info(ctx.arg.arch).page_size;
    let sig_off = ctx.chunks[chunk_idx].hdr.offset as usize;
    let sig_size = ctx.chunks[chunk_idx].hdr.size as usize;
    let filename = signature_filename(ctx);
    let filename_size = macho::align_to(filename.len() as u64 + 1, 16) as usize;
    let num_blocks = (macho::align_to(sig_off as u64, page_size) / page_size) as usize;

    let text_seg = &ctx.segments[ctx.chunks[ctx.text].seg];
    let dir_length = 88 + filename_size + num_blocks * macho::SHA256_SIZE;

    // Page hashes are computed over everything before the signature.
    let hashes: Vec<[u8; 32]> = (0..num_blocks)
        .into_par_iter()
        .map(|i| {
            let start = i * page_size as usize;
            let end = ((i + 1) * page_size as usize).min(sig_off);
            let mut sha = Sha256::new();
            sha.update(&buf[start..end]);
            sha.finalize().into()
        })
        .collect();

    let sig = &mut buf[sig_off..sig_off + sig_size];
    sig.fill(0);

    BigEndian::write_u32(&mut sig[0..], macho::CSMAGIC_EMBEDDED_SIGNATURE);
    BigEndian::write_u32(&mut sig[4..], sig_size as u32);
    BigEndian::write_u32(&mut sig[8..], 1); // blob count

    BigEndian::write_u32(&mut sig[12..], macho::CSSLOT_CODEDIRECTORY);
    BigEndian::write_u32(&mut sig[16..], 24); // blob offset

    let dir = &mut sig[24..];
    BigEndian::write_u32(&mut dir[0..], macho::CSMAGIC_CODEDIRECTORY);
    BigEndian::write_u32(&mut dir[4..], dir_length as u32);
    BigEndian::write_u32(&mut dir[8..], macho::CS_SUPPORTSEXECSEG); // version
    BigEndian::write_u32(&mut dir[12..], macho::CS_ADHOC | macho::CS_LINKER_SIGNED);
    BigEndian::write_u32(&mut dir[16..], (88 + filename_size) as u32); // hash_offset
    BigEndian::write_u32(&mut dir[20..], 88); // ident_offset
    BigEndian::write_u32(&mut dir[24..], 0); // n_special_slots
    BigEndian::write_u32(&mut dir[28..], num_blocks as u32);
    BigEndian::write_u32(&mut dir[32..], sig_off as u32); // code_limit
    dir[36] = macho::SHA256_SIZE as u8;
    dir[37] = macho::CS_HASHTYPE_SHA256;
    dir[38] = 0; // platform
    dir[39] = page_size.trailing_zeros() as u8;
    BigEndian::write_u64(&mut dir[64..], text_seg.fileoff); // exec_seg_base
    BigEndian::write_u64(&mut dir[72..], text_seg.filesize); // exec_seg_limit
    if ctx.arg.output_type == macho::MH_EXECUTE {
        BigEndian::write_u64(&mut dir[80..], macho::CS_EXECSEG_MAIN_BINARY);
    }

    dir[88..88 + filename.len()].copy_from_slice(filename.as_bytes());

    let hash_base = 88 + filename_size;
    for (i, hash) in hashes.iter().enumerate() {
        let pos = hash_base + i * macho::SHA256_SIZE;
        dir[pos..pos + macho::SHA256_SIZE].copy_from_slice(hash);
    }
}

fn write_uuid(ctx: &mut Context, buf: &mut [u8]) {
    let mut hash = match ctx.arg.uuid {
        crate::options::UuidKind::None => return,
        crate::options::UuidKind::Hash => {
            let mut sha = Sha256::new();
            sha.update(&buf[..]);
            sha.finalize()
        }
        crate::options::UuidKind::Random => {
            let mut sha = Sha256::new();
            sha.update(ctx.arg.output.as_bytes());
            sha.update(std::process::id().to_le_bytes());
            sha.update(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0)
                    .to_le_bytes(),
            );
            sha.finalize()
        }
    };

    // Mark the bytes as a UUIDv4 per RFC 4122.
    hash[6] = (hash[6] & 0b0000_1111) | 0b0101_0000;
    hash[8] = (hash[8] & 0b0011_1111) | 0b1000_0000;
    ctx.uuid.copy_from_slice(&hash[..16]);

    // Rewrite the load commands with the real UUID.
    let header_size = ctx.chunks[ctx.mach_hdr].hdr.size as usize;
    write_mach_header(ctx, &mut buf[..header_size]);
}

// ---------------------------------------------------------------------------
// Chunk copying and the final write
// ---------------------------------------------------------------------------

fn copy_output_section(ctx: &Context, chunk_idx: usize, out: &mut [u8]) {
    let (members, thunks) = match &ctx.chunks[chunk_idx].kind {
        ChunkKind::Output { members, thunks } => (members, thunks),
        _ => unreachable!(),
    };

    for &member in members {
        let file = &ctx.objs[member.file as usize];
        let subsec = &file.subsections[member.idx as usize];
        let isec = file.subsec_isec(member.idx);
        let off = subsec.output_offset() as usize;

        if !matches!(isec.contents, crate::object::SectionData::Zero) {
            let sec_data = isec.contents(&file.data);
            let start = (subsec.input_addr as u64 - isec.hdr.addr) as usize;
            out[off..off + subsec.input_size as usize]
                .copy_from_slice(&sec_data[start..start + subsec.input_size as usize]);
        }
        crate::arch::apply_reloc(ctx, member, &mut out[off..]);
    }

    let osec_addr = ctx.chunks[chunk_idx].hdr.addr;
    for thunk in thunks {
        for (i, &sym_ref) in thunk.symbols.iter().enumerate() {
            let target = ctx.sym_addr(sym_ref);
            let pc = osec_addr + thunk.offset + i as u64 * 12;
            let loc = (thunk.offset + i as u64 * 12) as usize;
            crate::arch::arm64::write_thunk_entry(ctx, target, pc, &mut out[loc..loc + 12]);
        }
    }
}

fn copy_chunk(ctx: &Context, chunk_idx: usize, out: &mut [u8]) {
    match &ctx.chunks[chunk_idx].kind {
        ChunkKind::MachHeader => write_mach_header(ctx, out),
        ChunkKind::Output { .. } => copy_output_section(ctx, chunk_idx, out),
        ChunkKind::Stubs => crate::arch::write_stubs(ctx, out),
        ChunkKind::StubHelper => crate::arch::write_stub_helper(ctx, out),
        ChunkKind::ObjcStubs => crate::arch::write_objc_stubs(ctx, out),
        ChunkKind::LazySymbolPtr => {
            let info = crate::arch::info(ctx.arg.arch);
            let helper_addr = ctx.chunks[ctx.stub_helper.unwrap()].hdr.addr;
            for i in 0..crate::fixups::lazy_stub_syms(ctx).len() {
                LittleEndian::write_u64(
                    &mut out[i * 8..],
                    helper_addr + info.stub_helper_hdr_size + info.stub_helper_size * i as u64,
                );
            }
        }
        ChunkKind::Got => {
            for (i, &sym_ref) in ctx.got_syms.iter().enumerate() {
                let def = ctx.sym(sym_ref).def();
                if !def.is_imported {
                    LittleEndian::write_u64(&mut out[i * 8..], ctx.def_addr(&def));
                }
            }
        }
        ChunkKind::ThreadPtrs => {
            for (i, &sym_ref) in ctx.tlv_syms.iter().enumerate() {
                let def = ctx.sym(sym_ref).def();
                if !def.is_imported {
                    LittleEndian::write_u64(&mut out[i * 8..], ctx.def_addr(&def));
                }
            }
        }
        ChunkKind::UnwindInfo => crate::unwind::copy_buf(ctx, out),
        ChunkKind::EhFrame => crate::eh_frame::copy_buf(ctx, out),
        ChunkKind::Rebase => out[..ctx.rebase_contents.len()].copy_from_slice(&ctx.rebase_contents),
        ChunkKind::Bind => out[..ctx.bind_contents.len()].copy_from_slice(&ctx.bind_contents),
        ChunkKind::LazyBind => {
            out[..ctx.lazy_bind_contents.len()].copy_from_slice(&ctx.lazy_bind_contents)
        }
        ChunkKind::ChainedFixups => {
            out[..ctx.chained.contents.len()].copy_from_slice(&ctx.chained.contents)
        }
        ChunkKind::ExportTrie => crate::export_trie::copy_buf(ctx, out),
        ChunkKind::FunctionStarts => {
            out[..ctx.function_starts_data.len()].copy_from_slice(&ctx.function_starts_data)
        }
        ChunkKind::DataInCode => {
            out[..ctx.data_in_code_data.len()].copy_from_slice(&ctx.data_in_code_data)
        }
        ChunkKind::IndirSymtab => write_indir_symtab(ctx, out),
        ChunkKind::ObjcImageInfo => {
            let info = ctx.merged_image_info.unwrap();
            LittleEndian::write_u32(&mut out[0..], info.version);
            out[4] = info.flags;
            out[5] = info.swift_version;
            LittleEndian::write_u16(&mut out[6..], info.swift_lang_version);
        }
        ChunkKind::InitOffsets => {
            let image_base = ctx.chunks[ctx.mach_hdr].hdr.addr;
            let mut pos = 0;
            for file in &ctx.objs {
                if !file.alive() {
                    continue;
                }
                for &sym_ref in &file.init_functions {
                    let def = ctx.sym(sym_ref).def();
                    if def.visibility != Visibility::Local {
                        error!(
                            ctx,
                            "{}: __mod_init_func: non-local initializer function: {}",
                            file.display_name(),
                            ctx.sym(sym_ref).name
                        );
                    }
                    LittleEndian::write_u32(&mut out[pos..], (ctx.def_addr(&def) - image_base) as u32);
                    pos += 4;
                }
            }
        }
        ChunkKind::SectCreate { contents } => out[..contents.len()].copy_from_slice(contents),
        ChunkKind::Symtab | ChunkKind::Strtab | ChunkKind::CodeSignature => {
            // Handled separately after the parallel pass.
        }
    }
}

/// Write the whole output file.
pub fn emit(ctx: &mut Context, filesize: u64) -> Result<(), String> {
    let mut buf = vec![0u8; filesize as usize];

    // Every chunk owns a disjoint range of the buffer; split it so the
    // copies can run in parallel.
    let mut jobs: Vec<(usize, usize, usize)> = ctx
        .chunks
        .iter()
        .enumerate()
        .filter(|(_, chunk)| {
            !chunk.is_bss()
                && chunk.hdr.size > 0
                && !matches!(
                    chunk.kind,
                    ChunkKind::Symtab | ChunkKind::Strtab | ChunkKind::CodeSignature
                )
        })
        .map(|(i, chunk)| (i, chunk.hdr.offset as usize, chunk.hdr.size as usize))
        .collect();
    jobs.sort_by_key(|&(_, off, _)| off);

    {
        let mut slices: Vec<(usize, &mut [u8])> = Vec::new();
        let mut rest: &mut [u8] = &mut buf;
        let mut pos = 0usize;
        for &(chunk_idx, off, size) in &jobs {
            let (_gap, tail) = rest.split_at_mut(off - pos);
            let (slice, tail) = tail.split_at_mut(size);
            slices.push((chunk_idx, slice));
            rest = tail;
            pos = off + size;
        }

        let ctx_ref: &Context = ctx;
        slices
            .into_par_iter()
            .for_each(|(chunk_idx, slice)| copy_chunk(ctx_ref, chunk_idx, slice));
    }

    populate_symtabs(ctx, &mut buf);

    if ctx.chained_fixups.is_some() {
        crate::fixups::write_fixup_chains(ctx, &mut buf);
    }
    ctx.checkpoint();

    write_uuid(ctx, &mut buf);

    if let Some(cs) = ctx.code_sig {
        write_code_signature(ctx, cs, &mut buf);
    }

    ctx.output_written.store(true, std::sync::atomic::Ordering::Relaxed);
    std::fs::write(&ctx.arg.output, &buf)
        .map_err(|e| format!("cannot write {}: {}", ctx.arg.output, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&ctx.arg.output, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| format!("cannot chmod {}: {}", ctx.arg.output, e))?;
    }

    Ok(())
}
