/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Relocatable object files, and the things parsed out of them:
//! input sections, subsections, relocations and unwind records.
//!
//! The binary is read exactly once. Everything the later phases need is
//! pulled into indexed structures here; raw bytes are addressed by range
//! into the file's mapping and never copied (the one exception is
//! `__eh_frame`, whose in-place relocations have to be applied to a copy).
//!
//! A subsection is the linker's unit of granularity: a contiguous byte
//! range of an input section with its own relocations, alignment and
//! liveness. See `split_subsections_via_symbols` for how sections are
//! carved up.

use crate::context::Context;
use crate::input::FileData;
use crate::macho::{self, CompactUnwindEntry, MachRel, MachSection, MachSym};
use crate::symbol::{FileRef, SubsecRef, SymRef, Symbol, SymbolTable, Visibility};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Where a section's bytes live.
pub enum SectionData {
    /// `(offset, size)` into the owning file's mapping.
    File(u32, u32),
    /// Synthesized contents (internal file, `__eh_frame` after in-place
    /// relocation).
    Owned(Vec<u8>),
    /// Zerofill; no bytes on disk.
    Zero,
}

pub struct InputSection {
    pub hdr: MachSection,
    pub secidx: u32,
    /// Output chunk this section's subsections feed into. Assigned in a
    /// serial pass after parsing (`layout::assign_output_sections`).
    pub osec: usize,
    pub contents: SectionData,
    pub rels: Vec<Relocation>,
}

impl InputSection {
    pub fn new(hdr: MachSection, secidx: u32) -> InputSection {
        let contents = if hdr.type_ == macho::S_ZEROFILL
            || hdr.type_ == macho::S_THREAD_LOCAL_ZEROFILL
        {
            SectionData::Zero
        } else {
            SectionData::File(hdr.offset, hdr.size as u32)
        };
        InputSection {
            hdr,
            secidx,
            osec: usize::MAX,
            contents,
            rels: Vec::new(),
        }
    }

    pub fn contents<'a>(&'a self, data: &'a FileData) -> &'a [u8] {
        match &self.contents {
            SectionData::File(off, size) => &data.bytes()[*off as usize..(*off + *size) as usize],
            SectionData::Owned(vec) => vec,
            SectionData::Zero => &[],
        }
    }
}

/// A region of an InputSection. Every input section is carved into one or
/// more of these; if a section is not splittable we still create one
/// subsection covering the whole section.
pub struct Subsection {
    pub isec: u32,
    pub input_addr: u32,
    pub input_size: u32,
    pub rel_offset: u32,
    pub nrels: u32,
    pub unwind_offset: u32,
    pub nunwind: u32,
    pub p2align: u8,
    pub has_compact_unwind: bool,
    pub is_alive: AtomicBool,
    /// Byte offset from the owning output section's start; `u32::MAX`
    /// until layout assigns one.
    pub output_offset: AtomicU32,
}

impl Subsection {
    pub fn new(isec: u32, input_addr: u32, input_size: u32, p2align: u8, alive: bool) -> Subsection {
        Subsection {
            isec,
            input_addr,
            input_size,
            rel_offset: 0,
            nrels: 0,
            unwind_offset: 0,
            nunwind: 0,
            p2align,
            has_compact_unwind: false,
            is_alive: AtomicBool::new(alive),
            output_offset: AtomicU32::new(u32::MAX),
        }
    }

    pub fn alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    pub fn output_offset(&self) -> u32 {
        self.output_offset.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    Sym(SymRef),
    /// Subsection of the same object file.
    Subsec(u32),
}

/// Mach-O-native relocations are translated into this form and attached to
/// subsections; `offset` is relative to the subsection start.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub offset: u32,
    pub type_: u8,
    pub size: u8,
    pub is_pcrel: bool,
    pub is_subtracted: bool,
    pub addend: i64,
    pub target: RelocTarget,
    // For ARM64 range-extension thunks.
    pub thunk_idx: i32,
    pub thunk_sym_idx: i32,
}

impl Relocation {
    pub fn sym(&self) -> Option<SymRef> {
        match self.target {
            RelocTarget::Sym(sym) => Some(sym),
            RelocTarget::Subsec(_) => None,
        }
    }

    pub fn subsec(&self) -> Option<u32> {
        match self.target {
            RelocTarget::Sym(_) => None,
            RelocTarget::Subsec(idx) => Some(idx),
        }
    }
}

/// How to handle exceptions for one function (or a part of one). At
/// runtime the unwinder searches these by instruction pointer.
#[derive(Debug, Clone)]
pub struct UnwindRecord {
    pub subsec: Option<u32>,
    pub personality: Option<SymRef>,
    pub lsda: Option<u32>,
    pub lsda_offset: u32,
    pub input_offset: u32,
    pub code_len: u32,
    pub encoding: u32,
    pub fde: Option<u32>,
}

/// DWARF Common Information Entry in `__TEXT,__eh_frame`.
#[derive(Debug, Clone)]
pub struct CieRecord {
    pub input_addr: u32,
    pub personality: Option<SymRef>,
    pub personality_offset: u32,
    pub has_lsda: bool,
    pub output_offset: u32,
}

/// DWARF Frame Description Entry, keyed by the subsection of its function.
#[derive(Debug, Clone)]
pub struct FdeRecord {
    pub subsec: u32,
    pub input_addr: u32,
    pub output_offset: u32,
    /// Index of the owning CIE in the file's `cies`.
    pub cie: u32,
    pub lsda: Option<u32>,
    pub lsda_offset: u32,
    /// Byte offset of the LSDA pointer within the FDE record.
    pub lsda_field_off: u32,
}

/// `__DATA,__objc_imageinfo` contents.
#[derive(Debug, Clone, Copy)]
pub struct ObjcImageInfo {
    pub version: u32,
    pub flags: u8,
    pub swift_version: u8,
    pub swift_lang_version: u16,
}

/// Per-file output symbol-table accounting, filled by
/// `compute_symtab_size` and consumed when the symtab is emitted.
#[derive(Default, Clone, Copy)]
pub struct SymtabCounts {
    pub num_stabs: u32,
    pub num_locals: u32,
    pub num_globals: u32,
    pub num_undefs: u32,
    pub stabs_offset: u32,
    pub locals_offset: u32,
    pub globals_offset: u32,
    pub undefs_offset: u32,
    pub strtab_size: u32,
    pub strtab_offset: u32,
}

pub struct ObjectFile {
    pub file_idx: u32,
    pub name: String,
    pub archive_name: String,
    pub data: FileData,
    pub priority: u32,
    pub is_alive: AtomicBool,
    pub is_hidden: bool,

    pub sections: Vec<Option<InputSection>>,
    pub subsections: Vec<Subsection>,
    /// Number of leading entries of `subsections` that are sorted by input
    /// address. Synthetic subsections (commons, ObjC stub data) appended
    /// later are not address-searchable.
    pub num_sorted_subsections: usize,

    pub mach_syms: Vec<MachSym>,
    pub strtab: (u32, u32),
    pub syms: Vec<SymRef>,
    pub local_syms: Vec<Symbol>,
    pub sym_to_subsec: Vec<Option<u32>>,

    pub unwind_records: Vec<UnwindRecord>,
    pub cies: Vec<CieRecord>,
    pub fdes: Vec<FdeRecord>,

    /// `-lfoo` / `-framework Foo` directives from LC_LINKER_OPTION.
    pub linker_options: Vec<String>,

    pub unwind_sec: Option<MachSection>,
    pub eh_frame_sec: Option<MachSection>,
    pub eh_frame_data: Vec<u8>,
    pub mod_init_func: Option<MachSection>,
    pub init_functions: Vec<SymRef>,
    pub objc_image_info: Option<ObjcImageInfo>,
    pub data_in_code: Option<(u32, u32)>,

    pub debug_info: Option<(u32, u32)>,
    pub debug_abbrev: Option<(u32, u32)>,
    pub debug_str: Option<(u32, u32)>,
    pub debug_line: Option<(u32, u32)>,
    pub source_name: String,
    pub oso_name: String,

    pub symtab: SymtabCounts,
}

impl ObjectFile {
    pub fn new(
        file_idx: u32,
        name: String,
        archive_name: String,
        data: FileData,
        priority: u32,
        alive: bool,
        hidden: bool,
    ) -> ObjectFile {
        ObjectFile {
            file_idx,
            name,
            archive_name,
            data,
            priority,
            is_alive: AtomicBool::new(alive),
            is_hidden: hidden,
            sections: Vec::new(),
            subsections: Vec::new(),
            num_sorted_subsections: 0,
            mach_syms: Vec::new(),
            strtab: (0, 0),
            syms: Vec::new(),
            local_syms: Vec::new(),
            sym_to_subsec: Vec::new(),
            unwind_records: Vec::new(),
            cies: Vec::new(),
            fdes: Vec::new(),
            linker_options: Vec::new(),
            unwind_sec: None,
            eh_frame_sec: None,
            eh_frame_data: Vec::new(),
            mod_init_func: None,
            init_functions: Vec::new(),
            objc_image_info: None,
            data_in_code: None,
            debug_info: None,
            debug_abbrev: None,
            debug_str: None,
            debug_line: None,
            source_name: String::new(),
            oso_name: String::new(),
            symtab: SymtabCounts::default(),
        }
    }

    pub fn alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    /// `path` or `archive(member)` for diagnostics.
    pub fn display_name(&self) -> String {
        if self.archive_name.is_empty() {
            self.name.clone()
        } else {
            format!("{}({})", self.archive_name, self.name)
        }
    }

    /// Parse everything that doesn't need the global symbol table: load
    /// commands, sections and subsection boundaries. Runs file-parallel.
    pub fn parse_sections(&mut self, ctx: &Context) {
        let file_data = self.data.clone();
        let data = file_data.bytes();

        let Some(hdr) = macho::MachHeader::parse(data) else {
            fatal!(ctx, "{}: truncated mach header", self.display_name());
        };
        let header_flags = hdr.flags;

        let Some(cmds) = macho::load_commands(data) else {
            fatal!(ctx, "{}: truncated load commands", self.display_name());
        };

        // Symbol table first; subsection splitting needs the nlists.
        for lc in &cmds {
            if lc.cmd == macho::LC_SYMTAB {
                let body = &data[lc.offset..];
                let symoff = read_u32(body, 8);
                let nsyms = read_u32(body, 12);
                let stroff = read_u32(body, 16);
                let strsize = read_u32(body, 20);
                self.strtab = (stroff, strsize);
                for i in 0..nsyms as usize {
                    let off = symoff as usize + i * MachSym::SIZE;
                    if off + MachSym::SIZE > data.len() {
                        fatal!(ctx, "{}: truncated symbol table", self.display_name());
                    }
                    self.mach_syms.push(MachSym::parse(&data[off..]));
                }
            } else if lc.cmd == macho::LC_DATA_IN_CODE {
                let body = &data[lc.offset..];
                self.data_in_code = Some((read_u32(body, 8), read_u32(body, 12)));
            } else if lc.cmd == macho::LC_LINKER_OPTION {
                // Objects may carry auto-linking directives ("-lfoo") in
                // LC_LINKER_OPTION: a count followed by NUL-separated
                // strings.
                let body = &data[lc.offset..lc.offset + lc.cmdsize as usize];
                let count = read_u32(body, 8);
                let mut pos = 12;
                for _ in 0..count {
                    let rest = &body[pos..];
                    let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                    self.linker_options
                        .push(String::from_utf8_lossy(&rest[..len]).into_owned());
                    pos += len + 1;
                }
            }
        }

        for lc in &cmds {
            if lc.cmd != macho::LC_SEGMENT_64 {
                continue;
            }
            let seg = macho::SegmentCommand::parse(&data[lc.offset..]);
            for i in 0..seg.nsects as usize {
                let off = lc.offset + macho::SegmentCommand::SIZE + i * MachSection::SIZE;
                if off + MachSection::SIZE > data.len() {
                    fatal!(ctx, "{}: truncated section headers", self.display_name());
                }
                let hdr = MachSection::parse(&data[off..]);

                if hdr.match_name("__LD", "__compact_unwind") {
                    self.unwind_sec = Some(hdr);
                    self.sections.push(None);
                    continue;
                }
                if hdr.match_name("__TEXT", "__eh_frame") {
                    self.eh_frame_sec = Some(hdr);
                    self.sections.push(None);
                    continue;
                }
                if hdr.match_name("__DATA", "__objc_imageinfo")
                    || hdr.match_name("__DATA_CONST", "__objc_imageinfo")
                {
                    if hdr.size != 8 {
                        fatal!(ctx, "{}: __objc_imageinfo: invalid size", self.display_name());
                    }
                    let body = &data[hdr.offset as usize..];
                    let info = ObjcImageInfo {
                        version: read_u32(body, 0),
                        flags: body[4],
                        swift_version: body[5],
                        swift_lang_version: u16::from_le_bytes([body[6], body[7]]),
                    };
                    if info.version != 0 {
                        fatal!(
                            ctx,
                            "{}: __objc_imageinfo: unknown version: {}",
                            self.display_name(),
                            info.version
                        );
                    }
                    self.objc_image_info = Some(info);
                    self.sections.push(None);
                    continue;
                }
                if ctx.arg.init_offsets && hdr.type_ == macho::S_MOD_INIT_FUNC_POINTERS {
                    self.mod_init_func = Some(hdr);
                    self.sections.push(None);
                    continue;
                }

                if hdr.match_name("__DWARF", "__debug_info") {
                    self.debug_info = Some((hdr.offset, hdr.size as u32));
                }
                if hdr.match_name("__DWARF", "__debug_abbrev") {
                    self.debug_abbrev = Some((hdr.offset, hdr.size as u32));
                }
                if hdr.match_name("__DWARF", "__debug_str") {
                    self.debug_str = Some((hdr.offset, hdr.size as u32));
                }
                if hdr.match_name("__DWARF", "__debug_line") {
                    self.debug_line = Some((hdr.offset, hdr.size as u32));
                }

                if hdr.segname == "__LLVM" || hdr.attr & macho::S_ATTR_DEBUG != 0 {
                    self.sections.push(None);
                    continue;
                }

                let secidx = self.sections.len() as u32;
                self.sections.push(Some(InputSection::new(hdr, secidx)));
            }
        }

        if header_flags & macho::MH_SUBSECTIONS_VIA_SYMBOLS != 0 {
            self.split_subsections_via_symbols(ctx);
        } else {
            self.init_subsections(ctx);
        }

        self.split_cstring_literals(ctx);
        self.split_fixed_size_literals(ctx);
        self.split_literal_pointers(ctx);

        self.sort_subsections();
    }

    /// For an object with subsections-via-symbols, every non-alt-entry
    /// N_SECT symbol begins a new subsection. We start with one big
    /// subsection per section and split the trailing one at each symbol;
    /// two symbols at the same address do not create an empty subsection.
    fn split_subsections_via_symbols(&mut self, ctx: &Context) {
        struct MachSymOff {
            sect: u8,
            value: u64,
            desc: u16,
            symidx: usize,
        }

        let mut msyms: Vec<MachSymOff> = Vec::new();
        for (i, msym) in self.mach_syms.iter().enumerate() {
            if msym.stab() == 0
                && msym.typ() == macho::N_SECT
                && (msym.sect as usize)
                    .checked_sub(1)
                    .and_then(|idx| self.sections.get(idx))
                    .map_or(false, |s| s.is_some())
            {
                msyms.push(MachSymOff {
                    sect: msym.sect,
                    value: msym.value,
                    desc: msym.desc,
                    symidx: i,
                });
            }
        }
        msyms.sort_by_key(|m| (m.sect, m.value));

        self.sym_to_subsec = vec![None; self.mach_syms.len()];
        let alive = !ctx.arg.dead_strip;

        for i in 0..self.sections.len() {
            let Some(isec) = &self.sections[i] else {
                continue;
            };
            if always_split(isec) {
                continue;
            }
            let sec_addr = isec.hdr.addr;
            let sec_size = isec.hdr.size;
            let p2align = isec.hdr.p2align as u8;

            self.subsections.push(Subsection::new(
                i as u32,
                sec_addr as u32,
                sec_size as u32,
                p2align,
                alive,
            ));

            for m in msyms.iter().filter(|m| m.sect as usize == i + 1) {
                if m.desc & macho::N_ALT_ENTRY == 0 {
                    let last = self.subsections.last_mut().unwrap();
                    let size1 = m.value as i64 - last.input_addr as i64;
                    let size2 = sec_addr as i64 + sec_size as i64 - m.value as i64;
                    if size1 > 0 && size2 > 0 {
                        last.input_size = size1 as u32;
                        self.subsections.push(Subsection::new(
                            i as u32,
                            m.value as u32,
                            size2 as u32,
                            p2align,
                            alive,
                        ));
                    }
                }
                self.sym_to_subsec[m.symidx] = Some(self.subsections.len() as u32 - 1);
            }
        }
    }

    /// Without MH_SUBSECTIONS_VIA_SYMBOLS, each section is one subsection.
    fn init_subsections(&mut self, ctx: &Context) {
        let alive = !ctx.arg.dead_strip;
        let mut sec_to_subsec = vec![None; self.sections.len()];

        for i in 0..self.sections.len() {
            let Some(isec) = &self.sections[i] else {
                continue;
            };
            if always_split(isec) {
                continue;
            }
            sec_to_subsec[i] = Some(self.subsections.len() as u32);
            self.subsections.push(Subsection::new(
                i as u32,
                isec.hdr.addr as u32,
                isec.hdr.size as u32,
                isec.hdr.p2align as u8,
                alive,
            ));
        }

        self.sym_to_subsec = vec![None; self.mach_syms.len()];
        for (i, msym) in self.mach_syms.iter().enumerate() {
            if msym.stab() == 0 && msym.typ() == macho::N_SECT {
                self.sym_to_subsec[i] = (msym.sect as usize)
                    .checked_sub(1)
                    .and_then(|idx| sec_to_subsec.get(idx))
                    .copied()
                    .flatten();
            }
        }
    }

    /// Split `__cstring`-class sections at each null run. A constant string
    /// has no alignment info of its own, so it is inferred from its offset.
    fn split_cstring_literals(&mut self, ctx: &Context) {
        let alive = !ctx.arg.dead_strip;
        let mut new_subsecs = Vec::new();

        for (i, isec) in self.sections.iter().enumerate() {
            let Some(isec) = isec else { continue };
            if isec.hdr.type_ != macho::S_CSTRING_LITERALS {
                continue;
            }
            let str_bytes = isec.contents(&self.data);
            let mut pos = 0usize;
            while pos < str_bytes.len() {
                let Some(nul) = str_bytes[pos..].iter().position(|&b| b == 0) else {
                    fatal!(ctx, "{}: corrupted cstring section", self.display_name());
                };
                let mut end = pos + nul;
                while end < str_bytes.len() && str_bytes[end] == 0 {
                    end += 1;
                }
                let p2align = (isec.hdr.p2align).min(pos.trailing_zeros()) as u8;
                new_subsecs.push(Subsection::new(
                    i as u32,
                    (isec.hdr.addr as usize + pos) as u32,
                    (end - pos) as u32,
                    p2align,
                    alive,
                ));
                pos = end;
            }
        }
        self.subsections.append(&mut new_subsecs);
    }

    /// Split `S_{4,8,16}BYTE_LITERALS` sections at the literal size.
    fn split_fixed_size_literals(&mut self, ctx: &Context) {
        let alive = !ctx.arg.dead_strip;
        let mut new_subsecs = Vec::new();

        for (i, isec) in self.sections.iter().enumerate() {
            let Some(isec) = isec else { continue };
            let size = match isec.hdr.type_ {
                macho::S_4BYTE_LITERALS => 4u32,
                macho::S_8BYTE_LITERALS => 8,
                macho::S_16BYTE_LITERALS => 16,
                _ => continue,
            };
            if isec.hdr.size % size as u64 != 0 {
                fatal!(ctx, "{}: invalid literals section", self.display_name());
            }
            let mut pos = 0u32;
            while (pos as u64) < isec.hdr.size {
                new_subsecs.push(Subsection::new(
                    i as u32,
                    isec.hdr.addr as u32 + pos,
                    size,
                    size.trailing_zeros() as u8,
                    alive,
                ));
                pos += size;
            }
        }
        self.subsections.append(&mut new_subsecs);
    }

    /// Split `S_LITERAL_POINTERS` sections (e.g. `__objc_selrefs`) at word
    /// size.
    fn split_literal_pointers(&mut self, ctx: &Context) {
        let alive = !ctx.arg.dead_strip;
        let mut new_subsecs = Vec::new();

        for (i, isec) in self.sections.iter().enumerate() {
            let Some(isec) = isec else { continue };
            if isec.hdr.type_ != macho::S_LITERAL_POINTERS {
                continue;
            }
            assert!(isec.hdr.size % 8 == 0);
            let mut pos = 0u32;
            while (pos as u64) < isec.hdr.size {
                new_subsecs.push(Subsection::new(
                    i as u32,
                    isec.hdr.addr as u32 + pos,
                    8,
                    3,
                    alive,
                ));
                pos += 8;
            }
        }
        self.subsections.append(&mut new_subsecs);
    }

    /// Sort subsections by input address and remap `sym_to_subsec`.
    fn sort_subsections(&mut self) {
        let mut order: Vec<u32> = (0..self.subsections.len() as u32).collect();
        order.sort_by_key(|&i| self.subsections[i as usize].input_addr);

        let mut old_to_new = vec![0u32; order.len()];
        for (new, &old) in order.iter().enumerate() {
            old_to_new[old as usize] = new as u32;
        }

        let mut sorted: Vec<Option<Subsection>> =
            self.subsections.drain(..).map(Some).collect();
        self.subsections = order
            .iter()
            .map(|&old| sorted[old as usize].take().unwrap())
            .collect();
        self.num_sorted_subsections = self.subsections.len();

        for slot in &mut self.sym_to_subsec {
            if let Some(idx) = slot {
                *idx = old_to_new[*idx as usize];
            }
        }
    }

    /// Binary search for the subsection containing `addr`. Only the
    /// address-sorted prefix (everything parsed from the file) is
    /// searched.
    pub fn find_subsection(&self, addr: u32) -> Option<u32> {
        let subsecs = &self.subsections[..self.num_sorted_subsections];
        let idx = subsecs.partition_point(|s| s.input_addr <= addr);
        if idx == 0 {
            None
        } else {
            Some(idx as u32 - 1)
        }
    }

    pub fn sym_name<'a>(&self, data: &'a [u8], msym: &MachSym) -> &'a str {
        let (stroff, strsize) = self.strtab;
        let start = (stroff + msym.stroff) as usize;
        let end = (stroff + strsize) as usize;
        if start >= end || start >= data.len() {
            return "";
        }
        let bytes = &data[start..end.min(data.len())];
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..len]).unwrap_or("")
    }

    /// Create symbols: locals into the file's private table, globals
    /// interned into the context's table. Runs serially (it is the only
    /// step that inserts into the interner).
    pub fn parse_symbols(&mut self, symtab: &mut SymbolTable) {
        let file_data = self.data.clone();
        let data = file_data.bytes();
        self.syms.reserve(self.mach_syms.len());

        for i in 0..self.mach_syms.len() {
            let msym = self.mach_syms[i];
            let name = self.sym_name(data, &msym);

            if msym.is_extern() {
                self.syms.push(SymRef::Global(symtab.intern(name)));
                continue;
            }

            let sym = Symbol::new(name);
            {
                let mut def = sym.def();
                def.file = Some(FileRef::Obj(self.file_idx));
                def.visibility = Visibility::Local;
                def.no_dead_strip = msym.desc & macho::N_NO_DEAD_STRIP != 0;

                if msym.typ() == macho::N_ABS {
                    def.value = msym.value;
                    def.is_abs = true;
                } else if msym.stab() == 0 && msym.typ() == macho::N_SECT {
                    let subsec = self.sym_to_subsec[i]
                        .or_else(|| self.find_subsection(msym.value as u32));
                    // Subsec is none if a symbol is in __compact_unwind.
                    if let Some(subsec) = subsec {
                        def.subsec = Some(SubsecRef {
                            file: self.file_idx,
                            idx: subsec,
                        });
                        def.value = msym.value - self.subsections[subsec as usize].input_addr as u64;
                        def.is_tlv = self.subsec_isec(subsec).hdr.type_
                            == macho::S_THREAD_LOCAL_VARIABLES;
                    } else {
                        def.value = msym.value;
                    }
                }
            }
            let idx = self.local_syms.len() as u32;
            self.local_syms.push(sym);
            self.syms.push(SymRef::Local {
                file: self.file_idx,
                idx,
            });
        }
    }

    pub fn subsec_isec(&self, subsec: u32) -> &InputSection {
        let isec = self.subsections[subsec as usize].isec;
        self.sections[isec as usize].as_ref().unwrap()
    }

    /// Decode the relocation table of every section and hand each
    /// subsection its slice. Runs file-parallel after symbol creation.
    pub fn parse_relocations(&mut self, ctx: &Context) {
        for i in 0..self.sections.len() {
            if self.sections[i].is_none() {
                continue;
            }
            let hdr = self.sections[i].as_ref().unwrap().hdr.clone();
            let mut rels = crate::arch::read_relocations(ctx, self, &hdr);
            rels.sort_by_key(|r| r.offset);

            // Find the subsections this section's relocations belong to and
            // assign each one a contiguous group.
            let begin = self.subsections[..self.num_sorted_subsections]
                .partition_point(|s| (s.input_addr as u64) < hdr.addr);
            let end = self.subsections[..self.num_sorted_subsections]
                .partition_point(|s| (s.input_addr as u64) < hdr.addr + hdr.size);

            let mut rel_idx = 0usize;
            for subsec in &mut self.subsections[begin..end] {
                subsec.rel_offset = rel_idx as u32;
                let input_offset = subsec.input_addr - hdr.addr as u32;
                while rel_idx < rels.len()
                    && rels[rel_idx].offset < input_offset + subsec.input_size
                {
                    rels[rel_idx].offset -= input_offset;
                    rel_idx += 1;
                }
                subsec.nrels = rel_idx as u32 - subsec.rel_offset;
            }

            self.sections[i].as_mut().unwrap().rels = rels;
        }
    }

    /// Read `__LD,__compact_unwind`: fixed 32-byte records whose
    /// code-start / personality / LSDA fields arrive as relocations.
    /// Records in DWARF mode are dropped; FDE-derived ones replace them.
    pub fn parse_compact_unwind(&mut self, ctx: &Context) {
        let Some(hdr) = self.unwind_sec.clone() else {
            return;
        };
        let file_data = self.data.clone();
        let data = file_data.bytes();

        if hdr.size % CompactUnwindEntry::SIZE as u64 != 0 {
            fatal!(ctx, "{}: invalid __compact_unwind section size", self.display_name());
        }
        let num_entries = (hdr.size / CompactUnwindEntry::SIZE as u64) as usize;

        let entry = |idx: usize| -> CompactUnwindEntry {
            CompactUnwindEntry::parse(&data[hdr.offset as usize + idx * CompactUnwindEntry::SIZE..])
        };

        let mut records: Vec<UnwindRecord> = (0..num_entries)
            .map(|i| {
                let src = entry(i);
                UnwindRecord {
                    subsec: None,
                    personality: None,
                    lsda: None,
                    lsda_offset: 0,
                    input_offset: 0,
                    code_len: src.code_len,
                    encoding: src.encoding,
                    fde: None,
                }
            })
            .collect();

        let find_symbol = |addr: u64| -> Option<SymRef> {
            for (i, msym) in self.mach_syms.iter().enumerate() {
                if msym.is_extern() && msym.value == addr {
                    return Some(self.syms[i]);
                }
            }
            None
        };

        let abs_rel = crate::arch::info(ctx.arg.arch).abs_rel;

        for i in 0..hdr.nreloc as usize {
            let r = MachRel::parse(&data[hdr.reloff as usize + i * MachRel::SIZE..]);
            if r.offset as u64 >= hdr.size {
                fatal!(ctx, "{}: relocation offset too large: {}", self.display_name(), i);
            }

            let idx = r.offset as usize / CompactUnwindEntry::SIZE;
            let src = entry(idx);

            if 1 << r.p2size != 8 || r.type_ != abs_rel {
                fatal!(
                    ctx,
                    "{}: __compact_unwind: unsupported relocation: {}",
                    self.display_name(),
                    i
                );
            }

            match r.offset as usize % CompactUnwindEntry::SIZE {
                CompactUnwindEntry::CODE_START_OFF => {
                    let rec = &mut records[idx];
                    if r.is_extern {
                        rec.subsec = self.sym_to_subsec[r.idx as usize];
                        rec.input_offset = src.code_start as u32;
                    } else {
                        rec.subsec = self.find_subsection(src.code_start as u32);
                        if let Some(subsec) = rec.subsec {
                            rec.input_offset =
                                src.code_start as u32 - self.subsections[subsec as usize].input_addr;
                        }
                    }
                    if rec.subsec.is_none() {
                        fatal!(
                            ctx,
                            "{}: __compact_unwind: unsupported relocation: {}",
                            self.display_name(),
                            i
                        );
                    }
                }
                CompactUnwindEntry::PERSONALITY_OFF => {
                    let personality = if r.is_extern {
                        Some(self.syms[r.idx as usize])
                    } else {
                        find_symbol(src.personality)
                    };
                    if personality.is_none() {
                        fatal!(
                            ctx,
                            "{}: __compact_unwind: unsupported personality reference: {}",
                            self.display_name(),
                            i
                        );
                    }
                    records[idx].personality = personality;
                }
                CompactUnwindEntry::LSDA_OFF => {
                    let rec = &mut records[idx];
                    let addr = src.lsda as u32;
                    if r.is_extern {
                        rec.lsda = self.sym_to_subsec[r.idx as usize];
                        rec.lsda_offset = addr;
                    } else {
                        rec.lsda = self.find_subsection(addr);
                        let Some(lsda) = rec.lsda else {
                            fatal!(
                                ctx,
                                "{}: __compact_unwind: unsupported relocation: {}",
                                self.display_name(),
                                i
                            );
                        };
                        rec.lsda_offset = addr - self.subsections[lsda as usize].input_addr;
                    }
                }
                _ => {
                    fatal!(
                        ctx,
                        "{}: __compact_unwind: unsupported relocation: {}",
                        self.display_name(),
                        i
                    );
                }
            }
        }

        // Compact unwind records pointing at DWARF unwind info are dropped:
        // we synthesize our own from the FDEs. `ld -r` output tends to
        // contain such records.
        let dwarf_mode = crate::arch::info(ctx.arg.arch).unwind_mode_dwarf;
        records.retain(|rec| rec.encoding & macho::UNWIND_MODE_MASK != dwarf_mode);

        for rec in &records {
            let Some(subsec) = rec.subsec else {
                fatal!(
                    ctx,
                    "{}: __compact_unwind: missing relocation at offset {:#x}",
                    self.display_name(),
                    rec.input_offset
                );
            };
            self.subsections[subsec as usize].has_compact_unwind = true;
        }

        self.unwind_records = records;
    }

    /// Attach unwind records (native ones plus those synthesized from
    /// FDEs) to their subsections.
    pub fn associate_compact_unwind(&mut self) {
        for (i, fde) in self.fdes.iter().enumerate() {
            self.unwind_records.push(UnwindRecord {
                subsec: Some(fde.subsec),
                personality: None,
                lsda: None,
                lsda_offset: 0,
                input_offset: 0,
                code_len: self.subsections[fde.subsec as usize].input_size,
                encoding: 0,
                fde: Some(i as u32),
            });
        }

        self.unwind_records.sort_by_key(|rec| {
            let subsec = rec.subsec.unwrap();
            (self.subsections[subsec as usize].input_addr, rec.input_offset)
        });

        let mut i = 0;
        while i < self.unwind_records.len() {
            let subsec = self.unwind_records[i].subsec.unwrap();
            let mut j = i + 1;
            while j < self.unwind_records.len() && self.unwind_records[j].subsec == Some(subsec) {
                j += 1;
            }
            let s = &mut self.subsections[subsec as usize];
            s.unwind_offset = i as u32;
            s.nunwind = (j - i) as u32;
            i = j;
        }
    }

    /// `__mod_init_func` holds absolute pointers to global initializers,
    /// one word each, all carried by extern relocations.
    pub fn parse_mod_init_func(&mut self, ctx: &Context) {
        let Some(hdr) = self.mod_init_func.clone() else {
            return;
        };
        let file_data = self.data.clone();
        let data = file_data.bytes();

        if hdr.size % 8 != 0 {
            fatal!(ctx, "{}: __mod_init_func: unexpected section size", self.display_name());
        }

        let mut rels: Vec<MachRel> = (0..hdr.nreloc as usize)
            .map(|i| MachRel::parse(&data[hdr.reloff as usize + i * MachRel::SIZE..]))
            .collect();
        rels.sort_by_key(|r| r.offset);

        let abs_rel = crate::arch::info(ctx.arg.arch).abs_rel;
        for (i, r) in rels.iter().enumerate() {
            if r.type_ != abs_rel {
                fatal!(ctx, "{}: __mod_init_func: unexpected relocation type", self.display_name());
            }
            if r.offset as usize != i * 8 {
                fatal!(ctx, "{}: __mod_init_func: unexpected relocation offset", self.display_name());
            }
            if !r.is_extern {
                fatal!(ctx, "{}: __mod_init_func: unexpected is_extern value", self.display_name());
            }
            self.init_functions.push(self.syms[r.idx as usize]);
        }
    }

    /// True if this object defines Objective-C classes or Swift sections.
    /// `-ObjC` force-loads such archive members.
    pub fn is_objc_object(&self, symtab: &SymbolTable) -> bool {
        for isec in self.sections.iter().flatten() {
            if isec.hdr.match_name("__DATA", "__objc_catlist")
                || (isec.hdr.segname == "__TEXT" && isec.hdr.sectname.starts_with("__swift"))
            {
                return true;
            }
        }
        for (i, msym) in self.mach_syms.iter().enumerate() {
            if !msym.is_undef() && msym.is_extern() {
                if let SymRef::Global(id) = self.syms[i] {
                    if symtab.syms[id as usize].name.starts_with("_OBJC_CLASS_$_") {
                        return true;
                    }
                }
            }
        }
        false
    }
}

fn always_split(isec: &InputSection) -> bool {
    matches!(
        isec.hdr.type_,
        macho::S_4BYTE_LITERALS
            | macho::S_8BYTE_LITERALS
            | macho::S_16BYTE_LITERALS
            | macho::S_LITERAL_POINTERS
            | macho::S_CSTRING_LITERALS
    )
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}
