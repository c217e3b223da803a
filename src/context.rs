/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The link context: all state shared across phases.
//!
//! Everything lives here — the file pools, the interned symbol table, the
//! output segment/chunk registry and the accumulated contents of the
//! synthesized sections. Files, subsections and chunks refer to each other
//! by index into these pools; the pools are append-only, so an index stays
//! valid for the whole link.

use crate::input::FileData;
use crate::dylib::DylibFile;
use crate::layout::{Chunk, ChunkKind, OutputSegment};
use crate::macho;
use crate::object::{ObjcImageInfo, ObjectFile, Subsection};
use crate::options::{LoadModifiers, Options};
use crate::symbol::{SubsecRef, SymRef, Symbol, SymbolDef, SymbolTable};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Context {
    pub arg: Options,
    pub has_error: AtomicBool,
    pub output_written: AtomicBool,

    pub symtab: SymbolTable,
    pub objs: Vec<ObjectFile>,
    pub dylibs: Vec<DylibFile>,
    pub internal_obj: usize,
    pub file_priority: u32,

    pub segments: Vec<OutputSegment>,
    pub chunks: Vec<Chunk>,

    // Well-known chunks. The optional ones depend on the fixup scheme and
    // command-line options.
    pub mach_hdr: usize,
    pub text: usize,
    pub data: usize,
    pub bss: usize,
    pub common: usize,
    pub stubs: usize,
    pub unwind_info: usize,
    pub got: usize,
    pub thread_ptrs: usize,
    pub export_chunk: usize,
    pub symtab_chunk: usize,
    pub strtab_chunk: usize,
    pub indir_symtab: usize,
    pub eh_frame: usize,
    pub stub_helper: Option<usize>,
    pub lazy_symbol_ptr: Option<usize>,
    pub lazy_bind: Option<usize>,
    pub rebase: Option<usize>,
    pub bind: Option<usize>,
    pub chained_fixups: Option<usize>,
    pub function_starts: Option<usize>,
    pub data_in_code: Option<usize>,
    pub init_offsets: Option<usize>,
    pub objc_stubs: Option<usize>,
    pub image_info: Option<usize>,
    pub code_sig: Option<usize>,

    // Per-symbol synthesized entries, in materialization order.
    pub got_syms: Vec<SymRef>,
    pub stub_syms: Vec<SymRef>,
    pub tlv_syms: Vec<SymRef>,
    pub objc_methnames: Vec<SubsecRef>,
    pub objc_selrefs: Vec<SubsecRef>,
    /// Global symbol ids of the `_objc_msgSend$...` stubs, parallel to
    /// `objc_methnames`.
    pub objc_stub_syms: Vec<u32>,

    // Accumulated contents of the __LINKEDIT chunks.
    pub rebase_contents: Vec<u8>,
    pub bind_contents: Vec<u8>,
    pub lazy_bind_contents: Vec<u8>,
    pub lazy_bind_offsets: Vec<u32>,
    pub chained: crate::fixups::ChainedState,
    pub export: crate::export_trie::ExportState,
    pub unwind: crate::unwind::UnwindState,
    pub outsym: crate::output::SymtabState,
    pub function_starts_data: Vec<u8>,
    pub data_in_code_data: Vec<u8>,
    pub merged_image_info: Option<ObjcImageInfo>,

    pub tls_begin: u64,
    pub eh_frame_size: u64,
    pub uuid: [u8; 16],
    pub entry_sym: Option<u32>,

    // Sentinel symbols the linker itself defines or references.
    pub dyld_stub_binder: u32,
    pub objc_msgsend: u32,
    pub mh_execute_header: u32,
    pub dyld_private: u32,
    pub mh_dylib_header: u32,
    pub mh_bundle_header: u32,
    pub dso_handle: u32,
}

impl Context {
    pub fn new(arg: Options) -> Context {
        let mut symtab = SymbolTable::default();
        let dyld_stub_binder = symtab.intern("dyld_stub_binder");
        let objc_msgsend = symtab.intern("_objc_msgSend");
        let mh_execute_header = symtab.intern("__mh_execute_header");
        let dyld_private = symtab.intern("__dyld_private");
        let mh_dylib_header = symtab.intern("__mh_dylib_header");
        let mh_bundle_header = symtab.intern("__mh_bundle_header");
        let dso_handle = symtab.intern("___dso_handle");

        let mut ctx = Context {
            arg,
            has_error: AtomicBool::new(false),
            output_written: AtomicBool::new(false),
            symtab,
            objs: Vec::new(),
            dylibs: Vec::new(),
            internal_obj: usize::MAX,
            file_priority: 10000,
            segments: Vec::new(),
            chunks: Vec::new(),
            mach_hdr: 0,
            text: 0,
            data: 0,
            bss: 0,
            common: 0,
            stubs: 0,
            unwind_info: 0,
            got: 0,
            thread_ptrs: 0,
            export_chunk: 0,
            symtab_chunk: 0,
            strtab_chunk: 0,
            indir_symtab: 0,
            eh_frame: 0,
            stub_helper: None,
            lazy_symbol_ptr: None,
            lazy_bind: None,
            rebase: None,
            bind: None,
            chained_fixups: None,
            function_starts: None,
            data_in_code: None,
            init_offsets: None,
            objc_stubs: None,
            image_info: None,
            code_sig: None,
            got_syms: Vec::new(),
            stub_syms: Vec::new(),
            tlv_syms: Vec::new(),
            objc_methnames: Vec::new(),
            objc_selrefs: Vec::new(),
            objc_stub_syms: Vec::new(),
            rebase_contents: Vec::new(),
            bind_contents: Vec::new(),
            lazy_bind_contents: Vec::new(),
            lazy_bind_offsets: Vec::new(),
            chained: Default::default(),
            export: Default::default(),
            unwind: Default::default(),
            outsym: Default::default(),
            function_starts_data: Vec::new(),
            data_in_code_data: Vec::new(),
            merged_image_info: None,
            tls_begin: 0,
            eh_frame_size: 0,
            uuid: [0; 16],
            entry_sym: None,
            dyld_stub_binder,
            objc_msgsend,
            mh_execute_header,
            dyld_private,
            mh_dylib_header,
            mh_bundle_header,
            dso_handle,
        };
        ctx.create_base_chunks();
        ctx
    }

    fn create_base_chunks(&mut self) {
        use crate::layout::add_chunk;

        self.mach_hdr = add_chunk(self, "__TEXT", "__mach_header", true, ChunkKind::MachHeader);

        self.text = add_chunk(
            self,
            "__TEXT",
            "__text",
            false,
            ChunkKind::Output {
                members: Vec::new(),
                thunks: Vec::new(),
            },
        );
        self.data = add_chunk(
            self,
            "__DATA",
            "__data",
            false,
            ChunkKind::Output {
                members: Vec::new(),
                thunks: Vec::new(),
            },
        );
        self.bss = add_chunk(
            self,
            "__DATA",
            "__bss",
            false,
            ChunkKind::Output {
                members: Vec::new(),
                thunks: Vec::new(),
            },
        );
        self.common = add_chunk(
            self,
            "__DATA",
            "__common",
            false,
            ChunkKind::Output {
                members: Vec::new(),
                thunks: Vec::new(),
            },
        );
        self.chunks[self.bss].hdr.type_ = macho::S_ZEROFILL;
        self.chunks[self.common].hdr.type_ = macho::S_ZEROFILL;

        self.stubs = add_chunk(self, "__TEXT", "__stubs", false, ChunkKind::Stubs);
        {
            let hdr = &mut self.chunks[self.stubs].hdr;
            hdr.p2align = 4;
            hdr.type_ = macho::S_SYMBOL_STUBS;
            hdr.attr = macho::S_ATTR_SOME_INSTRUCTIONS | macho::S_ATTR_PURE_INSTRUCTIONS;
        }

        self.unwind_info = add_chunk(self, "__TEXT", "__unwind_info", false, ChunkKind::UnwindInfo);
        self.chunks[self.unwind_info].hdr.p2align = 2;

        self.eh_frame = add_chunk(self, "__TEXT", "__eh_frame", false, ChunkKind::EhFrame);
        self.chunks[self.eh_frame].hdr.p2align = 3;

        self.got = add_chunk(self, "__DATA_CONST", "__got", false, ChunkKind::Got);
        {
            let hdr = &mut self.chunks[self.got].hdr;
            hdr.p2align = 3;
            hdr.type_ = macho::S_NON_LAZY_SYMBOL_POINTERS;
        }

        self.thread_ptrs = add_chunk(self, "__DATA", "__thread_ptrs", false, ChunkKind::ThreadPtrs);
        {
            let hdr = &mut self.chunks[self.thread_ptrs].hdr;
            hdr.p2align = 3;
            hdr.type_ = macho::S_THREAD_LOCAL_VARIABLE_POINTERS;
        }

        self.export_chunk = add_chunk(self, "__LINKEDIT", "__export", true, ChunkKind::ExportTrie);
        self.symtab_chunk = add_chunk(self, "__LINKEDIT", "__symbol_table", true, ChunkKind::Symtab);
        self.chunks[self.symtab_chunk].hdr.p2align = 3;
        self.strtab_chunk = add_chunk(self, "__LINKEDIT", "__string_table", true, ChunkKind::Strtab);
        self.chunks[self.strtab_chunk].hdr.p2align = 3;
        self.indir_symtab = add_chunk(
            self,
            "__LINKEDIT",
            "__ind_sym_tab",
            true,
            ChunkKind::IndirSymtab,
        );

        if self.arg.fixup_chains {
            let idx = add_chunk(
                self,
                "__LINKEDIT",
                "__chainfixups",
                true,
                ChunkKind::ChainedFixups,
            );
            self.chunks[idx].hdr.p2align = 3;
            self.chained_fixups = Some(idx);
        } else {
            self.rebase = Some(add_chunk(self, "__LINKEDIT", "__rebase", true, ChunkKind::Rebase));
            self.bind = Some(add_chunk(self, "__LINKEDIT", "__binding", true, ChunkKind::Bind));
            let lazy_bind = add_chunk(
                self,
                "__LINKEDIT",
                "__lazy_binding",
                true,
                ChunkKind::LazyBind,
            );
            self.chunks[lazy_bind].hdr.p2align = 3;
            self.lazy_bind = Some(lazy_bind);

            let stub_helper = add_chunk(self, "__TEXT", "__stub_helper", false, ChunkKind::StubHelper);
            {
                let hdr = &mut self.chunks[stub_helper].hdr;
                hdr.p2align = 4;
                hdr.attr = macho::S_ATTR_SOME_INSTRUCTIONS | macho::S_ATTR_PURE_INSTRUCTIONS;
            }
            self.stub_helper = Some(stub_helper);

            let lazy_ptr = add_chunk(
                self,
                "__DATA",
                "__la_symbol_ptr",
                false,
                ChunkKind::LazySymbolPtr,
            );
            {
                let hdr = &mut self.chunks[lazy_ptr].hdr;
                hdr.p2align = 3;
                hdr.type_ = macho::S_LAZY_SYMBOL_POINTERS;
            }
            self.lazy_symbol_ptr = Some(lazy_ptr);
        }

        if self.arg.function_starts {
            self.function_starts = Some(add_chunk(
                self,
                "__LINKEDIT",
                "__func_starts",
                true,
                ChunkKind::FunctionStarts,
            ));
        }
        if self.arg.data_in_code_info {
            let idx = add_chunk(self, "__LINKEDIT", "__data_in_code", true, ChunkKind::DataInCode);
            self.chunks[idx].hdr.p2align = 3;
            self.data_in_code = Some(idx);
        }
        if self.arg.init_offsets {
            let idx = add_chunk(self, "__TEXT", "__init_offsets", false, ChunkKind::InitOffsets);
            self.chunks[idx].hdr.p2align = 2;
            self.chunks[idx].hdr.type_ = macho::S_INIT_FUNC_OFFSETS;
            self.init_offsets = Some(idx);
        }
        if self.arg.adhoc_codesign == Some(true) {
            let idx = add_chunk(
                self,
                "__LINKEDIT",
                "__code_signature",
                true,
                ChunkKind::CodeSignature,
            );
            self.chunks[idx].hdr.p2align = 4;
            self.code_sig = Some(idx);
        }

        for (seg, sect, file) in self.arg.sectcreate.clone() {
            let contents = match std::fs::read(&file) {
                Ok(contents) => contents,
                Err(e) => {
                    fatal!(self, "-sectcreate: cannot read {}: {}", file, e);
                }
            };
            add_chunk(self, &seg, &sect, false, ChunkKind::SectCreate { contents });
        }

        for (seg, sect, p2align) in self.arg.sectalign.clone() {
            let idx = crate::layout::get_output_section(self, &seg, &sect);
            self.chunks[idx].hdr.p2align = self.chunks[idx].hdr.p2align.max(p2align as u32);
        }
    }

    pub fn add_object(
        &mut self,
        name: String,
        archive_name: String,
        data: FileData,
        alive: bool,
        hidden: bool,
    ) -> u32 {
        let idx = self.objs.len() as u32;
        let priority = self.file_priority;
        self.file_priority += 1;
        self.objs.push(ObjectFile::new(
            idx,
            name,
            archive_name,
            data,
            priority,
            alive,
            hidden,
        ));
        idx
    }

    pub fn add_dylib(&mut self, name: String, data: FileData, mods: LoadModifiers) -> u32 {
        let idx = self.dylibs.len() as u32;
        let priority = self.file_priority;
        self.file_priority += 1;

        // Even without -dead_strip_dylibs, a dylib carrying
        // MH_DEAD_STRIPPABLE_DYLIB is dropped if unreferenced.
        let dead_strippable_flag = macho::MachHeader::parse(data.bytes())
            .map_or(false, |hdr| {
                hdr.magic == macho::MH_MAGIC_64
                    && hdr.flags & macho::MH_DEAD_STRIPPABLE_DYLIB != 0
            });
        let is_dead_strippable = self.arg.dead_strip_dylibs || dead_strippable_flag;
        let alive = mods.needed || !is_dead_strippable;

        self.dylibs
            .push(DylibFile::new(idx, name, data, priority, alive, mods));
        idx
    }

    /// Exit with status 1 if any recoverable error has been reported.
    /// Called between phases so that one pass can report several errors.
    pub fn checkpoint(&self) {
        if self.has_error.load(Ordering::Relaxed) {
            cleanup_and_exit(self);
        }
    }

    pub fn sym(&self, r: SymRef) -> &Symbol {
        match r {
            SymRef::Global(idx) => &self.symtab.syms[idx as usize],
            SymRef::Local { file, idx } => &self.objs[file as usize].local_syms[idx as usize],
        }
    }

    pub fn sym_name(&self, r: SymRef) -> &str {
        &self.sym(r).name
    }

    pub fn subsec(&self, r: SubsecRef) -> &Subsection {
        &self.objs[r.file as usize].subsections[r.idx as usize]
    }

    pub fn subsec_addr(&self, r: SubsecRef) -> u64 {
        let file = &self.objs[r.file as usize];
        let subsec = &file.subsections[r.idx as usize];
        let osec = file.sections[subsec.isec as usize].as_ref().unwrap().osec;
        self.chunks[osec].hdr.addr + subsec.output_offset() as u64
    }

    /// Output section (chunk index) a subsection was placed in.
    pub fn subsec_osec(&self, r: SubsecRef) -> usize {
        let file = &self.objs[r.file as usize];
        let subsec = &file.subsections[r.idx as usize];
        file.sections[subsec.isec as usize].as_ref().unwrap().osec
    }

    /// Final address of a symbol: its stub if it has one, otherwise its
    /// place in its subsection, otherwise its absolute value.
    pub fn sym_addr(&self, r: SymRef) -> u64 {
        let def = self.sym(r).def();
        self.def_addr(&def)
    }

    pub fn def_addr(&self, def: &SymbolDef) -> u64 {
        if def.stub_idx != -1 {
            let stub_size = crate::arch::info(self.arg.arch).stub_size;
            return self.chunks[self.stubs].hdr.addr + def.stub_idx as u64 * stub_size;
        }
        if let Some(subsec) = def.subsec {
            debug_assert!(self.subsec(subsec).alive());
            return self.subsec_addr(subsec) + def.value;
        }
        def.value
    }

    pub fn got_addr(&self, def: &SymbolDef) -> u64 {
        assert!(def.got_idx != -1);
        self.chunks[self.got].hdr.addr + def.got_idx as u64 * 8
    }

    pub fn tlv_addr(&self, def: &SymbolDef) -> u64 {
        assert!(def.tlv_idx != -1);
        self.chunks[self.thread_ptrs].hdr.addr + def.tlv_idx as u64 * 8
    }

    /// True if the relocation target lives in a TLS data section; such
    /// addresses are thread-pointer-relative.
    pub fn refers_to_tls(&self, r: SymRef) -> bool {
        let def = self.sym(r).def();
        if let Some(subsec) = def.subsec {
            let file = &self.objs[subsec.file as usize];
            let isec = file.subsec_isec(subsec.idx);
            return isec.hdr.type_ == macho::S_THREAD_LOCAL_REGULAR
                || isec.hdr.type_ == macho::S_THREAD_LOCAL_ZEROFILL;
        }
        false
    }
}

/// Delete the partially written output (if any) and terminate.
pub fn cleanup_and_exit(ctx: &Context) -> ! {
    if ctx.output_written.load(Ordering::Relaxed) {
        let _ = std::fs::remove_file(&ctx.arg.output);
    }
    std::process::exit(1);
}
