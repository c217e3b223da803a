/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Output layout: segments, chunks and address assignment.
//!
//! A chunk is anything that occupies a range of the output file: a regular
//! output section built from input subsections, a linker-synthesized
//! section (stubs, GOT, unwind info, ...), or a `__LINKEDIT` blob. Chunks
//! belong to segments; layout walks the segments in their canonical order
//! and assigns every chunk a file offset and virtual address, computing
//! sizes on the way (a `__LINKEDIT` chunk may encode addresses of earlier
//! segments into its contents, which is why sizing happens mid-walk).

use crate::context::Context;
use crate::macho::{self, MachSection};
use crate::options::Arch;
use crate::symbol::SubsecRef;
use crate::thunks::RangeExtensionThunk;

pub enum ChunkKind {
    MachHeader,
    Output {
        members: Vec<SubsecRef>,
        thunks: Vec<RangeExtensionThunk>,
    },
    Stubs,
    StubHelper,
    LazySymbolPtr,
    Got,
    ThreadPtrs,
    ObjcStubs,
    UnwindInfo,
    EhFrame,
    Rebase,
    Bind,
    LazyBind,
    ChainedFixups,
    ExportTrie,
    FunctionStarts,
    Symtab,
    Strtab,
    IndirSymtab,
    DataInCode,
    CodeSignature,
    ObjcImageInfo,
    InitOffsets,
    SectCreate { contents: Vec<u8> },
}

pub struct Chunk {
    pub hdr: MachSection,
    pub seg: usize,
    /// Hidden chunks occupy file space but get no section header
    /// (`__LINKEDIT` blobs, the mach header itself).
    pub is_hidden: bool,
    pub sect_idx: u32,
    pub kind: ChunkKind,
}

impl Chunk {
    pub fn members(&self) -> &[SubsecRef] {
        match &self.kind {
            ChunkKind::Output { members, .. } => members,
            _ => &[],
        }
    }

    pub fn is_bss(&self) -> bool {
        self.hdr.type_ == macho::S_ZEROFILL || self.hdr.type_ == macho::S_THREAD_LOCAL_ZEROFILL
    }
}

pub struct OutputSegment {
    pub segname: String,
    pub seg_idx: i32,
    pub chunks: Vec<usize>,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub flags: u32,
}

pub fn get_segment(ctx: &mut Context, name: &str) -> usize {
    if let Some(idx) = ctx.segments.iter().position(|seg| seg.segname == name) {
        return idx;
    }
    let initprot = match name {
        "__PAGEZERO" => 0,
        "__TEXT" => macho::VM_PROT_READ | macho::VM_PROT_EXECUTE,
        "__LINKEDIT" => macho::VM_PROT_READ,
        _ => macho::VM_PROT_READ | macho::VM_PROT_WRITE,
    };
    let flags = if name == "__DATA_CONST" {
        macho::SG_READ_ONLY
    } else {
        0
    };
    ctx.segments.push(OutputSegment {
        segname: name.to_string(),
        seg_idx: -1,
        chunks: Vec::new(),
        vmaddr: 0,
        vmsize: 0,
        fileoff: 0,
        filesize: 0,
        maxprot: initprot,
        initprot,
        flags,
    });
    ctx.segments.len() - 1
}

/// Create a chunk and register it with its segment.
pub fn add_chunk(
    ctx: &mut Context,
    segname: &str,
    sectname: &str,
    is_hidden: bool,
    kind: ChunkKind,
) -> usize {
    let seg = get_segment(ctx, segname);
    let idx = ctx.chunks.len();
    ctx.chunks.push(Chunk {
        hdr: MachSection {
            segname: segname.to_string(),
            sectname: sectname.to_string(),
            ..Default::default()
        },
        seg,
        is_hidden,
        sect_idx: 0,
        kind,
    });
    ctx.segments[seg].chunks.push(idx);
    idx
}

/// Some input sections move to a different output segment or section:
/// read-only data and the ObjC metadata lists go to `__DATA_CONST`, and
/// `__StaticInit` folds into `__text`.
fn output_section_name(segname: &str, sectname: &str) -> (String, String) {
    const DATA_CONST_SECTIONS: &[&str] = &[
        "__got",
        "__auth_got",
        "__auth_ptr",
        "__nl_symbol_ptr",
        "__const",
        "__cfstring",
        "__mod_init_func",
        "__mod_term_func",
        "__objc_classlist",
        "__objc_nlclslist",
        "__objc_catlist",
        "__objc_nlcatlist",
        "__objc_protolist",
    ];

    if segname == "__DATA" && DATA_CONST_SECTIONS.contains(&sectname) {
        ("__DATA_CONST".to_string(), sectname.to_string())
    } else if segname == "__TEXT" && sectname == "__StaticInit" {
        ("__TEXT".to_string(), "__text".to_string())
    } else {
        (segname.to_string(), sectname.to_string())
    }
}

pub fn get_output_section(ctx: &mut Context, segname: &str, sectname: &str) -> usize {
    let (segname, sectname) = output_section_name(segname, sectname);
    for (i, chunk) in ctx.chunks.iter().enumerate() {
        if chunk.hdr.match_name(&segname, &sectname) {
            if matches!(chunk.kind, ChunkKind::Output { .. }) {
                return i;
            }
            fatal!(ctx, "reserved section name is used: {},{}", segname, sectname);
        }
    }
    add_chunk(
        ctx,
        &segname,
        &sectname,
        false,
        ChunkKind::Output {
            members: Vec::new(),
            thunks: Vec::new(),
        },
    )
}

/// Serial pass after parsing: decide the output section of every input
/// section. File order makes the result deterministic.
pub fn assign_output_sections(ctx: &mut Context) {
    for i in 0..ctx.objs.len() {
        for j in 0..ctx.objs[i].sections.len() {
            let Some((segname, sectname)) = ctx.objs[i].sections[j]
                .as_ref()
                .map(|isec| (isec.hdr.segname.clone(), isec.hdr.sectname.clone()))
            else {
                continue;
            };
            let osec = get_output_section(ctx, &segname, &sectname);
            ctx.objs[i].sections[j].as_mut().unwrap().osec = osec;
        }
    }
}

/// Append every live subsection to its output section, merging alignment
/// and attributes into the section header.
pub fn register_subsections(ctx: &mut Context) {
    for file_idx in 0..ctx.objs.len() {
        if !ctx.objs[file_idx].alive() {
            continue;
        }
        for subsec_idx in 0..ctx.objs[file_idx].subsections.len() {
            let file = &ctx.objs[file_idx];
            let subsec = &file.subsections[subsec_idx];
            if !subsec.alive() {
                continue;
            }
            let isec = file.sections[subsec.isec as usize].as_ref().unwrap();
            let osec = isec.osec;
            let p2align = subsec.p2align as u32;
            let attr = isec.hdr.attr;
            let type_ = isec.hdr.type_;

            let chunk = &mut ctx.chunks[osec];
            chunk.hdr.p2align = chunk.hdr.p2align.max(p2align);
            chunk.hdr.attr |= attr;
            chunk.hdr.type_ = type_;
            match &mut chunk.kind {
                ChunkKind::Output { members, .. } => members.push(SubsecRef {
                    file: file_idx as u32,
                    idx: subsec_idx as u32,
                }),
                _ => unreachable!(),
            }
        }
    }
}

// The canonical segment order. User-defined segments sort alphabetically
// between __DATA and __LINKEDIT.
fn segment_order(name: &str) -> (u32, &str) {
    match name {
        "__TEXT" => (0, ""),
        "__DATA_CONST" => (1, ""),
        "__DATA" => (2, ""),
        "__LINKEDIT" => (4, ""),
        _ => (3, name),
    }
}

fn chunk_order(chunk: &Chunk) -> u32 {
    let base = match &chunk.kind {
        ChunkKind::MachHeader => 0,
        ChunkKind::Output { .. } => {
            if chunk.hdr.match_name("__TEXT", "__text") {
                1
            } else {
                30
            }
        }
        ChunkKind::SectCreate { .. } => 31,
        ChunkKind::ObjcImageInfo => 32,
        ChunkKind::Stubs => 20,
        ChunkKind::StubHelper => 21,
        ChunkKind::ObjcStubs => 22,
        ChunkKind::InitOffsets => 23,
        ChunkKind::Got => 25,
        ChunkKind::LazySymbolPtr => 26,
        ChunkKind::ThreadPtrs => 27,
        ChunkKind::UnwindInfo => 40,
        ChunkKind::EhFrame => 41,
        ChunkKind::Rebase => 50,
        ChunkKind::Bind => 51,
        ChunkKind::LazyBind => 52,
        ChunkKind::ChainedFixups => 53,
        ChunkKind::ExportTrie => 54,
        ChunkKind::FunctionStarts => 55,
        ChunkKind::DataInCode => 56,
        ChunkKind::Symtab => 57,
        ChunkKind::IndirSymtab => 58,
        ChunkKind::Strtab => 59,
        ChunkKind::CodeSignature => 60,
    };
    // Zerofill chunks go to the end of their segment; they have vm space
    // but no file contents.
    if chunk.is_bss() {
        base + 1000
    } else {
        base
    }
}

/// Fix the segment and chunk order, then assign segment indices.
pub fn sort_output(ctx: &mut Context) {
    let mut seg_order: Vec<usize> = (0..ctx.segments.len()).collect();
    seg_order.sort_by(|&a, &b| {
        segment_order(&ctx.segments[a].segname).cmp(&segment_order(&ctx.segments[b].segname))
    });

    let mut remap = vec![0usize; ctx.segments.len()];
    for (new, &old) in seg_order.iter().enumerate() {
        remap[old] = new;
    }

    let mut segments: Vec<Option<OutputSegment>> = ctx.segments.drain(..).map(Some).collect();
    ctx.segments = seg_order
        .iter()
        .map(|&old| segments[old].take().unwrap())
        .collect();
    for chunk in &mut ctx.chunks {
        chunk.seg = remap[chunk.seg];
    }

    // __PAGEZERO occupies segment index 0 of the load-command order when
    // present; everything else follows.
    let base = if ctx.arg.pagezero_size > 0 { 1 } else { 0 };
    for i in 0..ctx.segments.len() {
        ctx.segments[i].seg_idx = (i + base) as i32;
        let mut chunks = std::mem::take(&mut ctx.segments[i].chunks);
        chunks.sort_by_key(|&c| (chunk_order(&ctx.chunks[c]), c));
        ctx.segments[i].chunks = chunks;
    }

    // Section ordinals are 1-based and skip hidden chunks.
    let mut sect_idx = 1;
    for i in 0..ctx.segments.len() {
        for j in 0..ctx.segments[i].chunks.len() {
            let chunk = ctx.segments[i].chunks[j];
            if !ctx.chunks[chunk].is_hidden {
                ctx.chunks[chunk].sect_idx = sect_idx;
                sect_idx += 1;
            }
        }
    }
}

fn chunk_alignment(ctx: &Context, chunk: &Chunk, seg: &OutputSegment) -> u64 {
    match chunk.hdr.type_ {
        // A TLS initialization image is copied as a contiguous block, so
        // its alignment is the largest of __thread_data and __thread_bss.
        macho::S_THREAD_LOCAL_REGULAR | macho::S_THREAD_LOCAL_ZEROFILL => {
            let mut val = 1u64;
            for &c in &seg.chunks {
                let hdr = &ctx.chunks[c].hdr;
                if hdr.type_ == macho::S_THREAD_LOCAL_REGULAR
                    || hdr.type_ == macho::S_THREAD_LOCAL_ZEROFILL
                {
                    val = val.max(1 << hdr.p2align);
                }
            }
            val
        }
        // __thread_vars contains pointers but compilers create it with an
        // alignment of 1; force word alignment.
        macho::S_THREAD_LOCAL_VARIABLES => 8,
        _ => 1 << chunk.hdr.p2align,
    }
}

/// Compute the size of an output section from its members. ARM64 code
/// sections go through thunk creation instead, which also assigns member
/// offsets.
fn compute_output_section_size(ctx: &mut Context, chunk_idx: usize) {
    let is_code = {
        let hdr = &ctx.chunks[chunk_idx].hdr;
        hdr.attr & (macho::S_ATTR_SOME_INSTRUCTIONS | macho::S_ATTR_PURE_INSTRUCTIONS) != 0
    };
    if ctx.arg.arch == Arch::Arm64 && is_code {
        crate::thunks::create_range_extension_thunks(ctx, chunk_idx);
        return;
    }

    // A word of padding at the start of __data is reserved for dyld; the
    // __dyld_private sentinel points at it.
    let mut offset: u64 = if chunk_idx == ctx.data { 8 } else { 0 };

    let members = match &ctx.chunks[chunk_idx].kind {
        ChunkKind::Output { members, .. } => members.clone(),
        _ => unreachable!(),
    };
    for r in members {
        let subsec = ctx.subsec(r);
        offset = macho::align_to(offset, 1 << subsec.p2align);
        subsec
            .output_offset
            .store(offset as u32, std::sync::atomic::Ordering::Relaxed);
        offset += subsec.input_size as u64;
    }
    ctx.chunks[chunk_idx].hdr.size = offset;
}

fn compute_chunk_size(ctx: &mut Context, chunk_idx: usize) {
    match &ctx.chunks[chunk_idx].kind {
        ChunkKind::MachHeader => {
            let size = crate::output::load_commands_size(ctx) + ctx.arg.headerpad;
            ctx.chunks[chunk_idx].hdr.size = macho::MachHeader::SIZE as u64 + size;
        }
        ChunkKind::Output { .. } => compute_output_section_size(ctx, chunk_idx),
        ChunkKind::Stubs => {
            ctx.chunks[chunk_idx].hdr.size =
                ctx.stub_syms.len() as u64 * crate::arch::info(ctx.arg.arch).stub_size;
        }
        ChunkKind::StubHelper => {
            let info = crate::arch::info(ctx.arg.arch);
            let n_lazy = crate::fixups::lazy_stub_syms(ctx).len() as u64;
            ctx.chunks[chunk_idx].hdr.size = if n_lazy == 0 {
                0
            } else {
                info.stub_helper_hdr_size + n_lazy * info.stub_helper_size
            };
        }
        ChunkKind::LazySymbolPtr => {
            ctx.chunks[chunk_idx].hdr.size = crate::fixups::lazy_stub_syms(ctx).len() as u64 * 8;
        }
        ChunkKind::Got => {
            ctx.chunks[chunk_idx].hdr.size = ctx.got_syms.len() as u64 * 8;
        }
        ChunkKind::ThreadPtrs => {
            ctx.chunks[chunk_idx].hdr.size = ctx.tlv_syms.len() as u64 * 8;
        }
        ChunkKind::ObjcStubs => {
            ctx.chunks[chunk_idx].hdr.size =
                ctx.objc_methnames.len() as u64 * crate::arch::info(ctx.arg.arch).objc_stub_size;
        }
        ChunkKind::UnwindInfo => crate::unwind::compute_size(ctx, chunk_idx),
        ChunkKind::EhFrame => crate::eh_frame::compute_size(ctx, chunk_idx),
        ChunkKind::Rebase => crate::fixups::compute_rebase_size(ctx, chunk_idx),
        ChunkKind::Bind => crate::fixups::compute_bind_size(ctx, chunk_idx),
        ChunkKind::LazyBind => crate::fixups::compute_lazy_bind_size(ctx, chunk_idx),
        ChunkKind::ChainedFixups => crate::fixups::compute_chained_fixups_size(ctx, chunk_idx),
        ChunkKind::ExportTrie => crate::export_trie::compute_size(ctx, chunk_idx),
        ChunkKind::FunctionStarts => crate::output::compute_function_starts(ctx, chunk_idx),
        ChunkKind::Symtab => crate::output::compute_symtab_size(ctx, chunk_idx),
        ChunkKind::Strtab => {
            // Size was computed together with the symbol table.
        }
        ChunkKind::IndirSymtab => crate::output::compute_indir_symtab_size(ctx, chunk_idx),
        ChunkKind::DataInCode => crate::output::compute_data_in_code(ctx, chunk_idx),
        ChunkKind::CodeSignature => crate::output::compute_code_signature_size(ctx, chunk_idx),
        ChunkKind::ObjcImageInfo => {
            ctx.chunks[chunk_idx].hdr.size = 8;
        }
        ChunkKind::InitOffsets => {
            let n: usize = ctx.objs.iter().map(|f| f.init_functions.len()).sum();
            ctx.chunks[chunk_idx].hdr.size = n as u64 * 4;
        }
        ChunkKind::SectCreate { contents } => {
            let len = contents.len() as u64;
            ctx.chunks[chunk_idx].hdr.size = len;
        }
    }
}

/// Walk the segments in order and assign every chunk its file offset and
/// virtual address. Returns the total file size.
pub fn assign_offsets(ctx: &mut Context) -> u64 {
    let page_size = crate::arch::info(ctx.arg.arch).page_size;
    let mut fileoff: u64 = 0;
    let mut vmaddr: u64 = ctx.arg.pagezero_size;

    for seg_pos in 0..ctx.segments.len() {
        ctx.segments[seg_pos].fileoff = fileoff;
        ctx.segments[seg_pos].vmaddr = vmaddr;
        let is_linkedit = ctx.segments[seg_pos].segname == "__LINKEDIT";

        // The __LINKEDIT blobs (export trie, bind streams, symtab) encode
        // addresses of everything laid out before them, including the
        // linker-defined sentinels; pin those down now.
        if is_linkedit {
            crate::resolve::fix_synthetic_symbols(ctx);
        }

        let chunks = ctx.segments[seg_pos].chunks.clone();
        for &chunk_idx in &chunks {
            let align = chunk_alignment(ctx, &ctx.chunks[chunk_idx], &ctx.segments[seg_pos]);
            let is_bss = ctx.chunks[chunk_idx].is_bss();

            if is_bss {
                vmaddr = macho::align_to(vmaddr, align);
                ctx.chunks[chunk_idx].hdr.addr = vmaddr;
                compute_chunk_size(ctx, chunk_idx);
                vmaddr += ctx.chunks[chunk_idx].hdr.size;
            } else {
                fileoff = macho::align_to(fileoff, align);
                vmaddr = macho::align_to(vmaddr, align);
                ctx.chunks[chunk_idx].hdr.offset = fileoff as u32;
                ctx.chunks[chunk_idx].hdr.addr = vmaddr;
                compute_chunk_size(ctx, chunk_idx);
                let size = ctx.chunks[chunk_idx].hdr.size;
                fileoff += size;
                vmaddr += size;
            }
        }

        let seg = &mut ctx.segments[seg_pos];
        seg.vmsize = macho::align_to(vmaddr - seg.vmaddr, page_size);
        if is_linkedit {
            // __LINKEDIT occupies file space precisely; only its vm
            // reservation is page-aligned.
            seg.filesize = fileoff - seg.fileoff;
        } else {
            seg.filesize = macho::align_to(fileoff - seg.fileoff, page_size);
            fileoff = seg.fileoff + seg.filesize;
        }
        vmaddr = seg.vmaddr + seg.vmsize;
    }

    // TLS offsets are relative to the start of the first thread-local
    // section.
    ctx.tls_begin = ctx
        .chunks
        .iter()
        .filter(|c| {
            c.hdr.type_ == macho::S_THREAD_LOCAL_REGULAR
                || c.hdr.type_ == macho::S_THREAD_LOCAL_ZEROFILL
        })
        .map(|c| c.hdr.addr)
        .min()
        .unwrap_or(0);

    fileoff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_const_remapping() {
        assert_eq!(
            output_section_name("__DATA", "__got"),
            ("__DATA_CONST".to_string(), "__got".to_string())
        );
        assert_eq!(
            output_section_name("__DATA", "__cfstring"),
            ("__DATA_CONST".to_string(), "__cfstring".to_string())
        );
        assert_eq!(
            output_section_name("__TEXT", "__StaticInit"),
            ("__TEXT".to_string(), "__text".to_string())
        );
        assert_eq!(
            output_section_name("__DATA", "__data"),
            ("__DATA".to_string(), "__data".to_string())
        );
    }

    #[test]
    fn segment_ordering() {
        let mut names = vec!["__LINKEDIT", "__MYSEG", "__DATA", "__TEXT", "__DATA_CONST"];
        names.sort_by_key(|n| segment_order(n));
        assert_eq!(
            names,
            vec!["__TEXT", "__DATA_CONST", "__DATA", "__MYSEG", "__LINKEDIT"]
        );
    }
}
