/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! macld is a static linker for Mach-O: it links relocatable objects,
//! static archives and dylib stubs into an executable, bundle or dynamic
//! library for ARM64 and x86-64 Apple platforms.
//!
//! The link is a pipeline over shared state in [context::Context]:
//!
//! 1. read inputs and classify them (`input`)
//! 2. parse objects into sections, subsections and symbols (`object`)
//! 3. resolve symbols and pull archive members (`resolve`)
//! 4. optionally dead-strip unreachable subsections (`dead_strip`)
//! 5. scan relocations for GOT/stub/TLV needs (`scan`)
//! 6. lay out segments and assign addresses (`layout`, `thunks`)
//! 7. apply relocations and write the file (`output`, `arch`, `fixups`)
//!
//! Phases run their per-file and per-section work in parallel; the glue
//! between them is serial.

#[macro_use]
mod log;
mod arch;
mod context;
mod dead_strip;
mod dwarf;
mod dylib;
mod eh_frame;
mod export_trie;
mod fixups;
mod input;
mod layout;
mod macho;
mod object;
mod options;
mod output;
mod resolve;
mod scan;
mod symbol;
mod tbd;
mod thunks;
mod unwind;

use context::Context;
use rayon::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
Usage:
    macld [options] file...

Commonly used options:
    -o <path>             Output file (default: a.out)
    -arch <name>          Target architecture: arm64 or x86_64
    -dylib / -bundle      Produce a dynamic library / bundle
    -e <symbol>           Entry point symbol (default: _main)
    -l<name>              Link against libname (.tbd, .dylib or .a)
    -L<dir>               Add a library search directory
    -dead_strip           Remove unreachable code and data
    -fixup_chains         Emit chained fixups instead of dyld info
    -platform_version <platform> <min> <sdk>
                          Target platform and versions
    --help                Display this help text
";

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--help") {
        println!("{}", USAGE);
        return Ok(());
    }
    if args.iter().any(|arg| arg == "--version" || arg == "-v") {
        println!("macld {}", VERSION);
        return Ok(());
    }

    let opts = options::Options::parse(&args).map_err(|e| {
        eprintln!("{}", USAGE);
        e
    })?;
    if opts.inputs.is_empty() {
        eprintln!("{}", USAGE);
        return Err("No input files".to_string());
    }

    let mut ctx = Context::new(opts);
    link(&mut ctx)
}

fn link(ctx: &mut Context) -> Result<(), String> {
    // P1: map and classify every input.
    input::read_input_files(ctx)?;

    // P2: parse. Objects go first and in parallel; the auto-linking
    // directives they carry can add further libraries. Dylibs are cheap
    // and parsed serially (their re-exports can pull in more files).
    {
        let mut objs = std::mem::take(&mut ctx.objs);
        {
            let ctx_ref: &Context = ctx;
            objs.par_iter_mut().for_each(|file| file.parse_sections(ctx_ref));
        }
        ctx.objs = objs;
    }

    // Auto-linking can append archives whose members still need parsing.
    let parsed_objs = ctx.objs.len();
    input::load_linker_options(ctx);
    if ctx.objs.len() > parsed_objs {
        let mut objs = std::mem::take(&mut ctx.objs);
        {
            let ctx_ref: &Context = ctx;
            objs[parsed_objs..]
                .par_iter_mut()
                .for_each(|file| file.parse_sections(ctx_ref));
        }
        ctx.objs = objs;
    }

    dylib::parse_dylibs(ctx);

    for i in 0..ctx.objs.len() {
        let mut file = std::mem::replace(
            &mut ctx.objs[i],
            object::ObjectFile::new(
                i as u32,
                String::new(),
                String::new(),
                input::FileData::empty(),
                0,
                false,
                false,
            ),
        );
        file.parse_symbols(&mut ctx.symtab);
        ctx.objs[i] = file;
    }

    {
        let mut objs = std::mem::take(&mut ctx.objs);
        {
            let ctx_ref: &Context = ctx;
            objs.par_iter_mut().for_each(|file| {
                file.parse_relocations(ctx_ref);
                file.parse_compact_unwind(ctx_ref);
                eh_frame::parse(ctx_ref, file);
                file.associate_compact_unwind();
                file.parse_mod_init_func(ctx_ref);
                if file.debug_info.is_some() {
                    file.source_name = dwarf::get_source_filename(ctx_ref, file);
                }
            });
        }
        ctx.objs = objs;
    }

    layout::assign_output_sections(ctx);

    // P3: resolution and archive claiming.
    resolve::resolve_symbols(ctx);
    resolve::create_internal_file(ctx);
    resolve::convert_common_symbols(ctx);
    resolve::check_duplicate_symbols(ctx);
    resolve::compute_import_export(ctx);

    if let Some(entry) = ctx.entry_sym {
        if ctx.symtab.syms[entry as usize].def().file.is_none() {
            error!(ctx, "undefined entry point symbol: {}", ctx.arg.entry);
        }
    }
    ctx.checkpoint();

    // P4: dead stripping, if requested.
    if ctx.arg.dead_strip {
        dead_strip::dead_strip(ctx);
    }

    // __eh_frame layout is position-independent within the section and
    // feeds the DWARF-mode unwind encodings, so it happens early.
    eh_frame::assign_offsets(ctx);

    // P5: scan relocations and materialize GOT/stub/TLV entries.
    scan::scan_relocations(ctx);
    output::merge_image_info(ctx);
    ctx.checkpoint();

    // P6: layout.
    layout::register_subsections(ctx);
    layout::sort_output(ctx);
    let filesize = layout::assign_offsets(ctx);
    ctx.checkpoint();

    // P7: emit.
    output::emit(ctx, filesize)?;
    ctx.checkpoint();

    log_dbg!(
        "wrote {} ({} bytes, {} objects, {} dylibs)",
        ctx.arg.output,
        filesize,
        ctx.objs.iter().filter(|f| f.alive()).count(),
        ctx.dylibs.iter().filter(|d| d.alive()).count()
    );
    Ok(())
}
