/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Dynamic library inputs: real dylibs, and text stubs (.tbd) standing in
//! for them.
//!
//! A dylib contributes nothing to the output but its exported names; they
//! participate in symbol resolution so that references to them become
//! dyld imports. Re-exported libraries are squashed into the umbrella:
//! their exports are read and merged as if the umbrella defined them.

use crate::context::Context;
use crate::input::{FileData, FileType};
use crate::macho::{self, read_uleb};
use crate::object::SymtabCounts;
use crate::options::LoadModifiers;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

pub struct DylibFile {
    pub file_idx: u32,
    pub name: String,
    pub data: FileData,
    pub priority: u32,
    pub is_alive: AtomicBool,
    pub is_weak: bool,
    pub is_reexported: bool,
    pub install_name: String,
    /// 1-based load-command ordinal, assigned once the set of live dylibs
    /// is final.
    pub dylib_idx: i32,
    /// Exported name -> EXPORT_SYMBOL_FLAGS_* bits. Ordered so that symbol
    /// resolution is deterministic.
    pub exports: BTreeMap<String, u32>,
    /// Interned global symbols, parallel to `exports` iteration order.
    pub syms: Vec<u32>,
    pub reexported_libs: Vec<String>,
    pub rpaths: Vec<String>,
    pub symtab: SymtabCounts,
}

impl DylibFile {
    pub fn new(
        file_idx: u32,
        name: String,
        data: FileData,
        priority: u32,
        alive: bool,
        mods: LoadModifiers,
    ) -> DylibFile {
        DylibFile {
            file_idx,
            name,
            data,
            priority,
            is_alive: AtomicBool::new(alive),
            is_weak: mods.weak,
            is_reexported: mods.reexport,
            install_name: String::new(),
            dylib_idx: 0,
            exports: BTreeMap::new(),
            syms: Vec::new(),
            reexported_libs: Vec::new(),
            rpaths: Vec::new(),
            symtab: SymtabCounts::default(),
        }
    }

    pub fn alive(&self) -> bool {
        self.is_alive.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Merge one export. A TLS/non-TLS mismatch between two providers of
    /// the same name is a real error; a strong definition beats a weak
    /// one.
    fn add_export(&mut self, ctx: &Context, name: &str, flags: u32) {
        let tls_kind = |f: u32| {
            f & macho::EXPORT_SYMBOL_FLAGS_KIND_MASK == macho::EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL
        };
        match self.exports.get_mut(name) {
            None => {
                self.exports.insert(name.to_string(), flags);
            }
            Some(existing) => {
                if tls_kind(*existing) != tls_kind(flags) {
                    error!(ctx, "{}: inconsistent TLS type: {}", self.name, name);
                }
                if *existing & macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0
                    && flags & macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION == 0
                {
                    *existing = flags;
                }
            }
        }
    }

    pub fn parse(&mut self, ctx: &mut Context) {
        let data = self.data.clone();
        match crate::input::get_file_type(data.bytes()) {
            FileType::Tapi => {
                let tbd = crate::tbd::parse(ctx, &self.name, data.bytes());
                self.install_name = tbd.install_name;
                self.reexported_libs = tbd.reexported_libs;
                for name in tbd.exports {
                    self.add_export(ctx, &name, 0);
                }
                for name in tbd.weak_exports {
                    self.add_export(ctx, &name, macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION);
                }
            }
            FileType::MachDylib => self.parse_dylib(ctx, data.bytes()),
            FileType::MachExe => {
                self.parse_dylib(ctx, data.bytes());
                self.dylib_idx = macho::BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE as i32;
            }
            _ => {
                fatal!(ctx, "{}: is not a dylib", self.name);
            }
        }

        // Squash re-exported libraries into this one: their exports become
        // ours. The worklist keeps nesting (libSystem re-exports a dozen
        // sublibraries, which re-export more).
        let mut worklist: Vec<String> = std::mem::take(&mut self.reexported_libs);
        let mut seen: Vec<String> = Vec::new();
        while let Some(path) = worklist.pop() {
            if seen.contains(&path) {
                continue;
            }
            seen.push(path.clone());

            let Some(file) = find_external_lib(ctx, self, &path) else {
                fatal!(
                    ctx,
                    "{}: cannot open reexported library {}",
                    self.install_name,
                    path
                );
            };
            let (exports, weak_exports, nested) = read_reexport(ctx, &path, &file);
            for name in exports {
                self.add_export(ctx, &name, 0);
            }
            for name in weak_exports {
                self.add_export(ctx, &name, macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION);
            }
            worklist.extend(nested);
        }

        // Initialize syms.
        let names: Vec<String> = self.exports.keys().cloned().collect();
        for name in names {
            self.syms.push(ctx.symtab.intern(&name));
        }
    }

    fn parse_dylib(&mut self, ctx: &Context, data: &[u8]) {
        let hdr = macho::MachHeader::parse(data).unwrap();

        if ctx.arg.application_extension && hdr.flags & macho::MH_APP_EXTENSION_SAFE == 0 {
            log!(
                "Warning: linking against a dylib which is not safe for use in application extensions: {}",
                self.name
            );
        }

        let Some(cmds) = macho::load_commands(data) else {
            fatal!(ctx, "{}: truncated load commands", self.name);
        };

        let mut trie: Option<(u32, u32)> = None;
        for lc in &cmds {
            let body = &data[lc.offset..];
            match lc.cmd {
                macho::LC_ID_DYLIB => {
                    let nameoff = read_u32(body, 8) as usize;
                    self.install_name = read_cstr(&body[nameoff..]);
                }
                macho::LC_DYLD_INFO | macho::LC_DYLD_INFO_ONLY => {
                    let export_off = read_u32(body, 40);
                    let export_size = read_u32(body, 44);
                    if export_off != 0 && export_size != 0 {
                        trie = Some((export_off, export_size));
                    }
                }
                macho::LC_DYLD_EXPORTS_TRIE => {
                    trie = Some((read_u32(body, 8), read_u32(body, 12)));
                }
                macho::LC_REEXPORT_DYLIB => {
                    if hdr.flags & macho::MH_NO_REEXPORTED_DYLIBS == 0 {
                        let nameoff = read_u32(body, 8) as usize;
                        self.reexported_libs.push(read_cstr(&body[nameoff..]));
                    }
                }
                macho::LC_RPATH => {
                    let pathoff = read_u32(body, 8) as usize;
                    let rpath = read_cstr(&body[pathoff..]);
                    let rpath = if let Some(rest) = rpath.strip_prefix("@loader_path/") {
                        format!("{}/../{}", self.name, rest)
                    } else {
                        rpath
                    };
                    self.rpaths.push(rpath);
                }
                _ => {}
            }
        }

        if let Some((off, size)) = trie {
            let trie_data = &data[off as usize..(off + size) as usize];
            let mut exports = Vec::new();
            read_trie(ctx, &self.name, trie_data, 0, String::new(), &mut exports);
            for (name, flags) in exports {
                self.add_export(ctx, &name, flags);
            }
        }
    }
}

/// Walk a serialized export trie, collecting `(name, flags)` pairs.
pub fn read_trie(
    ctx: &Context,
    filename: &str,
    data: &[u8],
    offset: usize,
    prefix: String,
    out: &mut Vec<(String, u32)>,
) {
    let mut pos = offset;
    if pos >= data.len() {
        fatal!(ctx, "{}: malformed export trie", filename);
    }

    if data[pos] != 0 {
        let _size = read_uleb(data, &mut pos);
        let flags = read_uleb(data, &mut pos) as u32;

        if flags & macho::EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            read_uleb(data, &mut pos); // library ordinal
            let imported_name = read_cstr(&data[pos..]);
            pos += imported_name.len() + 1;
            let name = if imported_name.is_empty() {
                prefix.clone()
            } else {
                imported_name
            };
            out.push((name, flags));
        } else if flags & macho::EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
            read_uleb(data, &mut pos); // stub offset
            read_uleb(data, &mut pos); // resolver offset
            out.push((prefix.clone(), flags));
        } else {
            read_uleb(data, &mut pos); // address
            out.push((prefix.clone(), flags));
        }
    } else {
        pos += 1;
    }

    let nchild = data[pos];
    pos += 1;

    for _ in 0..nchild {
        let suffix = read_cstr(&data[pos..]);
        pos += suffix.len() + 1;
        let child_off = read_uleb(data, &mut pos) as usize;
        if child_off == offset {
            fatal!(ctx, "{}: malformed export trie", filename);
        }
        read_trie(ctx, filename, data, child_off, format!("{}{}", prefix, suffix), out);
    }
}

/// Read the export set of a re-exported library without creating a file
/// record for it. Returns `(exports, weak exports, nested re-exports)`.
fn read_reexport(
    ctx: &Context,
    path: &str,
    data: &FileData,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    match crate::input::get_file_type(data.bytes()) {
        FileType::Tapi => {
            let tbd = crate::tbd::parse(ctx, path, data.bytes());
            (
                tbd.exports,
                tbd.weak_exports,
                tbd.reexported_libs,
            )
        }
        FileType::MachDylib => {
            let bytes = data.bytes();
            let hdr = macho::MachHeader::parse(bytes).unwrap();
            let Some(cmds) = macho::load_commands(bytes) else {
                fatal!(ctx, "{}: truncated load commands", path);
            };
            let mut exports = Vec::new();
            let mut nested = Vec::new();
            for lc in &cmds {
                let body = &bytes[lc.offset..];
                match lc.cmd {
                    macho::LC_DYLD_INFO | macho::LC_DYLD_INFO_ONLY => {
                        let off = read_u32(body, 40);
                        let size = read_u32(body, 44);
                        if off != 0 && size != 0 {
                            let trie = &bytes[off as usize..(off + size) as usize];
                            let mut pairs = Vec::new();
                            read_trie(ctx, path, trie, 0, String::new(), &mut pairs);
                            exports.extend(pairs);
                        }
                    }
                    macho::LC_DYLD_EXPORTS_TRIE => {
                        let off = read_u32(body, 8);
                        let size = read_u32(body, 12);
                        let trie = &bytes[off as usize..(off + size) as usize];
                        let mut pairs = Vec::new();
                        read_trie(ctx, path, trie, 0, String::new(), &mut pairs);
                        exports.extend(pairs);
                    }
                    macho::LC_REEXPORT_DYLIB => {
                        if hdr.flags & macho::MH_NO_REEXPORTED_DYLIBS == 0 {
                            let nameoff = read_u32(body, 8) as usize;
                            nested.push(read_cstr(&body[nameoff..]));
                        }
                    }
                    _ => {}
                }
            }
            let weak = exports
                .iter()
                .filter(|(_, f)| f & macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0)
                .map(|(n, _)| n.clone())
                .collect();
            let strong = exports
                .iter()
                .filter(|(_, f)| f & macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION == 0)
                .map(|(n, _)| n.clone())
                .collect();
            (strong, weak, nested)
        }
        _ => {
            fatal!(ctx, "{}: reexported library is not a dylib", path);
        }
    }
}

/// Resolve an install name of a re-exported library to a file, probing
/// `-syslibroot` directories and preferring `.tbd` stubs over binaries.
fn find_external_lib(ctx: &Context, loader: &DylibFile, path: &str) -> Option<FileData> {
    let try_open = |path: &Path| -> Option<FileData> {
        if path.is_file() {
            FileData::open(path).ok()
        } else {
            None
        }
    };

    let find = |path: &str| -> Option<FileData> {
        if !path.starts_with('/') {
            return try_open(Path::new(path));
        }
        for root in &ctx.arg.syslibroot {
            let rooted = format!("{}{}", root, path);
            if let Some(stem) = rooted.strip_suffix(".dylib") {
                if let Some(file) = try_open(Path::new(&format!("{}.tbd", stem))) {
                    return Some(file);
                }
            }
            if let Some(file) = try_open(Path::new(&rooted)) {
                return Some(file);
            }
            if !rooted.ends_with(".tbd") && !rooted.ends_with(".dylib") {
                if let Some(file) = try_open(Path::new(&format!("{}.tbd", rooted))) {
                    return Some(file);
                }
                if let Some(file) = try_open(Path::new(&format!("{}.dylib", rooted))) {
                    return Some(file);
                }
            }
        }
        if ctx.arg.syslibroot.is_empty() {
            return try_open(Path::new(path));
        }
        None
    };

    if let Some(rest) = path.strip_prefix("@loader_path/") {
        let base = PathBuf::from(&loader.name);
        let joined = base.parent().unwrap_or(Path::new(".")).join(rest);
        return try_open(&joined);
    }
    if let Some(rest) = path.strip_prefix("@rpath/") {
        for rpath in &loader.rpaths {
            if let Some(file) = find(&format!("{}/{}", rpath, rest)) {
                return Some(file);
            }
        }
        return None;
    }
    find(path)
}

/// Parse every dylib named on the command line. Runs serially; the export
/// tries are tiny compared to object files.
pub fn parse_dylibs(ctx: &mut Context) {
    for i in 0..ctx.dylibs.len() {
        let mut dylib = std::mem::replace(
            &mut ctx.dylibs[i],
            DylibFile::new(
                i as u32,
                String::new(),
                FileData::empty(),
                0,
                false,
                LoadModifiers::default(),
            ),
        );
        dylib.parse(ctx);
        ctx.dylibs[i] = dylib;
    }

    // Assign dyld ordinals to the dylibs in load order. Dead dylibs are
    // skipped later, but ordinals are final only once liveness is; this
    // runs again after scanning.
    assign_dylib_ordinals(ctx);
}

pub fn assign_dylib_ordinals(ctx: &mut Context) {
    let mut ordinal = 1;
    for dylib in &mut ctx.dylibs {
        if dylib.dylib_idx == macho::BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE as i32 {
            continue;
        }
        if dylib.alive() {
            dylib.dylib_idx = ordinal;
            ordinal += 1;
        }
    }
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn read_cstr(data: &[u8]) -> String {
    let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..len]).into_owned()
}
