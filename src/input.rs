/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Input file reading: memory-mapping, classification and archives.
//!
//! Every input is mapped exactly once. Fat-file slices and archive members
//! share their container's mapping and address it by `(offset, length)`, so
//! nothing is copied on the way in.

use crate::context::Context;
use crate::macho::{self, MachHeader};
use crate::options::{Arch, InputSpec, LoadModifiers};
use byteorder::{BigEndian, ByteOrder};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// A view into a mapped input file. Archive members and fat slices borrow
/// a sub-range of their container's mapping.
#[derive(Clone)]
pub struct FileData {
    mmap: Option<Arc<Mmap>>,
    off: usize,
    len: usize,
}

impl FileData {
    pub fn empty() -> FileData {
        FileData {
            mmap: None,
            off: 0,
            len: 0,
        }
    }

    pub fn open(path: &Path) -> Result<FileData, String> {
        let file =
            File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
        // Safety: the mapping is read-only and macld never writes to input
        // files while a link is running.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| format!("cannot mmap {}: {}", path.display(), e))?;
        let len = mmap.len();
        Ok(FileData {
            mmap: Some(Arc::new(mmap)),
            off: 0,
            len,
        })
    }

    pub fn slice(&self, off: usize, len: usize) -> FileData {
        assert!(off + len <= self.len);
        FileData {
            mmap: self.mmap.clone(),
            off: self.off + off,
            len,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.mmap {
            Some(mmap) => &mmap[self.off..self.off + self.len],
            None => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    MachObj,
    MachExe,
    MachDylib,
    Archive,
    Tapi,
    LlvmBitcode,
    Fat,
    Unknown,
}

pub fn get_file_type(data: &[u8]) -> FileType {
    if data.starts_with(macho::AR_MAGIC) {
        return FileType::Archive;
    }
    if data.starts_with(macho::BITCODE_MAGIC) {
        return FileType::LlvmBitcode;
    }
    if data.len() >= 8 && BigEndian::read_u32(data) == macho::FAT_MAGIC {
        return FileType::Fat;
    }
    if let Some(hdr) = MachHeader::parse(data) {
        if hdr.magic == macho::MH_MAGIC_64 {
            return match hdr.filetype {
                macho::MH_OBJECT => FileType::MachObj,
                macho::MH_EXECUTE => FileType::MachExe,
                macho::MH_DYLIB | macho::MH_DYLIB_STUB => FileType::MachDylib,
                macho::MH_BUNDLE => FileType::MachDylib,
                _ => FileType::Unknown,
            };
        }
    }
    if is_tapi_file(data) {
        return FileType::Tapi;
    }
    FileType::Unknown
}

// The "magic" of a TBD file is its YAML document marker.
fn is_tapi_file(data: &[u8]) -> bool {
    let head = &data[..data.len().min(64)];
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };
    text.starts_with("---")
}

/// Select the slice matching our architecture from a fat file.
pub fn select_fat_slice(ctx: &Context, name: &str, data: &FileData) -> FileData {
    let cputype = match ctx.arg.arch {
        Arch::Arm64 => macho::CPU_TYPE_ARM64,
        Arch::X86_64 => macho::CPU_TYPE_X86_64,
    };
    let Some(archs) = macho::fat_archs(data.bytes()) else {
        fatal!(ctx, "{}: malformed fat header", name);
    };
    for arch in archs {
        if arch.cputype == cputype {
            return data.slice(arch.offset as usize, arch.size as usize);
        }
    }
    fatal!(ctx, "{}: fat file does not contain a matching architecture", name);
}

/// One member of a static archive.
pub struct ArchiveMember {
    pub name: String,
    pub data: FileData,
}

/// Walk a `!<arch>\n` archive. Handles the BSD `#1/N` long-name convention
/// used by Apple toolchains and skips ranlib symbol-table members.
pub fn read_archive_members(ctx: &Context, name: &str, data: &FileData) -> Vec<ArchiveMember> {
    let bytes = data.bytes();
    let mut members = Vec::new();
    let mut pos = macho::AR_MAGIC.len();

    while pos + 60 <= bytes.len() {
        let hdr = &bytes[pos..pos + 60];
        if &hdr[58..60] != b"`\n" {
            fatal!(ctx, "{}: malformed archive member header at offset {}", name, pos);
        }

        let parse_field = |field: &[u8]| -> u64 {
            let s = std::str::from_utf8(field).unwrap_or("").trim();
            s.parse().unwrap_or(0)
        };

        let mut size = parse_field(&hdr[48..58]) as usize;
        let raw_name = std::str::from_utf8(&hdr[0..16]).unwrap_or("").trim_end();
        pos += 60;

        let member_name;
        let mut body_off = pos;
        if let Some(len) = raw_name.strip_prefix("#1/") {
            // BSD convention: the name is stored at the beginning of the
            // member body and its length is counted in `size`.
            let name_len: usize = len.trim().parse().unwrap_or(0);
            if pos + name_len > bytes.len() || name_len > size {
                fatal!(ctx, "{}: malformed archive long name at offset {}", name, pos);
            }
            let long = &bytes[pos..pos + name_len];
            let end = long.iter().position(|&b| b == 0).unwrap_or(name_len);
            member_name = String::from_utf8_lossy(&long[..end]).into_owned();
            body_off += name_len;
            size -= name_len;
        } else {
            member_name = raw_name.trim_end_matches('/').to_string();
        }

        if body_off + size > bytes.len() {
            fatal!(ctx, "{}: archive member {} is truncated", name, member_name);
        }

        if !member_name.starts_with("__.SYMDEF") {
            members.push(ArchiveMember {
                name: member_name,
                data: data.slice(body_off, size),
            });
        }

        pos = body_off + size;
        pos = (pos + 1) & !1; // members are 2-byte aligned
    }

    members
}

/// Search `-L` directories for `-lfoo`, preferring text stubs the way ld64
/// does: libfoo.tbd, then libfoo.dylib, then libfoo.a.
pub fn find_library(ctx: &Context, name: &str) -> Option<std::path::PathBuf> {
    for dir in &ctx.arg.library_paths {
        for ext in ["tbd", "dylib", "a"] {
            let path = Path::new(dir).join(format!("lib{}.{}", name, ext));
            if path.is_file() {
                return Some(path);
            }
        }
    }
    None
}

/// P1: open every command-line input, classify it, and create file records.
/// Archives are opened but their members start dead; the resolver claims
/// them by unresolved reference later.
pub fn read_input_files(ctx: &mut Context) -> Result<(), String> {
    let inputs = ctx.arg.inputs.clone();
    for spec in &inputs {
        match spec {
            InputSpec::File(path, mods) => {
                let data = FileData::open(Path::new(path))?;
                read_file(ctx, path, data, *mods);
            }
            InputSpec::Library(name, mods) => {
                let path = find_library(ctx, name)
                    .ok_or_else(|| format!("library not found: -l{}", name))?;
                let data = FileData::open(&path)?;
                read_file(ctx, &path.display().to_string(), data, *mods);
            }
        }
    }
    Ok(())
}

/// Load the libraries requested by LC_LINKER_OPTION auto-linking
/// directives. They are implicit: a dylib pulled in this way is dropped
/// again unless something actually references it.
pub fn load_linker_options(ctx: &mut Context) {
    let mut opts: Vec<String> = Vec::new();
    for file in &ctx.objs {
        opts.extend(file.linker_options.iter().cloned());
    }

    let mut loaded: rustc_hash::FxHashSet<String> = ctx
        .dylibs
        .iter()
        .map(|d| d.name.clone())
        .chain(ctx.objs.iter().map(|f| f.archive_name.clone()))
        .collect();

    let mut i = 0;
    while i < opts.len() {
        let opt = opts[i].clone();
        i += 1;

        let path = if let Some(name) = opt.strip_prefix("-l") {
            find_library(ctx, name)
        } else if opt == "-framework" {
            if i == opts.len() {
                continue;
            }
            let name = opts[i].clone();
            i += 1;
            find_framework(ctx, &name)
        } else {
            log_dbg!("ignoring linker option {:?}", opt);
            continue;
        };

        let Some(path) = path else {
            log!("Warning: auto-linked library not found: {}", opt);
            continue;
        };
        let path_str = path.display().to_string();
        if !loaded.insert(path_str.clone()) {
            continue;
        }

        let Ok(data) = FileData::open(&path) else {
            log!("Warning: cannot open auto-linked library: {}", path_str);
            continue;
        };
        let num_dylibs = ctx.dylibs.len();
        read_file(ctx, &path_str, data, LoadModifiers::default());

        // Implicitly loaded dylibs start dead regardless of
        // -dead_strip_dylibs.
        for dylib in &ctx.dylibs[num_dylibs..] {
            dylib
                .is_alive
                .store(false, std::sync::atomic::Ordering::Release);
        }
    }
}

fn find_framework(ctx: &Context, name: &str) -> Option<std::path::PathBuf> {
    for dir in &ctx.arg.framework_paths {
        let base = Path::new(dir).join(format!("{}.framework", name));
        for candidate in [base.join(format!("{}.tbd", name)), base.join(name)] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

pub fn read_file(ctx: &mut Context, name: &str, data: FileData, mods: LoadModifiers) {
    match get_file_type(data.bytes()) {
        FileType::Fat => {
            let slice = select_fat_slice(ctx, name, &data);
            read_file(ctx, name, slice, mods);
        }
        FileType::MachObj => {
            // Objects named directly on the command line are always loaded.
            ctx.add_object(name.to_string(), String::new(), data, true, mods.hidden);
        }
        FileType::Archive => {
            for member in read_archive_members(ctx, name, &data) {
                match get_file_type(member.data.bytes()) {
                    FileType::MachObj => {
                        let alive = ctx.arg.all_load || mods.force_load;
                        ctx.add_object(member.name, name.to_string(), member.data, alive, mods.hidden);
                    }
                    FileType::Fat => {
                        let slice = select_fat_slice(ctx, &member.name, &member.data);
                        let alive = ctx.arg.all_load || mods.force_load;
                        ctx.add_object(member.name, name.to_string(), slice, alive, mods.hidden);
                    }
                    FileType::LlvmBitcode => {
                        fatal!(
                            ctx,
                            "{}({}): LLVM bitcode members need an LTO compiler, which macld does not provide",
                            name,
                            member.name
                        );
                    }
                    _ => {
                        // Archives routinely contain non-object members
                        // (e.g. empty placeholder files); skip them.
                        log_dbg!("{}({}): skipping non-object member", name, member.name);
                    }
                }
            }
        }
        FileType::MachDylib | FileType::MachExe | FileType::Tapi => {
            ctx.add_dylib(name.to_string(), data, mods);
        }
        FileType::LlvmBitcode => {
            fatal!(
                ctx,
                "{}: LLVM bitcode input needs an LTO compiler, which macld does not provide",
                name
            );
        }
        FileType::Unknown => {
            fatal!(ctx, "{}: unknown file type", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_magic() {
        use byteorder::LittleEndian;

        assert_eq!(get_file_type(b"!<arch>\nrest"), FileType::Archive);
        assert_eq!(get_file_type(b"BC\xc0\xderest"), FileType::LlvmBitcode);
        assert_eq!(get_file_type(b"--- !tapi-tbd\n"), FileType::Tapi);
        assert_eq!(get_file_type(b"garbage"), FileType::Unknown);

        let mut obj = vec![0u8; 32];
        LittleEndian::write_u32(&mut obj[0..], macho::MH_MAGIC_64);
        LittleEndian::write_u32(&mut obj[12..], macho::MH_OBJECT);
        assert_eq!(get_file_type(&obj), FileType::MachObj);

        let mut fat = vec![0u8; 8];
        BigEndian::write_u32(&mut fat[0..], macho::FAT_MAGIC);
        assert_eq!(get_file_type(&fat), FileType::Fat);
    }
}
