/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Architecture dispatch.
//!
//! Everything that differs between ARM64 and x86-64 — relocation decoding,
//! scanning effects, relocation application and the synthesized machine
//! code for stubs — lives in the per-architecture submodules; this module
//! holds the parameter table and the dispatchers.

pub mod arm64;
pub mod x86_64;

use crate::context::Context;
use crate::macho::{self, MachSection};
use crate::object::{ObjectFile, Relocation};
use crate::options::Arch;
use crate::symbol::SubsecRef;

pub struct ArchInfo {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub page_size: u64,
    pub abs_rel: u8,
    pub subtractor_rel: u8,
    pub gotpc_rel: u8,
    pub unwind_mode_dwarf: u32,
    pub stub_size: u64,
    pub stub_helper_hdr_size: u64,
    pub stub_helper_size: u64,
    pub objc_stub_size: u64,
}

static ARM64_INFO: ArchInfo = ArchInfo {
    cputype: macho::CPU_TYPE_ARM64,
    cpusubtype: macho::CPU_SUBTYPE_ARM64_ALL,
    page_size: 16384,
    abs_rel: macho::ARM64_RELOC_UNSIGNED,
    subtractor_rel: macho::ARM64_RELOC_SUBTRACTOR,
    gotpc_rel: macho::ARM64_RELOC_POINTER_TO_GOT,
    unwind_mode_dwarf: macho::UNWIND_ARM64_MODE_DWARF,
    stub_size: 12,
    stub_helper_hdr_size: 24,
    stub_helper_size: 12,
    objc_stub_size: 32,
};

static X86_64_INFO: ArchInfo = ArchInfo {
    cputype: macho::CPU_TYPE_X86_64,
    cpusubtype: macho::CPU_SUBTYPE_X86_64_ALL,
    page_size: 4096,
    abs_rel: macho::X86_64_RELOC_UNSIGNED,
    subtractor_rel: macho::X86_64_RELOC_SUBTRACTOR,
    gotpc_rel: macho::X86_64_RELOC_GOT,
    unwind_mode_dwarf: macho::UNWIND_X86_64_MODE_DWARF,
    stub_size: 6,
    stub_helper_hdr_size: 16,
    stub_helper_size: 10,
    objc_stub_size: 16,
};

pub fn info(arch: Arch) -> &'static ArchInfo {
    match arch {
        Arch::Arm64 => &ARM64_INFO,
        Arch::X86_64 => &X86_64_INFO,
    }
}

/// Decode a section's native relocation table into our representation.
pub fn read_relocations(ctx: &Context, file: &ObjectFile, hdr: &MachSection) -> Vec<Relocation> {
    match ctx.arg.arch {
        Arch::Arm64 => arm64::read_relocations(ctx, file, hdr),
        Arch::X86_64 => x86_64::read_relocations(ctx, file, hdr),
    }
}

/// Flag symbols referenced by a subsection's relocations with the entries
/// they will need (GOT, stub, thread pointer), and mark referenced dylibs
/// alive.
pub fn scan_relocations(ctx: &Context, subsec: SubsecRef) {
    match ctx.arg.arch {
        Arch::Arm64 => arm64::scan_relocations(ctx, subsec),
        Arch::X86_64 => x86_64::scan_relocations(ctx, subsec),
    }
}

/// Patch a subsection's relocations into `buf`, the output bytes of that
/// subsection.
pub fn apply_reloc(ctx: &Context, subsec: SubsecRef, buf: &mut [u8]) {
    match ctx.arg.arch {
        Arch::Arm64 => arm64::apply_reloc(ctx, subsec, buf),
        Arch::X86_64 => x86_64::apply_reloc(ctx, subsec, buf),
    }
}

pub fn write_stubs(ctx: &Context, buf: &mut [u8]) {
    match ctx.arg.arch {
        Arch::Arm64 => arm64::write_stubs(ctx, buf),
        Arch::X86_64 => x86_64::write_stubs(ctx, buf),
    }
}

pub fn write_stub_helper(ctx: &Context, buf: &mut [u8]) {
    match ctx.arg.arch {
        Arch::Arm64 => arm64::write_stub_helper(ctx, buf),
        Arch::X86_64 => x86_64::write_stub_helper(ctx, buf),
    }
}

pub fn write_objc_stubs(ctx: &Context, buf: &mut [u8]) {
    match ctx.arg.arch {
        Arch::Arm64 => arm64::write_objc_stubs(ctx, buf),
        Arch::X86_64 => x86_64::write_objc_stubs(ctx, buf),
    }
}
