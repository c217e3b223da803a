/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Mach-O wire format: constants, on-disk structures and codecs.
//!
//! Everything the linker reads or writes on disk goes through this module.
//! All integer fields are little-endian in Mach-O streams; fat headers and
//! the code-signature blob are big-endian.
//!
//! Useful resources:
//! - `mach-o/loader.h`, `mach-o/reloc.h`, `mach-o/nlist.h` and
//!   `mach-o/compact_unwind_encoding.h` in the macOS SDK.
//! - Apple's dyld sources for the chained-fixups structures
//!   (`mach-o/fixup-chains.h`).

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const AR_MAGIC: &[u8] = b"!<arch>\n";
pub const BITCODE_MAGIC: &[u8] = b"BC\xc0\xde";

pub const MH_OBJECT: u32 = 0x1;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_BUNDLE: u32 = 0x8;
pub const MH_DYLIB_STUB: u32 = 0x9;

pub const MH_NOUNDEFS: u32 = 0x1;
pub const MH_DYLDLINK: u32 = 0x4;
pub const MH_TWOLEVEL: u32 = 0x80;
pub const MH_SUBSECTIONS_VIA_SYMBOLS: u32 = 0x2000;
pub const MH_NO_REEXPORTED_DYLIBS: u32 = 0x100000;
pub const MH_PIE: u32 = 0x200000;
pub const MH_DEAD_STRIPPABLE_DYLIB: u32 = 0x400000;
pub const MH_HAS_TLV_DESCRIPTORS: u32 = 0x800000;
pub const MH_APP_EXTENSION_SAFE: u32 = 0x02000000;

pub const VM_PROT_READ: u32 = 0x1;
pub const VM_PROT_WRITE: u32 = 0x2;
pub const VM_PROT_EXECUTE: u32 = 0x4;

pub const LC_REQ_DYLD: u32 = 0x80000000;

pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_DYLINKER: u32 = 0xe;
pub const LC_SUB_FRAMEWORK: u32 = 0x12;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_SOURCE_VERSION: u32 = 0x2a;
pub const LC_LINKER_OPTION: u32 = 0x2d;
pub const LC_BUILD_VERSION: u32 = 0x32;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

pub const SG_READ_ONLY: u32 = 0x10;

pub const S_REGULAR: u8 = 0x0;
pub const S_ZEROFILL: u8 = 0x1;
pub const S_CSTRING_LITERALS: u8 = 0x2;
pub const S_4BYTE_LITERALS: u8 = 0x3;
pub const S_8BYTE_LITERALS: u8 = 0x4;
pub const S_LITERAL_POINTERS: u8 = 0x5;
pub const S_NON_LAZY_SYMBOL_POINTERS: u8 = 0x6;
pub const S_LAZY_SYMBOL_POINTERS: u8 = 0x7;
pub const S_SYMBOL_STUBS: u8 = 0x8;
pub const S_MOD_INIT_FUNC_POINTERS: u8 = 0x9;
pub const S_MOD_TERM_FUNC_POINTERS: u8 = 0xa;
pub const S_16BYTE_LITERALS: u8 = 0xe;
pub const S_THREAD_LOCAL_REGULAR: u8 = 0x11;
pub const S_THREAD_LOCAL_ZEROFILL: u8 = 0x12;
pub const S_THREAD_LOCAL_VARIABLES: u8 = 0x13;
pub const S_THREAD_LOCAL_VARIABLE_POINTERS: u8 = 0x14;
pub const S_INIT_FUNC_OFFSETS: u8 = 0x16;

pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x4;
pub const S_ATTR_DEBUG: u32 = 0x20000;
pub const S_ATTR_LIVE_SUPPORT: u32 = 0x80000;
pub const S_ATTR_NO_DEAD_STRIP: u32 = 0x100000;
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x800000;

pub const CPU_TYPE_X86_64: u32 = 0x1000007;
pub const CPU_TYPE_ARM64: u32 = 0x100000c;
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;

pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x80000000;
pub const INDIRECT_SYMBOL_ABS: u32 = 0x40000000;

pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_OPCODE_DONE: u8 = 0x00;
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;

pub const BIND_TYPE_POINTER: u8 = 1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i64 = -3;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i64 = -1;
pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 1;
pub const BIND_IMMEDIATE_MASK: u8 = 0x0f;
pub const BIND_OPCODE_DONE: u8 = 0x00;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;

pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u32 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u32 = 0x01;
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u32 = 0x04;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u32 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u32 = 0x10;

pub const N_UNDF: u8 = 0;
pub const N_ABS: u8 = 1;
pub const N_SECT: u8 = 7;

pub const N_SO: u8 = 0x64;
pub const N_OSO: u8 = 0x66;
pub const N_FUN: u8 = 0x24;
pub const N_STSYM: u8 = 0x26;
pub const N_GSYM: u8 = 0x20;

pub const N_NO_DEAD_STRIP: u16 = 0x0020;
pub const N_WEAK_REF: u16 = 0x0040;
pub const N_WEAK_DEF: u16 = 0x0080;
pub const N_ALT_ENTRY: u16 = 0x0200;

pub const PLATFORM_MACOS: u32 = 1;

pub const TOOL_LD: u32 = 3;

pub const OBJC_IMAGE_HAS_CATEGORY_CLASS_PROPERTIES: u8 = 1 << 6;

pub const ARM64_RELOC_UNSIGNED: u8 = 0;
pub const ARM64_RELOC_SUBTRACTOR: u8 = 1;
pub const ARM64_RELOC_BRANCH26: u8 = 2;
pub const ARM64_RELOC_PAGE21: u8 = 3;
pub const ARM64_RELOC_PAGEOFF12: u8 = 4;
pub const ARM64_RELOC_GOT_LOAD_PAGE21: u8 = 5;
pub const ARM64_RELOC_GOT_LOAD_PAGEOFF12: u8 = 6;
pub const ARM64_RELOC_POINTER_TO_GOT: u8 = 7;
pub const ARM64_RELOC_TLVP_LOAD_PAGE21: u8 = 8;
pub const ARM64_RELOC_TLVP_LOAD_PAGEOFF12: u8 = 9;
pub const ARM64_RELOC_ADDEND: u8 = 10;

pub const X86_64_RELOC_UNSIGNED: u8 = 0;
pub const X86_64_RELOC_SIGNED: u8 = 1;
pub const X86_64_RELOC_BRANCH: u8 = 2;
pub const X86_64_RELOC_GOT_LOAD: u8 = 3;
pub const X86_64_RELOC_GOT: u8 = 4;
pub const X86_64_RELOC_SUBTRACTOR: u8 = 5;
pub const X86_64_RELOC_SIGNED_1: u8 = 6;
pub const X86_64_RELOC_SIGNED_2: u8 = 7;
pub const X86_64_RELOC_SIGNED_4: u8 = 8;
pub const X86_64_RELOC_TLV: u8 = 9;

// __TEXT,__unwind_info

pub const UNWIND_SECTION_VERSION: u32 = 1;
pub const UNWIND_SECOND_LEVEL_COMPRESSED: u32 = 3;
pub const UNWIND_PERSONALITY_MASK: u32 = 0x30000000;
pub const UNWIND_MODE_MASK: u32 = 0x0f000000;
pub const UNWIND_ARM64_MODE_DWARF: u32 = 0x03000000;
pub const UNWIND_X86_64_MODE_STACK_IND: u32 = 0x03000000;
pub const UNWIND_X86_64_MODE_DWARF: u32 = 0x04000000;

// __LINKEDIT,__chainfixups

pub const DYLD_CHAINED_PTR_64: u16 = 2;
pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xffff;
pub const DYLD_CHAINED_IMPORT: u32 = 1;
pub const DYLD_CHAINED_IMPORT_ADDEND: u32 = 2;
pub const DYLD_CHAINED_IMPORT_ADDEND64: u32 = 3;

// __LINKEDIT,__code_signature

pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
pub const CSSLOT_CODEDIRECTORY: u32 = 0;
pub const CS_SUPPORTSEXECSEG: u32 = 0x20400;
pub const CS_ADHOC: u32 = 0x00000002;
pub const CS_LINKER_SIGNED: u32 = 0x00020000;
pub const CS_EXECSEG_MAIN_BINARY: u64 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;
pub const SHA256_SIZE: usize = 32;

/// `mach_header_64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachHeader {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

impl MachHeader {
    pub const SIZE: usize = 32;

    pub fn parse(data: &[u8]) -> Option<MachHeader> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(MachHeader {
            magic: LittleEndian::read_u32(&data[0..]),
            cputype: LittleEndian::read_u32(&data[4..]),
            cpusubtype: LittleEndian::read_u32(&data[8..]),
            filetype: LittleEndian::read_u32(&data[12..]),
            ncmds: LittleEndian::read_u32(&data[16..]),
            sizeofcmds: LittleEndian::read_u32(&data[20..]),
            flags: LittleEndian::read_u32(&data[24..]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..], self.magic);
        LittleEndian::write_u32(&mut buf[4..], self.cputype);
        LittleEndian::write_u32(&mut buf[8..], self.cpusubtype);
        LittleEndian::write_u32(&mut buf[12..], self.filetype);
        LittleEndian::write_u32(&mut buf[16..], self.ncmds);
        LittleEndian::write_u32(&mut buf[20..], self.sizeofcmds);
        LittleEndian::write_u32(&mut buf[24..], self.flags);
        LittleEndian::write_u32(&mut buf[28..], 0); // reserved
    }
}

/// The `(cmd, cmdsize)` prefix every load command starts with.
#[derive(Debug, Clone, Copy)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// Offset of this command within the file.
    pub offset: usize,
}

/// Iterate the load commands of a Mach-O image. Returns `None` on a
/// truncated command list so the caller can report the file.
pub fn load_commands(data: &[u8]) -> Option<Vec<LoadCommand>> {
    let hdr = MachHeader::parse(data)?;
    let mut vec = Vec::with_capacity(hdr.ncmds as usize);
    let mut off = MachHeader::SIZE;
    for _ in 0..hdr.ncmds {
        if data.len() < off + 8 {
            return None;
        }
        let cmd = LittleEndian::read_u32(&data[off..]);
        let cmdsize = LittleEndian::read_u32(&data[off + 4..]);
        if cmdsize < 8 || data.len() < off + cmdsize as usize {
            return None;
        }
        vec.push(LoadCommand {
            cmd,
            cmdsize,
            offset: off,
        });
        off += cmdsize as usize;
    }
    Some(vec)
}

fn read_fixed_name(data: &[u8]) -> String {
    let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..len]).into_owned()
}

fn write_fixed_name(buf: &mut Vec<u8>, name: &str) {
    assert!(name.len() <= 16);
    buf.extend_from_slice(name.as_bytes());
    buf.resize(buf.len() + 16 - name.len(), 0);
}

/// `segment_command_64` (without the trailing sections).
#[derive(Debug, Clone, Default)]
pub struct SegmentCommand {
    pub segname: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

impl SegmentCommand {
    pub const SIZE: usize = 72;

    pub fn parse(data: &[u8]) -> SegmentCommand {
        SegmentCommand {
            segname: read_fixed_name(&data[8..24]),
            vmaddr: LittleEndian::read_u64(&data[24..]),
            vmsize: LittleEndian::read_u64(&data[32..]),
            fileoff: LittleEndian::read_u64(&data[40..]),
            filesize: LittleEndian::read_u64(&data[48..]),
            maxprot: LittleEndian::read_u32(&data[56..]),
            initprot: LittleEndian::read_u32(&data[60..]),
            nsects: LittleEndian::read_u32(&data[64..]),
            flags: LittleEndian::read_u32(&data[68..]),
        }
    }

    pub fn write(&self, buf: &mut Vec<u8>, cmdsize: u32) {
        buf.write_u32::<LittleEndian>(LC_SEGMENT_64).unwrap();
        buf.write_u32::<LittleEndian>(cmdsize).unwrap();
        write_fixed_name(buf, &self.segname);
        buf.write_u64::<LittleEndian>(self.vmaddr).unwrap();
        buf.write_u64::<LittleEndian>(self.vmsize).unwrap();
        buf.write_u64::<LittleEndian>(self.fileoff).unwrap();
        buf.write_u64::<LittleEndian>(self.filesize).unwrap();
        buf.write_u32::<LittleEndian>(self.maxprot).unwrap();
        buf.write_u32::<LittleEndian>(self.initprot).unwrap();
        buf.write_u32::<LittleEndian>(self.nsects).unwrap();
        buf.write_u32::<LittleEndian>(self.flags).unwrap();
    }
}

/// `section_64`. Also used as the header of every output chunk, the way
/// a section header describes placement, alignment and type.
#[derive(Debug, Clone, Default)]
pub struct MachSection {
    pub sectname: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub p2align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub type_: u8,
    pub attr: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl MachSection {
    pub const SIZE: usize = 80;

    pub fn parse(data: &[u8]) -> MachSection {
        let flags = LittleEndian::read_u32(&data[64..]);
        MachSection {
            sectname: read_fixed_name(&data[0..16]),
            segname: read_fixed_name(&data[16..32]),
            addr: LittleEndian::read_u64(&data[32..]),
            size: LittleEndian::read_u64(&data[40..]),
            offset: LittleEndian::read_u32(&data[48..]),
            p2align: LittleEndian::read_u32(&data[52..]),
            reloff: LittleEndian::read_u32(&data[56..]),
            nreloc: LittleEndian::read_u32(&data[60..]),
            type_: (flags & 0xff) as u8,
            attr: flags & 0xffffff00,
            reserved1: LittleEndian::read_u32(&data[68..]),
            reserved2: LittleEndian::read_u32(&data[72..]),
        }
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        write_fixed_name(buf, &self.sectname);
        write_fixed_name(buf, &self.segname);
        buf.write_u64::<LittleEndian>(self.addr).unwrap();
        buf.write_u64::<LittleEndian>(self.size).unwrap();
        buf.write_u32::<LittleEndian>(self.offset).unwrap();
        buf.write_u32::<LittleEndian>(self.p2align).unwrap();
        buf.write_u32::<LittleEndian>(self.reloff).unwrap();
        buf.write_u32::<LittleEndian>(self.nreloc).unwrap();
        buf.write_u32::<LittleEndian>(self.attr | self.type_ as u32).unwrap();
        buf.write_u32::<LittleEndian>(self.reserved1).unwrap();
        buf.write_u32::<LittleEndian>(self.reserved2).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap(); // reserved3
    }

    pub fn match_name(&self, segname: &str, sectname: &str) -> bool {
        self.segname == segname && self.sectname == sectname
    }

    pub fn is_text(&self) -> bool {
        self.attr & (S_ATTR_SOME_INSTRUCTIONS | S_ATTR_PURE_INSTRUCTIONS) != 0
    }
}

/// `nlist_64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachSym {
    pub stroff: u32,
    pub n_type: u8,
    pub sect: u8,
    pub desc: u16,
    pub value: u64,
}

impl MachSym {
    pub const SIZE: usize = 16;

    pub fn parse(data: &[u8]) -> MachSym {
        MachSym {
            stroff: LittleEndian::read_u32(&data[0..]),
            n_type: data[4],
            sect: data[5],
            desc: LittleEndian::read_u16(&data[6..]),
            value: LittleEndian::read_u64(&data[8..]),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..], self.stroff);
        buf[4] = self.n_type;
        buf[5] = self.sect;
        LittleEndian::write_u16(&mut buf[6..], self.desc);
        LittleEndian::write_u64(&mut buf[8..], self.value);
    }

    pub fn is_extern(&self) -> bool {
        self.n_type & 0x01 != 0
    }

    pub fn is_private_extern(&self) -> bool {
        self.n_type & 0x10 != 0
    }

    pub fn stab(&self) -> u8 {
        self.n_type & 0xe0
    }

    pub fn typ(&self) -> u8 {
        (self.n_type >> 1) & 0x7
    }

    pub fn is_undef(&self) -> bool {
        self.typ() == N_UNDF && !self.is_common()
    }

    pub fn is_common(&self) -> bool {
        self.typ() == N_UNDF && self.is_extern() && self.value != 0
    }

    pub fn common_p2align(&self) -> u8 {
        ((self.desc >> 8) & 0x0f) as u8
    }
}

/// `relocation_info`.
#[derive(Debug, Clone, Copy)]
pub struct MachRel {
    pub offset: u32,
    pub idx: u32,
    pub is_pcrel: bool,
    pub p2size: u8,
    pub is_extern: bool,
    pub type_: u8,
}

impl MachRel {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8]) -> MachRel {
        let info = LittleEndian::read_u32(&data[4..]);
        MachRel {
            offset: LittleEndian::read_u32(&data[0..]),
            idx: info & 0x00ffffff,
            is_pcrel: info & 0x01000000 != 0,
            p2size: ((info >> 25) & 3) as u8,
            is_extern: info & 0x08000000 != 0,
            type_: (info >> 28) as u8,
        }
    }
}

/// One `__LD,__compact_unwind` entry (64-bit targets).
#[derive(Debug, Clone, Copy)]
pub struct CompactUnwindEntry {
    pub code_start: u64,
    pub code_len: u32,
    pub encoding: u32,
    pub personality: u64,
    pub lsda: u64,
}

impl CompactUnwindEntry {
    pub const SIZE: usize = 32;
    pub const CODE_START_OFF: usize = 0;
    pub const PERSONALITY_OFF: usize = 16;
    pub const LSDA_OFF: usize = 24;

    pub fn parse(data: &[u8]) -> CompactUnwindEntry {
        CompactUnwindEntry {
            code_start: LittleEndian::read_u64(&data[0..]),
            code_len: LittleEndian::read_u32(&data[8..]),
            encoding: LittleEndian::read_u32(&data[12..]),
            personality: LittleEndian::read_u64(&data[16..]),
            lsda: LittleEndian::read_u64(&data[24..]),
        }
    }
}

/// `data_in_code_entry`.
#[derive(Debug, Clone, Copy)]
pub struct DataInCodeEntry {
    pub offset: u32,
    pub length: u16,
    pub kind: u16,
}

impl DataInCodeEntry {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8]) -> DataInCodeEntry {
        DataInCodeEntry {
            offset: LittleEndian::read_u32(&data[0..]),
            length: LittleEndian::read_u16(&data[4..]),
            kind: LittleEndian::read_u16(&data[6..]),
        }
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<LittleEndian>(self.offset).unwrap();
        buf.write_u16::<LittleEndian>(self.length).unwrap();
        buf.write_u16::<LittleEndian>(self.kind).unwrap();
    }
}

/// `fat_arch`, big-endian.
#[derive(Debug, Clone, Copy)]
pub struct FatArch {
    pub cputype: u32,
    pub offset: u32,
    pub size: u32,
}

pub fn fat_archs(data: &[u8]) -> Option<Vec<FatArch>> {
    if data.len() < 8 || BigEndian::read_u32(data) != FAT_MAGIC {
        return None;
    }
    let nfat = BigEndian::read_u32(&data[4..]) as usize;
    let mut vec = Vec::with_capacity(nfat);
    for i in 0..nfat {
        let off = 8 + i * 20;
        if data.len() < off + 20 {
            return None;
        }
        vec.push(FatArch {
            cputype: BigEndian::read_u32(&data[off..]),
            offset: BigEndian::read_u32(&data[off + 8..]),
            size: BigEndian::read_u32(&data[off + 12..]),
        });
    }
    Some(vec)
}

// Chained-fixup in-place records. These are bitfield-packed 64-bit words;
// the pack/unpack pairs below keep the layout in one place.

/// `dyld_chained_ptr_64_rebase { target:36, high8:8, reserved:7, next:12, bind:1 }`
pub fn pack_chained_rebase(target: u64, high8: u8, next: u32) -> u64 {
    (target & ((1 << 36) - 1)) | ((high8 as u64) << 36) | ((next as u64 & 0xfff) << 51)
}

/// `dyld_chained_ptr_64_bind { ordinal:24, addend:8, reserved:19, next:12, bind:1 }`
pub fn pack_chained_bind(ordinal: u32, addend: u8, next: u32) -> u64 {
    (ordinal as u64 & ((1 << 24) - 1))
        | ((addend as u64) << 24)
        | ((next as u64 & 0xfff) << 51)
        | (1 << 63)
}

/// `dyld_chained_import { lib_ordinal:8, weak_import:1, name_offset:23 }`
pub fn pack_chained_import(lib_ordinal: u8, weak_import: bool, name_offset: u32) -> u32 {
    lib_ordinal as u32 | ((weak_import as u32) << 8) | ((name_offset & 0x7fffff) << 9)
}

/// `dyld_chained_import_addend64 { lib_ordinal:16, weak_import:1, reserved:15, name_offset:32 }`
pub fn pack_chained_import64(lib_ordinal: u16, weak_import: bool, name_offset: u32) -> u64 {
    lib_ordinal as u64 | ((weak_import as u64) << 16) | ((name_offset as u64) << 32)
}

// ULEB128/SLEB128. The rebase/bind/lazy-bind streams, the export trie and
// LC_FUNCTION_STARTS are all ULEB-coded.

pub fn write_uleb(buf: &mut Vec<u8>, mut val: u64) {
    loop {
        let byte = (val & 0x7f) as u8;
        val >>= 7;
        if val == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn write_sleb(buf: &mut Vec<u8>, mut val: i64) {
    loop {
        let byte = (val & 0x7f) as u8;
        val >>= 7;
        let done = (val == 0 && byte & 0x40 == 0) || (val == -1 && byte & 0x40 != 0);
        if done {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn uleb_size(val: u64) -> usize {
    let mut size = 1;
    let mut val = val >> 7;
    while val != 0 {
        size += 1;
        val >>= 7;
    }
    size
}

/// Read a ULEB from `data` at `*pos`, advancing `*pos`.
pub fn read_uleb(data: &[u8], pos: &mut usize) -> u64 {
    let mut val = 0u64;
    let mut shift = 0;
    while *pos < data.len() {
        let byte = data[*pos];
        *pos += 1;
        val |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    val
}

pub fn align_to(val: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}

/// Extract bits [hi:lo] of `val` (inclusive).
pub fn bits(val: u64, hi: u32, lo: u32) -> u32 {
    ((val >> lo) & ((1 << (hi - lo + 1)) - 1)) as u32
}

pub fn sign_extend(val: u64, first_bit: u32) -> i64 {
    let shift = 63 - first_bit;
    ((val << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb_round_trip() {
        for val in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX] {
            let mut buf = Vec::new();
            write_uleb(&mut buf, val);
            assert_eq!(buf.len(), uleb_size(val));
            let mut pos = 0;
            assert_eq!(read_uleb(&buf, &mut pos), val);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn sleb_negative() {
        let mut buf = Vec::new();
        write_sleb(&mut buf, -2);
        assert_eq!(buf, [0x7e]);
        let mut buf = Vec::new();
        write_sleb(&mut buf, 63);
        assert_eq!(buf, [0x3f]);
        let mut buf = Vec::new();
        write_sleb(&mut buf, 64);
        assert_eq!(buf, [0xc0, 0x00]);
    }

    #[test]
    fn mach_sym_bitfields() {
        // N_SECT | N_EXT
        let sym = MachSym {
            n_type: 0x0f,
            ..Default::default()
        };
        assert!(sym.is_extern());
        assert_eq!(sym.typ(), N_SECT);
        assert!(!sym.is_undef());

        // undefined extern
        let sym = MachSym {
            n_type: 0x01,
            ..Default::default()
        };
        assert!(sym.is_undef());
        assert!(!sym.is_common());

        // common: undefined extern with a nonzero size in `value`
        let sym = MachSym {
            n_type: 0x01,
            value: 16,
            desc: 4 << 8,
            ..Default::default()
        };
        assert!(sym.is_common());
        assert_eq!(sym.common_p2align(), 4);
    }

    #[test]
    fn chained_fixup_packing() {
        let next_of = |word: u64| ((word >> 51) & 0xfff) as u32;
        let is_bind = |word: u64| word >> 63 != 0;

        let word = pack_chained_bind(3, 200, 2);
        assert!(is_bind(word));
        assert_eq!(next_of(word), 2);
        assert_eq!(word & 0xffffff, 3);
        assert_eq!((word >> 24) & 0xff, 200);

        let word = pack_chained_rebase(0x1000, 0xab, 1);
        assert!(!is_bind(word));
        assert_eq!(next_of(word), 1);
        assert_eq!(word & ((1 << 36) - 1), 0x1000);
        assert_eq!((word >> 36) & 0xff, 0xab);
    }

    #[test]
    fn section_header_round_trip() {
        let sec = MachSection {
            sectname: "__text".to_string(),
            segname: "__TEXT".to_string(),
            addr: 0x100003f00,
            size: 0x40,
            offset: 0x3f00,
            p2align: 2,
            type_: S_REGULAR,
            attr: S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            ..Default::default()
        };
        let mut buf = Vec::new();
        sec.write(&mut buf);
        assert_eq!(buf.len(), MachSection::SIZE);
        let back = MachSection::parse(&buf);
        assert_eq!(back.sectname, "__text");
        assert_eq!(back.segname, "__TEXT");
        assert_eq!(back.addr, sec.addr);
        assert_eq!(back.type_, S_REGULAR);
        assert_eq!(back.attr, sec.attr);
    }
}
