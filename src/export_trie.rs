/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The export trie.
//!
//! Exported symbols are published to dyld as a prefix tree. A terminal
//! node stores `(ULEB terminal-size, flags, address)`; every node stores
//! its child count followed by `(edge substring, ULEB child offset)`
//! pairs. Because child offsets are variable-length, sizing has to be
//! iterated; two passes are enough in practice for the offsets to
//! converge.

use crate::context::Context;
use crate::macho;
use crate::symbol::{FileRef, SymRef, Visibility};

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub flags: u32,
    pub addr: u64,
}

#[derive(Debug, Default)]
pub struct TrieNode {
    prefix: String,
    children: Vec<TrieNode>,
    addr: u64,
    flags: u32,
    offset: u32,
    is_leaf: bool,
}

#[derive(Default)]
pub struct ExportState {
    pub entries: Vec<Entry>,
    root: Option<TrieNode>,
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

fn construct_trie(node: &mut TrieNode, entries: &[Entry], len: usize) {
    let new_len = common_prefix_len(&entries[0].name, &entries[entries.len() - 1].name);

    let mut entries = entries;
    if new_len > len {
        node.prefix = entries[0].name[len..new_len].to_string();
        if entries[0].name.len() == new_len {
            node.is_leaf = true;
            node.flags = entries[0].flags;
            node.addr = entries[0].addr;
            entries = &entries[1..];
        }
    }

    let mut i = 0;
    while i < entries.len() {
        let divider = entries[i].name.as_bytes()[new_len];
        let j = entries[i..]
            .partition_point(|ent| ent.name.as_bytes()[new_len] == divider)
            + i;

        let mut child = TrieNode::default();
        construct_trie(&mut child, &entries[i..j], new_len);
        node.children.push(child);
        i = j;
    }
}

/// Assign serialized offsets to every node; returns the total size. The
/// offsets feed back into ULEB sizes, so the caller runs this until the
/// size stops shrinking.
fn set_offset(node: &mut TrieNode, offset: u32) -> u32 {
    node.offset = offset;

    let mut size: u32 = if node.is_leaf {
        let body = macho::uleb_size(node.flags as u64) + macho::uleb_size(node.addr);
        (body + macho::uleb_size(body as u64)) as u32
    } else {
        1
    };

    size += 1; // child count

    for child in &node.children {
        size += child.prefix.len() as u32 + 1 + macho::uleb_size(child.offset as u64) as u32;
    }

    for child in &mut node.children {
        size += set_offset(child, offset + size);
    }
    size
}

fn write_node(buf: &mut [u8], node: &TrieNode) {
    let mut pos = node.offset as usize;

    if node.is_leaf {
        let mut body = Vec::new();
        macho::write_uleb(&mut body, node.flags as u64);
        macho::write_uleb(&mut body, node.addr);
        let mut head = Vec::new();
        macho::write_uleb(&mut head, body.len() as u64);
        buf[pos..pos + head.len()].copy_from_slice(&head);
        pos += head.len();
        buf[pos..pos + body.len()].copy_from_slice(&body);
        pos += body.len();
    } else {
        buf[pos] = 0;
        pos += 1;
    }

    buf[pos] = node.children.len() as u8;
    pos += 1;

    for child in &node.children {
        buf[pos..pos + child.prefix.len()].copy_from_slice(child.prefix.as_bytes());
        pos += child.prefix.len();
        buf[pos] = 0;
        pos += 1;
        let mut off = Vec::new();
        macho::write_uleb(&mut off, child.offset as u64);
        buf[pos..pos + off.len()].copy_from_slice(&off);
        pos += off.len();
    }

    for child in &node.children {
        write_node(buf, child);
    }
}

/// Build a trie from a sorted entry list and return `(root, size)`.
pub fn build(mut entries: Vec<Entry>) -> (TrieNode, u32) {
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut node = TrieNode::default();
    construct_trie(&mut node, &entries, 0);

    let mut root = if node.prefix.is_empty() {
        node
    } else {
        TrieNode {
            children: vec![node],
            ..Default::default()
        }
    };

    // A serialized node contains ULEB offsets of other nodes, so the
    // total size needs more than one iteration to settle.
    set_offset(&mut root, 0);
    let size = set_offset(&mut root, 0);
    (root, size)
}

pub fn compute_size(ctx: &mut Context, chunk_idx: usize) {
    let mut entries = Vec::new();

    for file in &ctx.objs {
        if !file.alive() {
            continue;
        }
        for &sym_ref in &file.syms {
            let SymRef::Global(_) = sym_ref else { continue };
            let def = ctx.sym(sym_ref).def();
            if def.file != Some(FileRef::Obj(file.file_idx))
                || def.visibility != Visibility::Global
            {
                continue;
            }
            if let Some(subsec) = def.subsec {
                if !ctx.subsec(subsec).alive() {
                    continue;
                }
            }
            let mut flags = 0;
            if def.is_weak {
                flags |= macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION;
            }
            if def.is_tlv {
                flags |= macho::EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL;
            }
            let addr = ctx.def_addr(&def) - ctx.chunks[ctx.mach_hdr].hdr.addr;
            drop(def);
            entries.push(Entry {
                name: ctx.sym_name(sym_ref).to_string(),
                flags,
                addr,
            });
        }
    }

    if entries.is_empty() {
        ctx.export = ExportState::default();
        ctx.chunks[chunk_idx].hdr.size = 0;
        return;
    }

    let (root, size) = build(entries.clone());
    ctx.export = ExportState {
        entries,
        root: Some(root),
    };
    ctx.chunks[chunk_idx].hdr.size = macho::align_to(size as u64, 8);
}

pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
    if let Some(root) = &ctx.export.root {
        write_node(buf, root);
    }
}

/// Decode a serialized trie back into `(name, flags, addr)` entries.
/// Shared with the tests and useful for debugging dumps.
pub fn decode(data: &[u8]) -> Vec<Entry> {
    let mut out = Vec::new();
    decode_node(data, 0, String::new(), &mut out);
    out.sort_by(|a: &Entry, b: &Entry| a.name.cmp(&b.name));
    out
}

fn decode_node(data: &[u8], offset: usize, prefix: String, out: &mut Vec<Entry>) {
    let mut pos = offset;
    let terminal_size = macho::read_uleb(data, &mut pos);

    if terminal_size != 0 {
        let mut tpos = pos;
        let flags = macho::read_uleb(data, &mut tpos) as u32;
        let addr = macho::read_uleb(data, &mut tpos);
        out.push(Entry {
            name: prefix.clone(),
            flags,
            addr,
        });
        pos += terminal_size as usize;
    }

    let nchildren = data[pos];
    pos += 1;

    for _ in 0..nchildren {
        let end = data[pos..].iter().position(|&b| b == 0).unwrap();
        let edge = String::from_utf8_lossy(&data[pos..pos + end]).into_owned();
        pos += end + 1;
        let child_off = macho::read_uleb(data, &mut pos) as usize;
        decode_node(data, child_off, format!("{}{}", prefix, edge), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_symbol_round_trip() {
        let names = ["_a", "_aa", "_ab", "_b", "_ba", "_bb"];
        let entries: Vec<Entry> = names
            .iter()
            .enumerate()
            .map(|(i, name)| Entry {
                name: name.to_string(),
                flags: if i == 2 {
                    macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION
                } else {
                    0
                },
                addr: 0x1000 + i as u64 * 16,
            })
            .collect();

        let (root, size) = build(entries.clone());
        let mut buf = vec![0u8; size as usize];
        write_node(&mut buf, &root);

        let decoded = decode(&buf);
        assert_eq!(decoded.len(), 6);
        for (want, got) in entries.iter().zip(decoded.iter()) {
            assert_eq!(want.name, got.name);
            assert_eq!(want.flags, got.flags);
            assert_eq!(want.addr, got.addr);
        }
    }

    #[test]
    fn offsets_converge() {
        // Enough entries that first-pass ULEB offsets shrink on the second
        // pass; the written size must match the final set_offset result.
        let entries: Vec<Entry> = (0..200)
            .map(|i| Entry {
                name: format!("_symbol_{:03}", i),
                flags: 0,
                addr: 0x100000 + i as u64 * 4,
            })
            .collect();
        let (root, size) = build(entries);
        let mut buf = vec![0u8; size as usize];
        write_node(&mut buf, &root);
        let decoded = decode(&buf);
        assert_eq!(decoded.len(), 200);
        assert_eq!(decoded[7].name, "_symbol_007");
    }

    #[test]
    fn empty_prefix_root() {
        // Entries with no common prefix hang off a root with an empty
        // prefix.
        let (root, size) = build(vec![
            Entry {
                name: "abc".into(),
                flags: 0,
                addr: 1,
            },
            Entry {
                name: "xyz".into(),
                flags: 0,
                addr: 2,
            },
        ]);
        let mut buf = vec![0u8; size as usize];
        write_node(&mut buf, &root);
        let decoded = decode(&buf);
        assert_eq!(decoded[0].name, "abc");
        assert_eq!(decoded[1].name, "xyz");
    }
}
