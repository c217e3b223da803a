/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Text-stub (.tbd) parsing.
//!
//! A .tbd file is a YAML document describing a dylib: its install name and
//! the symbols it exports, so that you can link against a library without
//! having its binary. macld understands the subset of shapes that tapi
//! actually emits (v2 through v4): per-arch export blocks with flow-style
//! symbol lists. It is not a general YAML parser, by design; the interface
//! contract is the key set below.
//!
//! One file may contain several documents: the first is the main dylib,
//! the rest describe re-exported child libraries, which get squashed into
//! the main one.

use crate::context::Context;
use crate::options::Arch;

#[derive(Debug, Default)]
pub struct TextDylib {
    pub install_name: String,
    pub reexported_libs: Vec<String>,
    pub exports: Vec<String>,
    pub weak_exports: Vec<String>,
}

/// One logical line: flow lists (`[ ... ]`) spanning physical lines are
/// joined, so every value fits on its line.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out: Vec<(usize, String)> = Vec::new();
    let mut depth = 0usize;

    for raw in text.lines() {
        let line = raw.trim_end();
        if depth == 0 {
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let indent = line.len() - line.trim_start().len();
            out.push((indent, line.trim_start().to_string()));
        } else if let Some((_, last)) = out.last_mut() {
            last.push(' ');
            last.push_str(line.trim());
        }
        depth += line.matches('[').count();
        depth = depth.saturating_sub(line.matches(']').count());
    }
    out
}

fn strip_quotes(val: &str) -> String {
    let val = val.trim();
    let val = val
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| val.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .unwrap_or(val);
    val.to_string()
}

/// `[ a, 'b', c ]` -> `["a", "b", "c"]`.
fn parse_flow_list(val: &str) -> Vec<String> {
    let val = val.trim();
    let Some(inner) = val.strip_prefix('[').and_then(|v| v.strip_suffix(']')) else {
        return Vec::new();
    };
    inner
        .split(',')
        .map(strip_quotes)
        .filter(|s| !s.is_empty())
        .collect()
}

fn matches_arch(arch: Arch, targets: &[String]) -> bool {
    let name = match arch {
        Arch::Arm64 => "arm64",
        Arch::X86_64 => "x86_64",
    };
    let dash = format!("{}-", name);
    targets.iter().any(|t| t == name || t.starts_with(&dash))
}

/// A `key: value` pair collected from one block item.
#[derive(Default)]
struct Item {
    entries: Vec<(String, String)>,
}

impl Item {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key).map(parse_flow_list).unwrap_or_default()
    }
}

fn split_key(line: &str) -> Option<(String, String)> {
    let colon = line.find(':')?;
    let key = line[..colon].trim().to_string();
    let val = line[colon + 1..].trim().to_string();
    Some((key, val))
}

fn parse_document(ctx: &Context, doc: &[(usize, String)]) -> Option<TextDylib> {
    let mut tbd = TextDylib::default();
    let mut doc_targets: Vec<String> = Vec::new();
    let mut matched = false;

    // Collect the items of a block sequence: lines after `i` with a
    // greater indent, split at `- ` markers.
    let block_items = |i: usize| -> (Vec<Item>, usize) {
        let mut items: Vec<Item> = Vec::new();
        let mut j = i + 1;
        while j < doc.len() && doc[j].0 > 0 {
            let line = doc[j].1.as_str();
            let line = if let Some(rest) = line.strip_prefix("- ") {
                items.push(Item::default());
                rest
            } else {
                line
            };
            if let (Some(item), Some((key, val))) = (items.last_mut(), split_key(line)) {
                item.entries.push((key, val));
            }
            j += 1;
        }
        (items, j)
    };

    let item_matches = |item: &Item| -> bool {
        let targets = if item.get("targets").is_some() {
            item.list("targets")
        } else if item.get("archs").is_some() {
            item.list("archs")
        } else {
            return true;
        };
        matches_arch(ctx.arg.arch, &targets)
    };

    let mut i = 0;
    while i < doc.len() {
        let (indent, line) = &doc[i];
        if *indent != 0 {
            i += 1;
            continue;
        }
        let Some((key, val)) = split_key(line) else {
            i += 1;
            continue;
        };
        match key.as_str() {
            "targets" | "archs" => {
                doc_targets = parse_flow_list(&val);
                matched = matches_arch(ctx.arg.arch, &doc_targets);
                i += 1;
            }
            "install-name" => {
                tbd.install_name = strip_quotes(&val);
                i += 1;
            }
            "reexported-libraries" => {
                let (items, next) = block_items(i);
                for item in &items {
                    if item_matches(item) {
                        tbd.reexported_libs.extend(item.list("libraries"));
                    }
                }
                i = next;
            }
            "exports" | "reexports" => {
                let (items, next) = block_items(i);
                for item in &items {
                    if !item_matches(item) {
                        continue;
                    }
                    tbd.exports.extend(item.list("symbols"));
                    tbd.weak_exports.extend(item.list("weak-symbols"));
                    for class in item.list("objc-classes") {
                        tbd.exports.push(format!("_OBJC_CLASS_$_{}", class));
                        tbd.exports.push(format!("_OBJC_METACLASS_$_{}", class));
                    }
                    for ty in item.list("objc-eh-types") {
                        tbd.exports.push(format!("_OBJC_EHTYPE_$_{}", ty));
                    }
                    for ivar in item.list("objc-ivars") {
                        tbd.exports.push(format!("_OBJC_IVAR_$_{}", ivar));
                    }
                }
                i = next;
            }
            _ => {
                i += 1;
            }
        }
    }

    if matched {
        Some(tbd)
    } else {
        None
    }
}

/// Merge re-exported text dylibs found in the same file into the main one.
fn squash(mut tbds: Vec<TextDylib>) -> TextDylib {
    let mut main = tbds.remove(0);
    let mut remaining: Vec<String> = Vec::new();

    let mut worklist = std::mem::take(&mut main.reexported_libs);
    while let Some(lib) = worklist.pop() {
        if let Some(pos) = tbds.iter().position(|t| t.install_name == lib) {
            let child = tbds.remove(pos);
            main.exports.extend(child.exports);
            main.weak_exports.extend(child.weak_exports);
            worklist.extend(child.reexported_libs);
        } else {
            remaining.push(lib);
        }
    }

    main.reexported_libs = remaining;
    main
}

pub fn parse(ctx: &Context, filename: &str, data: &[u8]) -> TextDylib {
    let Ok(text) = std::str::from_utf8(data) else {
        fatal!(ctx, "{}: malformed TBD file", filename);
    };
    let text = text.replace('\r', "");

    // Split into documents at `---` markers; `...` ends a document.
    let mut docs: Vec<Vec<(usize, String)>> = Vec::new();
    for (indent, line) in logical_lines(&text) {
        if indent == 0 && line.starts_with("---") {
            docs.push(Vec::new());
            continue;
        }
        if indent == 0 && line == "..." {
            continue;
        }
        if let Some(doc) = docs.last_mut() {
            doc.push((indent, line));
        }
    }

    let mut tbds: Vec<TextDylib> = docs
        .iter()
        .filter_map(|doc| parse_document(ctx, doc))
        .collect();
    if tbds.is_empty() {
        fatal!(ctx, "{}: malformed TBD file", filename);
    }

    // Dylibs can carry `$ld$...` linker-directive pseudo-symbols; they are
    // not real exports.
    for tbd in &mut tbds {
        tbd.exports.retain(|name| !name.starts_with("$ld$"));
        tbd.weak_exports.retain(|name| !name.starts_with("$ld$"));
    }

    squash(tbds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn parse_str(text: &str) -> TextDylib {
        let ctx = Context::new(Options::default());
        parse(&ctx, "test.tbd", text.as_bytes())
    }

    #[test]
    fn v4_document() {
        let tbd = parse_str(
            "--- !tapi-tbd\n\
             tbd-version:     4\n\
             targets:         [ x86_64-macos, arm64-macos ]\n\
             install-name:    '/usr/lib/libSystem.B.dylib'\n\
             exports:\n\
             \x20 - targets:   [ arm64-macos ]\n\
             \x20   symbols:   [ _printf, _exit ]\n\
             \x20   weak-symbols: [ _weak_thing ]\n\
             \x20 - targets:   [ x86_64-macos ]\n\
             \x20   symbols:   [ _x86_only ]\n\
             ...\n",
        );
        assert_eq!(tbd.install_name, "/usr/lib/libSystem.B.dylib");
        assert_eq!(tbd.exports, vec!["_printf", "_exit"]);
        assert_eq!(tbd.weak_exports, vec!["_weak_thing"]);
    }

    #[test]
    fn objc_class_expansion() {
        let tbd = parse_str(
            "--- !tapi-tbd\n\
             targets: [ arm64-macos ]\n\
             install-name: /usr/lib/libobjc.A.dylib\n\
             exports:\n\
             \x20 - targets: [ arm64-macos ]\n\
             \x20   objc-classes: [ NSObject ]\n",
        );
        assert!(tbd.exports.contains(&"_OBJC_CLASS_$_NSObject".to_string()));
        assert!(tbd
            .exports
            .contains(&"_OBJC_METACLASS_$_NSObject".to_string()));
    }

    #[test]
    fn multi_document_squash() {
        let tbd = parse_str(
            "--- !tapi-tbd\n\
             targets: [ arm64-macos ]\n\
             install-name: /usr/lib/libSystem.B.dylib\n\
             reexported-libraries:\n\
             \x20 - targets: [ arm64-macos ]\n\
             \x20   libraries: [ '/usr/lib/system/libsystem_c.dylib' ]\n\
             --- !tapi-tbd\n\
             targets: [ arm64-macos ]\n\
             install-name: /usr/lib/system/libsystem_c.dylib\n\
             exports:\n\
             \x20 - targets: [ arm64-macos ]\n\
             \x20   symbols: [ _printf ]\n\
             ...\n",
        );
        assert_eq!(tbd.install_name, "/usr/lib/libSystem.B.dylib");
        assert!(tbd.exports.contains(&"_printf".to_string()));
        // Squashed children are no longer re-exports.
        assert!(tbd.reexported_libs.is_empty());
    }

    #[test]
    fn flow_list_spanning_lines() {
        let tbd = parse_str(
            "--- !tapi-tbd\n\
             targets: [ arm64-macos ]\n\
             install-name: /usr/lib/libc++.1.dylib\n\
             exports:\n\
             \x20 - targets: [ arm64-macos ]\n\
             \x20   symbols: [ __Za,\n\
             \x20              __Zb ]\n",
        );
        assert_eq!(tbd.exports, vec!["__Za", "__Zb"]);
    }

    #[test]
    fn wrong_arch_documents_are_skipped() {
        let tbd = parse_str(
            "--- !tapi-tbd-v3\n\
             archs: [ x86_64, arm64 ]\n\
             install-name: /usr/lib/libz.dylib\n\
             exports:\n\
             \x20 - archs: [ x86_64 ]\n\
             \x20   symbols: [ _inflate_x86 ]\n\
             \x20 - archs: [ arm64, arm64e ]\n\
             \x20   symbols: [ _inflate ]\n",
        );
        // Default arch is arm64.
        assert_eq!(tbd.exports, vec!["_inflate"]);
    }
}
