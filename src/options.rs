/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Parsing and management of command-line options.
//!
//! macld accepts the ld64 option syntax: single-dash multi-character
//! options, some of which consume one or more following arguments
//! (`-o a.out`, `-platform_version macos 13.0 13.3`). Options and input
//! files may be interleaved; input order is significant because it decides
//! file priority during symbol resolution.

use crate::macho::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE, PLATFORM_MACOS};

/// Target architecture of a link. The page size, relocation set and stub
/// layouts all key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    X86_64,
}

impl Arch {
    pub fn from_name(name: &str) -> Result<Arch, String> {
        match name {
            "arm64" => Ok(Arch::Arm64),
            "x86_64" => Ok(Arch::X86_64),
            _ => Err(format!("Unknown architecture: {}", name)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidKind {
    None,
    Hash,
    Random,
}

/// An `X.Y.Z` version, encoded `(major << 16) | (minor << 8) | patch` in
/// load commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionTriple {
    pub fn parse(arg: &str) -> Result<VersionTriple, String> {
        let mut it = arg.split('.');
        let mut part = |name: &str| -> Result<u32, String> {
            match it.next() {
                None => Ok(0),
                Some(s) => s
                    .parse()
                    .map_err(|_| format!("Invalid {} version in {:?}", name, arg)),
            }
        };
        let triple = VersionTriple {
            major: part("major")?,
            minor: part("minor")?,
            patch: part("patch")?,
        };
        if it.next().is_some() {
            return Err(format!("Too many version components in {:?}", arg));
        }
        Ok(triple)
    }

    pub fn encode(&self) -> u32 {
        (self.major << 16) | (self.minor << 8) | self.patch
    }
}

/// How one input argument should be loaded. `-weak-l`, `-reexport-l` etc.
/// apply to a single library, so the modifier travels with the argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadModifiers {
    pub weak: bool,
    pub reexport: bool,
    pub needed: bool,
    pub hidden: bool,
    pub force_load: bool,
}

#[derive(Debug, Clone)]
pub enum InputSpec {
    /// A path given directly on the command line.
    File(String, LoadModifiers),
    /// `-lfoo`: searched as libfoo.tbd / libfoo.dylib / libfoo.a in `-L`
    /// directories.
    Library(String, LoadModifiers),
}

/// Struct containing all user-configurable options.
pub struct Options {
    pub output: String,
    pub final_output: Option<String>,
    pub arch: Arch,
    pub output_type: u32,
    pub entry: String,
    pub dead_strip: bool,
    pub dead_strip_dylibs: bool,
    pub fixup_chains: bool,
    pub uuid: UuidKind,
    pub adhoc_codesign: Option<bool>,
    pub function_starts: bool,
    pub data_in_code_info: bool,
    pub init_offsets: bool,
    pub all_load: bool,
    pub objc: bool,
    pub application_extension: bool,
    pub mark_dead_strippable_dylib: bool,
    pub strip_debug: bool,
    pub strip_locals: bool,
    pub platform: u32,
    pub platform_min_version: VersionTriple,
    pub platform_sdk_version: VersionTriple,
    pub compatibility_version: VersionTriple,
    pub current_version: VersionTriple,
    pub headerpad: u64,
    pub pagezero_size: u64,
    pub stack_size: u64,
    pub install_name: String,
    pub umbrella: String,
    pub oso_prefix: String,
    pub rpaths: Vec<String>,
    pub library_paths: Vec<String>,
    pub framework_paths: Vec<String>,
    pub syslibroot: Vec<String>,
    pub forced_undefined: Vec<String>,
    pub sectcreate: Vec<(String, String, String)>,
    pub sectalign: Vec<(String, String, u8)>,
    pub inputs: Vec<InputSpec>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            output: "a.out".to_string(),
            final_output: None,
            arch: Arch::Arm64,
            output_type: MH_EXECUTE,
            entry: "_main".to_string(),
            dead_strip: false,
            dead_strip_dylibs: false,
            fixup_chains: false,
            uuid: UuidKind::Hash,
            adhoc_codesign: None,
            function_starts: true,
            data_in_code_info: true,
            init_offsets: false,
            all_load: false,
            objc: false,
            application_extension: false,
            mark_dead_strippable_dylib: false,
            strip_debug: false,
            strip_locals: false,
            platform: PLATFORM_MACOS,
            platform_min_version: VersionTriple::default(),
            platform_sdk_version: VersionTriple::default(),
            compatibility_version: VersionTriple::default(),
            current_version: VersionTriple::default(),
            headerpad: 256,
            pagezero_size: 0,
            stack_size: 0,
            install_name: String::new(),
            umbrella: String::new(),
            oso_prefix: String::new(),
            rpaths: Vec::new(),
            library_paths: Vec::new(),
            framework_paths: Vec::new(),
            syslibroot: Vec::new(),
            forced_undefined: Vec::new(),
            sectcreate: Vec::new(),
            sectalign: Vec::new(),
            inputs: Vec::new(),
        }
    }
}

fn parse_platform(name: &str) -> Result<u32, String> {
    match name {
        "macos" | "1" => Ok(1),
        "ios" | "2" => Ok(2),
        "tvos" | "3" => Ok(3),
        "watchos" | "4" => Ok(4),
        "bridgeos" | "5" => Ok(5),
        "mac-catalyst" | "6" => Ok(6),
        "ios-simulator" | "7" => Ok(7),
        "tvos-simulator" | "8" => Ok(8),
        "watchos-simulator" | "9" => Ok(9),
        "driverkit" | "10" => Ok(10),
        _ => Err(format!("Unknown platform: {}", name)),
    }
}

fn parse_hex_or_dec(arg: &str, name: &str) -> Result<u64, String> {
    let res = if let Some(hex) = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        arg.parse()
    };
    res.map_err(|_| format!("Invalid value for {}: {:?}", name, arg))
}

impl Options {
    /// Parse a full argument list (without argv[0]).
    pub fn parse(args: &[String]) -> Result<Options, String> {
        let mut opts = Options::default();
        let mut i = 0;

        let mut next = |i: &mut usize, opt: &str| -> Result<String, String> {
            *i += 1;
            args.get(*i)
                .cloned()
                .ok_or_else(|| format!("Option {} requires an argument", opt))
        };

        while i < args.len() {
            let arg = args[i].as_str();

            if !arg.starts_with('-') {
                opts.inputs
                    .push(InputSpec::File(arg.to_string(), LoadModifiers::default()));
            } else if arg == "-o" {
                opts.output = next(&mut i, arg)?;
            } else if arg == "-arch" {
                opts.arch = Arch::from_name(&next(&mut i, arg)?)?;
            } else if arg == "-dylib" {
                opts.output_type = MH_DYLIB;
            } else if arg == "-bundle" {
                opts.output_type = MH_BUNDLE;
            } else if arg == "-execute" {
                opts.output_type = MH_EXECUTE;
            } else if arg == "-e" {
                opts.entry = next(&mut i, arg)?;
            } else if arg == "-u" {
                opts.forced_undefined.push(next(&mut i, arg)?);
            } else if arg == "-dead_strip" {
                opts.dead_strip = true;
            } else if arg == "-dead_strip_dylibs" {
                opts.dead_strip_dylibs = true;
            } else if arg == "-fixup_chains" {
                opts.fixup_chains = true;
            } else if arg == "-no_fixup_chains" {
                opts.fixup_chains = false;
            } else if arg == "-no_uuid" {
                opts.uuid = UuidKind::None;
            } else if arg == "-random_uuid" {
                opts.uuid = UuidKind::Random;
            } else if arg == "-adhoc_codesign" {
                opts.adhoc_codesign = Some(true);
            } else if arg == "-no_adhoc_codesign" {
                opts.adhoc_codesign = Some(false);
            } else if arg == "-no_function_starts" {
                opts.function_starts = false;
            } else if arg == "-no_data_in_code_info" {
                opts.data_in_code_info = false;
            } else if arg == "-init_offsets" {
                opts.init_offsets = true;
            } else if arg == "-all_load" {
                opts.all_load = true;
            } else if arg == "-ObjC" {
                opts.objc = true;
            } else if arg == "-application_extension" {
                opts.application_extension = true;
            } else if arg == "-mark_dead_strippable_dylib" {
                opts.mark_dead_strippable_dylib = true;
            } else if arg == "-S" {
                opts.strip_debug = true;
            } else if arg == "-x" {
                opts.strip_locals = true;
            } else if arg == "-platform_version" {
                opts.platform = parse_platform(&next(&mut i, arg)?)?;
                opts.platform_min_version = VersionTriple::parse(&next(&mut i, arg)?)?;
                opts.platform_sdk_version = VersionTriple::parse(&next(&mut i, arg)?)?;
            } else if arg == "-compatibility_version" {
                opts.compatibility_version = VersionTriple::parse(&next(&mut i, arg)?)?;
            } else if arg == "-current_version" {
                opts.current_version = VersionTriple::parse(&next(&mut i, arg)?)?;
            } else if arg == "-headerpad" {
                opts.headerpad = parse_hex_or_dec(&next(&mut i, arg)?, "-headerpad")?;
            } else if arg == "-pagezero_size" {
                opts.pagezero_size = parse_hex_or_dec(&next(&mut i, arg)?, "-pagezero_size")?;
            } else if arg == "-stack_size" {
                opts.stack_size = parse_hex_or_dec(&next(&mut i, arg)?, "-stack_size")?;
            } else if arg == "-install_name" || arg == "-dylib_install_name" {
                opts.install_name = next(&mut i, arg)?;
            } else if arg == "-final_output" {
                opts.final_output = Some(next(&mut i, arg)?);
            } else if arg == "-umbrella" {
                opts.umbrella = next(&mut i, arg)?;
            } else if arg == "-oso_prefix" {
                opts.oso_prefix = next(&mut i, arg)?;
            } else if arg == "-rpath" {
                opts.rpaths.push(next(&mut i, arg)?);
            } else if arg == "-syslibroot" {
                opts.syslibroot.push(next(&mut i, arg)?);
            } else if arg == "-sectcreate" {
                let seg = next(&mut i, arg)?;
                let sect = next(&mut i, arg)?;
                let file = next(&mut i, arg)?;
                opts.sectcreate.push((seg, sect, file));
            } else if arg == "-sectalign" {
                let seg = next(&mut i, arg)?;
                let sect = next(&mut i, arg)?;
                let align = parse_hex_or_dec(&next(&mut i, arg)?, "-sectalign")?;
                if !align.is_power_of_two() {
                    return Err(format!("-sectalign: {} is not a power of two", align));
                }
                opts.sectalign
                    .push((seg, sect, align.trailing_zeros() as u8));
            } else if arg == "-force_load" {
                let path = next(&mut i, arg)?;
                opts.inputs.push(InputSpec::File(
                    path,
                    LoadModifiers {
                        force_load: true,
                        ..Default::default()
                    },
                ));
            } else if let Some(name) = arg.strip_prefix("-weak-l") {
                opts.inputs.push(InputSpec::Library(
                    name.to_string(),
                    LoadModifiers {
                        weak: true,
                        ..Default::default()
                    },
                ));
            } else if let Some(name) = arg.strip_prefix("-reexport-l") {
                opts.inputs.push(InputSpec::Library(
                    name.to_string(),
                    LoadModifiers {
                        reexport: true,
                        ..Default::default()
                    },
                ));
            } else if let Some(name) = arg.strip_prefix("-needed-l") {
                opts.inputs.push(InputSpec::Library(
                    name.to_string(),
                    LoadModifiers {
                        needed: true,
                        ..Default::default()
                    },
                ));
            } else if let Some(name) = arg.strip_prefix("-hidden-l") {
                opts.inputs.push(InputSpec::Library(
                    name.to_string(),
                    LoadModifiers {
                        hidden: true,
                        ..Default::default()
                    },
                ));
            } else if let Some(path) = arg.strip_prefix("-L") {
                opts.library_paths.push(path.to_string());
            } else if let Some(path) = arg.strip_prefix("-F") {
                opts.framework_paths.push(path.to_string());
            } else if let Some(name) = arg.strip_prefix("-l") {
                opts.inputs
                    .push(InputSpec::Library(name.to_string(), LoadModifiers::default()));
            } else if arg == "-demangle" || arg == "-dynamic" || arg == "-w" {
                // Accepted for compatibility; macld always behaves this way.
            } else {
                return Err(format!("Unknown option: {:?}", arg));
            }

            i += 1;
        }

        if opts.pagezero_size == 0 && opts.output_type == MH_EXECUTE {
            opts.pagezero_size = 1 << 32;
        }
        if opts.install_name.is_empty() && opts.output_type == MH_DYLIB {
            opts.install_name = opts.output.clone();
        }
        if opts.adhoc_codesign.is_none() {
            opts.adhoc_codesign = Some(opts.arch == Arch::Arm64);
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Options, String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Options::parse(&args)
    }

    #[test]
    fn basic_options() {
        let opts = parse(&[
            "-o", "out", "-arch", "x86_64", "-dead_strip", "main.o", "-lSystem",
        ])
        .unwrap();
        assert_eq!(opts.output, "out");
        assert_eq!(opts.arch, Arch::X86_64);
        assert!(opts.dead_strip);
        assert_eq!(opts.inputs.len(), 2);
        assert!(matches!(&opts.inputs[0], InputSpec::File(p, _) if p == "main.o"));
        assert!(matches!(&opts.inputs[1], InputSpec::Library(l, m) if l == "System" && !m.weak));
        // x86-64 doesn't sign by default
        assert_eq!(opts.adhoc_codesign, Some(false));
    }

    #[test]
    fn version_triple() {
        let v = VersionTriple::parse("13.2.1").unwrap();
        assert_eq!(v.encode(), (13 << 16) | (2 << 8) | 1);
        assert_eq!(VersionTriple::parse("13").unwrap().encode(), 13 << 16);
        assert!(VersionTriple::parse("1.2.3.4").is_err());
        assert!(VersionTriple::parse("abc").is_err());
    }

    #[test]
    fn pagezero_defaults() {
        let exe = parse(&["main.o"]).unwrap();
        assert_eq!(exe.pagezero_size, 1 << 32);
        let dylib = parse(&["-dylib", "main.o"]).unwrap();
        assert_eq!(dylib.pagezero_size, 0);
        assert_eq!(dylib.install_name, "a.out");
    }

    #[test]
    fn load_modifiers() {
        let opts = parse(&["-weak-lfoo", "-reexport-lbar", "-force_load", "a.a"]).unwrap();
        assert!(matches!(&opts.inputs[0], InputSpec::Library(l, m) if l == "foo" && m.weak));
        assert!(matches!(&opts.inputs[1], InputSpec::Library(l, m) if l == "bar" && m.reexport));
        assert!(matches!(&opts.inputs[2], InputSpec::File(p, m) if p == "a.a" && m.force_load));
    }

    #[test]
    fn unknown_option_is_an_error() {
        assert!(parse(&["--not-a-thing"]).is_err());
        assert!(parse(&["-o"]).is_err());
    }
}
