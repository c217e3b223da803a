/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

/// Print a message (with implicit newline) to stderr. This should be used
/// for all macld output: the linker's stdout belongs to build systems that
/// parse it.
macro_rules! echo {
    ($($arg:tt)+) => {
        eprintln!($($arg)+)
    };
    () => {
        eprintln!()
    };
}

/// Prints a log message unconditionally. Use this for warnings.
///
/// The message is prefixed with the module path, so it is clear where it
/// comes from.
macro_rules! log {
    ($($arg:tt)+) => {
        echo!("{}: {}", module_path!(), format_args!($($arg)+));
    }
}

/// Like [log], but prints the message only if debugging is enabled for the
/// module where it is used. This can be used for verbose things only needed
/// when debugging a link.
macro_rules! log_dbg {
    ($($arg:tt)+) => {
        if $crate::log::ENABLED_MODULES.contains(&module_path!()) {
            log!($($arg)*);
        }
    }
}

/// Report a recoverable link error. The link continues so that further
/// errors can be reported, and exits with status 1 at the next
/// [checkpoint][crate::context::Context::checkpoint].
macro_rules! error {
    ($ctx:expr, $($arg:tt)+) => {
        {
            echo!("macld: error: {}", format_args!($($arg)+));
            $ctx.has_error.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

/// Report an unrecoverable error (structural corruption in an input file,
/// usually), delete the partially written output and exit immediately.
macro_rules! fatal {
    ($ctx:expr, $($arg:tt)+) => {
        {
            echo!("macld: fatal: {}", format_args!($($arg)+));
            $crate::context::cleanup_and_exit($ctx)
        }
    }
}

/// Put modules to enable [log_dbg] for here, e.g. "macld::resolve" to see
/// which archive members get claimed and why.
pub const ENABLED_MODULES: &[&str] = &[];
