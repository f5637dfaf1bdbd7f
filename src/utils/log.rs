//! Logging utilities with colored output.
//!
//! This module provides:
//! - `log!` macro for formatted terminal output with colored prefixes
//! - `debug!` macro for lines only shown with `--verbose`
//!
//! # Example
//!
//! ```ignore
//! log!("git"; "found {} refs", count);
//! debug!("export"; "{sha} -> {}", target.display());
//! ```

use colored::{ColoredString, Colorize};
use crossterm::{
    execute,
    terminal::{Clear, ClearType, size},
};
use std::{
    io::{Write, stderr},
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

/// Cached terminal width (fetched once on first use)
static TERMINAL_WIDTH: OnceLock<u16> = OnceLock::new();

/// Whether `debug!` lines are printed
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Length of brackets around module name: "[]"
const BRACKET_LEN: usize = 2;
/// Space after prefix: "[module] " <- this space
const SPACE_AFTER_PREFIX: usize = 1;

/// Calculate total prefix length for a module name.
///
/// Returns: `module.len() + 3` (for "[", "]", and trailing space)
#[inline]
const fn calc_prefix_len(module_len: usize) -> usize {
    module_len + BRACKET_LEN + SPACE_AFTER_PREFIX
}

/// Get terminal width, cached after first call.
/// Falls back to 120 columns if detection fails.
fn get_terminal_width() -> u16 {
    *TERMINAL_WIDTH.get_or_init(|| size().map(|(w, _)| w).unwrap_or(120))
}

// ============================================================================
// Macros
// ============================================================================

/// Log a message with a colored module prefix.
///
/// # Usage
/// ```ignore
/// log!("module"; "message with {} formatting", args);
/// ```
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::utils::log::log($module, &format!($($arg)*))
    }};
}

/// Log a message only when verbose output is enabled.
#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::utils::log::is_verbose() {
            $crate::utils::log::log($module, &format!($($arg)*))
        }
    }};
}

// ============================================================================
// Setup
// ============================================================================

/// Configure verbosity and colors once at startup.
pub fn setup(verbose: bool, colors: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
    if !colors {
        colored::control::set_override(false);
    }
}

#[inline]
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Log a message with a colored module prefix.
///
/// Long single-line messages are truncated to the terminal width, except
/// warnings and errors. Multi-line messages (command output) are printed as-is.
#[inline]
pub fn log(module: &str, message: &str) {
    let module_lower = module.to_ascii_lowercase();
    let prefix = colorize_prefix(module, &module_lower);
    let width = get_terminal_width() as usize;

    let mut out = stderr().lock();
    execute!(out, Clear(ClearType::UntilNewLine)).ok();

    let prefix_len = calc_prefix_len(module.len());
    let max_msg_len = width.saturating_sub(prefix_len);

    let message = fit_message(&module_lower, message, max_msg_len);

    writeln!(out, "{prefix} {message}").ok();
    out.flush().ok();
}

/// Message as printed after a prefix leaving `max_len` columns.
///
/// Warnings and errors name the version they are about, so they are never cut.
fn fit_message<'a>(module_lower: &str, message: &'a str, max_len: usize) -> &'a str {
    if matches!(module_lower, "warn" | "error") || message.contains('\n') {
        return message;
    }
    truncate_str(message, max_len)
}

/// Apply color to a module prefix based on module type.
#[inline]
fn colorize_prefix(module: &str, module_lower: &str) -> ColoredString {
    let prefix = format!("[{module}]");
    match module_lower {
        "build" => prefix.bright_blue().bold(),
        "push" => prefix.bright_green().bold(),
        "warn" => prefix.bright_magenta().bold(),
        "error" => prefix.bright_red().bold(),
        _ => prefix.bright_yellow().bold(),
    }
}

/// Truncate a string to fit within max_len bytes.
///
/// Ensures the result is valid UTF-8 by finding the nearest character boundary.
#[inline]
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ============================================================================
// Tests
// ============================================================================
