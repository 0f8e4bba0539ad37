//! Configuration module.
//!
//! This module defines the command-line interface (CLI) using `clap` and the
//! load-address policy shared by the library.

use clap::Parser;
use std::path::PathBuf;

use crate::utils::parse_u64;

/// Default physical base for images linked at address zero.
///
/// Under QEMU on Linux this physical address usually happens to be free. It is
/// a heuristic, not an allocation.
pub const DEFAULT_FALLBACK_BASE: u64 = 0x1000_0000;

/// Added to a non-zero image base so relocations are always exercised.
pub const DEFAULT_REBASE_OFFSET: u64 = 0x1000;

pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

/// Load-address policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Granularity of physical reservations. Must be a power of two.
    pub page_size: u64,
    /// Base used when the image's preferred base is zero.
    pub fallback_base: u64,
    /// Offset added to a non-zero preferred base.
    pub rebase_offset: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fallback_base: DEFAULT_FALLBACK_BASE,
            rebase_offset: DEFAULT_REBASE_OFFSET,
        }
    }
}

/// Prepare a PE32+ kernel image for kexec.
///
/// Lays out the image's sections as physical segments, applies base
/// relocations for the chosen load address and prints the resulting layout.
/// With `--load`, hands the segments to kexec_load(2).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// PE image to load (reads stdin when omitted)
    pub image: Option<PathBuf>,

    /// Pass the prepared image to kexec_load(2)
    #[arg(long)]
    pub load: bool,

    /// Load as the crash kernel (KEXEC_ON_CRASH)
    #[arg(long, requires = "load")]
    pub on_crash: bool,

    /// Preserve system context across the jump (KEXEC_PRESERVE_CONTEXT)
    #[arg(long, requires = "load")]
    pub preserve_context: bool,

    /// Physical base for images linked at address zero
    #[arg(long, value_parser = parse_u64, default_value = "0x10000000")]
    pub fallback_base: u64,

    /// Offset added to a non-zero image base
    #[arg(long, value_parser = parse_u64, default_value = "0x1000")]
    pub rebase_offset: u64,

    /// Page size used to align physical segments
    #[arg(long, value_parser = parse_page_size, default_value = "0x1000")]
    pub page_size: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

impl Config {
    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            page_size: self.page_size,
            fallback_base: self.fallback_base,
            rebase_offset: self.rebase_offset,
        }
    }
}

fn parse_page_size(s: &str) -> Result<u64, String> {
    let size = parse_u64(s).map_err(|e| e.to_string())?;
    if !size.is_power_of_two() {
        return Err(format!("{size:#x} is not a power of two"));
    }
    Ok(size)
}
