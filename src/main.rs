//! Entry point for pekexec.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Set up logging.
//! 3. Read the image into a private working copy.
//! 4. Prepare it with the `X86_64` backend (the only supported architecture).
//! 5. Print the layout, and with `--load` hand it to kexec_load(2).
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pekexec::arch::x86_64::X86_64;
use pekexec::config::Config;
use pekexec::image::ImageBuffer;
use pekexec::kexec::{KexecFlags, KexecLoad};
use pekexec::loader::Loader;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let (name, mut image) = match &config.image {
        Some(path) => (
            path.display().to_string(),
            ImageBuffer::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => (
            "<stdin>".to_string(),
            ImageBuffer::read_from(std::io::stdin().lock()).context("failed to read stdin")?,
        ),
    };

    let loader = Loader::new(X86_64, config.loader_config());
    let prepared = loader
        .prepare(&mut image)
        .with_context(|| format!("segment parsing failed for {name}"))?;

    println!(
        "{name}: image base {:#x}, loaded at {:#x}, entry {:#x}, {} relocations",
        prepared.plan.image_base,
        prepared.plan.chosen_base,
        prepared.entry(),
        prepared.relocations.applied
    );
    for segment in prepared.plan.segments.iter() {
        println!("  segment {segment}");
    }
    for reservation in prepared.layout.reservations() {
        println!("  reserve {}", reservation.phys());
    }

    if !config.load {
        return Ok(());
    }

    let mut flags = KexecFlags::empty();
    if config.on_crash {
        flags |= KexecFlags::ON_CRASH;
    }
    if config.preserve_context {
        flags |= KexecFlags::PRESERVE_CONTEXT;
    }
    loader
        .execute(&prepared, &image, &mut KexecLoad, flags)
        .context("kexec load failed")?;

    println!("Loaded {name}; it will run on the next kexec reboot");
    Ok(())
}
