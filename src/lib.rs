//! PE kexec loader library.
//!
//! This library prepares a PE32+ kernel image for kexec_load(2).
//! It is organized into several modules:
//! - `config`: CLI configuration and load-address policy.
//! - `arch`: Architecture-specific backend logic.
//! - `pe`: PE header and section table parsing.
//! - `segment`: Physical address ranges and buffer-to-physical segments.
//! - `builder`: Load base selection and segment construction.
//! - `reloc`: Base relocation parsing and patching.
//! - `layout`: Page alignment, merging and validation of segments.
//! - `kexec`: Handoff to the load primitive.
//! - `loader`: The main orchestration.
//! - `image`: Private working copies of image files.

pub mod arch;
pub mod builder;
pub mod config;
pub mod error;
pub mod image;
pub mod kexec;
pub mod layout;
pub mod loader;
pub mod pe;
pub mod reloc;
pub mod segment;
pub mod utils;

pub use error::{Error, Result, Unsupported};
