//! In-memory working copy of an image.
//!
//! Relocation patches the image in place, so the loader always works on a
//! private copy: either a copy-on-write mapping of the file or bytes read from
//! a stream. Writes never reach the backing file.

use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::io::Read;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use crate::error::Result;

pub enum ImageBuffer {
    Mapped(MmapMut),
    Owned(Vec<u8>),
}

impl ImageBuffer {
    /// Maps `path` privately. Pages are copied only when written.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            // Zero-length mappings are rejected by the kernel.
            return Ok(Self::Owned(Vec::new()));
        }
        // SAFETY: the mapping is private, so our writes are not shared. Another
        // process truncating the file while it is mapped would fault; the
        // loader holds the image only for one load.
        let mmap = unsafe { MmapOptions::new().map_copy(&file)? };
        Ok(Self::Mapped(mmap))
    }

    /// Reads `reader` to the end.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(Self::Owned(buf))
    }
}

impl From<Vec<u8>> for ImageBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self::Owned(v)
    }
}

impl Deref for ImageBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Owned(v) => v,
        }
    }
}

impl DerefMut for ImageBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Owned(v) => v,
        }
    }
}
