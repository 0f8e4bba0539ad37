//! Synthetic PE images for integration tests.

#![allow(dead_code)]

use object::pe;
use pekexec::kexec::{KexecFlags, LoadPrimitive, RawSegment};

const NT_HEADERS_OFFSET: usize = 0x80;
const FILE_HEADER_OFFSET: usize = NT_HEADERS_OFFSET + 4;
const OPTIONAL_HEADER_OFFSET: usize = FILE_HEADER_OFFSET + 20;
const SECTION_HEADER_SIZE: usize = 40;
pub const FILE_ALIGNMENT: usize = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;

pub struct SectionSpec {
    pub name: &'static str,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub data: Vec<u8>,
    pub characteristics: u32,
}

/// Builds a minimal PE image: DOS stub header, NT headers, section table and
/// file-aligned raw section data.
pub struct PeBuilder {
    machine: u16,
    pe32: bool,
    image_base: u64,
    entry: u32,
    sections: Vec<SectionSpec>,
}

impl PeBuilder {
    pub fn new(image_base: u64) -> Self {
        Self {
            machine: pe::IMAGE_FILE_MACHINE_AMD64,
            pe32: false,
            image_base,
            entry: 0x1000,
            sections: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn pe32(mut self) -> Self {
        self.pe32 = true;
        self
    }

    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    pub fn text(self, virtual_address: u32, data: Vec<u8>) -> Self {
        let size = data.len() as u32;
        self.section(SectionSpec {
            name: ".text",
            virtual_address,
            virtual_size: size,
            data,
            characteristics: pe::IMAGE_SCN_CNT_CODE
                | pe::IMAGE_SCN_MEM_EXECUTE
                | pe::IMAGE_SCN_MEM_READ,
        })
    }

    pub fn reloc(self, virtual_address: u32, data: Vec<u8>) -> Self {
        let size = data.len() as u32;
        self.section(SectionSpec {
            name: ".reloc",
            virtual_address,
            virtual_size: size,
            data,
            characteristics: pe::IMAGE_SCN_CNT_INITIALIZED_DATA
                | pe::IMAGE_SCN_MEM_DISCARDABLE
                | pe::IMAGE_SCN_MEM_READ,
        })
    }

    pub fn section(mut self, section: SectionSpec) -> Self {
        self.sections.push(section);
        self
    }

    fn optional_header_size(&self) -> usize {
        // Fixed fields plus 16 data directories.
        if self.pe32 {
            96 + 128
        } else {
            112 + 128
        }
    }

    fn headers_size(&self) -> usize {
        let end = OPTIONAL_HEADER_OFFSET
            + self.optional_header_size()
            + SECTION_HEADER_SIZE * self.sections.len();
        align(end, FILE_ALIGNMENT)
    }

    /// File offset of section `index`'s raw data.
    pub fn raw_offset(&self, index: usize) -> usize {
        self.headers_size()
            + self.sections[..index]
                .iter()
                .map(|s| align(s.data.len(), FILE_ALIGNMENT))
                .sum::<usize>()
    }

    pub fn build(&self) -> Vec<u8> {
        let total = self.raw_offset(self.sections.len());
        let mut out = vec![0u8; total];

        out[0..2].copy_from_slice(b"MZ");
        put32(&mut out, 0x3c, NT_HEADERS_OFFSET as u32);
        out[NT_HEADERS_OFFSET..NT_HEADERS_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let fh = FILE_HEADER_OFFSET;
        put16(&mut out, fh, self.machine);
        put16(&mut out, fh + 2, self.sections.len() as u16);
        put16(&mut out, fh + 16, self.optional_header_size() as u16);
        put16(
            &mut out,
            fh + 18,
            pe::IMAGE_FILE_EXECUTABLE_IMAGE | pe::IMAGE_FILE_LARGE_ADDRESS_AWARE,
        );

        let size_of_image = self
            .sections
            .iter()
            .map(|s| s.virtual_address + align(s.virtual_size as usize, SECTION_ALIGNMENT as usize) as u32)
            .max()
            .unwrap_or(SECTION_ALIGNMENT);

        let oh = OPTIONAL_HEADER_OFFSET;
        put32(&mut out, oh + 16, self.entry);
        put32(&mut out, oh + 32, SECTION_ALIGNMENT);
        put32(&mut out, oh + 36, FILE_ALIGNMENT as u32);
        put32(&mut out, oh + 56, size_of_image);
        put32(&mut out, oh + 60, self.headers_size() as u32);
        put16(&mut out, oh + 68, pe::IMAGE_SUBSYSTEM_EFI_APPLICATION);
        if self.pe32 {
            put16(&mut out, oh, pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC);
            put32(&mut out, oh + 28, self.image_base as u32);
            put32(&mut out, oh + 92, 16);
        } else {
            put16(&mut out, oh, pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC);
            put64(&mut out, oh + 24, self.image_base);
            put32(&mut out, oh + 108, 16);
        }

        let table = oh + self.optional_header_size();
        for (i, s) in self.sections.iter().enumerate() {
            let at = table + i * SECTION_HEADER_SIZE;
            let raw = self.raw_offset(i);
            out[at..at + s.name.len()].copy_from_slice(s.name.as_bytes());
            put32(&mut out, at + 8, s.virtual_size);
            put32(&mut out, at + 12, s.virtual_address);
            put32(&mut out, at + 16, align(s.data.len(), FILE_ALIGNMENT) as u32);
            put32(&mut out, at + 20, raw as u32);
            put32(&mut out, at + 36, s.characteristics);
            out[raw..raw + s.data.len()].copy_from_slice(&s.data);
        }
        out
    }
}

/// Encodes one base relocation block.
pub fn reloc_block(page_rva: u32, entries: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&page_rva.to_le_bytes());
    out.extend_from_slice(&(8 + 2 * entries.len() as u32).to_le_bytes());
    for e in entries {
        out.extend_from_slice(&e.to_le_bytes());
    }
    out
}

pub fn dir64(offset: u16) -> u16 {
    (pe::IMAGE_REL_BASED_DIR64 << 12) | offset
}

pub fn read_u64(image: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(image[at..at + 8].try_into().unwrap())
}

fn align(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

fn put16(out: &mut [u8], at: usize, v: u16) {
    out[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(out: &mut [u8], at: usize, v: u32) {
    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(out: &mut [u8], at: usize, v: u64) {
    out[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Records handoffs instead of performing them.
#[derive(Default)]
pub struct Recorder {
    pub calls: Vec<(u64, Vec<RawSegment>, KexecFlags)>,
    pub fail_with: Option<i32>,
}

impl LoadPrimitive for Recorder {
    fn raw_load(&mut self, entry: u64, segments: &[RawSegment], flags: KexecFlags) -> Result<(), i32> {
        self.calls.push((entry, segments.to_vec(), flags));
        self.fail_with.map_or(Ok(()), Err)
    }
}
