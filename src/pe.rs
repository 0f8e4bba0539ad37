//! PE structural view.
//!
//! Parses just enough of a PE image to drive loading: the machine type, the
//! optional header's image base and entry point, and the section table. The
//! view owns no image bytes, so it can be dropped before the buffer is
//! relocated in place.

use object::pe;
use object::read::pe::{optional_header_magic, ImageNtHeaders, ImageOptionalHeader};
use object::LittleEndian as LE;

use crate::arch::Architecture;
use crate::error::{Error, Result, Unsupported};
use crate::segment::Range;

/// Name of the section holding base relocations.
pub const RELOC_SECTION: &str = ".reloc";

/// A section table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// `PointerToRawData`.
    pub file_offset: u32,
    /// `SizeOfRawData`.
    pub file_size: u32,
    /// Relative to the image base.
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub characteristics: u32,
}

impl Section {
    fn from_header(header: &pe::ImageSectionHeader) -> Self {
        Self {
            name: String::from_utf8_lossy(header.raw_name()).into_owned(),
            file_offset: header.pointer_to_raw_data.get(LE),
            file_size: header.size_of_raw_data.get(LE),
            virtual_address: header.virtual_address.get(LE),
            virtual_size: header.virtual_size.get(LE),
            characteristics: header.characteristics.get(LE),
        }
    }

    /// "The section can be discarded as needed." Usually `.reloc`.
    pub fn is_discardable(&self) -> bool {
        self.characteristics & pe::IMAGE_SCN_MEM_DISCARDABLE != 0
    }

    /// Range of the raw section data within the file.
    pub fn file_range(&self) -> Range {
        // Both halves are u32, so the sum always fits.
        Range::new(self.file_offset.into(), self.file_size.into()).unwrap_or_default()
    }

    /// Size of the section once loaded. Falls back to the raw size for
    /// linkers that leave `VirtualSize` zero.
    pub fn loaded_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.file_size
        } else {
            self.virtual_size
        }
    }

    /// Raw section bytes from the image they were parsed from.
    pub fn data<'d>(&self, image: &'d [u8]) -> Result<&'d [u8]> {
        self.file_range()
            .as_usize()
            .and_then(|r| image.get(r))
            .ok_or_else(|| {
                Error::format(format!(
                    "section {} raw data {} lies outside the {:#x} byte image",
                    self.name,
                    self.file_range(),
                    image.len()
                ))
            })
    }
}

/// The optional header, discriminated by its magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionalHeader {
    Pe32 {
        image_base: u32,
        address_of_entry_point: u32,
    },
    Pe64 {
        image_base: u64,
        address_of_entry_point: u32,
    },
}

/// Read-only projection of a 64-bit PE image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeImage {
    pub machine: u16,
    pub characteristics: u16,
    pub image_base: u64,
    pub address_of_entry_point: u32,
    /// In file order.
    pub sections: Vec<Section>,
}

struct Headers {
    machine: u16,
    characteristics: u16,
    optional_header: OptionalHeader,
    sections: Vec<Section>,
}

impl PeImage {
    /// Parses `data` as a PE32+ image for `arch`.
    pub fn parse<A: Architecture>(data: &[u8], arch: &A) -> Result<Self> {
        let headers = match optional_header_magic(data)? {
            pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC => parse_headers::<pe::ImageNtHeaders64>(data)?,
            pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC => parse_headers::<pe::ImageNtHeaders32>(data)?,
            magic => {
                return Err(Error::format(format!(
                    "invalid optional header magic {magic:#x}"
                )))
            }
        };

        let (image_base, address_of_entry_point) = match headers.optional_header {
            OptionalHeader::Pe32 { .. } => return Err(Unsupported::OptionalHeader32.into()),
            OptionalHeader::Pe64 {
                image_base,
                address_of_entry_point,
            } => (image_base, address_of_entry_point),
        };

        if headers.machine != arch.machine() {
            return Err(Unsupported::Machine(headers.machine).into());
        }

        tracing::debug!("file characteristics: {:#x}", headers.characteristics);
        tracing::debug!("image base: {:#x}", image_base);

        Ok(Self {
            machine: headers.machine,
            characteristics: headers.characteristics,
            image_base,
            address_of_entry_point,
            sections: headers.sections,
        })
    }

    /// The base relocation section, if the image has one.
    pub fn reloc_section(&self) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == RELOC_SECTION)
    }
}

fn parse_headers<Pe: ImageNtHeaders>(data: &[u8]) -> Result<Headers> {
    let dos_header = pe::ImageDosHeader::parse(data)?;
    let mut offset = dos_header.nt_headers_offset().into();
    let (nt_headers, _data_directories) = Pe::parse(data, &mut offset)?;

    let file_header = nt_headers.file_header();
    let optional = nt_headers.optional_header();
    let optional_header = if optional.magic() == pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC {
        OptionalHeader::Pe32 {
            image_base: optional.image_base() as u32,
            address_of_entry_point: optional.address_of_entry_point(),
        }
    } else {
        OptionalHeader::Pe64 {
            image_base: optional.image_base(),
            address_of_entry_point: optional.address_of_entry_point(),
        }
    };

    let sections = nt_headers
        .sections(data, offset)?
        .iter()
        .map(Section::from_header)
        .collect();

    Ok(Headers {
        machine: file_header.machine.get(LE),
        characteristics: file_header.characteristics.get(LE),
        optional_header,
        sections,
    })
}
