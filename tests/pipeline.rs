mod common;

use common::{dir64, read_u64, reloc_block, PeBuilder, Recorder};
use object::pe;
use pekexec::arch::x86_64::X86_64;
use pekexec::config::LoaderConfig;
use pekexec::image::ImageBuffer;
use pekexec::kexec::KexecFlags;
use pekexec::loader::Loader;
use pekexec::reloc::RelocStats;
use pekexec::segment::Range;
use pekexec::{Error, Unsupported};

const PAGE: u64 = 0x1000;
const EBUSY: i32 = 16;

fn loader() -> Loader<X86_64> {
    Loader::new(X86_64, LoaderConfig::default())
}

/// `.text` at rva 0x1000 with `value` stored at offset 0x20.
fn text_with_pointer(value: u64) -> Vec<u8> {
    let mut text = vec![0xccu8; 0x100];
    text[0x20..0x28].copy_from_slice(&value.to_le_bytes());
    text
}

#[test]
fn test_relocates_dir64() {
    let builder = PeBuilder::new(0x10000)
        .text(0x1000, text_with_pointer(0x0000_0000_1000_1000))
        .reloc(0x2000, reloc_block(0x1000, &[dir64(0x20)]));
    let mut image = builder.build();

    let prepared = loader().prepare(&mut image).unwrap();
    assert_eq!(prepared.plan.chosen_base, 0x11000);
    assert_eq!(prepared.entry(), 0x12000);
    assert_eq!(
        prepared.relocations,
        RelocStats {
            blocks: 1,
            applied: 1,
            skipped: 0
        }
    );

    let expected = 0x1000_1000 + (0x11000 - 0x10000);
    assert_eq!(read_u64(&image, builder.raw_offset(0) + 0x20), expected);

    // The same bytes, found through the physical address they will occupy.
    let at = Range::new(prepared.plan.chosen_base + 0x1020, 8).unwrap();
    let view = prepared.plan.segments.phys(&image, at).unwrap();
    assert_eq!(u64::from_le_bytes(view.try_into().unwrap()), expected);
}

#[test]
fn test_zero_image_base_uses_fallback() {
    let builder = PeBuilder::new(0)
        .text(0x1000, text_with_pointer(0x1040))
        .reloc(0x2000, reloc_block(0x1000, &[dir64(0x20), 0]));
    let mut image = builder.build();

    let prepared = loader().prepare(&mut image).unwrap();
    assert_eq!(prepared.plan.chosen_base, 0x1000_0000);
    assert_eq!(prepared.relocations.skipped, 1);
    assert_eq!(read_u64(&image, builder.raw_offset(0) + 0x20), 0x1000_1040);
}

#[test]
fn test_no_reloc_section() {
    let mut image = PeBuilder::new(0x10000)
        .text(0x1000, text_with_pointer(0x1000_1000))
        .build();
    let original = image.clone();

    let prepared = loader().prepare(&mut image).unwrap();
    assert_eq!(prepared.relocations, RelocStats::default());
    assert_eq!(image, original);
}

#[test]
fn test_discardable_sections_are_not_loaded() {
    let mut image = PeBuilder::new(0x10000)
        .text(0x1000, text_with_pointer(0x1000_1000))
        .reloc(0x2000, reloc_block(0x1000, &[dir64(0x20)]))
        .build();

    let prepared = loader().prepare(&mut image).unwrap();
    // Headers and .text only.
    assert_eq!(prepared.plan.segments.len(), 2);
    assert!(!prepared.layout.phys_contains(0x11000 + 0x2000));
}

#[test]
fn test_pe32_is_unsupported() {
    let mut image = PeBuilder::new(0x10000)
        .pe32()
        .text(0x1000, vec![0x90; 0x10])
        .build();
    let err = loader().prepare(&mut image).unwrap_err();
    assert!(matches!(err, Error::Unsupported(Unsupported::OptionalHeader32)), "{err}");
}

#[test]
fn test_foreign_machine_is_unsupported() {
    let mut image = PeBuilder::new(0x10000)
        .machine(pe::IMAGE_FILE_MACHINE_ARM64)
        .text(0x1000, vec![0x90; 0x10])
        .build();
    let err = loader().prepare(&mut image).unwrap_err();
    assert!(
        matches!(err, Error::Unsupported(Unsupported::Machine(pe::IMAGE_FILE_MACHINE_ARM64))),
        "{err}"
    );
}

#[test]
fn test_unknown_relocation_type() {
    let builder = PeBuilder::new(0x10000)
        .text(0x1000, text_with_pointer(0x1000_1000))
        .reloc(0x2000, reloc_block(0x1000, &[dir64(0x20), (7 << 12) | 0x30]));
    let mut image = builder.build();

    let err = loader().prepare(&mut image).unwrap_err();
    assert!(
        matches!(
            err,
            Error::Unsupported(Unsupported::RelocationType { kind: 7, .. })
        ),
        "{err}"
    );
}

#[test]
fn test_relocation_outside_segments() {
    // Points into the discardable .reloc section, which is never loaded.
    let mut image = PeBuilder::new(0x10000)
        .text(0x1000, text_with_pointer(0x1000_1000))
        .reloc(0x2000, reloc_block(0x2000, &[dir64(0x0)]))
        .build();

    let err = loader().prepare(&mut image).unwrap_err();
    assert!(
        matches!(err, Error::RelocationOutOfRange { address: 0x13000 }),
        "{err}"
    );
}

#[test]
fn test_truncated_relocation_block() {
    // Claims more entries than the whole section holds.
    let mut block = reloc_block(0x1000, &[dir64(0x20)]);
    block[4..8].copy_from_slice(&0x400u32.to_le_bytes());
    let mut image = PeBuilder::new(0x10000)
        .text(0x1000, text_with_pointer(0x1000_1000))
        .reloc(0x2000, block)
        .build();

    let err = loader().prepare(&mut image).unwrap_err();
    assert!(err.is_format(), "{err}");
}

#[test]
fn test_relocation_errors_follow_table_order() {
    let mut truncated = reloc_block(0x1000, &[dir64(0x28)]);
    truncated[4..8].copy_from_slice(&0x400u32.to_le_bytes());

    let mut table = reloc_block(0x1000, &[dir64(0x20), (7 << 12) | 0x30]);
    table.extend(&truncated);
    let mut image = PeBuilder::new(0x10000)
        .text(0x1000, text_with_pointer(0x1000_1000))
        .reloc(0x2000, table)
        .build();
    let err = loader().prepare(&mut image).unwrap_err();
    assert!(
        matches!(err, Error::Unsupported(Unsupported::RelocationType { kind: 7, .. })),
        "{err}"
    );

    let mut table = reloc_block(0x5000, &[dir64(0x0)]);
    table.extend(&truncated);
    let mut image = PeBuilder::new(0x10000)
        .text(0x1000, text_with_pointer(0x1000_1000))
        .reloc(0x2000, table)
        .build();
    let err = loader().prepare(&mut image).unwrap_err();
    assert!(
        matches!(err, Error::RelocationOutOfRange { address: 0x16000 }),
        "{err}"
    );
}

#[test]
fn test_truncated_image() {
    let builder = PeBuilder::new(0x10000).text(0x1000, vec![0x90; 0x100]);
    let mut image = builder.build();
    image.truncate(builder.raw_offset(0) + 0x80);

    let err = loader().prepare(&mut image).unwrap_err();
    assert!(err.is_format(), "{err}");
}

#[test]
fn test_entry_outside_image_is_never_loaded() {
    let mut image = PeBuilder::new(0x10000)
        .entry(0x9000)
        .text(0x1000, vec![0x90; 0x100])
        .build();

    let mut recorder = Recorder::default();
    let err = loader()
        .load(&mut image, &mut recorder, KexecFlags::empty())
        .unwrap_err();
    assert!(matches!(err, Error::EntryNotMapped { entry: 0x1a000 }), "{err}");
    assert!(recorder.calls.is_empty());
}

#[test]
fn test_handoff() {
    let builder = PeBuilder::new(0x10000)
        .entry(0x1010)
        .text(0x1000, text_with_pointer(0x1000_1000))
        .reloc(0x2000, reloc_block(0x1000, &[dir64(0x20)]));
    let mut image = builder.build();

    let mut recorder = Recorder::default();
    let prepared = loader()
        .load(&mut image, &mut recorder, KexecFlags::ON_CRASH)
        .unwrap();

    assert_eq!(recorder.calls.len(), 1);
    let (entry, segments, flags) = &recorder.calls[0];
    assert_eq!(*entry, 0x12010);
    assert_eq!(*entry, prepared.entry());
    assert_eq!(flags.bits(), 1 | (62 << 16));

    // Headers and .text share one page-aligned reservation.
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].phys, Range::new(0x11000, 0x2000).unwrap());
    for s in segments {
        assert!(s.phys.is_aligned(PAGE));
        assert!(s.buf.size() <= s.phys.size());
    }

    // The staged bytes carry the relocated pointer at its physical address.
    let staged = prepared.layout.stage(&image).unwrap();
    let at = (0x12020 - staged[0].phys.start()) as usize;
    assert_eq!(read_u64(&staged[0].data, at), 0x1000_2000);
}

#[test]
fn test_handoff_failure_is_reported() {
    let mut image = PeBuilder::new(0x10000)
        .text(0x1000, vec![0x90; 0x100])
        .build();

    let mut recorder = Recorder {
        fail_with: Some(EBUSY),
        ..Default::default()
    };
    let err = loader()
        .load(&mut image, &mut recorder, KexecFlags::empty())
        .unwrap_err();
    let kexec = match err {
        Error::LoadPrimitive(kexec) => kexec,
        other => panic!("unexpected error {other}"),
    };
    assert_eq!(kexec.entry, 0x12000);
    assert_eq!(kexec.errno, EBUSY);
    assert_eq!(kexec.segments, recorder.calls[0].1);
}

#[test]
fn test_backing_file_untouched() {
    let builder = PeBuilder::new(0x10000)
        .text(0x1000, text_with_pointer(0x1000_1000))
        .reloc(0x2000, reloc_block(0x1000, &[dir64(0x20)]));
    let original = builder.build();
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), &original).unwrap();

    let mut image = ImageBuffer::open(file.path()).unwrap();
    loader().prepare(&mut image).unwrap();
    assert_eq!(read_u64(&image, builder.raw_offset(0) + 0x20), 0x1000_2000);
    drop(image);

    assert_eq!(std::fs::read(file.path()).unwrap(), original);
}
