use crate::error::{Error, Result, corrupt_image};
use crate::events::{MapEvent, MapObserver};
use crate::pe_helpers::{PeHeaders, read_u16, read_u32, read_u64, write_u64};
use crate::pe_types::*;
use crate::reflective::{FailurePolicy, MapReport};

/// Bounds-checked view of one `IMAGE_BASE_RELOCATION` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelocationBlock {
    pub page_rva: u32,
    pub size_of_block: u32,
    offset: usize,
}

impl RelocationBlock {
    pub fn read(image: &[u8], offset: usize) -> Result<Self> {
        let (Some(page_rva), Some(size_of_block)) = (read_u32(image, offset), read_u32(image, offset + 4)) else {
            return Err(corrupt_image!("relocation block at 0x{offset:X} runs past the image"));
        };
        if (size_of_block as usize) < BASE_RELOCATION_SIZE {
            return Err(corrupt_image!("relocation block at 0x{offset:X} has size {size_of_block}"));
        }
        if offset + size_of_block as usize > image.len() {
            return Err(corrupt_image!("relocation block at 0x{offset:X} runs past the image"));
        }
        Ok(Self { page_rva, size_of_block, offset })
    }

    /// `(type, offset in page)` pairs packed in the block.
    pub fn entries<'a>(&self, image: &'a [u8]) -> impl Iterator<Item = (u8, u16)> + 'a {
        let first = self.offset + BASE_RELOCATION_SIZE;
        let count = (self.size_of_block as usize - BASE_RELOCATION_SIZE) / 2;
        (0..count).filter_map(move |i| read_u16(image, first + i * 2)).map(|entry| ((entry >> 12) as u8, entry & 0xFFF))
    }
}

/// Rebases the mapped `image` from its preferred base to `load_address`.
///
/// Only `IMAGE_REL_BASED_DIR64` entries are patched; padding entries are skipped and any other
/// type is reported and ignored.
pub(crate) fn apply_relocations(
    image: &mut [u8],
    headers: &PeHeaders,
    load_address: u64,
    policy: FailurePolicy,
    report: &mut MapReport,
    observer: &mut dyn MapObserver,
) -> Result<()> {
    let delta = load_address.wrapping_sub(headers.image_base);
    report.delta = delta;

    let directory = headers.directory(IMAGE_DIRECTORY_ENTRY_BASERELOC);
    if !directory.is_present() || directory.size == 0 {
        if delta != 0 {
            observer.on_event(&MapEvent::RelocationsStripped { preferred: headers.image_base, actual: load_address });
            if policy == FailurePolicy::Strict {
                return Err(Error::NotRelocatable { preferred: headers.image_base, actual: load_address });
            }
        }
        return Ok(());
    }
    if delta == 0 {
        return Ok(());
    }

    let start = directory.virtual_address as usize;
    let mut consumed = 0usize;
    let mut applied = 0usize;

    while consumed < directory.size as usize {
        let block = RelocationBlock::read(image, start + consumed)?;
        let entries: Vec<(u8, u16)> = block.entries(image).collect();

        for (kind, offset) in entries {
            let rva = block.page_rva.wrapping_add(offset as u32);
            match kind {
                IMAGE_REL_BASED_ABSOLUTE => {}
                IMAGE_REL_BASED_DIR64 => {
                    let Some(value) = read_u64(image, rva as usize) else {
                        observer.on_event(&MapEvent::RelocationOutOfRange { rva });
                        if policy == FailurePolicy::Strict {
                            return Err(corrupt_image!("relocation target 0x{rva:X} is outside the image"));
                        }
                        report.skipped_relocations += 1;
                        continue;
                    };
                    write_u64(image, rva as usize, value.wrapping_add(delta));
                    applied += 1;
                }
                _ => {
                    observer.on_event(&MapEvent::UnsupportedRelocation { kind, rva });
                    report.skipped_relocations += 1;
                }
            }
        }

        consumed += block.size_of_block as usize;
    }

    report.applied_relocations = applied;
    observer.on_event(&MapEvent::RelocationsApplied { count: applied, delta });
    Ok(())
}
