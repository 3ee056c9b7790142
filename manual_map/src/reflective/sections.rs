use crate::error::{Result, corrupt_image};
use crate::events::{MapEvent, MapObserver};
use crate::pe_helpers::PeHeaders;

/// Checks that the headers and every section body fit both the source file and an image of
/// `SizeOfImage` bytes. Runs before the destination is allocated.
pub(crate) fn validate_layout(raw: &[u8], headers: &PeHeaders) -> Result<()> {
    let size_of_image = headers.size_of_image as u64;
    let size_of_headers = headers.size_of_headers as u64;

    if size_of_headers > raw.len() as u64 || size_of_headers > size_of_image {
        return Err(corrupt_image!(
            "SizeOfHeaders 0x{size_of_headers:X} exceeds the file (0x{:X}) or the image (0x{size_of_image:X})",
            raw.len()
        ));
    }

    for section in headers.sections.iter().filter(|s| s.size_of_raw_data != 0) {
        let raw_size = section.size_of_raw_data as u64;
        let virtual_end = section.virtual_address as u64 + raw_size;
        if virtual_end > size_of_image {
            return Err(corrupt_image!(
                "section {} ends at 0x{virtual_end:X}, past SizeOfImage 0x{size_of_image:X}",
                section.name
            ));
        }
        let file_end = section.pointer_to_raw_data as u64 + raw_size;
        if file_end > raw.len() as u64 {
            return Err(corrupt_image!(
                "section {} raw data ends at 0x{file_end:X}, past the end of the file (0x{:X})",
                section.name,
                raw.len()
            ));
        }
    }
    Ok(())
}

/// Copies the headers and every section body from file layout into `dest`.
///
/// `dest` must be zero filled: sections whose virtual size exceeds their raw size rely on it
/// for the trailing bytes, and sections without raw data are not touched at all.
pub(crate) fn map_sections(
    raw: &[u8],
    headers: &PeHeaders,
    dest: &mut [u8],
    observer: &mut dyn MapObserver,
) -> Result<()> {
    validate_layout(raw, headers)?;
    if dest.len() != headers.size_of_image as usize {
        return Err(corrupt_image!(
            "destination is 0x{:X} bytes, image needs 0x{:X}",
            dest.len(),
            headers.size_of_image
        ));
    }

    let header_size = headers.size_of_headers as usize;
    dest[..header_size].copy_from_slice(&raw[..header_size]);
    observer.on_event(&MapEvent::HeadersCopied { size: headers.size_of_headers });

    for section in headers.sections.iter().filter(|s| s.size_of_raw_data != 0) {
        let source = section.pointer_to_raw_data as usize;
        let target = section.virtual_address as usize;
        let len = section.size_of_raw_data as usize;
        dest[target..target + len].copy_from_slice(&raw[source..source + len]);

        observer.on_event(&MapEvent::SectionMapped {
            name: section.name.clone(),
            rva: section.virtual_address,
            raw_size: section.size_of_raw_data,
            virtual_size: section.virtual_size,
        });
    }

    Ok(())
}
