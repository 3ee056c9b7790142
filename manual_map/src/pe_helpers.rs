use crate::error::{Result, invalid_image};
use crate::pe_types::*;

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

pub(crate) fn write_u64(data: &mut [u8], offset: usize, value: u64) -> Option<()> {
    let bytes = data.get_mut(offset..offset.checked_add(8)?)?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Some(())
}

/// Reads a NUL-terminated ASCII string. A string running off the end of the buffer is
/// rejected rather than truncated.
pub(crate) fn read_c_str(data: &[u8], offset: usize) -> Option<String> {
    let tail = data.get(offset..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&tail[..len]).into_owned())
}

/// Parsed and validated DOS/NT headers plus the section table of a PE32+ image.
///
/// Offsets are identical in file and virtual layout for the header region, so the same
/// parser serves the raw file and an already mapped image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeHeaders {
    pub e_lfanew: usize,
    pub machine: u16,
    pub timestamp: u32,
    pub characteristics: u16,
    pub entry_point: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub data_directories: Vec<DataDirectory>,
    pub sections: Vec<SectionHeader>,
}

impl PeHeaders {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if read_u16(data, 0) != Some(IMAGE_DOS_SIGNATURE) {
            return Err(invalid_image!("missing MZ signature"));
        }
        let e_lfanew = read_u32(data, 0x3C)
            .ok_or_else(|| invalid_image!("truncated DOS header"))? as usize;

        if read_u32(data, e_lfanew) != Some(IMAGE_NT_SIGNATURE) {
            return Err(invalid_image!("missing PE signature at 0x{e_lfanew:X}"));
        }

        let file_header = e_lfanew + 4;
        let truncated = || invalid_image!("truncated file header");
        let machine = read_u16(data, file_header).ok_or_else(truncated)?;
        if machine != IMAGE_FILE_MACHINE_AMD64 {
            return Err(invalid_image!("unsupported machine type 0x{machine:X}"));
        }
        let number_of_sections = read_u16(data, file_header + 2).ok_or_else(truncated)? as usize;
        let timestamp = read_u32(data, file_header + 4).ok_or_else(truncated)?;
        let size_of_optional_header = read_u16(data, file_header + 16).ok_or_else(truncated)? as usize;
        let characteristics = read_u16(data, file_header + 18).ok_or_else(truncated)?;

        let optional = file_header + FILE_HEADER_SIZE;
        let truncated = || invalid_image!("truncated optional header");
        let magic = read_u16(data, optional).ok_or_else(truncated)?;
        if magic != IMAGE_NT_OPTIONAL_HDR64_MAGIC {
            return Err(invalid_image!("optional header magic 0x{magic:X} is not PE32+"));
        }
        // Fixed part of the PE32+ optional header ends at 0x70, where the directories start.
        if size_of_optional_header < 0x70 || data.len() < optional + size_of_optional_header {
            return Err(truncated());
        }

        let entry_point = read_u32(data, optional + 0x10).ok_or_else(truncated)?;
        let image_base = read_u64(data, optional + 0x18).ok_or_else(truncated)?;
        let section_alignment = read_u32(data, optional + 0x20).ok_or_else(truncated)?;
        let file_alignment = read_u32(data, optional + 0x24).ok_or_else(truncated)?;
        let size_of_image = read_u32(data, optional + 0x38).ok_or_else(truncated)?;
        let size_of_headers = read_u32(data, optional + 0x3C).ok_or_else(truncated)?;
        let subsystem = read_u16(data, optional + 0x44).ok_or_else(truncated)?;
        let dll_characteristics = read_u16(data, optional + 0x46).ok_or_else(truncated)?;
        let number_of_rva_and_sizes = read_u32(data, optional + 0x6C).ok_or_else(truncated)? as usize;

        if size_of_image == 0 {
            return Err(invalid_image!("SizeOfImage is zero"));
        }

        let directory_count = number_of_rva_and_sizes
            .min(IMAGE_NUMBEROF_DIRECTORY_ENTRIES)
            .min((size_of_optional_header - 0x70) / 8);
        let mut data_directories = vec![DataDirectory::default(); IMAGE_NUMBEROF_DIRECTORY_ENTRIES];
        for (index, directory) in data_directories.iter_mut().enumerate().take(directory_count) {
            let offset = optional + 0x70 + index * 8;
            directory.virtual_address = read_u32(data, offset).ok_or_else(truncated)?;
            directory.size = read_u32(data, offset + 4).ok_or_else(truncated)?;
        }

        let section_table = optional + size_of_optional_header;
        let table_end = section_table + number_of_sections * SECTION_HEADER_SIZE;
        if data.len() < table_end {
            return Err(invalid_image!(
                "section table ({number_of_sections} entries) runs past the end of the headers"
            ));
        }
        let sections = (0..number_of_sections)
            .map(|i| parse_section(data, section_table + i * SECTION_HEADER_SIZE))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid_image!("truncated section table"))?;

        Ok(Self {
            e_lfanew,
            machine,
            timestamp,
            characteristics,
            entry_point,
            image_base,
            section_alignment,
            file_alignment,
            size_of_image,
            size_of_headers,
            subsystem,
            dll_characteristics,
            data_directories,
            sections,
        })
    }

    pub fn directory(&self, index: usize) -> DataDirectory {
        self.data_directories.get(index).copied().unwrap_or_default()
    }

    pub fn rva_to_offset(&self, rva: u64) -> Option<usize> {
        rva_to_offset(&self.sections, rva)
    }
}

fn parse_section(data: &[u8], offset: usize) -> Option<SectionHeader> {
    let raw_name = data.get(offset..offset + 8)?;
    let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(8);
    Some(SectionHeader {
        name: String::from_utf8_lossy(&raw_name[..name_len]).into_owned(),
        virtual_size: read_u32(data, offset + 8)?,
        virtual_address: read_u32(data, offset + 12)?,
        size_of_raw_data: read_u32(data, offset + 16)?,
        pointer_to_raw_data: read_u32(data, offset + 20)?,
        characteristics: read_u32(data, offset + 36)?,
    })
}

/// Converts a Relative Virtual Address (RVA) to a file offset.
///
/// Sections are scanned in table order and the first one whose virtual range contains
/// `rva` wins, so overlapping sections resolve to the earlier entry. Returns `None` for
/// RVAs outside every section, including the header region.
pub fn rva_to_offset(sections: &[SectionHeader], rva: u64) -> Option<usize> {
    sections
        .iter()
        .find(|section| section.contains_rva(rva))
        .map(|section| (section.pointer_to_raw_data as u64 + (rva - section.virtual_address as u64)) as usize)
}
