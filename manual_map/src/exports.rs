//! Export table lookups, usable on a raw file or on an already mapped image.

use crate::error::{Result, corrupt_image};
use crate::pe_helpers::{PeHeaders, read_c_str, read_u16, read_u32};
use crate::pe_types::*;

/// Image bytes together with the layout they are in.
#[derive(Debug, Clone, Copy)]
pub enum ImageView<'a> {
    /// On-disk layout; RVAs go through the section table.
    File(&'a [u8]),
    /// Virtual layout, as produced by the mapper; RVAs are offsets.
    Mapped(&'a [u8]),
}

struct ExportTable<'a> {
    data: &'a [u8],
    headers: PeHeaders,
    mapped: bool,
    directory: DataDirectory,
    number_of_functions: u32,
    number_of_names: u32,
    functions: u32,
    names: u32,
    ordinals: u32,
}

impl<'a> ExportTable<'a> {
    fn open(view: ImageView<'a>) -> Result<Option<Self>> {
        let (data, mapped) = match view {
            ImageView::File(data) => (data, false),
            ImageView::Mapped(data) => (data, true),
        };
        let headers = PeHeaders::parse(data)?;
        let directory = headers.directory(IMAGE_DIRECTORY_ENTRY_EXPORT);
        if !directory.is_present() || directory.size == 0 {
            return Ok(None);
        }

        let mut table = Self {
            data,
            headers,
            mapped,
            directory,
            number_of_functions: 0,
            number_of_names: 0,
            functions: 0,
            names: 0,
            ordinals: 0,
        };
        let base = directory.virtual_address;
        table.number_of_functions = table.u32_at(base.wrapping_add(20))?;
        table.number_of_names = table.u32_at(base.wrapping_add(24))?;
        table.functions = table.u32_at(base.wrapping_add(28))?;
        table.names = table.u32_at(base.wrapping_add(32))?;
        table.ordinals = table.u32_at(base.wrapping_add(36))?;
        Ok(Some(table))
    }

    fn offset(&self, rva: u32) -> Option<usize> {
        if self.mapped { Some(rva as usize) } else { self.headers.rva_to_offset(rva as u64) }
    }

    fn u32_at(&self, rva: u32) -> Result<u32> {
        self.offset(rva)
            .and_then(|offset| read_u32(self.data, offset))
            .ok_or_else(|| corrupt_image!("export table entry at rva 0x{rva:X} is out of bounds"))
    }

    fn u16_at(&self, rva: u32) -> Result<u16> {
        self.offset(rva)
            .and_then(|offset| read_u16(self.data, offset))
            .ok_or_else(|| corrupt_image!("export ordinal at rva 0x{rva:X} is out of bounds"))
    }

    fn str_at(&self, rva: u32) -> Result<String> {
        self.offset(rva)
            .and_then(|offset| read_c_str(self.data, offset))
            .ok_or_else(|| corrupt_image!("export string at rva 0x{rva:X} is out of bounds"))
    }

    fn name(&self, index: u32) -> Result<String> {
        let name_rva = self.u32_at(self.names.wrapping_add(index.wrapping_mul(4)))?;
        self.str_at(name_rva)
    }

    fn export(&self, index: u32, name: String) -> Result<Export> {
        let ordinal = self.u16_at(self.ordinals.wrapping_add(index.wrapping_mul(2)))?;
        if ordinal as u32 >= self.number_of_functions {
            return Err(corrupt_image!("export {name} has ordinal index {ordinal} out of range"));
        }
        let rva = self.u32_at(self.functions.wrapping_add(ordinal as u32 * 4))?;

        let directory_start = self.directory.virtual_address;
        let directory_end = directory_start.saturating_add(self.directory.size);
        let forwarder = if (directory_start..directory_end).contains(&rva) { Some(self.str_at(rva)?) } else { None };

        Ok(Export { name, ordinal, rva, forwarder })
    }
}

/// Finds the export called exactly `name`. Linear in the number of named exports.
pub fn find_export(view: ImageView<'_>, name: &str) -> Result<Option<Export>> {
    let Some(table) = ExportTable::open(view)? else {
        return Ok(None);
    };
    for index in 0..table.number_of_names {
        let candidate = table.name(index)?;
        if candidate == name {
            return table.export(index, candidate).map(Some);
        }
    }
    Ok(None)
}

/// Every named export, in name-table order.
pub fn list_exports(view: ImageView<'_>) -> Result<Vec<Export>> {
    let Some(table) = ExportTable::open(view)? else {
        return Ok(Vec::new());
    };
    (0..table.number_of_names)
        .map(|index| {
            let name = table.name(index)?;
            table.export(index, name)
        })
        .collect()
}
