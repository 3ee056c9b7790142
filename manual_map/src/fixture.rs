//! Builds small synthetic PE32+ images for tests.

use std::collections::BTreeMap;

use crate::pe_types::*;

const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;
const E_LFANEW: usize = 0x40;
const OPTIONAL_HEADER_SIZE: usize = 0xF0;

#[derive(Debug, Clone)]
pub(crate) enum FixtureImport {
    Name(&'static str),
    Ordinal(u16),
}

struct PendingSection {
    name: String,
    characteristics: u32,
    data: Vec<u8>,
    virtual_size: u32,
}

pub(crate) struct ImageBuilder {
    machine: u16,
    image_base: u64,
    entry_point: u32,
    sections: Vec<PendingSection>,
    imports: Vec<(String, Vec<FixtureImport>)>,
    iat_only: bool,
    relocations: Vec<(u32, u8)>,
    exports: Vec<(String, ExportTarget)>,
}

enum ExportTarget {
    Rva(u32),
    Forwarder(String),
}

pub(crate) struct BuiltImage {
    pub bytes: Vec<u8>,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub sections: Vec<(String, u32)>,
    /// IAT slot RVAs, one list per imported module in declaration order.
    pub iat_slots: Vec<Vec<u32>>,
}

impl BuiltImage {
    pub fn section_rva(&self, name: &str) -> u32 {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, rva)| *rva)
            .unwrap_or_else(|| panic!("no section {name}"))
    }

    pub fn section_header_offset(&self, index: usize) -> usize {
        E_LFANEW + 4 + 20 + OPTIONAL_HEADER_SIZE + index * SECTION_HEADER_SIZE
    }
}

fn align(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            machine: IMAGE_FILE_MACHINE_AMD64,
            image_base: 0x1_8000_0000,
            entry_point: 0,
            sections: Vec::new(),
            imports: Vec::new(),
            iat_only: false,
            relocations: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn image_base(mut self, image_base: u64) -> Self {
        self.image_base = image_base;
        self
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    pub fn section(mut self, name: &str, characteristics: u32, data: Vec<u8>) -> Self {
        let virtual_size = data.len() as u32;
        self.sections.push(PendingSection { name: name.into(), characteristics, data, virtual_size });
        self
    }

    /// A section whose virtual size exceeds its file data.
    pub fn padded_section(mut self, name: &str, characteristics: u32, data: Vec<u8>, virtual_size: u32) -> Self {
        let virtual_size = virtual_size.max(data.len() as u32);
        self.sections.push(PendingSection { name: name.into(), characteristics, data, virtual_size });
        self
    }

    pub fn import(mut self, module: &str, symbols: &[FixtureImport]) -> Self {
        self.imports.push((module.into(), symbols.to_vec()));
        self
    }

    /// Leave `OriginalFirstThunk` zero so loaders must read names from the IAT.
    pub fn iat_only(mut self) -> Self {
        self.iat_only = true;
        self
    }

    pub fn relocation(self, rva: u32) -> Self {
        self.relocation_of_kind(rva, IMAGE_REL_BASED_DIR64)
    }

    pub fn relocation_of_kind(mut self, rva: u32, kind: u8) -> Self {
        self.relocations.push((rva, kind));
        self
    }

    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push((name.into(), ExportTarget::Rva(rva)));
        self
    }

    pub fn export_forwarder(mut self, name: &str, target: &str) -> Self {
        self.exports.push((name.into(), ExportTarget::Forwarder(target.into())));
        self
    }

    pub fn build(mut self) -> BuiltImage {
        let mut next_rva = SECTION_ALIGNMENT;
        let mut rvas = Vec::new();
        for pending in &self.sections {
            rvas.push(next_rva);
            next_rva = align(next_rva + pending.virtual_size.max(1), SECTION_ALIGNMENT);
        }

        let mut directories = [DataDirectory::default(); IMAGE_NUMBEROF_DIRECTORY_ENTRIES];
        let mut iat_slots = Vec::new();

        if !self.imports.is_empty() {
            let (data, descriptors_size, slots) = self.build_imports(next_rva);
            directories[IMAGE_DIRECTORY_ENTRY_IMPORT] =
                DataDirectory { virtual_address: next_rva, size: descriptors_size };
            iat_slots = slots;
            let characteristics = IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;
            next_rva = self.push_generated(".idata", characteristics, data, next_rva, &mut rvas);
        }
        if !self.exports.is_empty() {
            let data = self.build_exports(next_rva);
            directories[IMAGE_DIRECTORY_ENTRY_EXPORT] =
                DataDirectory { virtual_address: next_rva, size: data.len() as u32 };
            next_rva = self.push_generated(".edata", IMAGE_SCN_MEM_READ, data, next_rva, &mut rvas);
        }
        if !self.relocations.is_empty() {
            let data = self.build_relocations();
            directories[IMAGE_DIRECTORY_ENTRY_BASERELOC] =
                DataDirectory { virtual_address: next_rva, size: data.len() as u32 };
            next_rva = self.push_generated(
                ".reloc",
                IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_DISCARDABLE,
                data,
                next_rva,
                &mut rvas,
            );
        }
        let size_of_image = next_rva;

        let section_table = E_LFANEW + 4 + 20 + OPTIONAL_HEADER_SIZE;
        let size_of_headers = align((section_table + self.sections.len() * SECTION_HEADER_SIZE) as u32, FILE_ALIGNMENT);

        let mut raw_pointers = Vec::new();
        let mut file_size = size_of_headers;
        for pending in &self.sections {
            if pending.data.is_empty() {
                raw_pointers.push((0, 0));
            } else {
                let raw_size = align(pending.data.len() as u32, FILE_ALIGNMENT);
                raw_pointers.push((file_size, raw_size));
                file_size += raw_size;
            }
        }

        let mut bytes = vec![0u8; file_size as usize];
        put_u16(&mut bytes, 0, IMAGE_DOS_SIGNATURE);
        put_u32(&mut bytes, 0x3C, E_LFANEW as u32);
        put_u32(&mut bytes, E_LFANEW, IMAGE_NT_SIGNATURE);

        let file_header = E_LFANEW + 4;
        put_u16(&mut bytes, file_header, self.machine);
        put_u16(&mut bytes, file_header + 2, self.sections.len() as u16);
        put_u16(&mut bytes, file_header + 16, OPTIONAL_HEADER_SIZE as u16);
        put_u16(&mut bytes, file_header + 18, 0x2022);

        let optional = file_header + 20;
        put_u16(&mut bytes, optional, IMAGE_NT_OPTIONAL_HDR64_MAGIC);
        put_u32(&mut bytes, optional + 0x10, self.entry_point);
        put_u64(&mut bytes, optional + 0x18, self.image_base);
        put_u32(&mut bytes, optional + 0x20, SECTION_ALIGNMENT);
        put_u32(&mut bytes, optional + 0x24, FILE_ALIGNMENT);
        put_u32(&mut bytes, optional + 0x38, size_of_image);
        put_u32(&mut bytes, optional + 0x3C, size_of_headers);
        put_u16(&mut bytes, optional + 0x44, 2);
        put_u16(&mut bytes, optional + 0x46, 0x0160);
        put_u32(&mut bytes, optional + 0x6C, IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32);
        for (index, directory) in directories.iter().enumerate() {
            put_u32(&mut bytes, optional + 0x70 + index * 8, directory.virtual_address);
            put_u32(&mut bytes, optional + 0x74 + index * 8, directory.size);
        }

        for (index, pending) in self.sections.iter().enumerate() {
            let header = section_table + index * SECTION_HEADER_SIZE;
            let name = pending.name.as_bytes();
            bytes[header..header + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            let (raw_pointer, raw_size) = raw_pointers[index];
            put_u32(&mut bytes, header + 8, pending.virtual_size);
            put_u32(&mut bytes, header + 12, rvas[index]);
            put_u32(&mut bytes, header + 16, raw_size);
            put_u32(&mut bytes, header + 20, raw_pointer);
            put_u32(&mut bytes, header + 36, pending.characteristics);
            let start = raw_pointer as usize;
            bytes[start..start + pending.data.len()].copy_from_slice(&pending.data);
        }

        let sections = self.sections.drain(..).map(|pending| pending.name).zip(rvas).collect();
        BuiltImage { bytes, size_of_image, size_of_headers, sections, iat_slots }
    }

    fn push_generated(
        &mut self,
        name: &str,
        characteristics: u32,
        data: Vec<u8>,
        rva: u32,
        rvas: &mut Vec<u32>,
    ) -> u32 {
        let virtual_size = data.len() as u32;
        self.sections.push(PendingSection { name: name.into(), characteristics, data, virtual_size });
        rvas.push(rva);
        align(rva + virtual_size.max(1), SECTION_ALIGNMENT)
    }

    fn build_imports(&self, base: u32) -> (Vec<u8>, u32, Vec<Vec<u32>>) {
        let descriptors = (self.imports.len() + 1) * IMPORT_DESCRIPTOR_SIZE;
        let thunks: usize = self.imports.iter().map(|(_, symbols)| 2 * (symbols.len() + 1) * 8).sum();
        let mut buf = vec![0u8; descriptors + thunks];
        let mut cursor = descriptors;
        let mut slots = Vec::new();

        for (index, (module, symbols)) in self.imports.iter().enumerate() {
            let lookup = cursor;
            cursor += (symbols.len() + 1) * 8;
            let iat = cursor;
            cursor += (symbols.len() + 1) * 8;

            let name = buf.len();
            buf.extend_from_slice(module.as_bytes());
            buf.push(0);

            let descriptor = index * IMPORT_DESCRIPTOR_SIZE;
            if !self.iat_only {
                put_u32(&mut buf, descriptor, base + lookup as u32);
            }
            put_u32(&mut buf, descriptor + 12, base + name as u32);
            put_u32(&mut buf, descriptor + 16, base + iat as u32);

            let mut module_slots = Vec::new();
            for (slot, symbol) in symbols.iter().enumerate() {
                let thunk = match symbol {
                    FixtureImport::Ordinal(ordinal) => IMAGE_ORDINAL_FLAG64 | *ordinal as u64,
                    FixtureImport::Name(name) => {
                        if buf.len() % 2 == 1 {
                            buf.push(0);
                        }
                        let record = buf.len();
                        buf.extend_from_slice(&(slot as u16).to_le_bytes());
                        buf.extend_from_slice(name.as_bytes());
                        buf.push(0);
                        (base + record as u32) as u64
                    }
                };
                put_u64(&mut buf, lookup + slot * 8, thunk);
                put_u64(&mut buf, iat + slot * 8, thunk);
                module_slots.push(base + (iat + slot * 8) as u32);
            }
            slots.push(module_slots);
        }

        (buf, descriptors as u32, slots)
    }

    fn build_exports(&self, base: u32) -> Vec<u8> {
        let count = self.exports.len();
        let functions = EXPORT_DIRECTORY_SIZE;
        let names = functions + count * 4;
        let ordinals = names + count * 4;
        let mut buf = vec![0u8; ordinals + count * 2];

        let module_name = buf.len();
        buf.extend_from_slice(b"fixture.dll\0");

        put_u32(&mut buf, 12, base + module_name as u32);
        put_u32(&mut buf, 16, 1);
        put_u32(&mut buf, 20, count as u32);
        put_u32(&mut buf, 24, count as u32);
        put_u32(&mut buf, 28, base + functions as u32);
        put_u32(&mut buf, 32, base + names as u32);
        put_u32(&mut buf, 36, base + ordinals as u32);

        for (index, (_, target)) in self.exports.iter().enumerate() {
            let rva = match target {
                ExportTarget::Rva(rva) => *rva,
                ExportTarget::Forwarder(forwarder) => {
                    let offset = buf.len();
                    buf.extend_from_slice(forwarder.as_bytes());
                    buf.push(0);
                    base + offset as u32
                }
            };
            put_u32(&mut buf, functions + index * 4, rva);
        }

        let mut sorted: Vec<(usize, &String)> = self.exports.iter().map(|(name, _)| name).enumerate().collect();
        sorted.sort_by(|a, b| a.1.cmp(b.1));
        for (position, (index, name)) in sorted.into_iter().enumerate() {
            let offset = buf.len();
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            put_u32(&mut buf, names + position * 4, base + offset as u32);
            put_u16(&mut buf, ordinals + position * 2, index as u16);
        }

        buf
    }

    fn build_relocations(&self) -> Vec<u8> {
        let mut pages: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
        for (rva, kind) in &self.relocations {
            pages
                .entry(rva & !0xFFF)
                .or_default()
                .push(((*kind as u16) << 12) | (rva & 0xFFF) as u16);
        }

        let mut buf = Vec::new();
        for (page, mut entries) in pages {
            if entries.len() % 2 == 1 {
                entries.push(0);
            }
            buf.extend_from_slice(&page.to_le_bytes());
            buf.extend_from_slice(&((BASE_RELOCATION_SIZE + entries.len() * 2) as u32).to_le_bytes());
            for entry in entries {
                buf.extend_from_slice(&entry.to_le_bytes());
            }
        }
        buf
    }
}
