use serde::Serialize;

pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // MZ
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

pub const IMAGE_REL_BASED_ABSOLUTE: u8 = 0;
pub const IMAGE_REL_BASED_DIR64: u8 = 10;

pub const IMAGE_ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

pub const DOS_HEADER_SIZE: usize = 0x40;
pub const FILE_HEADER_SIZE: usize = 20;
pub const SECTION_HEADER_SIZE: usize = 40;
pub const IMPORT_DESCRIPTOR_SIZE: usize = 20;
pub const BASE_RELOCATION_SIZE: usize = 8;
pub const EXPORT_DIRECTORY_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn is_executable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_EXECUTE != 0
    }

    pub fn is_readable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_READ != 0
    }

    pub fn is_writable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_WRITE != 0
    }

    /// Whether `rva` falls inside `[VirtualAddress, VirtualAddress + VirtualSize)`.
    pub fn contains_rva(&self, rva: u64) -> bool {
        let start = self.virtual_address as u64;
        rva >= start && rva < start + self.virtual_size as u64
    }
}

/// One import thunk, as named by the import lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ImportSymbol {
    Ordinal(u16),
    Name { hint: u16, name: String },
}

impl std::fmt::Display for ImportSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportSymbol::Ordinal(ordinal) => write!(f, "#{ordinal}"),
            ImportSymbol::Name { name, .. } => f.write_str(name),
        }
    }
}

/// An IAT slot that could not be bound. The slot keeps whatever the file had in it and
/// must never be called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedImport {
    pub module: String,
    pub symbol: ImportSymbol,
    pub iat_rva: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Export {
    pub name: String,
    pub ordinal: u16,
    pub rva: u32,
    /// `"MODULE.Symbol"` when the export is forwarded instead of pointing at code.
    pub forwarder: Option<String>,
}
