use serde::{Deserialize, Serialize};

use crate::events::{MapEvent, MapObserver};
use crate::pe_helpers::PeHeaders;
use crate::pe_types::SectionHeader;

const PAGE_SIZE: usize = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
}

impl Protection {
    pub fn is_executable(self) -> bool {
        matches!(self, Protection::Execute | Protection::ExecuteRead | Protection::ExecuteReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::ExecuteReadWrite)
    }
}

impl From<&SectionHeader> for Protection {
    fn from(section: &SectionHeader) -> Self {
        match (section.is_readable(), section.is_writable(), section.is_executable()) {
            (false, false, false) => Protection::NoAccess,
            (true, false, false) => Protection::ReadOnly,
            (_, true, false) => Protection::ReadWrite,
            (false, false, true) => Protection::Execute,
            (true, false, true) => Protection::ExecuteRead,
            (_, true, true) => Protection::ExecuteReadWrite,
        }
    }
}

/// How the finished image's pages are protected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionPolicy {
    /// Headers read-only, each section according to its characteristics.
    #[default]
    PerSection,
    /// The whole image read/write/execute.
    Uniform,
}

/// One byte range of the mapped image and the protection it should end up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProtectionRange {
    pub start: usize,
    pub len: usize,
    pub protection: Protection,
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Derives the page protections for an image described by `headers`.
///
/// Ranges are rounded up to the section alignment and clipped to `SizeOfImage`.
pub(crate) fn plan_protections(
    headers: &PeHeaders,
    policy: ProtectionPolicy,
    observer: &mut dyn MapObserver,
) -> Vec<ProtectionRange> {
    let size_of_image = headers.size_of_image as usize;
    let mut plan = Vec::new();

    match policy {
        ProtectionPolicy::Uniform => plan.push(ProtectionRange {
            start: 0,
            len: size_of_image,
            protection: Protection::ExecuteReadWrite,
        }),
        ProtectionPolicy::PerSection => {
            let alignment = match headers.section_alignment as usize {
                0 => PAGE_SIZE,
                alignment => alignment,
            };
            let headers_len = align_up(headers.size_of_headers as usize, PAGE_SIZE).min(size_of_image);
            if headers_len > 0 {
                plan.push(ProtectionRange { start: 0, len: headers_len, protection: Protection::ReadOnly });
            }

            for section in &headers.sections {
                let start = section.virtual_address as usize;
                let size = (section.virtual_size as usize).max(section.size_of_raw_data as usize);
                if size == 0 || start >= size_of_image {
                    continue;
                }
                let len = align_up(size, alignment).min(size_of_image - start);
                plan.push(ProtectionRange { start, len, protection: Protection::from(section) });
            }
        }
    }

    for range in &plan {
        observer.on_event(&MapEvent::ProtectionPlanned {
            start: range.start,
            len: range.len,
            protection: range.protection,
        });
    }
    plan
}
