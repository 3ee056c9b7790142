//! Executable mapping in the current process (Windows only).

use std::ffi::c_void;

use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualProtect,
};

use crate::error::{Error, Result};
use crate::events::MapObserver;
use crate::exports::{self, ImageView};
use crate::pe_helpers::PeHeaders;
use crate::reflective::sections::validate_layout;
use crate::reflective::{ManualMapper, MapReport, Protection, ProtectionRange};
use crate::resolver::ImportResolver;

impl From<Protection> for PAGE_PROTECTION_FLAGS {
    fn from(protection: Protection) -> Self {
        match protection {
            Protection::NoAccess => PAGE_NOACCESS,
            Protection::ReadOnly => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::Execute => PAGE_EXECUTE,
            Protection::ExecuteRead => PAGE_EXECUTE_READ,
            Protection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        }
    }
}

/// An image mapped into pages committed with `VirtualAlloc`, fixed up to run where it lies.
///
/// Pages stay read/write until [`ImageRegion::finalize`] applies the protection plan. The
/// region is released when dropped.
pub struct ImageRegion {
    base: *mut c_void,
    size: usize,
    headers: PeHeaders,
    protections: Vec<ProtectionRange>,
    report: MapReport,
    finalized: bool,
}

impl ImageRegion {
    pub fn map(
        mapper: &ManualMapper,
        raw: &[u8],
        resolver: &mut dyn ImportResolver,
        observer: &mut dyn MapObserver,
    ) -> Result<Self> {
        let headers = PeHeaders::parse(raw)?;
        validate_layout(raw, &headers)?;

        let size = headers.size_of_image as usize;
        let base = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if base.is_null() {
            return Err(Error::AllocationFailure { size });
        }

        let mut region = Self {
            base,
            size,
            headers,
            protections: Vec::new(),
            report: MapReport::default(),
            finalized: false,
        };
        // Committed pages are zero filled.
        let dest = unsafe { std::slice::from_raw_parts_mut(base as *mut u8, size) };
        let (report, protections) = mapper.map_into(raw, dest, base as u64, resolver, observer)?;
        region.report = report;
        region.protections = protections;
        Ok(region)
    }

    /// Applies the protection plan, one `VirtualProtect` call per range.
    pub fn finalize(&mut self) -> Result<()> {
        for range in &self.protections {
            let mut old = PAGE_PROTECTION_FLAGS(0);
            unsafe {
                VirtualProtect(
                    (self.base as usize + range.start) as *const c_void,
                    range.len,
                    range.protection.into(),
                    &mut old,
                )
            }
            .map_err(|e| Error::Memory(format!("VirtualProtect at +0x{:X}: {e}", range.start)))?;
        }
        self.finalized = true;
        Ok(())
    }

    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn entry_point(&self) -> Option<u64> {
        (self.headers.entry_point != 0).then(|| self.base().wrapping_add(self.headers.entry_point as u64))
    }

    pub fn protections(&self) -> &[ProtectionRange] {
        &self.protections
    }

    pub fn report(&self) -> &MapReport {
        &self.report
    }

    pub fn export_address(&self, name: &str) -> Result<Option<u64>> {
        let image = unsafe { std::slice::from_raw_parts(self.base as *const u8, self.size) };
        Ok(exports::find_export(ImageView::Mapped(image), name)?
            .filter(|export| export.forwarder.is_none())
            .map(|export| self.base().wrapping_add(export.rva as u64)))
    }
}

impl Drop for ImageRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { VirtualFree(self.base, 0, MEM_RELEASE) } {
            log::error!("VirtualFree failed for image at 0x{:X}: {e}", self.base as usize);
        }
    }
}
