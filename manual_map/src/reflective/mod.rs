//! Manual mapping pipeline: headers and sections, imports, base relocations, protections.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::MapObserver;
use crate::exports::{self, ImageView};
use crate::pe_helpers::PeHeaders;
use crate::pe_types::{Export, UnresolvedImport};
use crate::resolver::ImportResolver;

pub(crate) mod imports;
pub(crate) mod protection;
pub(crate) mod relocations;
pub(crate) mod sections;

pub use protection::{Protection, ProtectionPolicy, ProtectionRange};

/// What to do when an import or relocation cannot be honoured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the problem in the [`MapReport`] and keep mapping.
    #[default]
    Lenient,
    /// Abort on the first missing module, unresolved symbol or unusable relocation.
    Strict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapOptions {
    /// Address the image will run at. `None` means the mapped buffer itself.
    pub load_address: Option<u64>,
    pub failure_policy: FailurePolicy,
    pub protection: ProtectionPolicy,
}

impl MapOptions {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn load_address(mut self, address: u64) -> Self {
        self.load_address = Some(address);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn protection(mut self, policy: ProtectionPolicy) -> Self {
        self.protection = policy;
        self
    }
}

/// Outcome of a mapping run that did not abort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MapReport {
    pub missing_modules: Vec<String>,
    pub unresolved: Vec<UnresolvedImport>,
    pub resolved_imports: usize,
    pub applied_relocations: usize,
    pub skipped_relocations: usize,
    /// `load_address - ImageBase`, wrapping.
    pub delta: u64,
}

impl MapReport {
    /// Every dependency loaded and every import bound.
    pub fn is_complete(&self) -> bool {
        self.missing_modules.is_empty() && self.unresolved.is_empty()
    }
}

/// A fully mapped image in virtual layout, fixed up for [`MappedImage::load_address`].
#[derive(Debug)]
pub struct MappedImage {
    bytes: Vec<u8>,
    headers: PeHeaders,
    load_address: u64,
    protections: Vec<ProtectionRange>,
    report: MapReport,
}

impl MappedImage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn headers(&self) -> &PeHeaders {
        &self.headers
    }

    pub fn load_address(&self) -> u64 {
        self.load_address
    }

    /// Absolute entry point, or `None` for images without one.
    pub fn entry_point(&self) -> Option<u64> {
        (self.headers.entry_point != 0).then(|| self.load_address.wrapping_add(self.headers.entry_point as u64))
    }

    pub fn protections(&self) -> &[ProtectionRange] {
        &self.protections
    }

    pub fn report(&self) -> &MapReport {
        &self.report
    }

    pub fn find_export(&self, name: &str) -> Result<Option<Export>> {
        exports::find_export(ImageView::Mapped(&self.bytes), name)
    }

    /// Absolute address of a named export as the image will see it once running.
    pub fn export_address(&self, name: &str) -> Result<Option<u64>> {
        Ok(self
            .find_export(name)?
            .filter(|export| export.forwarder.is_none())
            .map(|export| self.load_address.wrapping_add(export.rva as u64)))
    }
}

/// Maps raw PE32+ images without going through the system loader.
#[derive(Debug, Clone, Default)]
pub struct ManualMapper {
    options: MapOptions,
}

impl ManualMapper {
    pub fn new(options: MapOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MapOptions {
        &self.options
    }

    /// Maps `raw` into a freshly allocated buffer of `SizeOfImage` bytes.
    ///
    /// Header and layout problems abort before anything is allocated. Import and relocation
    /// problems follow the configured [`FailurePolicy`].
    pub fn map(
        &self,
        raw: &[u8],
        resolver: &mut dyn ImportResolver,
        observer: &mut dyn MapObserver,
    ) -> Result<MappedImage> {
        let headers = PeHeaders::parse(raw)?;
        sections::validate_layout(raw, &headers)?;

        let size = headers.size_of_image as usize;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).map_err(|_| Error::AllocationFailure { size })?;
        bytes.resize(size, 0);

        let load_address = self.options.load_address.unwrap_or(bytes.as_ptr() as u64);
        let (report, protections) = self.run(raw, &headers, &mut bytes, load_address, resolver, observer)?;

        Ok(MappedImage { bytes, headers, load_address, protections, report })
    }

    /// Maps `raw` into `dest`, which must be zero filled and exactly `SizeOfImage` bytes,
    /// fixing it up to run at `load_address`. [`MapOptions::load_address`] is ignored.
    pub fn map_into(
        &self,
        raw: &[u8],
        dest: &mut [u8],
        load_address: u64,
        resolver: &mut dyn ImportResolver,
        observer: &mut dyn MapObserver,
    ) -> Result<(MapReport, Vec<ProtectionRange>)> {
        let headers = PeHeaders::parse(raw)?;
        self.run(raw, &headers, dest, load_address, resolver, observer)
    }

    fn run(
        &self,
        raw: &[u8],
        headers: &PeHeaders,
        dest: &mut [u8],
        load_address: u64,
        resolver: &mut dyn ImportResolver,
        observer: &mut dyn MapObserver,
    ) -> Result<(MapReport, Vec<ProtectionRange>)> {
        let policy = self.options.failure_policy;
        let mut report = MapReport::default();

        sections::map_sections(raw, headers, dest, observer)?;
        // IAT slots must be bound before anything can run code from the image.
        imports::resolve_imports(dest, headers, resolver, policy, &mut report, observer)?;
        relocations::apply_relocations(dest, headers, load_address, policy, &mut report, observer)?;
        let protections = protection::plan_protections(headers, self.options.protection, observer);

        Ok((report, protections))
    }
}
