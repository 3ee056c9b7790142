//! Manual mapper for 64-bit Windows DLL images.
//!
//! [`ManualMapper`] turns a raw PE32+ file into its in-memory layout without the system
//! loader: headers and sections are copied to their virtual addresses, every import slot is
//! bound through an [`ImportResolver`], and absolute addresses are rebased for the load
//! address. The result never shows up in the process module list.
//!
//! ```no_run
//! use manual_map::{HostResolver, LogObserver, ManualMapper, MapOptions};
//!
//! # fn main() -> manual_map::Result<()> {
//! let raw = std::fs::read("payload.dll").expect("read image");
//! let mut resolver = HostResolver::new();
//! let image = ManualMapper::new(MapOptions::default()).map(&raw, &mut resolver, &mut LogObserver)?;
//! for missing in &image.report().unresolved {
//!     eprintln!("unbound import {}!{}", missing.module, missing.symbol);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Auxiliary, off the mapping path: [`exports`] for export-table lookups and [`processes`]
//! for finding a running process by executable name.

mod error;
pub mod events;
pub mod exports;
pub mod pe_helpers;
pub mod pe_types;
pub mod processes;
pub mod reflective;
#[cfg(windows)]
pub mod region;
pub mod resolver;

#[cfg(test)]
mod fixture;

pub use error::{Error, Result};
pub use events::{JsonObserver, LogObserver, MapEvent, MapObserver};
pub use exports::ImageView;
pub use pe_helpers::{PeHeaders, rva_to_offset};
pub use reflective::{
    FailurePolicy, ManualMapper, MapOptions, MapReport, MappedImage, Protection, ProtectionPolicy, ProtectionRange,
};
#[cfg(windows)]
pub use region::ImageRegion;
pub use resolver::{HostResolver, ImportResolver, ModuleId};
