//! Structured diagnostics emitted while an image is mapped.
//!
//! Every stage reports what it did through a [`MapObserver`] instead of printing, so callers
//! decide whether progress goes to the `log` facade, a JSON stream, or a test vector.

use std::io::Write;

use serde::Serialize;

use crate::pe_types::ImportSymbol;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MapEvent {
    HeadersCopied { size: u32 },
    SectionMapped { name: String, rva: u32, raw_size: u32, virtual_size: u32 },
    ModuleLoaded { module: String },
    MissingDependency { module: String, reason: String },
    ImportResolved { module: String, symbol: ImportSymbol, address: u64 },
    UnresolvedSymbol { module: String, symbol: ImportSymbol },
    RelocationsApplied { count: usize, delta: u64 },
    /// No relocation directory although the image is not at its preferred base. The
    /// mapping is left as is and is very likely broken.
    RelocationsStripped { preferred: u64, actual: u64 },
    UnsupportedRelocation { kind: u8, rva: u32 },
    RelocationOutOfRange { rva: u32 },
    ProtectionPlanned { start: usize, len: usize, protection: crate::Protection },
}

pub trait MapObserver {
    fn on_event(&mut self, event: &MapEvent);
}

/// Discards everything.
impl MapObserver for () {
    fn on_event(&mut self, _event: &MapEvent) {}
}

/// Records events in order; mostly useful in tests.
impl MapObserver for Vec<MapEvent> {
    fn on_event(&mut self, event: &MapEvent) {
        self.push(event.clone());
    }
}

/// Forwards events to the `log` facade under the `manual_map` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl MapObserver for LogObserver {
    fn on_event(&mut self, event: &MapEvent) {
        match event {
            MapEvent::HeadersCopied { size } => log::debug!("copied 0x{size:X} bytes of headers"),
            MapEvent::SectionMapped { name, rva, raw_size, virtual_size } => {
                log::debug!("mapped {name} at rva 0x{rva:X} (raw 0x{raw_size:X}, virtual 0x{virtual_size:X})")
            }
            MapEvent::ModuleLoaded { module } => log::info!("loaded dependency {module}"),
            MapEvent::MissingDependency { module, reason } => {
                log::warn!("failed to load {module}: {reason}; its imports stay unbound")
            }
            MapEvent::ImportResolved { module, symbol, address } => {
                log::debug!("import {module}!{symbol} -> 0x{address:X}")
            }
            MapEvent::UnresolvedSymbol { module, symbol } => log::warn!("unresolved import {module}!{symbol}"),
            MapEvent::RelocationsApplied { count, delta } => {
                log::info!("applied {count} relocations (delta 0x{delta:X})")
            }
            MapEvent::RelocationsStripped { preferred, actual } => log::warn!(
                "image has no relocations but is loaded at 0x{actual:X} instead of 0x{preferred:X}"
            ),
            MapEvent::UnsupportedRelocation { kind, rva } => {
                log::debug!("skipping relocation type {kind} at rva 0x{rva:X}")
            }
            MapEvent::RelocationOutOfRange { rva } => log::warn!("relocation target 0x{rva:X} is outside the image"),
            MapEvent::ProtectionPlanned { start, len, protection } => {
                log::debug!("protect 0x{start:X}..0x{:X} as {protection:?}", start + len)
            }
        }
    }
}

/// Writes one JSON object per event, newline separated.
pub struct JsonObserver<W: Write> {
    writer: W,
}

impl<W: Write> JsonObserver<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MapObserver for JsonObserver<W> {
    fn on_event(&mut self, event: &MapEvent) {
        let written = serde_json::to_writer(&mut self.writer, event)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));
        if let Err(e) = written {
            log::error!("failed to write map event: {e}");
        }
    }
}
