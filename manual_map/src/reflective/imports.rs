use crate::error::{Error, Result, corrupt_image};
use crate::events::{MapEvent, MapObserver};
use crate::pe_helpers::{PeHeaders, read_c_str, read_u16, read_u32, read_u64, write_u64};
use crate::pe_types::*;
use crate::reflective::{FailurePolicy, MapReport};
use crate::resolver::ImportResolver;

/// Bounds-checked view of one `IMAGE_IMPORT_DESCRIPTOR` in a mapped image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImportDescriptor {
    pub original_first_thunk: u32,
    pub name: u32,
    pub first_thunk: u32,
}

impl ImportDescriptor {
    pub fn read(image: &[u8], offset: usize) -> Result<Self> {
        let field = |at: usize| {
            read_u32(image, offset + at)
                .ok_or_else(|| corrupt_image!("import descriptor at 0x{offset:X} runs past the image"))
        };
        Ok(Self {
            original_first_thunk: field(0)?,
            name: field(12)?,
            first_thunk: field(16)?,
        })
    }

    /// Thunks that name the imports: the lookup table when the linker emitted one,
    /// otherwise the IAT itself.
    fn lookup_table(&self) -> u32 {
        if self.original_first_thunk != 0 { self.original_first_thunk } else { self.first_thunk }
    }
}

fn decode_thunk(image: &[u8], thunk: u64) -> Result<ImportSymbol> {
    if thunk & IMAGE_ORDINAL_FLAG64 != 0 {
        return Ok(ImportSymbol::Ordinal((thunk & 0xFFFF) as u16));
    }
    let record = (thunk & 0x7FFF_FFFF) as usize;
    let hint = read_u16(image, record)
        .ok_or_else(|| corrupt_image!("import-by-name record at 0x{record:X} is outside the image"))?;
    let name = read_c_str(image, record + 2)
        .ok_or_else(|| corrupt_image!("import name at 0x{:X} is not terminated", record + 2))?;
    Ok(ImportSymbol::Name { hint, name })
}

/// Binds every IAT slot of the mapped `image` to the address reported by `resolver`.
///
/// Under the lenient policy a module that fails to load leaves all of its slots untouched,
/// and a symbol that is not found leaves its own slot untouched; both are recorded in
/// `report` and processing continues.
pub(crate) fn resolve_imports(
    image: &mut [u8],
    headers: &PeHeaders,
    resolver: &mut dyn ImportResolver,
    policy: FailurePolicy,
    report: &mut MapReport,
    observer: &mut dyn MapObserver,
) -> Result<()> {
    let directory = headers.directory(IMAGE_DIRECTORY_ENTRY_IMPORT);
    if !directory.is_present() {
        return Ok(());
    }

    let mut offset = directory.virtual_address as usize;
    loop {
        let descriptor = ImportDescriptor::read(image, offset)?;
        if descriptor.first_thunk == 0 {
            break;
        }
        offset += IMPORT_DESCRIPTOR_SIZE;

        let module = read_c_str(image, descriptor.name as usize)
            .ok_or_else(|| corrupt_image!("module name at 0x{:X} is not terminated", descriptor.name))?;

        let module_id = match resolver.load_module(&module) {
            Ok(id) => id,
            Err(reason) => {
                observer.on_event(&MapEvent::MissingDependency { module: module.clone(), reason: reason.clone() });
                if policy == FailurePolicy::Strict {
                    return Err(Error::MissingDependency { module, reason });
                }
                report.missing_modules.push(module);
                continue;
            }
        };
        observer.on_event(&MapEvent::ModuleLoaded { module: module.clone() });

        let lookup = descriptor.lookup_table() as usize;
        let iat = descriptor.first_thunk as usize;
        for index in 0.. {
            let thunk = read_u64(image, lookup + index * 8)
                .ok_or_else(|| corrupt_image!("import thunks of {module} run past the image"))?;
            if thunk == 0 {
                break;
            }
            let symbol = decode_thunk(image, thunk)?;
            let slot = iat + index * 8;

            match resolver.resolve(module_id, &symbol) {
                Some(address) => {
                    write_u64(image, slot, address)
                        .ok_or_else(|| corrupt_image!("IAT slot 0x{slot:X} of {module} is outside the image"))?;
                    report.resolved_imports += 1;
                    observer.on_event(&MapEvent::ImportResolved { module: module.clone(), symbol, address });
                }
                None => {
                    observer.on_event(&MapEvent::UnresolvedSymbol { module: module.clone(), symbol: symbol.clone() });
                    if policy == FailurePolicy::Strict {
                        return Err(Error::UnresolvedSymbol { module, symbol: symbol.to_string() });
                    }
                    report.unresolved.push(UnresolvedImport { module: module.clone(), symbol, iat_rva: slot as u32 });
                }
            }
        }
    }

    Ok(())
}
