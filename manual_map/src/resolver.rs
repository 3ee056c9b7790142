use std::collections::HashMap;
use std::ffi::c_void;

use crate::pe_types::ImportSymbol;

/// Opaque handle for a module loaded by an [`ImportResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub usize);

/// The host's dynamic loading facility, as seen by the import binder.
///
/// Loading the same module twice must be cheap and return an equivalent handle; the host
/// loader is expected to reference count rather than load a second copy.
pub trait ImportResolver {
    fn load_module(&mut self, name: &str) -> Result<ModuleId, String>;

    /// Absolute address of `symbol` in `module`, or `None` when it is not exported.
    fn resolve(&mut self, module: ModuleId, symbol: &ImportSymbol) -> Option<u64>;
}

#[cfg(windows)]
type HostLibrary = libloading::os::windows::Library;
#[cfg(unix)]
type HostLibrary = libloading::os::unix::Library;

/// Resolves imports against the current process with the platform loader
/// (`LoadLibrary`/`GetProcAddress` on Windows, `dlopen`/`dlsym` elsewhere).
///
/// Every module it loads stays resident for the rest of the process, as with a plain
/// `LoadLibrary` that is never paired with `FreeLibrary`. Addresses bound into a mapped image
/// therefore outlive the resolver.
#[derive(Default)]
pub struct HostResolver {
    libraries: Vec<HostLibrary>,
    by_name: HashMap<String, ModuleId>,
}

impl HostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct modules loaded so far.
    pub fn module_count(&self) -> usize {
        self.libraries.len()
    }
}

impl Drop for HostResolver {
    fn drop(&mut self) {
        // Leak the handles: closing them would unload code the mapped image still calls.
        for library in self.libraries.drain(..) {
            std::mem::forget(library);
        }
    }
}

impl ImportResolver for HostResolver {
    fn load_module(&mut self, name: &str) -> Result<ModuleId, String> {
        let key = name.to_ascii_lowercase();
        if let Some(id) = self.by_name.get(&key) {
            return Ok(*id);
        }

        let library = unsafe { HostLibrary::new(name) }.map_err(|e| e.to_string())?;
        let id = ModuleId(self.libraries.len());
        self.libraries.push(library);
        self.by_name.insert(key, id);
        Ok(id)
    }

    fn resolve(&mut self, module: ModuleId, symbol: &ImportSymbol) -> Option<u64> {
        let library = self.libraries.get(module.0)?;
        let address = match symbol {
            ImportSymbol::Name { name, .. } => {
                unsafe { library.get::<*const c_void>(name.as_bytes()) }.ok().map(|s| *s)
            }
            ImportSymbol::Ordinal(ordinal) => resolve_ordinal(library, *ordinal),
        }?;
        (!address.is_null()).then_some(address as u64)
    }
}

#[cfg(windows)]
fn resolve_ordinal(library: &HostLibrary, ordinal: u16) -> Option<*const c_void> {
    unsafe { library.get_ordinal::<*const c_void>(ordinal) }.ok().map(|s| *s)
}

#[cfg(unix)]
fn resolve_ordinal(_library: &HostLibrary, _ordinal: u16) -> Option<*const c_void> {
    None
}
