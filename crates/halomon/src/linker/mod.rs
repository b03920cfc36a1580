//! JIT link/load layer.
//!
//! One [`LinkerSession`] per process. The session owns the data layout
//! string recovered from the original executable's bitcode (linking refuses
//! to proceed without it, since an object produced for the wrong layout would be
//! silently miscompiled) and the registry of loaded modules. Each
//! [`DyLib`] owns the executable memory of one server-supplied object and a
//! use-counted symbol table.
//!
//! Undefined symbols resolve against previously loaded JIT modules first,
//! then the process image via `dlsym`, then the original executable's
//! globals. Symbols hold no owning reference to their module; use counts
//! drive module reclaim-eligibility, not symbol lifetime.

pub mod materialize;
pub mod memory;

use std::ffi::CString;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use halo_wire::{DyLibInfo, SymbolInfo};

use crate::error::{HaloError, Result};
use crate::linker::materialize::{materialize, MaterializedModule, SymbolResolver};
use crate::ORIGINAL_MODULE;

/// One use-counted symbol of a loaded module.
#[derive(Debug)]
pub struct DySymbol {
    /// Absolute address after linking.
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
    /// Whether the symbol may be installed as a redirection target.
    pub callable: bool,
    /// Outstanding uses. Incremented by `require`, decremented by
    /// `release`, never below zero.
    uses: AtomicU32,
}

impl DySymbol {
    /// Current use count.
    pub fn uses(&self) -> u32 {
        self.uses.load(Ordering::Relaxed)
    }
}

/// A JIT module loaded into the process.
#[derive(Debug)]
pub struct DyLib {
    /// Unique module name from the load request.
    pub name: String,
    /// SHA-256 of the raw object bytes, for identity in logs.
    pub checksum: [u8; 32],
    symbols: FxHashMap<String, DySymbol>,
    /// The module's executable memory; pages survive exactly as long as
    /// the module record does.
    image: MaterializedModule,
}

impl DyLib {
    /// VA range [start, end) occupied by the module's image.
    pub fn image_range(&self) -> (u64, u64) {
        let base = self.image.memory.base_addr();
        (base, base + self.image.memory.len() as u64)
    }

    /// Look up a symbol without touching its use count.
    pub fn symbol(&self, name: &str) -> Option<&DySymbol> {
        self.symbols.get(name)
    }

    /// All symbols of the module.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, &DySymbol)> {
        self.symbols.iter().map(|(name, sym)| (name.as_str(), sym))
    }

    /// Retain a symbol: bump its use count and return its address.
    pub fn require(&self, name: &str) -> Result<&DySymbol> {
        let sym = self.symbols.get(name).ok_or_else(|| HaloError::UnknownSymbol {
            module: self.name.clone(),
            symbol: name.to_string(),
        })?;
        sym.uses.fetch_add(1, Ordering::Relaxed);
        Ok(sym)
    }

    /// Release one use of the symbol at `addr`. Returns true if this module
    /// held it. Counts saturate at zero.
    pub fn release_addr(&self, addr: u64) -> bool {
        for sym in self.symbols.values() {
            if sym.address == addr {
                let _ = sym
                    .uses
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |u| u.checked_sub(1));
                return true;
            }
        }
        false
    }

    /// Whether any symbol of this module is at `addr`.
    pub fn owns_addr(&self, addr: u64) -> bool {
        self.symbols.values().any(|s| s.address == addr)
    }

    /// Number of symbols with a nonzero use count.
    pub fn used_symbols(&self) -> usize {
        self.symbols.values().filter(|s| s.uses() > 0).count()
    }

    /// A module with zero used symbols may be reclaimed. Reclamation is
    /// not performed: application threads may still be executing inside
    /// the module's code, and proving otherwise needs live-thread
    /// inspection.
    pub fn reclaim_eligible(&self) -> bool {
        self.used_symbols() == 0
    }
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// `dlsym(RTLD_DEFAULT, name)` over the current process image.
pub struct ProcessResolver;

impl SymbolResolver for ProcessResolver {
    fn resolve(&self, name: &str) -> Option<u64> {
        let cname = CString::new(name).ok()?;
        // Safety: dlsym with RTLD_DEFAULT searches the global symbol scope;
        // the name pointer lives across the call.
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
        if addr.is_null() {
            None
        } else {
            Some(addr as u64)
        }
    }
}

/// Resolution chain used while materializing one module: prior JIT modules,
/// then the process image, then the original executable's globals.
struct SessionResolver<'a> {
    modules: &'a FxHashMap<String, Arc<DyLib>>,
    process: ProcessResolver,
    original_globals: &'a FxHashMap<String, u64>,
}

impl SymbolResolver for SessionResolver<'_> {
    fn resolve(&self, name: &str) -> Option<u64> {
        for module in self.modules.values() {
            if let Some(sym) = module.symbol(name) {
                return Some(sym.address);
            }
        }
        if let Some(addr) = self.process.resolve(name) {
            return Some(addr);
        }
        self.original_globals.get(name).copied()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Process-wide linker state.
#[derive(Default)]
pub struct LinkerSession {
    /// Data layout of the original executable's compile. Required before
    /// the first load.
    data_layout: Option<String>,
    /// Loaded modules by name.
    modules: FxHashMap<String, Arc<DyLib>>,
    /// Global symbols of the original executable, the last resolver tier.
    original_globals: FxHashMap<String, u64>,
}

impl LinkerSession {
    /// Fresh session with no data layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the data layout string recovered from the embedded bitcode.
    pub fn set_data_layout(&mut self, layout: String) {
        debug!("linker: data layout \"{layout}\"");
        self.data_layout = Some(layout);
    }

    /// Whether the session is ready to link.
    pub fn has_data_layout(&self) -> bool {
        self.data_layout.is_some()
    }

    /// Register the original executable's global symbols as the fallback
    /// resolution tier.
    pub fn set_original_globals(&mut self, globals: FxHashMap<String, u64>) {
        self.original_globals = globals;
    }

    /// Access a loaded module.
    pub fn module(&self, name: &str) -> Option<&Arc<DyLib>> {
        self.modules.get(name)
    }

    /// Number of loaded modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Link a server-supplied relocatable object into the process.
    ///
    /// Every declared symbol is force-resolved: missing, zero-address, or
    /// zero-size function symbols fail the load before anything is
    /// published. Returns the module handle and the reply for the server.
    pub fn load_module(
        &mut self,
        name: &str,
        object_bytes: &[u8],
        declared_symbols: &[String],
    ) -> Result<(Arc<DyLib>, DyLibInfo)> {
        if !self.has_data_layout() {
            return Err(HaloError::Link {
                module: name.to_string(),
                reason: "data layout not initialized from bitcode".to_string(),
            });
        }
        if name == ORIGINAL_MODULE || self.modules.contains_key(name) {
            return Err(HaloError::DuplicateModule {
                name: name.to_string(),
            });
        }

        let resolver = SessionResolver {
            modules: &self.modules,
            process: ProcessResolver,
            original_globals: &self.original_globals,
        };
        let image = materialize(name, object_bytes, &resolver)?;

        let mut symbols = FxHashMap::default();
        for (sym_name, sym) in &image.exports {
            symbols.insert(
                sym_name.clone(),
                DySymbol {
                    address: sym.address,
                    size: sym.size,
                    callable: sym.callable,
                    uses: AtomicU32::new(0),
                },
            );
        }

        // Force materialization of everything the server declared.
        let mut reply_symbols = Vec::with_capacity(declared_symbols.len());
        for declared in declared_symbols {
            let sym = symbols.get(declared).ok_or_else(|| HaloError::UnknownSymbol {
                module: name.to_string(),
                symbol: declared.clone(),
            })?;
            if sym.address == 0 {
                return Err(HaloError::Link {
                    module: name.to_string(),
                    reason: format!("declared symbol {declared} resolved to address zero"),
                });
            }
            if sym.callable && sym.size == 0 {
                return Err(HaloError::Link {
                    module: name.to_string(),
                    reason: format!("function symbol {declared} has size zero"),
                });
            }
            reply_symbols.push(SymbolInfo {
                label: declared.clone(),
                start: sym.address,
                size: sym.size,
                patchable: false,
            });
        }

        let checksum: [u8; 32] = Sha256::digest(object_bytes).into();
        let dylib = Arc::new(DyLib {
            name: name.to_string(),
            checksum,
            symbols,
            image,
        });

        info!(
            "linker: loaded module {} ({} bytes, {} symbols, sha256 {:02x}{:02x}{:02x}{:02x}…)",
            name,
            object_bytes.len(),
            dylib.symbols.len(),
            checksum[0],
            checksum[1],
            checksum[2],
            checksum[3],
        );

        self.modules.insert(name.to_string(), dylib.clone());

        let info = DyLibInfo {
            name: name.to_string(),
            symbols: reply_symbols,
        };
        Ok((dylib, info))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Relocatable-object fixtures shared by linker, patcher, and monitor
    //! tests.

    use super::LinkerSession;
    use object::write;
    use object::{elf, Architecture, BinaryFormat, Endianness, SectionKind, SymbolKind};

    /// A plausible x86_64 data layout string.
    pub const LAYOUT: &str = "e-m:e-i64:64-f80:128-n8:16:32:64-S128";

    /// Session with the data layout already set.
    pub fn ready_session() -> LinkerSession {
        let mut s = LinkerSession::new();
        s.set_data_layout(LAYOUT.to_string());
        s
    }

    /// Object exporting one function (`mov eax, <ret>; ret`).
    pub fn simple_object(func_name: &str, ret: i32) -> Vec<u8> {
        let mut obj =
            write::Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        let mut code = vec![0xb8];
        code.extend_from_slice(&ret.to_le_bytes());
        code.push(0xc3);
        obj.append_section_data(text, &code, 16);
        obj.add_symbol(write::Symbol {
            name: func_name.as_bytes().to_vec(),
            value: 0,
            size: code.len() as u64,
            kind: SymbolKind::Text,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: object::SymbolFlags::None,
        });
        obj.write().unwrap()
    }

    /// Object whose exported `indirect` data cell carries an absolute
    /// relocation against the external symbol `referenced`.
    pub fn referencing_object(referenced: &str) -> Vec<u8> {
        let mut obj =
            write::Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
        obj.append_section_data(data, &[0u8; 8], 8);
        obj.add_symbol(write::Symbol {
            name: b"indirect".to_vec(),
            value: 0,
            size: 8,
            kind: SymbolKind::Data,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(data),
            flags: object::SymbolFlags::None,
        });
        let external = obj.add_symbol(write::Symbol {
            name: referenced.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Undefined,
            flags: object::SymbolFlags::None,
        });
        obj.add_relocation(
            data,
            write::Relocation {
                offset: 0,
                symbol: external,
                addend: 0,
                flags: object::RelocationFlags::Elf {
                    r_type: elf::R_X86_64_64,
                },
            },
        )
        .unwrap();
        obj.write().unwrap()
    }
}
