//! Object-file parsing for module enrollment.
//!
//! Reads an on-disk ELF and produces everything the inventory and the
//! enrollment message need: the function symbol table, position-independence,
//! and the halo-specific sections the compiler embedded (`.halo.metadata`,
//! `.llvmcmd`, and the bitcode of the compile).

use std::fs::File;
use std::path::Path;

use addr2line::{demangle, gimli};
use memmap2::Mmap;
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SymbolKind};

use crate::error::{HaloError, Result};

/// Section holding the NUL-separated patchable-function name list.
pub const HALO_METADATA_SECTION: &str = ".halo.metadata";

/// Section holding the embedded bitcode of the compile.
pub const BITCODE_SECTION: &str = ".llvmbc";

/// Section holding the NUL-separated compiler command line.
pub const CMDLINE_SECTION: &str = ".llvmcmd";

/// One function symbol read from the object file. Addresses are link-time
/// (in-object) values; the inventory rebases them by the load delta.
#[derive(Debug, Clone)]
pub struct RawFunction {
    /// Symbol name exactly as stored in the symbol table.
    pub raw_name: String,
    /// Demangled name, or the raw name when demangling does not apply.
    pub label: String,
    /// Link-time address.
    pub address: u64,
    /// Size in bytes, always nonzero.
    pub size: u64,
}

/// Halo-specific data embedded in the original executable.
#[derive(Debug, Clone, Default)]
pub struct BinaryArtifacts {
    /// Entire bitcode of the compile.
    pub bitcode: Vec<u8>,
    /// Compiler command-line tokens.
    pub build_flags: Vec<String>,
    /// Raw names of functions the compiler marked patchable.
    pub patchable_names: Vec<String>,
}

/// Everything extracted from one object file.
#[derive(Debug)]
pub struct ParsedBinary {
    /// True for position-independent objects (delta = vma_start).
    pub is_pie: bool,
    /// Function-typed symbols with nonzero size.
    pub functions: Vec<RawFunction>,
    /// Halo sections; empty vectors when the sections are absent.
    pub artifacts: BinaryArtifacts,
}

/// Parse an ELF object from disk.
pub fn parse_binary(path: &Path) -> Result<ParsedBinary> {
    let file = File::open(path).map_err(|e| HaloError::Os {
        op: "open object file",
        source: e,
    })?;
    // Safety: the mapping is read-only and lives only for the parse.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| HaloError::Os {
        op: "mmap object file",
        source: e,
    })?;
    parse_bytes(&mmap, &path.display().to_string())
}

/// Parse an ELF object from memory.
pub fn parse_bytes(data: &[u8], context: &str) -> Result<ParsedBinary> {
    let obj = object::File::parse(data).map_err(|e| HaloError::Object {
        context: context.to_string(),
        source: e,
    })?;

    // ET_EXEC parses as Executable; PIE executables are ET_DYN and parse
    // as Dynamic, in which case sampled IPs need rebasing by the load
    // address.
    let is_pie = match obj.kind() {
        ObjectKind::Executable => false,
        _ => true,
    };

    let mut functions = Vec::new();
    for sym in obj.symbols() {
        if sym.kind() != SymbolKind::Text || sym.size() == 0 {
            continue;
        }
        let Ok(raw_name) = sym.name() else { continue };
        functions.push(RawFunction {
            raw_name: raw_name.to_string(),
            label: demangle_label(raw_name),
            address: sym.address(),
            size: sym.size(),
        });
    }

    let artifacts = BinaryArtifacts {
        bitcode: section_data(&obj, BITCODE_SECTION).unwrap_or_default(),
        build_flags: nul_separated(&section_data(&obj, CMDLINE_SECTION).unwrap_or_default()),
        patchable_names: nul_separated(
            &section_data(&obj, HALO_METADATA_SECTION).unwrap_or_default(),
        ),
    };

    Ok(ParsedBinary {
        is_pie,
        functions,
        artifacts,
    })
}

/// Demangled-or-raw label for a symbol name.
fn demangle_label(raw: &str) -> String {
    demangle(raw, gimli::DW_LANG_Rust)
        .or_else(|| demangle(raw, gimli::DW_LANG_C_plus_plus))
        .unwrap_or_else(|| raw.to_string())
}

fn section_data<'a>(obj: &object::File<'a>, name: &str) -> Option<Vec<u8>> {
    let section = obj.section_by_name(name)?;
    section.uncompressed_data().ok().map(|d| d.into_owned())
}

/// Split NUL-separated section contents, dropping empties.
fn nul_separated(data: &[u8]) -> Vec<String> {
    data.split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_separated_drops_empties() {
        let data = b"fib\0main\0\0helper\0";
        assert_eq!(nul_separated(data), vec!["fib", "main", "helper"]);
        assert!(nul_separated(b"").is_empty());
        assert!(nul_separated(b"\0\0").is_empty());
    }

    #[test]
    fn demangle_passes_through_extern_c() {
        // Patchable functions are extern "C"; their names survive untouched.
        assert_eq!(demangle_label("fib"), "fib");
    }

    #[test]
    fn demangle_handles_cxx() {
        let label = demangle_label("_Z3fooi");
        assert_eq!(label, "foo(int)");
    }

    #[test]
    fn parse_self_executable() {
        // The test binary itself is a usable ELF fixture.
        let exe = crate::host::self_exe_path().unwrap();
        let parsed = parse_binary(&exe).unwrap();
        assert!(!parsed.functions.is_empty());
        for f in &parsed.functions {
            assert!(f.size > 0);
        }
        // Rust test binaries carry no halo sections.
        assert!(parsed.artifacts.patchable_names.is_empty());
    }

    #[test]
    fn garbage_bytes_rejected() {
        assert!(parse_bytes(&[0u8; 16], "garbage").is_err());
    }
}
