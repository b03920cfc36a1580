//! Materialization of relocatable objects into executable memory.
//!
//! The server ships ELF relocatable objects (`ET_REL`). Loading one means:
//! lay out its allocatable sections in a fresh mapping (code first, then
//! read-only data and the GOT, then writable data and zero-filled bss),
//! resolve every referenced symbol (locally defined ones against the new
//! image, undefined ones through the caller's resolver chain), apply the
//! x86_64 relocations, and lock pages down to their final protections.
//!
//! Supported relocation types are the ones the small code model emits:
//! absolute 64/32/32S, PC-relative 32 (PLT32 resolves direct, there is no
//! PLT), and the GOTPCREL family backed by a per-module GOT slab.

use rustc_hash::FxHashMap;

use object::elf;
use object::{
    Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget,
    SectionIndex, SectionKind, SymbolIndex, SymbolKind, SymbolSection,
};

use crate::error::{HaloError, Result};
use crate::linker::memory::{align_up, page_size, ExecutableMemory, Protection};

/// Resolves symbols the object itself does not define.
pub trait SymbolResolver {
    /// Absolute address for `name`, or `None` if this resolver has no answer.
    fn resolve(&self, name: &str) -> Option<u64>;
}

/// A symbol exported by a materialized module.
#[derive(Debug, Clone, Copy)]
pub struct MaterializedSymbol {
    /// Absolute address in the process.
    pub address: u64,
    /// Size in bytes from the object's symbol table.
    pub size: u64,
    /// Whether the symbol is function-typed and may be used as a
    /// redirection target.
    pub callable: bool,
}

/// The result of materializing one object.
#[derive(Debug)]
pub struct MaterializedModule {
    /// Backing memory. Dropping it unmaps the module.
    pub memory: ExecutableMemory,
    /// Exported (global, defined, named) symbols.
    pub exports: FxHashMap<String, MaterializedSymbol>,
}

/// Which page group a section lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Exec,
    Const,
    Mutable,
}

fn link_err(module: &str, reason: impl Into<String>) -> HaloError {
    HaloError::Link {
        module: module.to_string(),
        reason: reason.into(),
    }
}

/// Materialize a relocatable object.
pub fn materialize(
    module_name: &str,
    bytes: &[u8],
    resolver: &dyn SymbolResolver,
) -> Result<MaterializedModule> {
    let obj = object::File::parse(bytes).map_err(|e| HaloError::Object {
        context: format!("dylib {module_name}"),
        source: e,
    })?;

    if obj.kind() != ObjectKind::Relocatable {
        return Err(link_err(
            module_name,
            format!("expected a relocatable object, got {:?}", obj.kind()),
        ));
    }

    // ---- Pass 1: classify sections and compute the image layout ----

    let mut placements: FxHashMap<SectionIndex, (Group, usize)> = FxHashMap::default();
    let mut group_sizes = [0usize; 3];

    for section in obj.sections() {
        let group = match section.kind() {
            SectionKind::Text => Group::Exec,
            SectionKind::ReadOnlyData
            | SectionKind::ReadOnlyString
            | SectionKind::ReadOnlyDataWithRel => Group::Const,
            SectionKind::Data | SectionKind::UninitializedData => Group::Mutable,
            SectionKind::Tls | SectionKind::UninitializedTls => {
                return Err(link_err(module_name, "TLS sections are not supported"));
            }
            // Notes, debug info, metadata: not mapped.
            _ => continue,
        };
        let align = (section.align().max(1)) as usize;
        let cursor = &mut group_sizes[group as usize];
        *cursor = align_up(*cursor, align);
        placements.insert(section.index(), (group, *cursor));
        *cursor += section.size() as usize;
    }

    // GOT slots live at the head of the const group, 8 bytes per symbol
    // referenced through a GOTPCREL-family relocation.
    let mut got_slots: FxHashMap<SymbolIndex, usize> = FxHashMap::default();
    for section in obj.sections() {
        if !placements.contains_key(&section.index()) {
            continue;
        }
        for (_, reloc) in section.relocations() {
            if !is_got_reloc(&reloc.flags()) {
                continue;
            }
            let RelocationTarget::Symbol(sym_idx) = reloc.target() else {
                return Err(link_err(module_name, "GOT relocation against a non-symbol"));
            };
            let next = got_slots.len();
            got_slots.entry(sym_idx).or_insert(next);
        }
    }
    let got_size = got_slots.len() * 8;

    // Page-aligned group bases: exec, then const (GOT first), then mutable.
    let page = page_size();
    let exec_base = 0usize;
    let const_base = align_up(group_sizes[Group::Exec as usize], page);
    let mutable_base = align_up(const_base + got_size + group_sizes[Group::Const as usize], page);
    let total = mutable_base + group_sizes[Group::Mutable as usize];

    let group_base = |g: Group| match g {
        Group::Exec => exec_base,
        Group::Const => const_base + got_size,
        Group::Mutable => mutable_base,
    };

    let mut memory = ExecutableMemory::map(total.max(1))?;
    let image_base = memory.base_addr();

    // ---- Pass 2: copy section contents (bss stays zero) ----

    for section in obj.sections() {
        let Some(&(group, offset)) = placements.get(&section.index()) else {
            continue;
        };
        if section.kind() == SectionKind::UninitializedData {
            continue;
        }
        let data = section.data().map_err(|e| HaloError::Object {
            context: format!("dylib {module_name} section data"),
            source: e,
        })?;
        let start = group_base(group) + offset;
        memory.slice_mut()[start..start + data.len()].copy_from_slice(data);
    }

    // ---- Pass 3: resolve symbols ----

    let section_addr = |idx: SectionIndex| -> Option<u64> {
        placements
            .get(&idx)
            .map(|&(group, offset)| image_base + (group_base(group) + offset) as u64)
    };

    let mut resolved: FxHashMap<SymbolIndex, u64> = FxHashMap::default();
    let mut resolve_symbol = |sym_idx: SymbolIndex| -> Result<u64> {
        if let Some(&addr) = resolved.get(&sym_idx) {
            return Ok(addr);
        }
        let sym = obj.symbol_by_index(sym_idx).map_err(|e| HaloError::Object {
            context: format!("dylib {module_name} symbol table"),
            source: e,
        })?;
        let addr = match sym.section() {
            SymbolSection::Section(sec_idx) => {
                let base = section_addr(sec_idx).ok_or_else(|| {
                    link_err(
                        module_name,
                        format!("symbol {:?} in unmapped section", sym.name()),
                    )
                })?;
                base + sym.address()
            }
            SymbolSection::Absolute => sym.address(),
            SymbolSection::Undefined => {
                let name = sym.name().map_err(|e| HaloError::Object {
                    context: format!("dylib {module_name} symbol name"),
                    source: e,
                })?;
                resolver.resolve(name).ok_or_else(|| HaloError::UnknownSymbol {
                    module: module_name.to_string(),
                    symbol: name.to_string(),
                })?
            }
            other => {
                return Err(link_err(
                    module_name,
                    format!("unsupported symbol binding {other:?}"),
                ));
            }
        };
        resolved.insert(sym_idx, addr);
        Ok(addr)
    };

    // ---- Pass 4: fill the GOT ----

    let got_base = image_base + const_base as u64;
    for (&sym_idx, &slot) in &got_slots {
        let addr = resolve_symbol(sym_idx)?;
        let start = const_base + slot * 8;
        memory.slice_mut()[start..start + 8].copy_from_slice(&addr.to_le_bytes());
    }

    // ---- Pass 5: apply relocations ----

    for section in obj.sections() {
        let Some(&(group, sec_offset)) = placements.get(&section.index()) else {
            continue;
        };
        let sec_image_off = group_base(group) + sec_offset;

        for (r_offset, reloc) in section.relocations() {
            let flags = reloc.flags();
            let RelocationFlags::Elf { r_type } = flags else {
                return Err(link_err(module_name, "non-ELF relocation"));
            };

            let s: u64 = match reloc.target() {
                RelocationTarget::Symbol(sym_idx) => {
                    if is_got_reloc(&flags) {
                        // G: address of the symbol's GOT slot.
                        let slot = got_slots[&sym_idx];
                        got_base + (slot * 8) as u64
                    } else {
                        resolve_symbol(sym_idx)?
                    }
                }
                RelocationTarget::Section(sec_idx) => section_addr(sec_idx).ok_or_else(|| {
                    link_err(module_name, "relocation against unmapped section")
                })?,
                _ => {
                    return Err(link_err(module_name, "unsupported relocation target"));
                }
            };

            let a = reloc.addend();
            let p = image_base + (sec_image_off + r_offset as usize) as u64;
            let spot = sec_image_off + r_offset as usize;
            let image = memory.slice_mut();

            match r_type {
                elf::R_X86_64_64 => {
                    let value = (s as i64).wrapping_add(a) as u64;
                    image[spot..spot + 8].copy_from_slice(&value.to_le_bytes());
                }
                elf::R_X86_64_PC32
                | elf::R_X86_64_PLT32
                | elf::R_X86_64_GOTPCREL
                | elf::R_X86_64_GOTPCRELX
                | elf::R_X86_64_REX_GOTPCRELX => {
                    let value = (s as i64).wrapping_add(a).wrapping_sub(p as i64);
                    let value = i32::try_from(value).map_err(|_| {
                        link_err(
                            module_name,
                            format!("PC32 relocation out of range at {p:#x}"),
                        )
                    })?;
                    image[spot..spot + 4].copy_from_slice(&value.to_le_bytes());
                }
                elf::R_X86_64_32 => {
                    let value = (s as i64).wrapping_add(a);
                    let value = u32::try_from(value).map_err(|_| {
                        link_err(module_name, format!("R_X86_64_32 overflow at {p:#x}"))
                    })?;
                    image[spot..spot + 4].copy_from_slice(&value.to_le_bytes());
                }
                elf::R_X86_64_32S => {
                    let value = (s as i64).wrapping_add(a);
                    let value = i32::try_from(value).map_err(|_| {
                        link_err(module_name, format!("R_X86_64_32S overflow at {p:#x}"))
                    })?;
                    image[spot..spot + 4].copy_from_slice(&value.to_le_bytes());
                }
                elf::R_X86_64_NONE => {}
                other => {
                    return Err(link_err(
                        module_name,
                        format!("unsupported relocation type {other}"),
                    ));
                }
            }
        }
    }

    // ---- Pass 6: final protections ----

    memory.protect(exec_base, const_base - exec_base, Protection::ReadExec)?;
    if mutable_base > const_base {
        memory.protect(const_base, mutable_base - const_base, Protection::Read)?;
    }
    // The mutable group keeps the mapping's original read-write protection.

    // ---- Exports ----

    let mut exports = FxHashMap::default();
    for sym in obj.symbols() {
        if !sym.is_global() || sym.is_undefined() {
            continue;
        }
        let SymbolSection::Section(sec_idx) = sym.section() else {
            continue;
        };
        let Some(base) = section_addr(sec_idx) else {
            continue;
        };
        let Ok(name) = sym.name() else { continue };
        if name.is_empty() {
            continue;
        }
        exports.insert(
            name.to_string(),
            MaterializedSymbol {
                address: base + sym.address(),
                size: sym.size(),
                callable: sym.kind() == SymbolKind::Text,
            },
        );
    }

    Ok(MaterializedModule { memory, exports })
}

fn is_got_reloc(flags: &RelocationFlags) -> bool {
    matches!(
        flags,
        RelocationFlags::Elf {
            r_type: elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX
        }
    )
}
