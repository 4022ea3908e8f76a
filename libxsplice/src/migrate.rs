//! Moves included elements into a fresh output model and puts them in
//! link-compliant order.
//!
//! Migration renumbers both slabs, so every cross-reference (relocation
//! targets, section symbols, bundled symbols, relocation partners) is
//! remapped; references to elements that stayed behind are severed.

use crate::elf::ElfObject;
use crate::elf::SectionId;
use crate::elf::Symbol;
use crate::elf::SymbolId;
use crate::error::Result;
use anyhow::bail;

pub(crate) fn migrate_included_elements(old: ElfObject) -> Result<ElfObject> {
    let mut section_map: Vec<Option<SectionId>> = vec![None; old.sections.len()];
    let mut next = 0;
    for (i, sec) in old.sections.iter().enumerate() {
        if sec.include {
            section_map[i] = Some(SectionId(next));
            next += 1;
        }
    }
    let mut symbol_map: Vec<Option<SymbolId>> = vec![None; old.symbols.len()];
    let mut next = 0;
    for (i, sym) in old.symbols.iter().enumerate() {
        if sym.include {
            symbol_map[i] = Some(SymbolId(next));
            next += 1;
        }
    }

    let mut out = ElfObject {
        header: old.header,
        sections: Vec::new(),
        symbols: Vec::new(),
        strings: Vec::new(),
    };

    for (i, mut sec) in old.sections.into_iter().enumerate() {
        if section_map[i].is_none() {
            continue;
        }
        sec.index = 0;
        sec.twin = None;
        sec.rela = sec.rela.and_then(|id| section_map[id.0]);
        if sec.is_rela() {
            let Some(base) = sec.base.and_then(|id| section_map[id.0]) else {
                bail!("relocation section {} included without its base", sec.name);
            };
            sec.base = Some(base);
        }
        // Break links to symbols that stayed behind.
        sec.secsym = sec.secsym.and_then(|id| symbol_map[id.0]);
        sec.bundled = sec.bundled.and_then(|id| symbol_map[id.0]);
        for rela in &mut sec.relas {
            let Some(sym) = symbol_map[rela.sym.0] else {
                bail!(
                    "relocation in {} targets a symbol that was not included",
                    sec.name
                );
            };
            rela.sym = sym;
        }
        out.sections.push(sec);
    }

    for (i, mut sym) in old.symbols.into_iter().enumerate() {
        if symbol_map[i].is_none() {
            continue;
        }
        sym.index = 0;
        sym.twin = None;
        // Break links to sections that stayed behind.
        sym.section = sym.section.and_then(|id| section_map[id.0]);
        out.symbols.push(sym);
    }

    Ok(out)
}

/// Bucket order required by linkers: the null symbol, file markers, local
/// functions, remaining locals, then globals. Relative order within each
/// bucket is preserved.
fn symbol_rank(sym: &Symbol) -> u32 {
    if sym.name.is_empty() {
        0
    } else if sym.kind == object::elf::STT_FILE {
        1
    } else if sym.bind == object::elf::STB_LOCAL && sym.kind == object::elf::STT_FUNC {
        2
    } else if sym.bind == object::elf::STB_LOCAL {
        3
    } else {
        4
    }
}

pub(crate) fn reorder_symbols(obj: &mut ElfObject) {
    let mut order: Vec<usize> = (0..obj.symbols.len()).collect();
    order.sort_by_key(|&i| symbol_rank(&obj.symbols[i]));

    let mut remap = vec![0; order.len()];
    for (new, &old) in order.iter().enumerate() {
        remap[old] = new;
    }

    let mut slots: Vec<Option<Symbol>> =
        std::mem::take(&mut obj.symbols).into_iter().map(Some).collect();
    obj.symbols = order
        .iter()
        .map(|&i| slots[i].take().expect("permutation visits each slot once"))
        .collect();

    for sec in &mut obj.sections {
        sec.secsym = sec.secsym.map(|id| SymbolId(remap[id.0]));
        sec.bundled = sec.bundled.map(|id| SymbolId(remap[id.0]));
        for rela in &mut sec.relas {
            rela.sym = SymbolId(remap[rela.sym.0]);
        }
    }
}

/// Assigns final section and symbol table indices and rewrites each symbol's
/// section-index field.
pub(crate) fn reindex_elements(obj: &mut ElfObject) {
    // Section 0 is the reserved null entry, written by the output stage.
    for (i, sec) in obj.sections.iter_mut().enumerate() {
        sec.index = i + 1;
    }

    for i in 0..obj.symbols.len() {
        obj.symbols[i].index = i;
        let shndx = match obj.symbols[i].section {
            Some(sec) => obj.sections[sec.0].index as u16,
            None if obj.symbols[i].st_shndx == object::elf::SHN_ABS => object::elf::SHN_ABS,
            None => object::elf::SHN_UNDEF,
        };
        obj.symbols[i].st_shndx = shndx;
    }
}
