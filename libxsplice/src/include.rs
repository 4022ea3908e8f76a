//! Selects the minimal set of elements that must travel in the patch.
//!
//! Inclusion starts from every changed function and closes over relocation
//! targets with an explicit worklist. Sections that always have to be
//! present (string/symbol tables, read-only string pools, debug info, hook
//! metadata) are pulled in separately.

use crate::elf::ElfObject;
use crate::elf::Status;
use crate::elf::SymbolId;
use crate::error::Result;
use anyhow::bail;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Sections included in every patch regardless of what changed.
pub(crate) fn include_standard_elements(obj: &mut ElfObject) {
    for id in obj.section_ids().collect::<Vec<_>>() {
        let sec = obj.section(id);
        if sec.name == ".shstrtab"
            || sec.name == ".strtab"
            || sec.name == ".symtab"
            || sec.name.starts_with(".rodata.str1.")
        {
            obj.section_mut(id).include = true;
            if let Some(secsym) = obj.section(id).secsym {
                obj.symbol_mut(secsym).include = true;
            }
        }
    }

    // The null symbol.
    if let Some(sym) = obj.symbols.first_mut() {
        sym.include = true;
    }
}

/// Marks `root` and everything reachable from it through relocations.
///
/// The walk stops at sections that are already included and at unchanged
/// non-section symbols: an unchanged function keeps living in the running
/// image, so the patch only needs its symbol for linking, not its body.
pub(crate) fn include_symbol(obj: &mut ElfObject, root: SymbolId) {
    let mut worklist = vec![root];
    while let Some(sym_id) = worklist.pop() {
        let sym = obj.symbol_mut(sym_id);
        sym.include = true;
        debug!("symbol {} is included", sym.name);

        let sym = obj.symbol(sym_id);
        let Some(sec_id) = sym.section else {
            continue;
        };
        if obj.section(sec_id).include {
            continue;
        }
        if sym.kind != object::elf::STT_SECTION && sym.status == Status::Same {
            continue;
        }

        obj.section_mut(sec_id).include = true;
        debug!("section {} is included", obj.section(sec_id).name);
        if let Some(secsym) = obj.section(sec_id).secsym {
            if secsym != sym_id {
                obj.symbol_mut(secsym).include = true;
            }
        }
        let Some(rela_id) = obj.section(sec_id).rela else {
            continue;
        };
        obj.section_mut(rela_id).include = true;
        debug!("section {} is included", obj.section(rela_id).name);
        worklist.extend(obj.section(rela_id).relas.iter().map(|rela| rela.sym));
    }
}

/// Includes every changed function (with its dependency closure) and every
/// `STT_FILE` marker. Returns the number of changed functions.
pub(crate) fn include_changed_functions(obj: &mut ElfObject) -> usize {
    let mut changed = 0;
    for id in obj.symbol_ids().collect::<Vec<_>>() {
        let sym = obj.symbol(id);
        if sym.status == Status::Changed && sym.kind == object::elf::STT_FUNC {
            changed += 1;
            include_symbol(obj, id);
        } else if sym.kind == object::elf::STT_FILE {
            obj.symbol_mut(id).include = true;
        }
    }
    changed
}

/// New global symbols carry new code; include them like changed functions.
/// Returns how many were found.
pub(crate) fn include_new_globals(obj: &mut ElfObject) -> usize {
    let mut count = 0;
    for id in obj.symbol_ids().collect::<Vec<_>>() {
        let sym = obj.symbol(id);
        if sym.bind == object::elf::STB_GLOBAL
            && sym.section.is_some()
            && sym.status == Status::New
        {
            include_symbol(obj, id);
            count += 1;
        }
    }
    count
}

/// All `.debug_*` sections ride along; their relocation lists are filtered
/// down to targets whose sections made it into the patch.
pub(crate) fn include_debug_sections(obj: &mut ElfObject) {
    for id in obj.section_ids().collect::<Vec<_>>() {
        if !obj.is_debug_section(id) {
            continue;
        }
        obj.section_mut(id).include = true;
        if !obj.section(id).is_rela() {
            if let Some(secsym) = obj.section(id).secsym {
                obj.symbol_mut(secsym).include = true;
            }
        }
    }

    for id in obj.section_ids().collect::<Vec<_>>() {
        if !obj.section(id).is_rela() || !obj.is_debug_section(id) {
            continue;
        }
        let mut relas = std::mem::take(&mut obj.section_mut(id).relas);
        relas.retain(|rela| {
            obj.symbol(rela.sym)
                .section
                .is_some_and(|sec| obj.section(sec).include)
        });
        obj.section_mut(id).relas = relas;
    }
}

const HOOK_SECTION_NAMES: &[&str] = &[
    ".xsplice.hooks.load",
    ".xsplice.hooks.unload",
    ".rela.xsplice.hooks.load",
    ".rela.xsplice.hooks.unload",
];

/// Load/unload hook sections are always included. The global function-pointer
/// object the author declared (`xsplice_load_data` / `xsplice_unload_data`)
/// is only scaffolding for the hook macro: its dependencies are included,
/// then the object itself is stripped and the relocation is redirected at
/// the hook section's own section symbol.
pub(crate) fn include_hook_elements(obj: &mut ElfObject) -> Result {
    for id in obj.section_ids().collect::<Vec<_>>() {
        if !HOOK_SECTION_NAMES.contains(&obj.section(id).name.as_str()) {
            continue;
        }
        obj.section_mut(id).include = true;
        if obj.section(id).is_rela() {
            for i in 0..obj.section(id).relas.len() {
                let sym_id = obj.section(id).relas[i].sym;
                info!("found hook: {}", obj.symbol(sym_id).name);
                include_symbol(obj, sym_id);

                let Some(hook_sec) = obj.symbol(sym_id).section else {
                    bail!(
                        "hook symbol {} has no section",
                        obj.symbol(sym_id).name
                    );
                };
                let Some(secsym) = obj.section(hook_sec).secsym else {
                    bail!(
                        "hook section {} has no section symbol",
                        obj.section(hook_sec).name
                    );
                };
                obj.symbol_mut(sym_id).include = false;
                obj.section_mut(hook_sec).bundled = None;
                obj.section_mut(id).relas[i].sym = secsym;
            }
        } else if let Some(secsym) = obj.section(id).secsym {
            obj.symbol_mut(secsym).include = true;
        }
    }

    // The pointer objects are stripped by name as well; the hook macro
    // always emits them under these exact names.
    for id in obj.symbol_ids().collect::<Vec<_>>() {
        let name = &obj.symbol(id).name;
        if name == "xsplice_load_data" || name == "xsplice_unload_data" {
            obj.symbol_mut(id).include = false;
        }
    }
    Ok(())
}

/// Logs what the patch will carry.
pub(crate) fn report_changes(obj: &ElfObject) {
    for sym in &obj.symbols {
        if !sym.include || sym.section.is_none() || sym.kind != object::elf::STT_FUNC {
            continue;
        }
        match sym.status {
            Status::New => info!("new function: {}", sym.name),
            Status::Changed => info!("changed function: {}", sym.name),
            Status::Same => {}
        }
    }
}

/// Final gate before migration: every change must have been picked up, and
/// nothing unsupported may have slipped into the patch.
pub(crate) fn verify_patchability(obj: &ElfObject) -> Result {
    let mut errs = 0;
    for sec in &obj.sections {
        if sec.status == Status::Changed && !sec.include {
            warn!("changed section {} not selected for inclusion", sec.name);
            errs += 1;
        }

        if sec.status != Status::Same && sec.grouped {
            warn!("changed section {} is part of a section group", sec.name);
            errs += 1;
        }

        if sec.sh.sh_type == object::elf::SHT_GROUP && sec.status == Status::New {
            warn!("new/changed group sections are not supported");
            errs += 1;
        }

        // Data sections cannot be patched: the running image's data is live.
        // `.data.unlikely` is the exception, it only holds warn-once flags.
        if sec.include
            && sec.status != Status::New
            && (sec.name.starts_with(".data") || sec.name.starts_with(".bss"))
            && sec.name != ".data.unlikely"
        {
            warn!("data section {} selected for inclusion", sec.name);
            errs += 1;
        }
    }
    if errs > 0 {
        crate::diff_bail!("{errs} unsupported section change(s)");
    }
    Ok(())
}
