//! Classifies correlated sections and symbols as SAME or CHANGED.
//!
//! Comparison runs on the patched model; the base model is reached through
//! twin links and is discarded as soon as this pass completes. Uncorrelated
//! elements stay NEW.

use crate::correlate::is_constant_label;
use crate::correlate::is_special_static;
use crate::correlate::mangled_name_eq;
use crate::elf::ElfObject;
use crate::elf::Reloc;
use crate::elf::SectionId;
use crate::elf::Status;
use crate::error::Result;
use anyhow::bail;
use anyhow::Context as _;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub(crate) fn compare_correlated_elements(patched: &mut ElfObject, base: &ElfObject) -> Result {
    debug!("compare sections");
    compare_sections(patched, base)?;
    debug!("compare symbols");
    compare_symbols(patched, base)?;
    Ok(())
}

fn compare_sections(patched: &mut ElfObject, base: &ElfObject) -> Result {
    for id in patched.section_ids().collect::<Vec<_>>() {
        let status = match patched.section(id).twin {
            Some(twin) => compare_correlated_section(patched, base, id, twin)?,
            None => Status::New,
        };
        if status == Status::Changed {
            debug!("section {} has changed", patched.section(id).name);
        }
        patched.section_mut(id).status = status;
    }

    // Propagate each section's status onto its bundled symbol. A symbol is
    // changed if either its code or its relocations changed, so CHANGED is
    // never downgraded.
    for id in patched.section_ids().collect::<Vec<_>>() {
        let sec = patched.section(id);
        let status = sec.status;
        let bundled = match sec.base {
            Some(base_sec) => patched.section(base_sec).bundled,
            None => sec.bundled,
        };
        if let Some(sym) = bundled {
            if patched.symbol(sym).status != Status::Changed {
                patched.symbol_mut(sym).status = status;
            }
        }
    }
    Ok(())
}

fn compare_correlated_section(
    patched: &ElfObject,
    base: &ElfObject,
    id: SectionId,
    twin: SectionId,
) -> Result<Status> {
    let sec1 = patched.section(id);
    let sec2 = base.section(twin);
    debug!("compare correlated section: {}", sec1.name);

    if sec1.sh.sh_type != sec2.sh.sh_type
        || sec1.sh.sh_flags != sec2.sh.sh_flags
        || sec1.sh.sh_addr != sec2.sh.sh_addr
        || sec1.sh.sh_addralign != sec2.sh.sh_addralign
        || sec1.sh.sh_entsize != sec2.sh.sh_entsize
    {
        crate::diff_bail!("{} section header details differ", sec1.name);
    }

    if sec1.sh.sh_size != sec2.sh.sh_size || sec1.data.len() != sec2.data.len() {
        return Ok(Status::Changed);
    }

    if sec1.is_rela() {
        let equal = sec1.relas.len() == sec2.relas.len()
            && sec1
                .relas
                .iter()
                .zip(&sec2.relas)
                .all(|(r1, r2)| rela_equal(patched, base, r1, r2));
        Ok(if equal { Status::Same } else { Status::Changed })
    } else if sec1.sh.sh_type != object::elf::SHT_NOBITS && sec1.data != sec2.data {
        Ok(Status::Changed)
    } else {
        Ok(Status::Same)
    }
}

fn rela_equal(patched: &ElfObject, base: &ElfObject, r1: &Reloc, r2: &Reloc) -> bool {
    if r1.r_type != r2.r_type || r1.offset != r2.offset {
        return false;
    }

    // String literals are compared by content; their pool offsets shift
    // whenever any literal changes.
    if let Some(string) = &r1.string {
        return r2.string.as_ref() == Some(string);
    }

    if r1.addend != r2.addend {
        return false;
    }

    let sym1 = patched.symbol(r1.sym);
    let sym2 = base.symbol(r2.sym);
    if is_constant_label(sym1) && is_constant_label(sym2) {
        return true;
    }
    if is_special_static(patched, Some(r1.sym)) {
        return mangled_name_eq(&sym1.name, &sym2.name);
    }
    sym1.name == sym2.name
}

fn compare_symbols(patched: &mut ElfObject, base: &ElfObject) -> Result {
    for id in patched.symbol_ids().collect::<Vec<_>>() {
        match patched.symbol(id).twin {
            Some(twin) => {
                let sym1 = patched.symbol(id);
                let sym2 = base.symbol(twin);
                if sym1.st_info() != sym2.st_info()
                    || sym1.st_other != sym2.st_other
                    || sym1.section.is_some() != sym2.section.is_some()
                {
                    crate::diff_bail!("symbol info mismatch: {}", sym1.name);
                }

                // A correlated symbol whose sections aren't correlated has
                // moved between sections. Only allowed when it's moving out
                // of an ignored section.
                if let (Some(sec1), Some(sec2)) = (sym1.section, sym2.section) {
                    if patched.section(sec1).twin != Some(sec2) {
                        let moved_from = base
                            .section(sec2)
                            .twin
                            .is_some_and(|p| patched.section(p).ignore);
                        if moved_from {
                            patched.symbol_mut(id).status = Status::Changed;
                        } else {
                            crate::diff_bail!(
                                "symbol changed sections: {}, {}, {}, {}",
                                patched.symbol(id).name,
                                sym2.name,
                                patched.section(sec1).name,
                                base.section(sec2).name,
                            );
                        }
                    }
                }

                let sym1 = patched.symbol(id);
                if sym1.kind == object::elf::STT_OBJECT && sym1.st_size != sym2.st_size {
                    crate::diff_bail!("object size mismatch: {}", sym1.name);
                }

                if sym1.st_shndx == object::elf::SHN_UNDEF
                    || sym1.st_shndx == object::elf::SHN_ABS
                {
                    patched.symbol_mut(id).status = Status::Same;
                }

                // Local symbols otherwise keep the status their section's
                // comparison assigned.
            }
            None => patched.symbol_mut(id).status = Status::New,
        }
        let sym = patched.symbol(id);
        debug!("symbol {} is {}", sym.name, sym.status);
    }
    Ok(())
}

/// Processes `.xsplice.ignore.functions`: every relocation in it names a
/// function the author wants forced SAME regardless of what changed.
pub(crate) fn mark_ignored_functions_same(patched: &mut ElfObject) -> Result {
    let Some(sec_id) = patched.find_section_by_name(".xsplice.ignore.functions") else {
        return Ok(());
    };
    let Some(rela_id) = patched.section(sec_id).rela else {
        return Ok(());
    };
    for i in 0..patched.section(rela_id).relas.len() {
        let sym_id = patched.section(rela_id).relas[i].sym;
        let sym = patched.symbol(sym_id);
        let Some(func_sec) = sym.section else {
            bail!("expected bundled symbol");
        };
        if sym.kind != object::elf::STT_FUNC {
            bail!("expected function symbol");
        }
        info!("ignoring function: {}", sym.name);
        if sym.status != Status::Changed {
            warn!(
                "no change detected in function {}, unnecessary XSPLICE_IGNORE_FUNCTION()?",
                sym.name
            );
        }
        patched.symbol_mut(sym_id).status = Status::Same;
        patched.section_mut(func_sec).status = Status::Same;
        if let Some(secsym) = patched.section(func_sec).secsym {
            patched.symbol_mut(secsym).status = Status::Same;
        }
        if let Some(func_rela) = patched.section(func_sec).rela {
            patched.section_mut(func_rela).status = Status::Same;
        }
    }
    Ok(())
}

/// Processes `.xsplice.ignore.sections`: each relocation's addend points at a
/// section name literal; that section is flagged to be forced SAME after
/// comparison. Runs before comparison so symbol comparison can tell a symbol
/// moving out of an ignored section from an unsupported section change.
pub(crate) fn mark_ignored_sections(patched: &mut ElfObject) -> Result {
    let Some(sec_id) = patched.find_section_by_name(".xsplice.ignore.sections") else {
        return Ok(());
    };
    let Some(rela_id) = patched.section(sec_id).rela else {
        return Ok(());
    };
    for i in 0..patched.section(rela_id).relas.len() {
        let rela = &patched.section(rela_id).relas[i];
        let addend = rela.addend;
        let target = rela.sym;
        let Some(strsec_id) = patched.symbol(target).section else {
            bail!("XSPLICE_IGNORE_SECTION: expected a section name reference");
        };

        // The macro passes a literal string, which inevitably lands in the
        // string section and changes it. Include the string section here so
        // the change doesn't trip the patchability check when nothing else
        // touches it.
        let strsec = patched.section_mut(strsec_id);
        strsec.status = Status::Changed;
        strsec.include = true;

        let strsec = patched.section(strsec_id);
        let name = usize::try_from(addend)
            .ok()
            .and_then(|offset| strsec.data.get(offset..))
            .and_then(|bytes| bytes.split(|&b| b == 0).next())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .with_context(|| {
                format!(
                    "XSPLICE_IGNORE_SECTION: bad name offset {addend} in {}",
                    strsec.name
                )
            })?;

        let Some(mut ignore_id) = patched.find_section_by_name(&name) else {
            bail!("XSPLICE_IGNORE_SECTION: can't find {name}");
        };
        info!("ignoring section: {name}");
        if let Some(base_sec) = patched.section(ignore_id).base {
            ignore_id = base_sec;
        }
        patched.section_mut(ignore_id).ignore = true;
    }
    Ok(())
}

/// Forces every ignored section, together with its symbols and relocation
/// partner, to SAME after comparison.
pub(crate) fn mark_ignored_sections_same(patched: &mut ElfObject) {
    for id in patched.section_ids().collect::<Vec<_>>() {
        if !patched.section(id).ignore {
            continue;
        }
        patched.section_mut(id).status = Status::Same;
        if let Some(secsym) = patched.section(id).secsym {
            patched.symbol_mut(secsym).status = Status::Same;
        }
        if let Some(rela) = patched.section(id).rela {
            patched.section_mut(rela).status = Status::Same;
        }
        for sym_id in patched.symbol_ids().collect::<Vec<_>>() {
            if patched.symbol(sym_id).section == Some(id) {
                patched.symbol_mut(sym_id).status = Status::Same;
            }
        }
    }
}

pub(crate) fn mark_constant_labels_same(patched: &mut ElfObject) {
    for id in patched.symbol_ids().collect::<Vec<_>>() {
        if is_constant_label(patched.symbol(id)) {
            patched.symbol_mut(id).status = Status::Same;
        }
    }
}
