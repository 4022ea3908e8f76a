//! Pairs sections and symbols across the base and patched objects.
//!
//! Correlation has to see through two kinds of compiler renaming: optimized
//! functions gain `.isra.N` / `.constprop.N` / `.part.N` suffixes whose
//! trailing number is arbitrary, and static locals gain a bare `.N` suffix.
//! Both are handled by renaming the patched element to its base counterpart
//! before anything is compared.

use crate::elf::ElfObject;
use crate::elf::SectionId;
use crate::elf::Status;
use crate::elf::Symbol;
use crate::elf::SymbolId;
use crate::error::Result;
use crate::insn;
use anyhow::bail;
use itertools::Itertools as _;
use tracing::debug;
use tracing::warn;

/// Compiler-generated static locals that exist per call site (tracing keys,
/// warn-once flags, `__func__` literals, ratelimit state). Never correlated;
/// always included when referenced.
pub(crate) const SPECIAL_STATIC_PREFIXES: &[&str] =
    &["__key.", "__warned.", "descriptor.", "__func__.", "_rs."];

/// Section holding tracing descriptor variables; treated like a special
/// static wholesale.
pub(crate) const VERBOSE_SECTION: &str = "__verbose";

pub(crate) fn verify_compatible_headers(base: &ElfObject, patched: &ElfObject) -> Result {
    let h1 = &base.header;
    let h2 = &patched.header;
    if h1.ident != h2.ident
        || h1.e_type != h2.e_type
        || h1.machine != h2.machine
        || h1.version != h2.version
        || h1.entry != h2.entry
        || h1.phoff != h2.phoff
        || h1.flags != h2.flags
        || h1.ehsize != h2.ehsize
        || h1.phentsize != h2.phentsize
        || h1.shentsize != h2.shentsize
    {
        crate::diff_bail!("ELF headers differ");
    }
    for header in [h1, h2] {
        if header.phnum != 0 {
            crate::diff_bail!("ELF contains program header");
        }
    }
    Ok(())
}

/// Flags every member of an `SHT_GROUP` section; grouped sections cannot be
/// patched and the flag feeds the final patchability check.
pub(crate) fn mark_grouped_sections(obj: &mut ElfObject) -> Result {
    let mut members = Vec::new();
    for id in obj.section_ids() {
        let sec = obj.section(id);
        if sec.sh.sh_type != object::elf::SHT_GROUP {
            continue;
        }
        // The first word is the flag word (e.g. GRP_COMDAT); the rest are
        // member section indices.
        for entry in sec.data.chunks_exact(4).skip(1) {
            let index = u32::from_le_bytes(entry.try_into().unwrap()) as usize;
            // Model ids are dense over ELF indices 1..n.
            if index == 0 || index > obj.sections.len() {
                bail!("group section member {index} not found");
            }
            members.push(SectionId(index - 1));
        }
    }
    for id in members {
        let sec = obj.section_mut(id);
        sec.grouped = true;
        debug!("marking section {} as grouped", sec.name);
    }
    Ok(())
}

/// The compiler sometimes relocates against a section symbol plus offset
/// rather than the function/object symbol itself. Substitute the real symbol
/// so relocations correlate across inputs and link against the running image.
pub(crate) fn canonicalize_section_symbol_refs(obj: &mut ElfObject) -> Result {
    for id in obj.section_ids().collect::<Vec<_>>() {
        if !obj.section(id).is_rela() || obj.is_debug_section(id) {
            continue;
        }
        let mut relas = std::mem::take(&mut obj.section_mut(id).relas);
        let result = canonicalize_relas(obj, id, &mut relas);
        obj.section_mut(id).relas = relas;
        result?;
    }
    Ok(())
}

fn canonicalize_relas(
    obj: &ElfObject,
    rela_sec: SectionId,
    relas: &mut [crate::elf::Reloc],
) -> Result {
    for rela in relas {
        let target = obj.symbol(rela.sym);
        if target.kind != object::elf::STT_SECTION {
            continue;
        }
        let Some(target_sec) = target.section else {
            continue;
        };

        // Bundled sections have exactly one symbol; use it directly.
        if let Some(bundled) = obj.section(target_sec).bundled {
            rela.sym = bundled;
            continue;
        }

        let adjust = match rela.r_type {
            object::elf::R_X86_64_PC32 => {
                let base = obj
                    .section(rela_sec)
                    .base
                    .expect("relocation section without a base");
                let data = &obj.section(base).data;
                insn::next_instruction_offset(data, rela.offset)? as i64 - rela.offset as i64
            }
            object::elf::R_X86_64_64 | object::elf::R_X86_64_32S => 0,
            _ => continue,
        };
        let effective = rela.addend + adjust;

        for sym_id in obj.symbol_ids() {
            let sym = obj.symbol(sym_id);
            if sym.kind == object::elf::STT_SECTION || sym.section != Some(target_sec) {
                continue;
            }
            let start = sym.st_value as i64;
            let end = start + sym.st_size as i64;
            if effective < start || effective >= end {
                continue;
            }
            debug!(
                "{}: replacing {}+{} reference with {}+{}",
                obj.section(rela_sec).name,
                obj.symbol(rela.sym).name,
                rela.addend,
                sym.name,
                rela.addend - start,
            );
            rela.sym = sym_id;
            rela.addend -= start;
            break;
        }
    }
    Ok(())
}

/// Compares names, treating every `.<digits>` run as a wildcard. The digits
/// the compiler appends to mangled names change arbitrarily between builds.
pub(crate) fn mangled_name_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut i = 0;
    let mut j = 0;
    loop {
        match (a.get(i), b.get(j)) {
            (None, None) => return true,
            (Some(&ca), Some(&cb)) if ca == cb => {
                if ca == b'.' && a.get(i + 1).is_some_and(u8::is_ascii_digit) {
                    if !b.get(j + 1).is_some_and(u8::is_ascii_digit) {
                        return false;
                    }
                    i += 1;
                    while a.get(i).is_some_and(u8::is_ascii_digit) {
                        i += 1;
                    }
                    j += 1;
                    while b.get(j).is_some_and(u8::is_ascii_digit) {
                        j += 1;
                    }
                } else {
                    i += 1;
                    j += 1;
                }
            }
            _ => return false,
        }
    }
}

pub(crate) fn is_special_static(obj: &ElfObject, id: Option<SymbolId>) -> bool {
    let Some(id) = id else {
        return false;
    };
    let mut sym = obj.symbol(id);
    if sym.kind == object::elf::STT_SECTION {
        if sym.name == VERBOSE_SECTION {
            return true;
        }
        let bundled = sym.section.and_then(|sec| obj.section(sec).bundled);
        let Some(bundled) = bundled else {
            return false;
        };
        sym = obj.symbol(bundled);
    }
    sym.kind == object::elf::STT_OBJECT
        && sym.bind == object::elf::STB_LOCAL
        && SPECIAL_STATIC_PREFIXES
            .iter()
            .any(|prefix| sym.name.starts_with(prefix))
}

/// Read-only-data labels of the form `.LC<digits>`.
pub(crate) fn is_constant_label(sym: &Symbol) -> bool {
    sym.bind == object::elf::STB_LOCAL
        && sym
            .name
            .strip_prefix(".LC")
            .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Renames `foo.isra.2`-style patched functions to their base counterpart so
/// they correlate. The trailing number is arbitrary and may differ even when
/// the function itself is unchanged.
pub(crate) fn rename_mangled_functions(base: &ElfObject, patched: &mut ElfObject) {
    for sym_id in patched.symbol_ids().collect::<Vec<_>>() {
        let sym = patched.symbol(sym_id);
        if sym.kind != object::elf::STT_FUNC {
            continue;
        }
        if !sym.name.contains(".isra.")
            && !sym.name.contains(".constprop.")
            && !sym.name.contains(".part.")
        {
            continue;
        }

        let candidate = base
            .symbols
            .iter()
            .enumerate()
            .filter(|(_, basesym)| {
                basesym.kind == object::elf::STT_FUNC && mangled_name_eq(&basesym.name, &sym.name)
            })
            .at_most_one();
        let (base_id, basesym) = match candidate {
            Ok(Some(found)) => found,
            Ok(None) => continue,
            Err(_) => {
                debug!("multiple base candidates for mangled function {}", sym.name);
                continue;
            }
        };
        let base_id = SymbolId(base_id);
        if sym.name == basesym.name {
            continue;
        }

        debug!("renaming {} to {}", sym.name, basesym.name);
        let orig_name = sym.name.clone();
        let new_name = basesym.name.clone();
        patched.symbol_mut(sym_id).name = new_name.clone();

        // Only bundled symbols drag their sections along.
        let Some(sec_id) = patched.symbol(sym_id).section else {
            continue;
        };
        if patched.section(sec_id).bundled != Some(sym_id) {
            continue;
        }
        let Some(base_sec_name) = base.symbol(base_id).section.map(|s| base.section(s).name.clone())
        else {
            continue;
        };
        patched.section_mut(sec_id).name = base_sec_name.clone();
        if let Some(rela_id) = patched.section(sec_id).rela {
            patched.section_mut(rela_id).name = format!(".rela{base_sec_name}");
        }

        // A function with a switch statement may have a bundled
        // `.rodata.foo.isra.1` jump-table section next to `.text.foo.isra.1`.
        let old_rodata = format!(".rodata.{orig_name}");
        let new_rodata = format!(".rodata.{new_name}");
        let Some(rodata_id) = patched.find_section_by_name(&old_rodata) else {
            continue;
        };
        if base.find_section_by_name(&new_rodata).is_none() {
            continue;
        }
        patched.section_mut(rodata_id).name = new_rodata.clone();
        if let Some(secsym) = patched.section(rodata_id).secsym {
            patched.symbol_mut(secsym).name = new_rodata.clone();
        }
        if let Some(rela_id) = patched.section(rodata_id).rela {
            patched.section_mut(rela_id).name = format!(".rela{new_rodata}");
        }
    }
}

pub(crate) fn correlate_objects(base: &mut ElfObject, patched: &mut ElfObject) {
    correlate_sections(base, patched);
    correlate_symbols(base, patched);
}

fn correlate_sections(base: &mut ElfObject, patched: &mut ElfObject) {
    for base_id in base.section_ids() {
        let base_sec = base.section(base_id);

        // Special statics are never correlated; judge by the section symbol
        // (of the applies-to section for relocation sections).
        let judged = match base_sec.base {
            Some(b) => base.section(b).secsym,
            None => base_sec.secsym,
        };
        if is_special_static(base, judged) {
            continue;
        }

        let Some(patched_id) = patched.section_ids().find(|&p| {
            let p_sec = patched.section(p);
            if p_sec.twin.is_some() || p_sec.name != base_sec.name {
                return false;
            }
            // Group sections must match exactly to be correlated; changed
            // group sections are not supported.
            if base_sec.sh.sh_type == object::elf::SHT_GROUP && base_sec.data != p_sec.data {
                return false;
            }
            true
        }) else {
            continue;
        };

        debug!("found section twins: {}", base_sec.name);
        base.section_mut(base_id).twin = Some(patched_id);
        base.section_mut(base_id).status = Status::Same;
        patched.section_mut(patched_id).twin = Some(base_id);
        patched.section_mut(patched_id).status = Status::Same;
    }
}

fn correlate_symbols(base: &mut ElfObject, patched: &mut ElfObject) {
    for base_id in base.symbol_ids() {
        let base_sym = base.symbol(base_id);
        if is_special_static(base, Some(base_id)) || is_constant_label(base_sym) {
            continue;
        }
        let Some(patched_id) = patched.symbol_ids().find(|&p| {
            let p_sym = patched.symbol(p);
            if p_sym.twin.is_some()
                || p_sym.name != base_sym.name
                || p_sym.kind != base_sym.kind
            {
                return false;
            }
            // Symbols owned by a group section only correlate when their
            // sections do.
            if let Some(sec) = base_sym.section {
                if base.section(sec).sh.sh_type == object::elf::SHT_GROUP
                    && base.section(sec).twin != p_sym.section
                {
                    return false;
                }
            }
            true
        }) else {
            continue;
        };

        debug!("found symbol twins: {}", base_sym.name);
        base.symbol_mut(base_id).twin = Some(patched_id);
        base.symbol_mut(base_id).status = Status::Same;
        patched.symbol_mut(patched_id).twin = Some(base_id);
        patched.symbol_mut(patched_id).status = Status::Same;
    }
}

/// Static locals are renamed `__foo` -> `__foo.31452` and the number changes
/// arbitrarily. Match them through the functions that reference them, then
/// rename and correlate the patched symbol to the base one.
pub(crate) fn correlate_static_local_variables(
    base: &mut ElfObject,
    patched: &mut ElfObject,
) -> Result {
    for sym_id in patched.symbol_ids().collect::<Vec<_>>() {
        let sym = patched.symbol(sym_id);
        if sym.kind != object::elf::STT_OBJECT
            || sym.bind != object::elf::STB_LOCAL
            || sym.twin.is_some()
        {
            continue;
        }
        if is_special_static(patched, Some(sym_id)) {
            continue;
        }
        if !sym.name.contains('.') {
            continue;
        }

        // Multiple functions may reference the variable if it's defined in an
        // inlined function; every referencing function must agree on the
        // base twin.
        let mut used_by = None;
        let mut base_twin = None;
        for sec_id in patched.section_ids() {
            let sec = patched.section(sec_id);
            if !sec.is_rela() || patched.is_debug_section(sec_id) {
                continue;
            }
            let applies_to = sec.base.expect("relocation section without a base");
            if !patched.section(applies_to).is_text() {
                continue;
            }
            if !sec.relas.iter().any(|rela| rela.sym == sym_id) {
                continue;
            }
            let candidate = find_static_twin(base, patched, sec_id, sym_id)?;
            if let (Some(prev), Some(new)) = (base_twin, candidate) {
                if prev != new {
                    bail!(
                        "found two twins for static local variable {}: {} and {}",
                        patched.symbol(sym_id).name,
                        base.symbol(prev).name,
                        base.symbol(new).name,
                    );
                }
            }
            if base_twin.is_none() {
                base_twin = candidate;
            }
            used_by = Some(sec_id);
        }

        let Some(used_by) = used_by else {
            bail!("static local variable {} not used", patched.symbol(sym_id).name);
        };
        let Some(base_id) = base_twin else {
            warn!(
                "unable to correlate static local variable {} used by {}, assuming variable is new",
                patched.symbol(sym_id).name,
                patched.section_function_name(used_by),
            );
            continue;
        };

        let sym_sec = patched
            .symbol(sym_id)
            .section
            .expect("static local without a section");
        let base_sec = base
            .symbol(base_id)
            .section
            .expect("static local without a section");
        let bundled = patched.section(sym_sec).bundled == Some(sym_id);
        let base_bundled = base.section(base_sec).bundled == Some(base_id);
        if bundled != base_bundled {
            bail!("bundle mismatch for symbol {}", patched.symbol(sym_id).name);
        }
        if !bundled && patched.section(sym_sec).twin != Some(base_sec) {
            bail!(
                "sections {} and {} aren't correlated",
                patched.section(sym_sec).name,
                base.section(base_sec).name,
            );
        }

        debug!(
            "renaming and correlating {} to {}",
            patched.symbol(sym_id).name,
            base.symbol(base_id).name,
        );
        patched.symbol_mut(sym_id).name = base.symbol(base_id).name.clone();
        patched.symbol_mut(sym_id).twin = Some(base_id);
        patched.symbol_mut(sym_id).status = Status::Same;
        base.symbol_mut(base_id).twin = Some(sym_id);
        base.symbol_mut(base_id).status = Status::Same;

        if bundled {
            patched.section_mut(sym_sec).twin = Some(base_sec);
            patched.section_mut(sym_sec).status = Status::Same;
            base.section_mut(base_sec).twin = Some(sym_sec);
            base.section_mut(base_sec).status = Status::Same;
        }
    }
    Ok(())
}

/// Given a static local and a patched relocation section referencing it, find
/// the corresponding variable usage in the section's base-object twin.
fn find_static_twin(
    base: &ElfObject,
    patched: &ElfObject,
    sec_id: SectionId,
    sym_id: SymbolId,
) -> Result<Option<SymbolId>> {
    let Some(twin_sec) = patched.section(sec_id).twin else {
        return Ok(None);
    };
    let sym_name = &patched.symbol(sym_id).name;

    // No other orphaned static with a matching name may appear in the same
    // function, or the pairing would be ambiguous. Possible when variables
    // live in different scopes or one belongs to an inlined function.
    for rela in &patched.section(sec_id).relas {
        if rela.sym == sym_id || patched.symbol(rela.sym).twin.is_some() {
            continue;
        }
        if mangled_name_eq(&patched.symbol(rela.sym).name, sym_name) {
            bail!(
                "found another static local variable matching {} in patched {}",
                sym_name,
                patched.section_function_name(sec_id),
            );
        }
    }

    let mut found = None;
    for rela in &base.section(twin_sec).relas {
        let target = base.symbol(rela.sym);
        if target.twin.is_some() || !mangled_name_eq(&target.name, sym_name) {
            continue;
        }
        if found.is_some_and(|prev| prev != rela.sym) {
            bail!(
                "found two static local variables matching {} in orig {}",
                sym_name,
                patched.section_function_name(sec_id),
            );
        }
        found = Some(rela.sym);
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::test_support::*;

    #[test]
    fn mangled_equality() {
        assert!(mangled_name_eq("foo", "foo"));
        assert!(mangled_name_eq("foo.isra.1", "foo.isra.2"));
        assert!(mangled_name_eq("counter.7", "counter.9"));
        assert!(mangled_name_eq("a.1.b.22", "a.9.b.3"));
        assert!(!mangled_name_eq("foo", "bar"));
        assert!(!mangled_name_eq("foo.1", "foo.x"));
        assert!(!mangled_name_eq("foo.1", "foo"));
        assert!(!mangled_name_eq("foo.isra.1", "fop.isra.1"));
        // A dot not followed by a digit compares literally.
        assert!(mangled_name_eq("a.b", "a.b"));
        assert!(!mangled_name_eq("a.b", "a.c"));
    }

    #[test]
    fn constant_labels() {
        let mut obj = empty_object();
        let mk = |obj: &mut crate::elf::ElfObject, name: &str, bind| {
            add_symbol(obj, name, object::elf::STT_NOTYPE, bind, None)
        };
        let lc0 = mk(&mut obj, ".LC0", object::elf::STB_LOCAL);
        let lc42 = mk(&mut obj, ".LC42", object::elf::STB_LOCAL);
        let bare = mk(&mut obj, ".LC", object::elf::STB_LOCAL);
        let alpha = mk(&mut obj, ".LC1a", object::elf::STB_LOCAL);
        let global = mk(&mut obj, ".LC1", object::elf::STB_GLOBAL);
        assert!(is_constant_label(obj.symbol(lc0)));
        assert!(is_constant_label(obj.symbol(lc42)));
        assert!(!is_constant_label(obj.symbol(bare)));
        assert!(!is_constant_label(obj.symbol(alpha)));
        assert!(!is_constant_label(obj.symbol(global)));
    }

    #[test]
    fn special_statics() {
        let mut obj = empty_object();
        let warned = add_symbol(
            &mut obj,
            "__warned.1234",
            object::elf::STT_OBJECT,
            object::elf::STB_LOCAL,
            None,
        );
        assert!(is_special_static(&obj, Some(warned)));

        let plain = add_symbol(
            &mut obj,
            "counter.7",
            object::elf::STT_OBJECT,
            object::elf::STB_LOCAL,
            None,
        );
        assert!(!is_special_static(&obj, Some(plain)));

        // A section symbol is judged through its bundled symbol.
        let sec = add_section(&mut obj, ".data.__key.9", object::elf::SHT_PROGBITS);
        let key = add_symbol(
            &mut obj,
            "__key.9",
            object::elf::STT_OBJECT,
            object::elf::STB_LOCAL,
            Some(sec),
        );
        obj.section_mut(sec).bundled = Some(key);
        let secsym = add_symbol(
            &mut obj,
            ".data.__key.9",
            object::elf::STT_SECTION,
            object::elf::STB_LOCAL,
            Some(sec),
        );
        obj.section_mut(sec).secsym = Some(secsym);
        assert!(is_special_static(&obj, Some(secsym)));

        let verbose_sec = add_section(&mut obj, VERBOSE_SECTION, object::elf::SHT_PROGBITS);
        let verbose_sym = add_symbol(
            &mut obj,
            VERBOSE_SECTION,
            object::elf::STT_SECTION,
            object::elf::STB_LOCAL,
            Some(verbose_sec),
        );
        assert!(is_special_static(&obj, Some(verbose_sym)));

        assert!(!is_special_static(&obj, None));
    }

    #[test]
    fn correlation_is_symmetric_and_unique() {
        let mut base = empty_object();
        let mut patched = empty_object();
        for obj in [&mut base, &mut patched] {
            let text = add_section(obj, ".text.foo", object::elf::SHT_PROGBITS);
            add_symbol(
                obj,
                "foo",
                object::elf::STT_FUNC,
                object::elf::STB_GLOBAL,
                Some(text),
            );
        }
        correlate_objects(&mut base, &mut patched);
        assert_eq!(base.sections[0].twin, Some(SectionId(0)));
        assert_eq!(patched.sections[0].twin, Some(SectionId(0)));
        assert_eq!(base.symbols[0].twin, Some(SymbolId(0)));
        assert_eq!(patched.symbols[0].twin, Some(SymbolId(0)));
        assert_eq!(base.symbols[0].status, Status::Same);
    }
}
