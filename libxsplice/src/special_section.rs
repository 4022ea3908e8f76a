//! Regenerates architecture metadata sections at group granularity.
//!
//! Sections like `.ex_table` and `.bug_frames.*` are tables of fixed-size
//! records pointing into function bodies. The patch must carry only the
//! records that point at included code, so each section is rebuilt from the
//! base bytes group by group, keeping a group iff one of its relocations
//! targets an included function.

use crate::elf::ElfObject;
use crate::elf::SectionId;
use crate::elf::Status;
use crate::error::Result;
use anyhow::bail;
use anyhow::Context as _;
use tracing::debug;

enum GroupSize {
    Fixed(u64),
    /// `.fixup` groups vary in size; boundaries are the `.fixup` references
    /// in `.rela.ex_table`.
    FixupScan,
}

struct SpecialSection {
    name: &'static str,
    group_size: GroupSize,
}

// `.fixup` must precede `.ex_table`: computing fixup group boundaries needs
// the `.ex_table` relocations intact.
const SPECIAL_SECTIONS: &[SpecialSection] = &[
    SpecialSection {
        name: ".bug_frames.0",
        group_size: GroupSize::Fixed(8),
    },
    SpecialSection {
        name: ".bug_frames.1",
        group_size: GroupSize::Fixed(8),
    },
    SpecialSection {
        name: ".bug_frames.2",
        group_size: GroupSize::Fixed(8),
    },
    SpecialSection {
        name: ".bug_frames.3",
        group_size: GroupSize::Fixed(16),
    },
    SpecialSection {
        name: ".fixup",
        group_size: GroupSize::FixupScan,
    },
    SpecialSection {
        name: ".ex_table",
        group_size: GroupSize::Fixed(8),
    },
    SpecialSection {
        name: ".altinstructions",
        group_size: GroupSize::Fixed(12),
    },
];

pub(crate) fn process_special_sections(obj: &mut ElfObject) -> Result {
    for special in SPECIAL_SECTIONS {
        let Some(sec_id) = obj.find_section_by_name(special.name) else {
            continue;
        };
        let Some(rela_id) = obj.section(sec_id).rela else {
            continue;
        };
        regenerate_special_section(obj, special, rela_id)?;
    }

    include_altinstr_replacement(obj);
    Ok(())
}

fn group_size(obj: &ElfObject, special: &SpecialSection, offset: u64) -> Result<u64> {
    match special.group_size {
        GroupSize::Fixed(size) => Ok(size),
        GroupSize::FixupScan => fixup_group_size(obj, offset),
    }
}

/// The group starting at `offset` in `.fixup` extends to the next `.fixup`
/// reference in `.rela.ex_table`, or to the section end for the last group.
fn fixup_group_size(obj: &ElfObject, offset: u64) -> Result<u64> {
    let sec_id = obj
        .find_section_by_name(".rela.ex_table")
        .context("missing .rela.ex_table section")?;
    let relas = &obj.section(sec_id).relas;
    let start = relas
        .iter()
        .position(|rela| {
            obj.symbol(rela.sym).name == ".fixup" && rela.addend == offset as i64
        })
        .with_context(|| format!("can't find .fixup rela group at offset {offset}"))?;

    for rela in &relas[start + 1..] {
        if obj.symbol(rela.sym).name == ".fixup" && rela.addend > offset as i64 {
            return Ok(rela.addend as u64 - offset);
        }
    }

    // Last group.
    let fixup = obj
        .find_section_by_name(".fixup")
        .context("missing .fixup section")?;
    Ok(obj.section(fixup).sh.sh_size - offset)
}

fn should_keep_rela_group(
    obj: &ElfObject,
    relas: &[crate::elf::Reloc],
    start: u64,
    size: u64,
    section_name: &str,
) -> bool {
    let mut found = false;
    for rela in relas {
        if rela.offset < start || rela.offset >= start + size {
            continue;
        }
        let sym = obj.symbol(rela.sym);
        if sym.kind != object::elf::STT_FUNC {
            continue;
        }
        if sym.section.is_some_and(|sec| obj.section(sec).include) {
            found = true;
            debug!(
                "new/changed symbol {} found in special section {}",
                sym.name, section_name,
            );
        }
    }
    found
}

fn regenerate_special_section(
    obj: &mut ElfObject,
    special: &SpecialSection,
    rela_id: SectionId,
) -> Result {
    let base_id = obj
        .section(rela_id)
        .base
        .expect("relocation section without a base");
    let src = obj.section(base_id).data.clone();
    let base_size = obj.section(base_id).sh.sh_size;
    let section_name = obj.section(rela_id).name.clone();

    let mut old_relas = std::mem::take(&mut obj.section_mut(rela_id).relas);
    let mut new_relas = Vec::new();
    let mut dest = Vec::with_capacity(src.len());

    let mut src_offset = 0;
    let mut dest_offset = 0;
    while src_offset < base_size {
        let size = group_size(obj, special, src_offset)?;
        if should_keep_rela_group(obj, &old_relas, src_offset, size, &section_name) {
            // Move the group's relocations, rebasing their offsets into the
            // compacted buffer. They may not be sorted (e.g. `.rela.fixup`),
            // so scan the whole list.
            let mut i = 0;
            while i < old_relas.len() {
                if old_relas[i].offset >= src_offset && old_relas[i].offset < src_offset + size {
                    let mut rela = old_relas.remove(i);
                    rela.offset = rela.offset - src_offset + dest_offset;
                    obj.symbol_mut(rela.sym).include = true;
                    new_relas.push(rela);
                } else {
                    i += 1;
                }
            }

            let group = src
                .get(src_offset as usize..(src_offset + size) as usize)
                .with_context(|| format!("group at {src_offset} runs past {}", special.name))?;
            dest.extend_from_slice(group);
            dest_offset += size;
        }
        src_offset += size;
    }

    // The walk must land exactly on the aligned section end, or the group
    // size table doesn't describe this section.
    let align = obj.section(base_id).sh.sh_addralign.max(1);
    let aligned_size = base_size.div_ceil(align) * align;
    if src_offset != aligned_size {
        bail!("group size mismatch for section {}", special.name);
    }

    if dest_offset == 0 {
        // No group referenced included code; the section pair drops out of
        // the patch entirely.
        let sec = obj.section_mut(rela_id);
        sec.status = Status::Same;
        sec.include = false;
        sec.relas = old_relas;
        let base_sec = obj.section_mut(base_id);
        base_sec.status = Status::Same;
        base_sec.include = false;
        return Ok(());
    }

    obj.section_mut(rela_id).relas = new_relas;
    obj.section_mut(rela_id).include = true;
    let base_sec = obj.section_mut(base_id);
    base_sec.include = true;
    base_sec.data = dest;
    base_sec.sh.sh_size = dest_offset;
    Ok(())
}

/// `.altinstr_replacement` holds the replacement bodies that
/// `.altinstructions` entries point into; none of its relocations reference
/// non-included symbols, so the whole section rides along.
fn include_altinstr_replacement(obj: &mut ElfObject) {
    let Some(sec_id) = obj.find_section_by_name(".altinstr_replacement") else {
        return;
    };
    obj.section_mut(sec_id).include = true;

    for sym_id in obj.symbol_ids().collect::<Vec<_>>() {
        if obj.symbol(sym_id).section == Some(sec_id) {
            obj.symbol_mut(sym_id).include = true;
        }
    }

    if let Some(rela_id) = obj.section(sec_id).rela {
        obj.section_mut(rela_id).include = true;
        for i in 0..obj.section(rela_id).relas.len() {
            let target = obj.section(rela_id).relas[i].sym;
            obj.symbol_mut(target).include = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::test_support::*;
    use crate::elf::Reloc;

    fn reloc(sym: crate::elf::SymbolId, offset: u64) -> Reloc {
        Reloc {
            offset,
            r_type: object::elf::R_X86_64_PC32,
            addend: 0,
            sym,
            string: None,
        }
    }

    /// An `.ex_table` with two 8-byte groups: the first points at an included
    /// function, the second at an excluded one.
    fn ex_table_object() -> (ElfObject, SectionId, SectionId) {
        let mut obj = empty_object();
        let text_in = add_section(&mut obj, ".text.keep", object::elf::SHT_PROGBITS);
        obj.section_mut(text_in).include = true;
        let keep = add_symbol(
            &mut obj,
            "keep",
            object::elf::STT_FUNC,
            object::elf::STB_LOCAL,
            Some(text_in),
        );
        let text_out = add_section(&mut obj, ".text.drop", object::elf::SHT_PROGBITS);
        let drop = add_symbol(
            &mut obj,
            "drop",
            object::elf::STT_FUNC,
            object::elf::STB_LOCAL,
            Some(text_out),
        );

        let ex_table = add_section(&mut obj, ".ex_table", object::elf::SHT_PROGBITS);
        {
            let sec = obj.section_mut(ex_table);
            sec.data = (0u8..16).collect();
            sec.sh.sh_size = 16;
            sec.sh.sh_addralign = 8;
        }
        let rela = add_section(&mut obj, ".rela.ex_table", object::elf::SHT_RELA);
        obj.section_mut(rela).base = Some(ex_table);
        obj.section_mut(ex_table).rela = Some(rela);
        obj.section_mut(rela).relas = vec![reloc(keep, 0), reloc(drop, 8)];
        (obj, ex_table, rela)
    }

    #[test]
    fn keeps_only_groups_referencing_included_code() {
        let (mut obj, ex_table, rela) = ex_table_object();
        process_special_sections(&mut obj).unwrap();

        let sec = obj.section(ex_table);
        assert!(sec.include);
        assert_eq!(sec.data, (0u8..8).collect::<Vec<_>>());
        let relas = &obj.section(rela).relas;
        assert_eq!(relas.len(), 1);
        assert_eq!(relas[0].offset, 0);
    }

    #[test]
    fn drops_section_when_nothing_survives() {
        let (mut obj, ex_table, rela) = ex_table_object();
        // Exclude everything.
        let keep_sec = obj.find_section_by_name(".text.keep").unwrap();
        obj.section_mut(keep_sec).include = false;
        process_special_sections(&mut obj).unwrap();

        assert!(!obj.section(ex_table).include);
        assert!(!obj.section(rela).include);
        assert_eq!(obj.section(ex_table).status, Status::Same);
        // The original data and relocations are untouched.
        assert_eq!(obj.section(ex_table).data.len(), 16);
        assert_eq!(obj.section(rela).relas.len(), 2);
    }

    #[test]
    fn rebases_offsets_into_compacted_buffer() {
        let (mut obj, ex_table, rela) = ex_table_object();
        // Make the *second* group the kept one.
        let keep_sec = obj.find_section_by_name(".text.keep").unwrap();
        let drop_sec = obj.find_section_by_name(".text.drop").unwrap();
        obj.section_mut(keep_sec).include = false;
        obj.section_mut(drop_sec).include = true;
        process_special_sections(&mut obj).unwrap();

        assert_eq!(obj.section(ex_table).data, (8u8..16).collect::<Vec<_>>());
        let relas = &obj.section(rela).relas;
        assert_eq!(relas.len(), 1);
        // The group moved from source offset 8 to destination offset 0.
        assert_eq!(relas[0].offset, 0);
    }

    #[test]
    fn fixup_groups_are_delimited_by_ex_table_references() {
        let mut obj = empty_object();
        let fixup = add_section(&mut obj, ".fixup", object::elf::SHT_PROGBITS);
        obj.section_mut(fixup).sh.sh_size = 20;
        let fixup_sym = add_symbol(
            &mut obj,
            ".fixup",
            object::elf::STT_SECTION,
            object::elf::STB_LOCAL,
            Some(fixup),
        );
        obj.section_mut(fixup).secsym = Some(fixup_sym);

        let ex_table = add_section(&mut obj, ".ex_table", object::elf::SHT_PROGBITS);
        let rela = add_section(&mut obj, ".rela.ex_table", object::elf::SHT_RELA);
        obj.section_mut(rela).base = Some(ex_table);
        obj.section_mut(ex_table).rela = Some(rela);
        let mut fixup_ref = |obj: &mut ElfObject, offset: u64, addend: i64| {
            let mut r = reloc(fixup_sym, offset);
            r.addend = addend;
            obj.section_mut(rela).relas.push(r);
        };
        fixup_ref(&mut obj, 4, 0);
        fixup_ref(&mut obj, 12, 6);
        fixup_ref(&mut obj, 20, 13);

        assert_eq!(fixup_group_size(&obj, 0).unwrap(), 6);
        assert_eq!(fixup_group_size(&obj, 6).unwrap(), 7);
        // Last group extends to the end of the section.
        assert_eq!(fixup_group_size(&obj, 13).unwrap(), 7);
        assert!(fixup_group_size(&obj, 3).is_err());
    }
}
