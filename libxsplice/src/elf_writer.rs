//! Serializes the output model into a relocatable ELF image.
//!
//! The string, symbol and section-header-string tables all survive migration
//! as included sections, but their contents are stale: names were rewritten
//! and most of the input's elements are gone. They are rebuilt here from the
//! final model before the file layout is computed.

use crate::elf::ElfObject;
use crate::elf::Rela;
use crate::elf::SectionHeader;
use crate::elf::SymtabEntry;
use crate::error::Result;
use anyhow::Context as _;
use object::LittleEndian;
use object::I64;
use object::U16;
use object::U32;
use object::U64;
use tracing::debug;

const FILE_HEADER_SIZE: usize = size_of::<crate::elf::FileHeader>();
const SECTION_HEADER_SIZE: usize = size_of::<SectionHeader>();

pub(crate) fn write_output(obj: &mut ElfObject) -> Result<Vec<u8>> {
    let symtab_id = obj
        .find_section_by_name(".symtab")
        .context("can't find .symtab")?;
    let strtab_id = obj
        .find_section_by_name(".strtab")
        .context("can't find .strtab")?;
    let shstrtab_id = obj
        .find_section_by_name(".shstrtab")
        .context("can't find .shstrtab")?;

    update_rela_section_headers(obj, symtab_id);
    rebuild_rela_section_data(obj);
    debug!("create shstrtab");
    rebuild_shstrtab(obj, shstrtab_id);
    debug!("create strtab");
    rebuild_strtab(obj, strtab_id);
    debug!("create symtab");
    rebuild_symtab(obj, symtab_id, strtab_id);

    Ok(serialize(obj, shstrtab_id))
}

fn update_rela_section_headers(obj: &mut ElfObject, symtab_id: crate::elf::SectionId) {
    let symtab_index = obj.section(symtab_id).index as u32;
    for id in obj.section_ids().collect::<Vec<_>>() {
        if !obj.section(id).is_rela() {
            continue;
        }
        let base_index = obj
            .section(id)
            .base
            .map(|base| obj.section(base).index as u32)
            .unwrap_or_default();
        let sec = obj.section_mut(id);
        sec.sh.sh_link = symtab_index;
        sec.sh.sh_info = base_index;
    }
}

fn rebuild_rela_section_data(obj: &mut ElfObject) {
    let e = LittleEndian;
    for id in obj.section_ids().collect::<Vec<_>>() {
        if !obj.section(id).is_rela() {
            continue;
        }
        debug!("rebuild rela section data for {}", obj.section(id).name);
        let entries: Vec<Rela> = obj
            .section(id)
            .relas
            .iter()
            .map(|rela| {
                let sym_index = obj.symbol(rela.sym).index as u64;
                Rela {
                    r_offset: U64::new(e, rela.offset),
                    r_info: U64::new(e, (sym_index << 32) | u64::from(rela.r_type)),
                    r_addend: I64::new(e, rela.addend),
                }
            })
            .collect();
        let sec = obj.section_mut(id);
        sec.data = object::bytes_of_slice(&entries).to_vec();
        sec.sh.sh_size = sec.data.len() as u64;
    }
}

fn rebuild_shstrtab(obj: &mut ElfObject, shstrtab_id: crate::elf::SectionId) {
    let mut data = vec![0u8];
    for id in obj.section_ids().collect::<Vec<_>>() {
        obj.section_mut(id).sh_name = data.len() as u32;
        data.extend_from_slice(obj.section(id).name.as_bytes());
        data.push(0);
    }
    let sec = obj.section_mut(shstrtab_id);
    sec.data = data;
    sec.sh.sh_size = sec.data.len() as u64;
}

fn rebuild_strtab(obj: &mut ElfObject, strtab_id: crate::elf::SectionId) {
    let mut data = vec![0u8];
    for sym in &mut obj.symbols {
        // Section symbols resolve their names through the section table.
        if sym.kind == object::elf::STT_SECTION || sym.name.is_empty() {
            sym.st_name = 0;
            continue;
        }
        sym.st_name = data.len() as u32;
        data.extend_from_slice(sym.name.as_bytes());
        data.push(0);
    }
    let sec = obj.section_mut(strtab_id);
    sec.data = data;
    sec.sh.sh_size = sec.data.len() as u64;
}

fn rebuild_symtab(
    obj: &mut ElfObject,
    symtab_id: crate::elf::SectionId,
    strtab_id: crate::elf::SectionId,
) {
    let e = LittleEndian;
    let entries: Vec<SymtabEntry> = obj
        .symbols
        .iter()
        .map(|sym| SymtabEntry {
            st_name: U32::new(e, sym.st_name),
            st_info: sym.st_info(),
            st_other: sym.st_other,
            st_shndx: U16::new(e, sym.st_shndx),
            st_value: U64::new(e, sym.st_value),
            st_size: U64::new(e, sym.st_size),
        })
        .collect();

    let first_nonlocal = obj
        .symbols
        .iter()
        .position(|sym| sym.bind != object::elf::STB_LOCAL)
        .unwrap_or(obj.symbols.len());
    let strtab_index = obj.section(strtab_id).index as u32;

    let sec = obj.section_mut(symtab_id);
    sec.data = object::bytes_of_slice(&entries).to_vec();
    sec.sh.sh_size = sec.data.len() as u64;
    sec.sh.sh_entsize = size_of::<SymtabEntry>() as u64;
    sec.sh.sh_addralign = 8;
    sec.sh.sh_link = strtab_index;
    sec.sh.sh_info = first_nonlocal as u32;
}

fn serialize(obj: &ElfObject, shstrtab_id: crate::elf::SectionId) -> Vec<u8> {
    let e = LittleEndian;

    // Lay the sections out in model order after the file header.
    let mut offset = FILE_HEADER_SIZE;
    let mut offsets = Vec::with_capacity(obj.sections.len());
    for sec in &obj.sections {
        if sec.sh.sh_type == object::elf::SHT_NOBITS {
            offsets.push(offset);
            continue;
        }
        let align = sec.sh.sh_addralign.max(1) as usize;
        offset = offset.next_multiple_of(align);
        offsets.push(offset);
        offset += sec.data.len();
    }
    let shoff = offset.next_multiple_of(8);
    let total = shoff + SECTION_HEADER_SIZE * (obj.sections.len() + 1);

    let mut out = vec![0u8; total];

    let ident = &obj.header.ident;
    let header = crate::elf::FileHeader {
        e_ident: object::elf::Ident {
            magic: ident[0..4].try_into().unwrap(),
            class: ident[4],
            data: ident[5],
            version: ident[6],
            os_abi: ident[7],
            abi_version: ident[8],
            padding: ident[9..16].try_into().unwrap(),
        },
        e_type: U16::new(e, object::elf::ET_REL),
        e_machine: U16::new(e, obj.header.machine),
        e_version: U32::new(e, obj.header.version),
        e_entry: U64::new(e, obj.header.entry),
        e_phoff: U64::new(e, 0),
        e_shoff: U64::new(e, shoff as u64),
        e_flags: U32::new(e, obj.header.flags),
        e_ehsize: U16::new(e, FILE_HEADER_SIZE as u16),
        e_phentsize: U16::new(e, 0),
        e_phnum: U16::new(e, 0),
        e_shentsize: U16::new(e, SECTION_HEADER_SIZE as u16),
        e_shnum: U16::new(e, (obj.sections.len() + 1) as u16),
        e_shstrndx: U16::new(e, obj.section(shstrtab_id).index as u16),
    };
    out[..FILE_HEADER_SIZE].copy_from_slice(object::bytes_of(&header));

    for (sec, &sec_offset) in obj.sections.iter().zip(&offsets) {
        if sec.sh.sh_type != object::elf::SHT_NOBITS {
            out[sec_offset..sec_offset + sec.data.len()].copy_from_slice(&sec.data);
        }
    }

    // Section header 0 stays all-zero.
    let zero = |e| SectionHeader {
        sh_name: U32::new(e, 0),
        sh_type: U32::new(e, 0),
        sh_flags: U64::new(e, 0),
        sh_addr: U64::new(e, 0),
        sh_offset: U64::new(e, 0),
        sh_size: U64::new(e, 0),
        sh_link: U32::new(e, 0),
        sh_info: U32::new(e, 0),
        sh_addralign: U64::new(e, 0),
        sh_entsize: U64::new(e, 0),
    };
    let mut headers = vec![zero(e)];
    for (sec, &sec_offset) in obj.sections.iter().zip(&offsets) {
        let size = if sec.sh.sh_type == object::elf::SHT_NOBITS {
            sec.sh.sh_size
        } else {
            sec.data.len() as u64
        };
        headers.push(SectionHeader {
            sh_name: U32::new(e, sec.sh_name),
            sh_type: U32::new(e, sec.sh.sh_type),
            sh_flags: U64::new(e, sec.sh.sh_flags),
            sh_addr: U64::new(e, sec.sh.sh_addr),
            sh_offset: U64::new(e, sec_offset as u64),
            sh_size: U64::new(e, size),
            sh_link: U32::new(e, sec.sh.sh_link),
            sh_info: U32::new(e, sec.sh.sh_info),
            sh_addralign: U64::new(e, sec.sh.sh_addralign),
            sh_entsize: U64::new(e, sec.sh.sh_entsize),
        });
    }
    out[shoff..shoff + headers.len() * SECTION_HEADER_SIZE]
        .copy_from_slice(object::bytes_of_slice(&headers));

    out
}
