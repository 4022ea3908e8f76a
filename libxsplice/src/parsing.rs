//! Loads a relocatable object file into the in-memory model.
//!
//! Names and section contents are copied into owned buffers, so the model
//! does not borrow from the input bytes. Relocation records are decoded
//! field-by-field rather than cast, since the copied buffers carry no
//! alignment guarantee.

use crate::elf::is_string_section_name;
use crate::elf::ElfObject;
use crate::elf::HeaderInfo;
use crate::elf::Section;
use crate::elf::SectionId;
use crate::elf::SectionInfo;
use crate::elf::Status;
use crate::elf::Symbol;
use crate::elf::SymbolId;
use crate::error::Result;
use anyhow::bail;
use anyhow::Context as _;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;
use object::LittleEndian;

const RELA_ENTRY_SIZE: usize = size_of::<crate::elf::Rela>();

pub(crate) fn parse_object(data: &[u8]) -> Result<ElfObject> {
    let e = LittleEndian;
    let header = crate::elf::FileHeader::parse(data)
        .map_err(|err| anyhow::anyhow!("failed to parse ELF header: {err}"))?;

    if header.e_ident.class != object::elf::ELFCLASS64 {
        bail!("only 64 bit ELF objects are supported");
    }
    if header.e_ident.data != object::elf::ELFDATA2LSB {
        bail!("only little endian ELF objects are supported");
    }
    if header.e_type.get(e) != object::elf::ET_REL {
        bail!("input is not a relocatable object");
    }
    if header.e_machine.get(e) != object::elf::EM_X86_64 {
        bail!(
            "unsupported machine type {:#x}",
            header.e_machine.get(e)
        );
    }

    let header_info = HeaderInfo {
        ident: data[..16].try_into().unwrap(),
        e_type: header.e_type.get(e),
        machine: header.e_machine.get(e),
        version: header.e_version.get(e),
        entry: header.e_entry.get(e),
        phoff: header.e_phoff.get(e),
        flags: header.e_flags.get(e),
        ehsize: header.e_ehsize.get(e),
        phentsize: header.e_phentsize.get(e),
        shentsize: header.e_shentsize.get(e),
        phnum: header.e_phnum.get(e),
    };

    let section_table = header
        .sections(e, data)
        .map_err(|err| anyhow::anyhow!("failed to read section table: {err}"))?;

    let mut obj = ElfObject {
        header: header_info,
        sections: Vec::new(),
        symbols: Vec::new(),
        strings: Vec::new(),
    };

    // ELF index -> model id. Index 0 is the null section and has no model
    // counterpart.
    let mut ids_by_elf_index: Vec<Option<SectionId>> = vec![None; section_table.len()];

    for (elf_index, shdr) in section_table.enumerate() {
        if elf_index.0 == 0 {
            continue;
        }
        let name = section_table
            .section_name(e, shdr)
            .map_err(|err| anyhow::anyhow!("failed to read section name: {err}"))?;
        let name = String::from_utf8_lossy(name).into_owned();
        let sh_type = shdr.sh_type.get(e);
        let data_bytes = if sh_type == object::elf::SHT_NOBITS {
            Vec::new()
        } else {
            shdr.data(e, data)
                .map_err(|err| anyhow::anyhow!("failed to read section {name}: {err}"))?
                .to_vec()
        };

        let id = SectionId(obj.sections.len());
        ids_by_elf_index[elf_index.0] = Some(id);
        obj.sections.push(Section {
            name,
            sh: SectionInfo {
                sh_type,
                sh_flags: shdr.sh_flags.get(e),
                sh_addr: shdr.sh_addr.get(e),
                sh_link: shdr.sh_link.get(e),
                sh_info: shdr.sh_info.get(e),
                sh_addralign: shdr.sh_addralign.get(e),
                sh_entsize: shdr.sh_entsize.get(e),
                sh_size: shdr.sh_size.get(e),
            },
            data: data_bytes,
            index: elf_index.0,
            sh_name: 0,
            relas: Vec::new(),
            base: None,
            rela: None,
            secsym: None,
            bundled: None,
            twin: None,
            grouped: false,
            ignore: false,
            include: false,
            status: Status::New,
        });
    }

    link_rela_sections(&mut obj, &ids_by_elf_index)?;
    parse_symbols(&mut obj, data, &section_table, &ids_by_elf_index)?;
    parse_relocations(&mut obj)?;
    attach_inlined_strings(&mut obj);

    Ok(obj)
}

fn link_rela_sections(obj: &mut ElfObject, ids_by_elf_index: &[Option<SectionId>]) -> Result {
    for id in obj.section_ids().collect::<Vec<_>>() {
        let sec = obj.section(id);
        if !sec.is_rela() {
            continue;
        }
        let applies_to = sec.sh.sh_info as usize;
        let base = ids_by_elf_index
            .get(applies_to)
            .copied()
            .flatten()
            .with_context(|| {
                format!("relocation section {} has a bad sh_info link", sec.name)
            })?;
        obj.section_mut(id).base = Some(base);
        obj.section_mut(base).rela = Some(id);
    }
    Ok(())
}

fn parse_symbols(
    obj: &mut ElfObject,
    data: &[u8],
    section_table: &object::read::elf::SectionTable<crate::elf::FileHeader>,
    ids_by_elf_index: &[Option<SectionId>],
) -> Result {
    let e = LittleEndian;
    let symtab = section_table
        .symbols(e, data, object::elf::SHT_SYMTAB)
        .map_err(|err| anyhow::anyhow!("failed to read symbol table: {err}"))?;

    for sym in symtab.symbols() {
        let name = symtab
            .symbol_name(e, sym)
            .map_err(|err| anyhow::anyhow!("failed to read symbol name: {err}"))?;
        let mut name = String::from_utf8_lossy(name).into_owned();
        let st_shndx = sym.st_shndx(e);
        let section = if st_shndx != object::elf::SHN_UNDEF
            && st_shndx < object::elf::SHN_LORESERVE
        {
            ids_by_elf_index.get(st_shndx as usize).copied().flatten()
        } else {
            None
        };
        let kind = sym.st_type();
        if kind == object::elf::STT_SECTION {
            // Section symbols carry no name of their own; give them their
            // section's.
            if let Some(sec) = section {
                name = obj.section(sec).name.clone();
            }
        }

        let id = SymbolId(obj.symbols.len());
        obj.symbols.push(Symbol {
            name,
            kind,
            bind: sym.st_bind(),
            st_other: sym.st_other(),
            st_shndx,
            st_value: sym.st_value.get(e),
            st_size: sym.st_size.get(e),
            index: 0,
            st_name: 0,
            section,
            twin: None,
            include: false,
            status: Status::New,
        });

        if let Some(sec) = section {
            if kind == object::elf::STT_SECTION {
                obj.section_mut(sec).secsym = Some(id);
            } else if is_bundleable(obj, id) && obj.symbol(id).st_value == 0 {
                obj.section_mut(sec).bundled = Some(id);
            }
        }
    }
    Ok(())
}

/// Per-function/per-data compilation puts each function or object in a
/// section named after it; such a symbol is "bundled" into its section.
fn is_bundleable(obj: &ElfObject, id: SymbolId) -> bool {
    let sym = obj.symbol(id);
    let Some(sec) = sym.section else {
        return false;
    };
    let sec_name = &obj.section(sec).name;
    match sym.kind {
        object::elf::STT_FUNC => sec_name
            .strip_prefix(".text.")
            .is_some_and(|rest| rest == sym.name),
        object::elf::STT_OBJECT => [".data.", ".rodata.", ".bss."].iter().any(|prefix| {
            sec_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest == sym.name)
        }),
        _ => false,
    }
}

fn parse_relocations(obj: &mut ElfObject) -> Result {
    for id in obj.section_ids().collect::<Vec<_>>() {
        if !obj.section(id).is_rela() {
            continue;
        }
        let data = std::mem::take(&mut obj.section_mut(id).data);
        if data.len() % RELA_ENTRY_SIZE != 0 {
            bail!(
                "relocation section {} has a truncated entry",
                obj.section(id).name
            );
        }
        let mut relas = Vec::with_capacity(data.len() / RELA_ENTRY_SIZE);
        for entry in data.chunks_exact(RELA_ENTRY_SIZE) {
            let r_offset = u64::from_le_bytes(entry[0..8].try_into().unwrap());
            let r_info = u64::from_le_bytes(entry[8..16].try_into().unwrap());
            let r_addend = i64::from_le_bytes(entry[16..24].try_into().unwrap());
            let sym_index = (r_info >> 32) as usize;
            if sym_index >= obj.symbols.len() {
                bail!(
                    "relocation in {} references symbol {sym_index} out of range",
                    obj.section(id).name
                );
            }
            relas.push(crate::elf::Reloc {
                offset: r_offset,
                r_type: r_info as u32,
                addend: r_addend,
                sym: SymbolId(sym_index),
                string: None,
            });
        }
        let sec = obj.section_mut(id);
        sec.data = data;
        sec.relas = relas;
    }
    Ok(())
}

/// Record the literal bytes for relocations that land in a string section,
/// so comparison can match by content instead of by pool offset.
fn attach_inlined_strings(obj: &mut ElfObject) {
    for id in obj.section_ids().collect::<Vec<_>>() {
        if !obj.section(id).is_rela() {
            continue;
        }
        let mut relas = std::mem::take(&mut obj.section_mut(id).relas);
        for rela in &mut relas {
            let sym = obj.symbol(rela.sym);
            let Some(target_sec) = sym.section else {
                continue;
            };
            let target_sec = obj.section(target_sec);
            if !is_string_section_name(&target_sec.name) {
                continue;
            }
            let offset = sym.st_value as i64 + rela.addend;
            if offset < 0 || offset as usize >= target_sec.data.len() {
                continue;
            }
            let bytes = &target_sec.data[offset as usize..];
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            rela.string = Some(bytes[..end].to_vec());
        }
        obj.section_mut(id).relas = relas;
    }
}
