//! Emits `.xsplice.funcs`, its relocations and `.xsplice.strings`.
//!
//! One record per changed function tells the runtime loader where the old
//! function lives in the running image and where the replacement lives in
//! the patch module. The record's `new_addr` and `name` slots are filled at
//! load time through ordinary absolute relocations.

use crate::elf::ElfObject;
use crate::elf::Section;
use crate::elf::SectionId;
use crate::elf::SectionInfo;
use crate::elf::Status;
use crate::elf::Symbol;
use crate::elf::SymbolId;
use crate::elf::PATCH_INSN_SIZE;
use crate::error::Result;
use crate::lookup::LookupTable;
use anyhow::bail;
use anyhow::ensure;
use anyhow::Context as _;
use object::LittleEndian;
use object::U32;
use object::U64;
use std::mem::offset_of;
use tracing::debug;

/// The record consumed by the runtime live-patching loader. Layout and
/// padding must match the target's expectation exactly.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct PatchFunc {
    pub(crate) old_addr: U64<LittleEndian>,
    pub(crate) new_addr: U64<LittleEndian>,
    pub(crate) old_size: U32<LittleEndian>,
    pub(crate) new_size: U32<LittleEndian>,
    pub(crate) name: U64<LittleEndian>,
    pub(crate) pad: [u8; 32],
}

// Safety: PatchFunc is repr(C) plain data with no padding bytes
// (8+8+4+4+8+32 = 64).
unsafe impl object::Pod for PatchFunc {}

pub(crate) const PATCH_FUNC_SIZE: usize = size_of::<PatchFunc>();

/// `<file>#<symbol>`, the form Xen's symbol table uses for local symbols.
fn mangle_local_symbol(hint: &str, name: &str) -> String {
    format!("{hint}#{name}")
}

/// Creates the empty `.xsplice.strings` section and its section symbol. The
/// data is filled in by [`build_strings_section_data`] once every name has
/// been interned.
pub(crate) fn create_strings_elements(obj: &mut ElfObject) -> (SectionId, SymbolId) {
    let sec_id = SectionId(obj.sections.len());
    obj.sections.push(Section {
        name: ".xsplice.strings".to_owned(),
        sh: SectionInfo {
            sh_type: object::elf::SHT_PROGBITS,
            sh_flags: u64::from(object::elf::SHF_ALLOC),
            sh_entsize: 1,
            sh_addralign: 1,
            ..Default::default()
        },
        data: Vec::new(),
        index: 0,
        sh_name: 0,
        relas: Vec::new(),
        base: None,
        rela: None,
        secsym: None,
        bundled: None,
        twin: None,
        grouped: false,
        ignore: false,
        include: true,
        status: Status::New,
    });

    let sym_id = SymbolId(obj.symbols.len());
    obj.symbols.push(Symbol {
        name: ".xsplice.strings".to_owned(),
        kind: object::elf::STT_SECTION,
        bind: object::elf::STB_LOCAL,
        st_other: 0,
        st_shndx: 0,
        st_value: 0,
        st_size: 0,
        index: 0,
        st_name: 0,
        section: Some(sec_id),
        twin: None,
        include: true,
        status: Status::New,
    });
    obj.section_mut(sec_id).secsym = Some(sym_id);

    (sec_id, sym_id)
}

/// Creates a PROGBITS section together with its relocation section.
fn create_section_pair(
    obj: &mut ElfObject,
    name: &str,
    entsize: usize,
    count: usize,
) -> (SectionId, SectionId) {
    let size = entsize * count;
    let sec_id = SectionId(obj.sections.len());
    obj.sections.push(Section {
        name: name.to_owned(),
        sh: SectionInfo {
            sh_type: object::elf::SHT_PROGBITS,
            sh_flags: u64::from(object::elf::SHF_ALLOC),
            sh_entsize: entsize as u64,
            sh_addralign: 8,
            sh_size: size as u64,
            ..Default::default()
        },
        data: vec![0; size],
        index: 0,
        sh_name: 0,
        relas: Vec::new(),
        base: None,
        rela: None,
        secsym: None,
        bundled: None,
        twin: None,
        grouped: false,
        ignore: false,
        include: true,
        status: Status::New,
    });

    let rela_id = SectionId(obj.sections.len());
    obj.sections.push(Section {
        name: format!(".rela{name}"),
        sh: SectionInfo {
            sh_type: object::elf::SHT_RELA,
            sh_entsize: size_of::<crate::elf::Rela>() as u64,
            sh_addralign: 8,
            ..Default::default()
        },
        data: Vec::new(),
        index: 0,
        sh_name: 0,
        relas: Vec::new(),
        base: Some(sec_id),
        rela: None,
        secsym: None,
        bundled: None,
        twin: None,
        grouped: false,
        ignore: false,
        include: true,
        status: Status::New,
    });
    obj.section_mut(sec_id).rela = Some(rela_id);

    (sec_id, rela_id)
}

/// Emits one patch record per changed function, resolved against the running
/// image's symbol table.
pub(crate) fn create_patches_sections(
    obj: &mut ElfObject,
    table: &LookupTable,
    hint: &str,
    resolve: bool,
    strings_sym: SymbolId,
) -> Result {
    let e = LittleEndian;
    let changed: Vec<SymbolId> = obj
        .symbol_ids()
        .filter(|&id| {
            let sym = obj.symbol(id);
            sym.kind == object::elf::STT_FUNC && sym.status == Status::Changed
        })
        .collect();

    let (sec_id, rela_id) = create_section_pair(
        obj,
        ".xsplice.funcs",
        PATCH_FUNC_SIZE,
        changed.len(),
    );

    let mut funcs = Vec::with_capacity(changed.len());
    let mut relas = Vec::new();
    for (index, &sym_id) in changed.iter().enumerate() {
        let sym = obj.symbol(sym_id);
        let (func_name, result) = if sym.bind == object::elf::STB_LOCAL {
            let result = table
                .lookup_local(&sym.name, hint)
                .with_context(|| format!("lookup_local_symbol {} ({hint})", sym.name))?;
            (mangle_local_symbol(hint, &sym.name), result)
        } else {
            let result = table
                .lookup_global(&sym.name)
                .with_context(|| format!("lookup_global_symbol {}", sym.name))?;
            (sym.name.clone(), result)
        };
        debug!(
            "lookup for {} @ {:#018x} len {}",
            sym.name, result.value, result.size
        );

        if result.size < PATCH_INSN_SIZE {
            bail!("{} too small to patch", sym.name);
        }

        funcs.push(PatchFunc {
            // Without --resolve the runtime fills this in at load time.
            old_addr: U64::new(e, if resolve { result.value } else { 0 }),
            new_addr: U64::new(e, 0),
            old_size: U32::new(e, result.size as u32),
            new_size: U32::new(e, obj.symbol(sym_id).st_size as u32),
            name: U64::new(e, 0),
            pad: [0; 32],
        });

        let record_offset = (index * PATCH_FUNC_SIZE) as u64;

        // Populates `new_addr` with the patched function's load address.
        relas.push(crate::elf::Reloc {
            offset: record_offset + offset_of!(PatchFunc, new_addr) as u64,
            r_type: object::elf::R_X86_64_64,
            addend: 0,
            sym: sym_id,
            string: None,
        });

        // Populates `name` with a pointer into `.xsplice.strings`.
        let name_offset = obj.offset_of_string(&func_name);
        relas.push(crate::elf::Reloc {
            offset: record_offset + offset_of!(PatchFunc, name) as u64,
            r_type: object::elf::R_X86_64_64,
            addend: name_offset as i64,
            sym: strings_sym,
            string: None,
        });
    }

    ensure!(
        funcs.len() == changed.len(),
        "size mismatch in funcs sections"
    );
    obj.section_mut(sec_id).data = object::bytes_of_slice(&funcs).to_vec();
    obj.section_mut(rela_id).relas = relas;
    Ok(())
}

/// Lays the interned strings out as NUL-terminated concatenation.
pub(crate) fn build_strings_section_data(obj: &mut ElfObject, strings_sec: SectionId) {
    let mut data = Vec::new();
    for string in &obj.strings {
        data.extend_from_slice(string.as_bytes());
        data.push(0);
    }
    let sec = obj.section_mut(strings_sec);
    sec.sh.sh_size = data.len() as u64;
    sec.data = data;
}

/// Renames local symbols to the `<file>#<symbol>` form used by Xen's symbol
/// table, so a loaded patch module's symbols stay unambiguous.
pub(crate) fn rename_local_symbols(obj: &mut ElfObject, hint: &str) {
    for sym in &mut obj.symbols {
        if sym.name.is_empty() {
            continue;
        }
        if sym.kind != object::elf::STT_FUNC && sym.kind != object::elf::STT_OBJECT {
            continue;
        }
        if sym.bind != object::elf::STB_LOCAL {
            continue;
        }
        sym.name = mangle_local_symbol(hint, &sym.name);
        debug!("local symbol mangled to: {}", sym.name);
    }
}
