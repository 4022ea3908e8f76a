//! In-memory model of a relocatable object file.
//!
//! Both inputs and the output are held in this representation. Ownership is
//! flat: an `ElfObject` owns its sections and symbols in two slabs and every
//! relation between them (a relocation's target, a section's relocation
//! partner, a bundled symbol) is an index into the owning slab. Twin links
//! point into the *other* input's slabs and are only meaningful while both
//! inputs are alive.

use object::LittleEndian;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type SymtabEntry = object::elf::Sym64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;

/// Size of the jump written over the start of a patched function. Functions
/// smaller than this cannot be redirected.
pub(crate) const PATCH_INSN_SIZE: u64 = 5;

/// Index of a section within its owning `ElfObject`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub(crate) struct SectionId(pub(crate) usize);

/// Index of a symbol within its owning `ElfObject`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub(crate) struct SymbolId(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) enum Status {
    #[default]
    New,
    Changed,
    Same,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::New => "NEW",
            Status::Changed => "CHANGED",
            Status::Same => "SAME",
        };
        f.write_str(s)
    }
}

/// The file-header fields we carry around: enough to verify that two inputs
/// are compatible and to reproduce the header on output.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct HeaderInfo {
    pub(crate) ident: [u8; 16],
    pub(crate) e_type: u16,
    pub(crate) machine: u16,
    pub(crate) version: u32,
    pub(crate) entry: u64,
    pub(crate) phoff: u64,
    pub(crate) flags: u32,
    pub(crate) ehsize: u16,
    pub(crate) phentsize: u16,
    pub(crate) shentsize: u16,
    pub(crate) phnum: u16,
}

/// Copy of a section header with the file-layout fields dropped. `sh_size` is
/// only authoritative for `SHT_NOBITS`; everywhere else the data buffer's
/// length wins.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SectionInfo {
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_addr: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) sh_size: u64,
}

#[derive(Debug)]
pub(crate) struct Section {
    pub(crate) name: String,
    pub(crate) sh: SectionInfo,
    pub(crate) data: Vec<u8>,
    /// Output section index, assigned by reindexing.
    pub(crate) index: usize,
    /// Offset of the name in the output `.shstrtab`.
    pub(crate) sh_name: u32,
    /// Relocations owned by this section (relocation sections only).
    pub(crate) relas: Vec<Reloc>,
    /// For a relocation section, the section its relocations apply to.
    pub(crate) base: Option<SectionId>,
    /// For a base section, its relocation section.
    pub(crate) rela: Option<SectionId>,
    /// The `STT_SECTION` symbol naming this section.
    pub(crate) secsym: Option<SymbolId>,
    /// The unique function/object symbol when this is a per-function or
    /// per-data section (`.text.foo` etc).
    pub(crate) bundled: Option<SymbolId>,
    /// Correlated section in the other input.
    pub(crate) twin: Option<SectionId>,
    pub(crate) grouped: bool,
    pub(crate) ignore: bool,
    pub(crate) include: bool,
    pub(crate) status: Status,
}

#[derive(Debug)]
pub(crate) struct Symbol {
    pub(crate) name: String,
    pub(crate) kind: u8,
    pub(crate) bind: u8,
    pub(crate) st_other: u8,
    pub(crate) st_shndx: u16,
    pub(crate) st_value: u64,
    pub(crate) st_size: u64,
    /// Output symbol index, assigned by reindexing.
    pub(crate) index: usize,
    /// Offset of the name in the output `.strtab`.
    pub(crate) st_name: u32,
    pub(crate) section: Option<SectionId>,
    /// Correlated symbol in the other input.
    pub(crate) twin: Option<SymbolId>,
    pub(crate) include: bool,
    pub(crate) status: Status,
}

#[derive(Clone, Debug)]
pub(crate) struct Reloc {
    pub(crate) offset: u64,
    pub(crate) r_type: u32,
    pub(crate) addend: i64,
    pub(crate) sym: SymbolId,
    /// The literal bytes when the target lies in a string section. Compared
    /// by content because string-pool layout shifts between compilations.
    pub(crate) string: Option<Vec<u8>>,
}

/// One parsed object file (or the output under construction).
pub(crate) struct ElfObject {
    pub(crate) header: HeaderInfo,
    pub(crate) sections: Vec<Section>,
    pub(crate) symbols: Vec<Symbol>,
    /// String pool for `.xsplice.strings`, output model only.
    pub(crate) strings: Vec<String>,
}

impl Symbol {
    pub(crate) fn st_info(&self) -> u8 {
        (self.bind << 4) | (self.kind & 0xf)
    }
}

impl Section {
    pub(crate) fn is_rela(&self) -> bool {
        self.sh.sh_type == object::elf::SHT_RELA
    }

    pub(crate) fn is_text(&self) -> bool {
        self.sh.sh_type == object::elf::SHT_PROGBITS
            && self.sh.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0
    }
}

/// String-literal pool sections are compared by content, not by offset.
pub(crate) fn is_string_section_name(name: &str) -> bool {
    name.starts_with(".rodata.str1.")
}

impl ElfObject {
    pub(crate) fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0]
    }

    pub(crate) fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0]
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    pub(crate) fn section_ids(&self) -> impl Iterator<Item = SectionId> {
        (0..self.sections.len()).map(SectionId)
    }

    pub(crate) fn symbol_ids(&self) -> impl Iterator<Item = SymbolId> {
        (0..self.symbols.len()).map(SymbolId)
    }

    pub(crate) fn find_section_by_name(&self, name: &str) -> Option<SectionId> {
        self.sections
            .iter()
            .position(|sec| sec.name == name)
            .map(SectionId)
    }

    pub(crate) fn find_symbol_by_name(&self, name: &str) -> Option<SymbolId> {
        self.symbols
            .iter()
            .position(|sym| sym.name == name)
            .map(SymbolId)
    }

    /// Debug sections are `.debug_*` and their relocation sections.
    pub(crate) fn is_debug_section(&self, id: SectionId) -> bool {
        let sec = self.section(id);
        let name = match sec.base {
            Some(base) => &self.section(base).name,
            None => &sec.name,
        };
        name.starts_with(".debug_")
    }

    /// The name to blame in diagnostics: the containing function if the
    /// section is bundled, otherwise the section itself.
    pub(crate) fn section_function_name(&self, id: SectionId) -> &str {
        let sec = self.section(id);
        let sec = match sec.base {
            Some(base) => self.section(base),
            None => sec,
        };
        match sec.bundled {
            Some(sym) => &self.symbol(sym).name,
            None => &sec.name,
        }
    }

    /// Returns the offset of `name` in the patch string pool, appending it if
    /// it isn't there yet.
    pub(crate) fn offset_of_string(&mut self, name: &str) -> u64 {
        let mut offset = 0;
        for existing in &self.strings {
            if existing == name {
                return offset;
            }
            offset += existing.len() as u64 + 1;
        }
        self.strings.push(name.to_owned());
        offset
    }

    pub(crate) fn dump(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        tracing::debug!("sections:");
        for sec in &self.sections {
            tracing::debug!(
                "  {} status={} include={} ignore={} grouped={}",
                sec.name,
                sec.status,
                sec.include,
                sec.ignore,
                sec.grouped,
            );
        }
        tracing::debug!("symbols:");
        for sym in &self.symbols {
            tracing::debug!(
                "  {} status={} include={}",
                sym.name,
                sym.status,
                sym.include,
            );
        }
    }
}
