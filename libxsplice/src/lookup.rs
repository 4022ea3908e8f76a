//! Symbol lookup against the running image.
//!
//! The patch table records where each to-be-patched function lives in the
//! running binary (e.g. `xen-syms`). Globals are matched by name; locals are
//! matched by name within the window of their translation unit, delimited by
//! `STT_FILE` markers in the image's symbol table.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context as _;
use hashbrown::HashMap;
use object::read::elf::FileHeader as _;
use object::read::elf::Sym as _;
use object::LittleEndian;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupResult {
    pub value: u64,
    pub size: u64,
}

struct ImageSymbol {
    name: String,
    kind: u8,
    bind: u8,
    defined: bool,
    value: u64,
    size: u64,
}

pub struct LookupTable {
    symbols: Vec<ImageSymbol>,
    globals_by_name: HashMap<String, LookupResult>,
}

impl LookupTable {
    pub fn from_path(path: &Path) -> Result<LookupTable> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(data: &[u8]) -> Result<LookupTable> {
        let e = LittleEndian;
        let header = crate::elf::FileHeader::parse(data)
            .map_err(|err| anyhow::anyhow!("failed to parse ELF header: {err}"))?;
        let sections = header
            .sections(e, data)
            .map_err(|err| anyhow::anyhow!("failed to read section table: {err}"))?;
        let symtab = sections
            .symbols(e, data, object::elf::SHT_SYMTAB)
            .map_err(|err| anyhow::anyhow!("failed to read symbol table: {err}"))?;

        let mut symbols = Vec::with_capacity(symtab.len());
        let mut globals_by_name = HashMap::new();
        for sym in symtab.symbols() {
            let name = symtab
                .symbol_name(e, sym)
                .map_err(|err| anyhow::anyhow!("failed to read symbol name: {err}"))?;
            let name = String::from_utf8_lossy(name).into_owned();
            let defined = sym.st_shndx(e) != object::elf::SHN_UNDEF;
            let entry = ImageSymbol {
                kind: sym.st_type(),
                bind: sym.st_bind(),
                defined,
                value: sym.st_value(e),
                size: sym.st_size(e),
                name,
            };
            if entry.bind == object::elf::STB_GLOBAL && entry.defined {
                globals_by_name
                    .entry(entry.name.clone())
                    .or_insert(LookupResult {
                        value: entry.value,
                        size: entry.size,
                    });
            }
            symbols.push(entry);
        }
        Ok(LookupTable {
            symbols,
            globals_by_name,
        })
    }

    pub fn lookup_global(&self, name: &str) -> Result<LookupResult> {
        match self.globals_by_name.get(name) {
            Some(result) => Ok(*result),
            None => bail!("global symbol {name} not found in running image"),
        }
    }

    /// Locals are only unique within their translation unit: scan the window
    /// between the `STT_FILE` marker matching `hint` and the next one.
    pub fn lookup_local(&self, name: &str, hint: &str) -> Result<LookupResult> {
        let mut in_file = false;
        for sym in &self.symbols {
            if sym.kind == object::elf::STT_FILE {
                if in_file {
                    break;
                }
                in_file = sym.name == hint;
                continue;
            }
            if !in_file {
                continue;
            }
            if sym.bind == object::elf::STB_LOCAL && sym.defined && sym.name == name {
                return Ok(LookupResult {
                    value: sym.value,
                    size: sym.size,
                });
            }
        }
        bail!("local symbol {name} ({hint}) not found in running image");
    }
}
