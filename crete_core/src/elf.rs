use crate::error::CreteError;
use goblin::elf::Elf;
use goblin::elf::header::ET_DYN;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A named symbol with its link-time address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntry {
    pub address: u64,
    pub size: u64,
}

/// A named section with its link-time address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    pub address: u64,
    pub size: u64,
}

/// Symbol and section tables of one ELF file, copied out of the parsed image
/// so the file bytes need not be kept around.
#[derive(Debug, Clone)]
pub struct ElfImage {
    relocatable: bool,
    symtab: HashMap<String, SymbolEntry>,
    dynsym: HashMap<String, SymbolEntry>,
    sections: HashMap<String, SectionEntry>,
}

impl ElfImage {
    pub fn load(path: &Path) -> Result<Self, CreteError> {
        let bytes = fs::read(path).map_err(|e| CreteError::io(path, e))?;
        Self::parse(path, &bytes)
    }

    pub fn parse(path: &Path, bytes: &[u8]) -> Result<Self, CreteError> {
        let elf = Elf::parse(bytes).map_err(|e| CreteError::Elf {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut symtab = HashMap::new();
        for sym in elf.syms.iter() {
            if let Some(name) = elf.strtab.get_at(sym.st_name) {
                if !name.is_empty() && sym.st_value != 0 {
                    symtab.entry(name.to_string()).or_insert(SymbolEntry {
                        address: sym.st_value,
                        size: sym.st_size,
                    });
                }
            }
        }

        let mut dynsym = HashMap::new();
        for sym in elf.dynsyms.iter() {
            if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
                if !name.is_empty() && sym.st_value != 0 {
                    dynsym.entry(name.to_string()).or_insert(SymbolEntry {
                        address: sym.st_value,
                        size: sym.st_size,
                    });
                }
            }
        }

        let mut sections = HashMap::new();
        for section in &elf.section_headers {
            if let Some(name) = elf.shdr_strtab.get_at(section.sh_name) {
                if !name.is_empty() {
                    sections.insert(
                        name.to_string(),
                        SectionEntry {
                            address: section.sh_addr,
                            size: section.sh_size,
                        },
                    );
                }
            }
        }

        Ok(Self {
            relocatable: elf.header.e_type == ET_DYN,
            symtab,
            dynsym,
            sections,
        })
    }

    /// Shared objects and position-independent executables are loaded at a
    /// runtime base; their link-time addresses must be rebased.
    pub fn is_relocatable(&self) -> bool {
        self.relocatable
    }

    pub fn has_symtab(&self) -> bool {
        !self.symtab.is_empty()
    }

    /// Looks in `.symtab` only.
    pub fn symtab_symbol(&self, name: &str) -> Option<SymbolEntry> {
        self.symtab.get(name).copied()
    }

    /// Looks in `.symtab`, then `.dynsym`.
    pub fn symbol(&self, name: &str) -> Option<SymbolEntry> {
        self.symtab_symbol(name)
            .or_else(|| self.dynsym.get(name).copied())
    }

    pub fn section(&self, name: &str) -> Option<SectionEntry> {
        self.sections.get(name).copied()
    }
}
