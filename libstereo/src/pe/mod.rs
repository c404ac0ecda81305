//! PE image introspection for modules mapped into the current process.
//!
//! Headers and the section table are parsed with goblin from a copy of the
//! header page. The exception directory is not copied; its entries are read
//! from live memory on demand because large executables carry tens of
//! thousands of them.

mod errors;

use goblin::pe::exception::RuntimeFunction;
use goblin::pe::header::{COFF_MACHINE_X86_64, Header, SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC};
use goblin::pe::section_table::SectionTable;
use scroll::{LE, Pread};

pub use errors::*;

use crate::ffi::address::Address;
use crate::memory;
use crate::os::{self, OsError};

const DOS_MAGIC: u16 = 0x5A4D;
const NT_SIGNATURE: u32 = 0x0000_4550;
const E_LFANEW_OFFSET: usize = 0x3C;
const HEADER_PAGE: usize = 0x1000;

/// Size of one `RUNTIME_FUNCTION` entry
pub const RUNTIME_FUNCTION_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl Section {
    fn from_table(table: &SectionTable) -> Self {
        Self {
            name: table.name().unwrap_or("").to_string(),
            virtual_address: table.virtual_address,
            virtual_size: table.virtual_size,
            size_of_raw_data: table.size_of_raw_data,
            pointer_to_raw_data: table.pointer_to_raw_data,
            characteristics: table.characteristics,
        }
    }

    /// Mapped size; images built without VirtualSize fall back to the raw size
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.size_of_raw_data
        } else {
            self.virtual_size
        }
    }

    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address
            && (rva - self.virtual_address) < self.mapped_size()
    }
}

/// Location of the `RUNTIME_FUNCTION` array in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionDirectory {
    pub address: Address,
    pub count: usize,
}

/// Frozen view of one loaded image.
///
/// Snapshot taken at construction; if the host unloads or reloads the
/// module the bounds become stale and must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleBounds {
    base: Address,
    size: usize,
    sections: Vec<Section>,
    exception: Option<ExceptionDirectory>,
}

impl ModuleBounds {
    /// Parses the image mapped at `base`
    pub fn from_base(base: Address) -> PeResult<Self> {
        if base.is_null() {
            return Err(PeError::NullBase);
        }

        let magic = memory::read::<u16>(base).ok_or(PeError::UnreadableHeaders(base))?;
        if magic != DOS_MAGIC {
            return Err(PeError::InvalidDosMagic(magic));
        }

        let e_lfanew = memory::read::<u32>(base + E_LFANEW_OFFSET)
            .ok_or(PeError::UnreadableHeaders(base))? as usize;

        let signature =
            memory::read::<u32>(base + e_lfanew).ok_or(PeError::UnreadableHeaders(base))?;
        if signature != NT_SIGNATURE {
            return Err(PeError::InvalidNtSignature(signature));
        }

        let span = memory::readable_span(base, HEADER_PAGE);
        let bytes = memory::read_bytes(base, span).ok_or(PeError::UnreadableHeaders(base))?;

        let (header, tables) = parse_headers(&bytes)?;

        if header.coff_header.machine != COFF_MACHINE_X86_64 {
            log::warn!(
                "Module at {base} has machine 0x{:04X}, expected x86-64",
                header.coff_header.machine
            );
        }

        let optional = header
            .optional_header
            .ok_or(PeError::MissingOptionalHeader)?;

        let size = optional.windows_fields.size_of_image as usize;

        let mut exception = None;
        if let Some(dir) = optional.data_directories.get_exception_table() {
            if dir.virtual_address != 0 && dir.size != 0 {
                exception = Some(ExceptionDirectory {
                    address: base + dir.virtual_address as usize,
                    count: dir.size as usize / RUNTIME_FUNCTION_SIZE,
                });
            }
        }

        let sections = tables.iter().map(Section::from_table).collect();

        log::trace!(
            "Parsed module at {base}: size 0x{size:X}, exception entries {}",
            exception.map_or(0, |e: ExceptionDirectory| e.count)
        );

        Ok(Self {
            base,
            size,
            sections,
            exception,
        })
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> Address {
        self.base + self.size
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.end()
    }

    /// RVA of an address inside this module
    pub fn rva_of(&self, address: Address) -> Option<u32> {
        if !self.contains(address) {
            return None;
        }

        address
            .distance_from(self.base)
            .and_then(|rva| u32::try_from(rva).ok())
    }

    /// Virtual address of an RVA
    pub fn va(&self, rva: u32) -> Address {
        self.base + rva as usize
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn exception_directory(&self) -> Option<ExceptionDirectory> {
        self.exception
    }

    pub fn has_exception_directory(&self) -> bool {
        self.exception.is_some()
    }

    /// Reads entry `index` of the exception directory
    pub fn runtime_function(&self, index: usize) -> Option<RuntimeFunction> {
        let dir = self.exception?;

        if index >= dir.count {
            return None;
        }

        let raw = memory::read::<[u8; RUNTIME_FUNCTION_SIZE]>(dir.address + index * RUNTIME_FUNCTION_SIZE)?;

        raw.pread_with::<RuntimeFunction>(0, LE).ok()
    }

    /// Every exception directory entry, stopping at the first unreadable one
    pub fn runtime_functions(&self) -> impl Iterator<Item = RuntimeFunction> + '_ {
        let count = self.exception.map_or(0, |dir| dir.count);

        (0..count).map_while(move |index| self.runtime_function(index))
    }
}

fn parse_headers(bytes: &[u8]) -> PeResult<(Header, Vec<SectionTable>)> {
    let header = Header::parse(bytes)?;

    let mut offset = header.dos_header.pe_pointer as usize
        + SIZEOF_PE_MAGIC
        + SIZEOF_COFF_HEADER
        + header.coff_header.size_of_optional_header as usize;

    let tables = header.coff_header.sections(bytes, &mut offset)?;

    Ok((header, tables))
}

/// Maps an RVA to a file offset in raw (unmapped) image bytes.
///
/// The first section whose virtual range holds the RVA wins.
pub fn ptr_from_rva(module_bytes: &[u8], rva: u32) -> Option<usize> {
    let (_, tables) = match parse_headers(module_bytes) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::debug!("Failed to parse image headers: {e}");
            return None;
        }
    };

    tables
        .iter()
        .map(Section::from_table)
        .find(|section| section.contains_rva(rva))
        .map(|section| {
            rva as usize - section.virtual_address as usize + section.pointer_to_raw_data as usize
        })
}

/// Explicit set of modules discovery is allowed to look at
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleBounds>,
    main: Option<Address>,
}

impl ModuleRegistry {
    /// Enumerates PE images loaded in the current process
    pub fn snapshot() -> PeResult<Self> {
        let bases = match os::loaded_module_bases() {
            Ok(bases) => bases,
            Err(OsError::Unsupported) => {
                log::debug!("Module enumeration unsupported, registry is empty");
                Vec::new()
            }
            Err(e) => {
                log::error!("Failed to enumerate modules: {e}");
                Vec::new()
            }
        };

        let mut modules = Vec::with_capacity(bases.len());
        for base in bases {
            match ModuleBounds::from_base(base) {
                Ok(module) => modules.push(module),
                Err(e) => log::debug!("Skipping module at {base}: {e}"),
            }
        }

        modules.sort_by_key(|module| module.base());

        Ok(Self {
            modules,
            main: os::main_module_base(),
        })
    }

    /// Registry over known modules; the first one is treated as the host
    pub fn from_modules(mut modules: Vec<ModuleBounds>) -> Self {
        let main = modules.first().map(ModuleBounds::base);
        modules.sort_by_key(|module| module.base());

        Self { modules, main }
    }

    pub fn module_within(&self, address: Address) -> Option<&ModuleBounds> {
        self.modules.iter().find(|module| module.contains(address))
    }

    pub fn main_module(&self) -> Option<&ModuleBounds> {
        let main = self.main?;
        self.modules.iter().find(|module| module.base() == main)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleBounds> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
