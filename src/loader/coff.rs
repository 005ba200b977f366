//! Binary-format boundary.
//!
//! The loader never looks at raw file bytes itself; an [`ImageParser`]
//! turns a file into an [`ImageLayout`]. [`GoblinParser`] is the real one.
//! [`read_exports`] decodes an export directory out of an already mapped
//! image, for modules that rebuild their export table while initialising.

use std::cmp::min;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use goblin::pe::export::ExportAddressTableEntry;
use goblin::pe::PE;
use log::debug;
use scroll::Pread;

use super::module::Symbol;
use crate::errors::{ErrorKind, Result};
use crate::utils::load_file;

pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

#[derive(Clone, Debug)]
pub struct ImageSection {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub characteristics: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ImageImport {
    pub dll: String,
    pub symbol: Symbol,
    pub iat_rva: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageExport {
    pub name: Option<String>,
    pub ordinal: u16,
    pub rva: u32,
}

#[derive(Clone, Debug)]
pub struct ImageLayout {
    pub path: PathBuf,
    pub image_base: u32,
    pub size_of_image: u32,
    pub section_alignment: u32,
    pub entry_rva: u32,
    pub headers: Vec<u8>,
    pub sections: Vec<ImageSection>,
    pub imports: Vec<ImageImport>,
    pub exports: Vec<ImageExport>,
    pub export_directory: Option<DataDirectory>,
    pub relocations: Option<DataDirectory>,
}

impl ImageLayout {
    /// Distinct imported dll names, in first-seen order.
    pub fn libraries(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for import in &self.imports {
            if !out.iter().any(|d| d.eq_ignore_ascii_case(&import.dll)) {
                out.push(&import.dll);
            }
        }
        out
    }

    pub fn malformed(&self, reason: String) -> crate::errors::Error {
        parse_failure(&self.path, reason)
    }

    /// `base + rva`; an image whose offsets leave the address space is malformed.
    pub fn at(&self, base: u32, rva: u32) -> Result<u32> {
        base.checked_add(rva)
            .ok_or_else(|| self.malformed(format!("rva 0x{:x} from base 0x{:08x} overflows", rva, base)))
    }
}

pub trait ImageParser: Send {
    /// `ModuleNotFound` when nothing exists at `path`, `ParseFailure` when
    /// something does but is not a usable image.
    fn open(&self, path: &Path) -> Result<ImageLayout>;
}

pub struct GoblinParser;

impl ImageParser for GoblinParser {
    fn open(&self, path: &Path) -> Result<ImageLayout> {
        if !path.is_file() {
            return Err(ErrorKind::ModuleNotFound(path.display().to_string()).into());
        }
        let data = load_file(&path.to_string_lossy())?;
        parse_image(path, &data[..])
    }
}

fn parse_failure(path: &Path, reason: String) -> crate::errors::Error {
    ErrorKind::ParseFailure(path.display().to_string(), reason).into()
}

pub fn parse_image(path: &Path, data: &[u8]) -> Result<ImageLayout> {
    let pe = PE::parse(data).map_err(|e| parse_failure(path, e.to_string()))?;
    if pe.is_64 {
        return Err(parse_failure(path, "only 32-bit x86 images are supported".to_owned()));
    }
    let header = pe
        .header
        .optional_header
        .ok_or_else(|| parse_failure(path, "missing optional header".to_owned()))?;

    let header_size = min(
        data.len(),
        (0x18
            + pe.header.dos_header.pe_pointer
            + pe.header.coff_header.size_of_optional_header as u32
            + pe.header.coff_header.number_of_sections as u32 * 0x28) as usize,
    );

    let mut sections = Vec::with_capacity(pe.sections.len());
    for section in &pe.sections {
        let start = section.pointer_to_raw_data as usize;
        let len = match section.virtual_size {
            0 => section.size_of_raw_data,
            v => min(v, section.size_of_raw_data),
        } as usize;
        let raw = if start == 0 || len == 0 {
            Vec::new()
        } else {
            data.get(start..start + len)
                .ok_or_else(|| parse_failure(path, format!("section data at 0x{:x} runs past the file", start)))?
                .to_vec()
        };
        sections.push(ImageSection {
            name: section.name().unwrap_or("").to_owned(),
            virtual_address: section.virtual_address,
            virtual_size: section.virtual_size.max(section.size_of_raw_data),
            characteristics: section.characteristics,
            data: raw,
        });
    }

    let imports = pe
        .imports
        .iter()
        .map(|import| {
            let symbol = if import.name.starts_with("ORDINAL ") {
                Symbol::Ordinal(import.ordinal)
            } else {
                Symbol::Name(import.name.to_string())
            };
            ImageImport { dll: import.dll.to_owned(), symbol, iat_rva: import.offset as u32 }
        })
        .collect();

    let mut exports = Vec::new();
    if let Some(export_data) = &pe.export_data {
        let base = export_data.export_directory_table.ordinal_base;
        let mut names: HashMap<u32, Vec<&str>> = HashMap::new();
        for export in &pe.exports {
            if let (Some(name), None) = (export.name, &export.reexport) {
                names.entry(export.rva as u32).or_default().push(name);
            }
        }
        for (i, entry) in export_data.export_address_table.iter().enumerate() {
            let ordinal = (base as usize + i) as u16;
            match *entry {
                ExportAddressTableEntry::ExportRVA(0) => {}
                ExportAddressTableEntry::ExportRVA(rva) => match names.get(&rva) {
                    Some(list) => exports.extend(list.iter().map(|name| ImageExport {
                        name: Some((*name).to_owned()),
                        ordinal,
                        rva,
                    })),
                    None => exports.push(ImageExport { name: None, ordinal, rva }),
                },
                ExportAddressTableEntry::ForwarderRVA(_) => {
                    debug!("[-] {}: skipping forwarded export ordinal {}", path.display(), ordinal);
                }
            }
        }
    }

    let directory = |dd: &Option<goblin::pe::data_directories::DataDirectory>| {
        dd.as_ref()
            .filter(|d| d.virtual_address != 0 && d.size != 0)
            .map(|d| DataDirectory { rva: d.virtual_address, size: d.size })
    };

    Ok(ImageLayout {
        path: path.to_path_buf(),
        image_base: header.windows_fields.image_base as u32,
        size_of_image: header.windows_fields.size_of_image,
        section_alignment: header.windows_fields.section_alignment.max(1),
        entry_rva: header.standard_fields.address_of_entry_point as u32,
        headers: data[..header_size].to_vec(),
        sections,
        imports,
        exports,
        export_directory: directory(header.data_directories.get_export_table()),
        relocations: directory(header.data_directories.get_base_relocation_table()),
    })
}

#[allow(dead_code)]
#[derive(Pread)]
struct ExportDirectoryTable {
    export_flags: u32,
    time_date_stamp: u32,
    version: u32,
    name_rva: u32,
    ordinal_base: u32,
    address_table_entries: u32,
    number_of_name_pointers: u32,
    export_address_table_rva: u32,
    name_pointer_rva: u32,
    ordinal_table_rva: u32,
}

/* 从已映射的内存映像 (偏移 == RVA) 中读取导出表 */
pub fn read_exports(image: &[u8], dir: DataDirectory) -> Result<Vec<ImageExport>> {
    let table: ExportDirectoryTable = image.pread_with(dir.rva as usize, scroll::LE)?;
    let dir_end = dir.rva as u64 + dir.size as u64;

    let mut names: HashMap<u16, Vec<String>> = HashMap::new();
    for i in 0..table.number_of_name_pointers as usize {
        let name_rva: u32 = image.pread_with(table.name_pointer_rva as usize + i * 4, scroll::LE)?;
        let index: u16 = image.pread_with(table.ordinal_table_rva as usize + i * 2, scroll::LE)?;
        let name: &str = image.pread(name_rva as usize)?;
        names.entry(index).or_default().push(name.to_owned());
    }

    let mut exports = Vec::new();
    for i in 0..table.address_table_entries as usize {
        let rva: u32 = image.pread_with(table.export_address_table_rva as usize + i * 4, scroll::LE)?;
        // forwarders point back into the directory itself
        if rva == 0 || (rva >= dir.rva && (rva as u64) < dir_end) {
            continue;
        }
        let ordinal = (table.ordinal_base as usize + i) as u16;
        match names.remove(&(i as u16)) {
            Some(list) => exports.extend(list.into_iter().map(|name| ImageExport { name: Some(name), ordinal, rva })),
            None => exports.push(ImageExport { name: None, ordinal, rva }),
        }
    }
    Ok(exports)
}
