//! Hand-built images served from memory, and a tiny x86 assembler to fill
//! their code sections.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use scroll::Pwrite;

use dllkeeper::loader::coff::{
    DataDirectory, ImageExport, ImageImport, ImageLayout, ImageParser, ImageSection, IMAGE_SCN_MEM_EXECUTE,
    IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
};
use dllkeeper::{ErrorKind, LoaderConfig, Result, Runtime, Symbol};

pub const TEXT: u32 = 0x1000;
pub const IAT: u32 = 0x2000;
pub const DATA: u32 = 0x3000;
pub const RELOC: u32 = 0x4000;
pub const IMAGE_SIZE: u32 = 0x5000;

const DATA_SIZE: usize = 0x400;
/// Where a hidden export directory is written inside `.data`.
const EXPORT_DIRECTORY: usize = 0x100;

#[derive(Default)]
pub struct FakeParser {
    images: HashMap<PathBuf, ImageLayout>,
}

impl FakeParser {
    pub fn new() -> FakeParser {
        FakeParser::default()
    }

    pub fn with(mut self, image: &Image) -> FakeParser {
        let layout = image.build();
        self.images.insert(layout.path.clone(), layout);
        self
    }

    pub fn with_layout(mut self, layout: ImageLayout) -> FakeParser {
        self.images.insert(layout.path.clone(), layout);
        self
    }
}

impl ImageParser for FakeParser {
    fn open(&self, path: &Path) -> Result<ImageLayout> {
        self.images
            .get(path)
            .cloned()
            .ok_or_else(|| ErrorKind::ModuleNotFound(path.display().to_string()).into())
    }
}

/// Runtime searching `plugins/` over the given images.
pub fn runtime(images: &[&Image]) -> Runtime {
    runtime_with(LoaderConfig::new(), images)
}

pub fn runtime_with(config: LoaderConfig, images: &[&Image]) -> Runtime {
    let parser = images.iter().fold(FakeParser::new(), |parser, image| parser.with(image));
    let config = config.with_search_path("plugins").with_instruction_budget(100_000);
    Runtime::with_parser(config, Box::new(parser)).unwrap()
}

/// A 32-bit image under construction: `.text`, an IAT, `.data` and
/// `.reloc`, each one page, at fixed RVAs.
pub struct Image {
    pub path: PathBuf,
    pub base: u32,
    code: Vec<u8>,
    data: Vec<u8>,
    imports: Vec<(String, Symbol)>,
    exports: Vec<(String, u32)>,
    relocs: Vec<u32>,
    entry: Option<u32>,
    hide_exports: bool,
    strip_relocs: bool,
}

impl Image {
    pub fn new(path: &str, base: u32) -> Image {
        Image {
            path: PathBuf::from(path),
            base,
            code: Vec::new(),
            data: vec![0; DATA_SIZE],
            imports: Vec::new(),
            exports: Vec::new(),
            relocs: Vec::new(),
            entry: None,
            hide_exports: false,
            strip_relocs: false,
        }
    }

    /// RVA of the next instruction.
    pub fn here(&self) -> u32 {
        TEXT + self.code.len() as u32
    }

    fn emit(&mut self, bytes: &[u8]) -> &mut Image {
        self.code.extend_from_slice(bytes);
        self
    }

    /// An absolute address that needs a base relocation.
    fn absolute(&mut self, rva: u32) -> &mut Image {
        let at = self.here();
        self.relocs.push(at);
        let addr = self.base + rva;
        self.emit(&addr.to_le_bytes())
    }

    fn slot(&mut self, dll: &str, symbol: Symbol) -> u32 {
        let index = match self.imports.iter().position(|(d, s)| d == dll && *s == symbol) {
            Some(index) => index,
            None => {
                self.imports.push((dll.to_owned(), symbol));
                self.imports.len() - 1
            }
        };
        IAT + index as u32 * 4
    }

    /// Declares an import without calling it; returns its IAT RVA.
    pub fn import(&mut self, dll: &str, name: &str) -> u32 {
        self.slot(dll, Symbol::name(name))
    }

    /// Starts an exported function at the current position.
    pub fn export(&mut self, name: &str) -> &mut Image {
        let rva = self.here();
        self.exports.push((name.to_owned(), rva));
        self
    }

    /// The entry point starts at the current position.
    pub fn entry(&mut self) -> &mut Image {
        self.entry = Some(self.here());
        self
    }

    /// Exports only reachable through the export directory in `.data`.
    pub fn hide_exports(&mut self) -> &mut Image {
        self.hide_exports = true;
        self
    }

    pub fn strip_relocs(&mut self) -> &mut Image {
        self.strip_relocs = true;
        self
    }

    /// `call dword [iat]`
    pub fn call_import(&mut self, dll: &str, name: &str) -> &mut Image {
        let slot = self.slot(dll, Symbol::name(name));
        self.emit(&[0xff, 0x15]).absolute(slot)
    }

    pub fn call_ordinal(&mut self, dll: &str, ordinal: u16) -> &mut Image {
        let slot = self.slot(dll, Symbol::Ordinal(ordinal));
        self.emit(&[0xff, 0x15]).absolute(slot)
    }

    pub fn push(&mut self, value: u32) -> &mut Image {
        self.emit(&[0x68]).emit(&value.to_le_bytes())
    }

    /// `push dword [esp + disp]`
    pub fn push_stack(&mut self, disp: u8) -> &mut Image {
        self.emit(&[0xff, 0x74, 0x24, disp])
    }

    /// `push <address of .data + offset>`
    pub fn push_data(&mut self, offset: u32) -> &mut Image {
        self.emit(&[0x68]).absolute(DATA + offset)
    }

    pub fn push_eax(&mut self) -> &mut Image {
        self.emit(&[0x50])
    }

    /// `mov eax, [esp + disp]`
    pub fn load_stack(&mut self, disp: u8) -> &mut Image {
        self.emit(&[0x8b, 0x44, 0x24, disp])
    }

    /// `mov [.data + offset], eax`
    pub fn store(&mut self, offset: u32) -> &mut Image {
        self.emit(&[0xa3]).absolute(DATA + offset)
    }

    /// `mov eax, [.data + offset]`
    pub fn load(&mut self, offset: u32) -> &mut Image {
        self.emit(&[0xa1]).absolute(DATA + offset)
    }

    /// `push dword [.data + offset]`
    pub fn push_global(&mut self, offset: u32) -> &mut Image {
        self.emit(&[0xff, 0x35]).absolute(DATA + offset)
    }

    pub fn mov_eax(&mut self, value: u32) -> &mut Image {
        self.emit(&[0xb8]).emit(&value.to_le_bytes())
    }

    pub fn add_esp(&mut self, n: u8) -> &mut Image {
        self.emit(&[0x83, 0xc4, n])
    }

    pub fn ret(&mut self) -> &mut Image {
        self.emit(&[0xc3])
    }

    pub fn ret_n(&mut self, n: u16) -> &mut Image {
        self.emit(&[0xc2]).emit(&n.to_le_bytes())
    }

    /// `test eax, eax`
    pub fn test_eax(&mut self) -> &mut Image {
        self.emit(&[0x85, 0xc0])
    }

    /// `jz rel8`; the displacement is fixed up with [`Image::patch_jump`].
    pub fn jz(&mut self) -> &mut Image {
        self.emit(&[0x74, 0])
    }

    /// Points the rel8 jump whose opcode is at `at` to the current position.
    pub fn patch_jump(&mut self, at: u32) -> &mut Image {
        let rel = self.here() - (at + 2);
        self.code[(at - TEXT + 1) as usize] = rel as u8;
        self
    }

    pub fn int3(&mut self) -> &mut Image {
        self.emit(&[0xcc])
    }

    /// Places `bytes` in `.data` at `offset`.
    pub fn data(&mut self, offset: usize, bytes: &[u8]) -> &mut Image {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// `DllMain` returning TRUE, placed at the current position.
    pub fn trivial_entry(&mut self) -> &mut Image {
        self.entry().mov_eax(1).ret_n(12)
    }

    pub fn build(&self) -> ImageLayout {
        let mut data = self.data.clone();
        let mut exports: Vec<ImageExport> = self
            .exports
            .iter()
            .enumerate()
            .map(|(i, (name, rva))| ImageExport { name: Some(name.clone()), ordinal: i as u16 + 1, rva: *rva })
            .collect();
        let mut export_directory = None;
        if self.hide_exports {
            let size = write_export_directory(&mut data, &exports);
            export_directory = Some(DataDirectory { rva: DATA + EXPORT_DIRECTORY as u32, size });
            exports.clear();
        }

        let imports = self
            .imports
            .iter()
            .enumerate()
            .map(|(i, (dll, symbol))| ImageImport { dll: dll.clone(), symbol: symbol.clone(), iat_rva: IAT + i as u32 * 4 })
            .collect();

        let reloc = if self.strip_relocs { Vec::new() } else { relocation_blocks(&self.relocs) };
        let relocations = if reloc.is_empty() { None } else { Some(DataDirectory { rva: RELOC, size: reloc.len() as u32 }) };

        let mut headers = vec![0u8; 0x200];
        headers[..2].copy_from_slice(b"MZ");

        ImageLayout {
            path: self.path.clone(),
            image_base: self.base,
            size_of_image: IMAGE_SIZE,
            section_alignment: 0x1000,
            entry_rva: self.entry.unwrap_or(0),
            headers,
            sections: vec![
                section(".text", TEXT, IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_EXECUTE, self.code.clone()),
                section(".idata", IAT, IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE, vec![0; self.imports.len() * 4]),
                section(".data", DATA, IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE, data),
                section(".reloc", RELOC, IMAGE_SCN_MEM_READ, reloc),
            ],
            imports,
            exports,
            export_directory,
            relocations,
        }
    }
}

fn section(name: &str, rva: u32, characteristics: u32, data: Vec<u8>) -> ImageSection {
    ImageSection { name: name.to_owned(), virtual_address: rva, virtual_size: 0x1000, characteristics, data }
}

/// `IMAGE_BASE_RELOCATION` blocks, one per page, all `HIGHLOW`.
fn relocation_blocks(relocs: &[u32]) -> Vec<u8> {
    let mut pages: Vec<u32> = relocs.iter().map(|rva| rva & !0xfff).collect();
    pages.sort_unstable();
    pages.dedup();
    let mut out = Vec::new();
    for page in pages {
        let mut entries: Vec<u16> = relocs
            .iter()
            .filter(|rva| *rva & !0xfff == page)
            .map(|rva| (3 << 12) | (rva & 0xfff) as u16)
            .collect();
        if entries.len() % 2 == 1 {
            entries.push(0);
        }
        out.extend_from_slice(&page.to_le_bytes());
        out.extend_from_slice(&(8 + entries.len() as u32 * 2).to_le_bytes());
        for entry in entries {
            out.extend_from_slice(&entry.to_le_bytes());
        }
    }
    out
}

/// Writes an export directory for `exports` into `.data`; returns its size.
fn write_export_directory(data: &mut [u8], exports: &[ImageExport]) -> u32 {
    let dir = EXPORT_DIRECTORY;
    let n = exports.len();
    let functions = dir + 40;
    let names = functions + n * 4;
    let ordinals = names + n * 4;
    let mut strings = ordinals + n * 2;

    let rva = |offset: usize| DATA + offset as u32;
    data.pwrite_with(1u32, dir + 16, scroll::LE).unwrap();
    data.pwrite_with(n as u32, dir + 20, scroll::LE).unwrap();
    data.pwrite_with(n as u32, dir + 24, scroll::LE).unwrap();
    data.pwrite_with(rva(functions), dir + 28, scroll::LE).unwrap();
    data.pwrite_with(rva(names), dir + 32, scroll::LE).unwrap();
    data.pwrite_with(rva(ordinals), dir + 36, scroll::LE).unwrap();
    for (i, export) in exports.iter().enumerate() {
        data.pwrite_with(export.rva, functions + i * 4, scroll::LE).unwrap();
        data.pwrite_with(rva(strings), names + i * 4, scroll::LE).unwrap();
        data.pwrite_with(i as u16, ordinals + i * 2, scroll::LE).unwrap();
        let name = export.name.as_deref().unwrap_or_default().as_bytes();
        data[strings..strings + name.len()].copy_from_slice(name);
        strings += name.len() + 1;
    }
    (strings - dir) as u32
}
