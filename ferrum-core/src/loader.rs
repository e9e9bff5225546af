//! Image loading: simplified hex streams and RISC-V ELF files.
//!
//! Loaders run on the control thread during configuration or pause, never
//! from hart threads. Bytes land through the attribute-bypassing poke path,
//! so images may populate any in-bounds address.

use crate::memory::Memory;
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::sym::STT_FUNC;
use goblin::elf::{header::EM_RISCV, Elf};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Location and size of an ELF file symbol.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ElfSymbol {
    pub address: u64,
    pub size: u64,
    pub(crate) function: bool,
}

impl ElfSymbol {
    /// True if the symbol is of function kind (`STT_FUNC`).
    pub fn is_function(&self) -> bool {
        self.function
    }
}

/// Entry point and end address of a loaded ELF image.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ElfLoadInfo {
    /// The file's entry point.
    pub entry_point: u64,
    /// The maximum `vaddr + memsz` over the loaded segments.
    pub end_address: u64,
}

/// ELF class and machine flags of a file, as reported by
/// [`check_elf_file`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ElfFileClass {
    pub is_32: bool,
    pub is_64: bool,
    pub is_riscv: bool,
}

impl Memory {
    /// Load a hex image.
    ///
    /// The format is line-oriented ASCII: a token `@hhh...` sets the current
    /// address from hexadecimal; any other token must be exactly two hex
    /// digits and is written as a byte to the current address, which then
    /// advances by one. Whitespace separates tokens; blank lines are
    /// ignored. There are no checksums and no record types; this is not the
    /// standard Intel-HEX record format.
    pub fn load_hex_file(&mut self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let malformed = |line: usize, token: &str| LoadError::MalformedHex {
            path: path.to_path_buf(),
            line: line + 1,
            token: token.to_string(),
        };

        let mut address = 0u64;
        for (line_no, line) in text.lines().enumerate() {
            for token in line.split_whitespace() {
                if let Some(hex) = token.strip_prefix('@') {
                    address = u64::from_str_radix(hex, 16)
                        .map_err(|_| malformed(line_no, token))?;
                } else if token.len() == 2 {
                    let byte = u8::from_str_radix(token, 16)
                        .map_err(|_| malformed(line_no, token))?;
                    self.poke_byte_no_access_check(address, byte)
                        .map_err(|_| LoadError::TargetOutOfBounds { address })?;
                    address += 1;
                } else {
                    return Err(malformed(line_no, token));
                }
            }
        }
        debug!("loaded hex image {}", path.display());
        Ok(())
    }

    /// Load a RISC-V ELF image compatible with the given register width
    /// (32 or 64).
    ///
    /// Loadable program segments are copied to their virtual addresses in
    /// file order; the symbol table is merged into the memory's symbol map
    /// (last loaded wins on name collision). With
    /// [`check_unmapped_elf`](Memory::check_unmapped_elf) enabled, a segment
    /// touching an unmapped page fails the load.
    pub fn load_elf_file(
        &mut self,
        path: impl AsRef<Path>,
        register_width: u32,
    ) -> Result<ElfLoadInfo, LoadError> {
        let path = path.as_ref();
        let buf = read_file(path)?;
        let elf = Elf::parse(&buf)?;

        let want_64 = match register_width {
            32 => false,
            64 => true,
            width => return Err(LoadError::UnsupportedRegisterWidth(width)),
        };
        if elf.is_64 != want_64 {
            return Err(LoadError::ClassMismatch {
                path: path.to_path_buf(),
                register_width,
            });
        }
        if !elf.little_endian || elf.header.e_machine != EM_RISCV {
            return Err(LoadError::NotRiscv {
                path: path.to_path_buf(),
            });
        }

        let mut end_address = 0u64;
        for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
            debug!(
                "loading segment: file range [{:#x}, {:#x}) to [{:#x}, {:#x})",
                ph.p_offset,
                ph.p_offset + ph.p_filesz,
                ph.p_vaddr,
                ph.p_vaddr + ph.p_memsz,
            );

            if self.check_unmapped_elf {
                let mut page = self.page_start_addr(ph.p_vaddr);
                while page < ph.p_vaddr + ph.p_memsz {
                    if !self.get_pma(page).is_mapped() {
                        return Err(LoadError::UnmappedSegment {
                            path: path.to_path_buf(),
                            address: page,
                        });
                    }
                    page += self.page_size();
                }
            }

            let bytes = buf.get(ph.file_range()).ok_or_else(|| {
                goblin::error::Error::Malformed(format!(
                    "segment file range [{:#x}, {:#x}) exceeds file size",
                    ph.p_offset,
                    ph.p_offset + ph.p_filesz
                ))
            })?;
            for (i, byte) in bytes.iter().enumerate() {
                let address = ph.p_vaddr + i as u64;
                self.poke_byte_no_access_check(address, *byte)
                    .map_err(|_| LoadError::TargetOutOfBounds { address })?;
            }

            end_address = end_address.max(ph.p_vaddr + ph.p_memsz);
        }

        let mut merged = 0usize;
        for sym in elf.syms.iter() {
            let Some(name) = elf.strtab.get_at(sym.st_name) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            self.symbols.insert(
                name.to_string(),
                ElfSymbol {
                    address: sym.st_value,
                    size: sym.st_size,
                    function: sym.st_type() == STT_FUNC,
                },
            );
            merged += 1;
        }
        debug!(
            "loaded {} with entry {:#x}, merged {merged} symbols",
            path.display(),
            elf.entry
        );

        Ok(ElfLoadInfo {
            entry_point: elf.entry,
            end_address,
        })
    }

    /// Look up a symbol collected from the loaded ELF files. Exact,
    /// case-sensitive match.
    pub fn find_symbol(&self, name: &str) -> Option<&ElfSymbol> {
        self.symbols.get(name)
    }

    /// Find a symbol whose byte interval contains `address`, preferring
    /// symbols of function kind when intervals overlap. Which symbol wins
    /// among equally-preferred candidates is unspecified.
    pub fn find_function(&self, address: u64) -> Option<(&str, &ElfSymbol)> {
        let mut best: Option<(&str, &ElfSymbol)> = None;
        for (name, sym) in &self.symbols {
            if address >= sym.address && address - sym.address < sym.size {
                match best {
                    Some((_, prev)) if prev.is_function() || !sym.is_function() => {}
                    _ => best = Some((name, sym)),
                }
            }
        }
        best
    }

    /// All collected symbols, in no particular order.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, &ElfSymbol)> {
        self.symbols.iter().map(|(name, sym)| (name.as_str(), sym))
    }
}

/// Return the minimum and maximum addresses covered by the loadable
/// segments of the given ELF file.
pub fn elf_address_bounds(path: impl AsRef<Path>) -> Result<(u64, u64), LoadError> {
    let path = path.as_ref();
    let buf = read_file(path)?;
    let elf = Elf::parse(&buf)?;

    let mut bounds: Option<(u64, u64)> = None;
    for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        let (min, max) = bounds.unwrap_or((u64::MAX, 0));
        bounds = Some((min.min(ph.p_vaddr), max.max(ph.p_vaddr + ph.p_memsz)));
    }
    bounds.ok_or_else(|| LoadError::NoLoadableSegments {
        path: path.to_path_buf(),
    })
}

/// Report the ELF class and machine of the given file without loading it.
pub fn check_elf_file(path: impl AsRef<Path>) -> Result<ElfFileClass, LoadError> {
    let buf = read_file(path.as_ref())?;
    let elf = Elf::parse(&buf)?;
    Ok(ElfFileClass {
        is_32: !elf.is_64,
        is_64: elf.is_64,
        is_riscv: elf.little_endian && elf.header.e_machine == EM_RISCV,
    })
}

/// True if the given ELF file defines a symbol with exactly this name.
pub fn is_symbol_in_elf(path: impl AsRef<Path>, name: &str) -> Result<bool, LoadError> {
    let buf = read_file(path.as_ref())?;
    let elf = Elf::parse(&buf)?;
    Ok(elf
        .syms
        .iter()
        .any(|sym| elf.strtab.get_at(sym.st_name) == Some(name)))
}

fn read_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Failure to load an image or inspect an ELF file.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Elf(#[from] goblin::error::Error),
    #[error("{path}: not a little-endian RISC-V ELF file")]
    NotRiscv { path: PathBuf },
    #[error("{path}: ELF class is incompatible with register width {register_width}")]
    ClassMismatch {
        path: PathBuf,
        register_width: u32,
    },
    #[error("register width {0} is not supported (expected 32 or 64)")]
    UnsupportedRegisterWidth(u32),
    #[error("{path}:{line}: malformed hex token `{token}`")]
    MalformedHex {
        path: PathBuf,
        line: usize,
        token: String,
    },
    #[error("image byte at {address:#x} falls outside the memory")]
    TargetOutOfBounds { address: u64 },
    #[error("{path}: segment at {address:#x} targets unmapped memory")]
    UnmappedSegment { path: PathBuf, address: u64 },
    #[error("{path}: no loadable segments")]
    NoLoadableSegments { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfig;
    use std::path::PathBuf;

    fn mem_1mib() -> Memory {
        Memory::new(MemoryConfig::new(1 << 20)).unwrap()
    }

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    /// A minimal little-endian RISC-V ELF64 with a single PT_LOAD segment.
    fn minimal_elf64(entry: u64, vaddr: u64, payload: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
        b.extend_from_slice(&[0u8; 8]);
        b.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
        b.extend_from_slice(&243u16.to_le_bytes()); // e_machine: EM_RISCV
        b.extend_from_slice(&1u32.to_le_bytes()); // e_version
        b.extend_from_slice(&entry.to_le_bytes());
        b.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        b.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        b.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        b.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        b.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        b.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        b.extend_from_slice(&[0u8; 6]); // e_shentsize, e_shnum, e_shstrndx

        b.extend_from_slice(&1u32.to_le_bytes()); // p_type: PT_LOAD
        b.extend_from_slice(&5u32.to_le_bytes()); // p_flags: R+X
        b.extend_from_slice(&0x78u64.to_le_bytes()); // p_offset
        b.extend_from_slice(&vaddr.to_le_bytes());
        b.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
        b.extend_from_slice(&(payload.len() as u64).to_le_bytes()); // p_filesz
        b.extend_from_slice(&(payload.len() as u64).to_le_bytes()); // p_memsz
        b.extend_from_slice(&8u64.to_le_bytes()); // p_align
        assert_eq!(b.len(), 0x78);
        b.extend_from_slice(payload);
        b
    }

    #[test]
    fn hex_file_places_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "image.hex", b"@100\nde ad\tbe ef\n\n@200 01 02\n");
        let mut mem = mem_1mib();
        mem.load_hex_file(&path).unwrap();
        assert_eq!(mem.read_word(0x100), Ok(0xEFBE_ADDE));
        assert_eq!(mem.read_halfword(0x200), Ok(0x0201));
    }

    #[test]
    fn hex_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "image.hex", b"@40 11 22 33 44");
        let mut mem = mem_1mib();
        mem.load_hex_file(&path).unwrap();
        mem.load_hex_file(&path).unwrap();
        assert_eq!(mem.read_word(0x40), Ok(0x4433_2211));
    }

    #[test]
    fn hex_malformed_token_names_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "bad.hex", b"@100\nde adX\n");
        let mut mem = mem_1mib();
        match mem.load_hex_file(&path) {
            Err(LoadError::MalformedHex { line, token, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(token, "adX");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            mem_1mib().load_hex_file(write_temp(&dir, "bad2.hex", b"@zz")),
            Err(LoadError::MalformedHex { .. })
        ));
    }

    #[test]
    fn hex_byte_past_end_of_memory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "oob.hex", b"@FFFFF aa bb");
        let mut mem = mem_1mib();
        assert!(matches!(
            mem.load_hex_file(&path),
            Err(LoadError::TargetOutOfBounds { address: 0x100000 })
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let mut mem = mem_1mib();
        assert!(matches!(
            mem.load_hex_file("/nonexistent/image.hex"),
            Err(LoadError::Io { .. })
        ));
        assert!(matches!(
            mem.load_elf_file("/nonexistent/image.elf", 64),
            Err(LoadError::Io { .. })
        ));
    }

    #[test]
    fn elf_segment_lands_at_virtual_address() {
        let dir = tempfile::tempdir().unwrap();
        let elf = minimal_elf64(0x100, 0x100, &[0x13, 0x00, 0x00, 0x00]);
        let path = write_temp(&dir, "image.elf", &elf);

        let mut mem = mem_1mib();
        let info = mem.load_elf_file(&path, 64).unwrap();
        assert_eq!(
            info,
            ElfLoadInfo {
                entry_point: 0x100,
                end_address: 0x104
            }
        );
        assert_eq!(mem.read_word(0x100), Ok(0x0000_0013));
    }

    #[test]
    fn elf_class_must_match_register_width() {
        let dir = tempfile::tempdir().unwrap();
        let elf = minimal_elf64(0x100, 0x100, &[0x13]);
        let path = write_temp(&dir, "image.elf", &elf);

        let mut mem = mem_1mib();
        assert!(matches!(
            mem.load_elf_file(&path, 32),
            Err(LoadError::ClassMismatch {
                register_width: 32,
                ..
            })
        ));
        assert!(matches!(
            mem.load_elf_file(&path, 16),
            Err(LoadError::UnsupportedRegisterWidth(16))
        ));
    }

    #[test]
    fn non_elf_file_fails_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "not.elf", b"just text");
        let mut mem = mem_1mib();
        assert!(matches!(
            mem.load_elf_file(&path, 64),
            Err(LoadError::Elf(_))
        ));
    }

    #[test]
    fn unmapped_segment_check() {
        let dir = tempfile::tempdir().unwrap();
        let elf = minimal_elf64(0x0, 0x0, &[0xAA, 0xBB]);
        let path = write_temp(&dir, "image.elf", &elf);

        // Sealing with an ICCM unmaps the rest of the region, so a segment
        // at 0x0 now targets unmapped memory.
        let mut mem = mem_1mib();
        mem.define_iccm(0x10000, 0x1000).unwrap();
        mem.finish_config(true);

        mem.check_unmapped_elf(true);
        assert!(matches!(
            mem.load_elf_file(&path, 64),
            Err(LoadError::UnmappedSegment { address: 0x0, .. })
        ));

        // Without the check the load bypasses attributes entirely.
        mem.check_unmapped_elf(false);
        mem.load_elf_file(&path, 64).unwrap();
        assert_eq!(mem.core_port().poke_byte_no_access_check(0x0, 0xAA), Ok(()));
    }

    #[test]
    fn elf_inspection_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let elf = minimal_elf64(0x100, 0x100, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let path = write_temp(&dir, "image.elf", &elf);

        let class = check_elf_file(&path).unwrap();
        assert_eq!(
            class,
            ElfFileClass {
                is_32: false,
                is_64: true,
                is_riscv: true
            }
        );
        assert_eq!(elf_address_bounds(&path).unwrap(), (0x100, 0x108));
        assert!(!is_symbol_in_elf(&path, "main").unwrap());
    }

    #[test]
    fn symbol_queries() {
        let mut mem = mem_1mib();
        mem.symbols.insert(
            "counter".to_string(),
            ElfSymbol {
                address: 0x2000,
                size: 8,
                function: false,
            },
        );
        mem.symbols.insert(
            "main".to_string(),
            ElfSymbol {
                address: 0x1000,
                size: 0x40,
                function: true,
            },
        );
        // An object symbol overlapping `main`, e.g. a literal pool label.
        mem.symbols.insert(
            "pool".to_string(),
            ElfSymbol {
                address: 0x1020,
                size: 0x10,
                function: false,
            },
        );

        assert_eq!(mem.find_symbol("main").map(|s| s.address), Some(0x1000));
        assert!(mem.find_symbol("Main").is_none());
        assert!(mem.find_symbol("start").is_none());

        // Function kind is preferred over the overlapping object.
        let (name, sym) = mem.find_function(0x1024).unwrap();
        assert_eq!(name, "main");
        assert!(sym.is_function());

        let (name, _) = mem.find_function(0x2004).unwrap();
        assert_eq!(name, "counter");
        assert!(mem.find_function(0x3000).is_none());

        assert_eq!(mem.symbols().count(), 3);
    }
}
