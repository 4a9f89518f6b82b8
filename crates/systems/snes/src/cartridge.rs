//! SNES cartridge: copier header stripping, LoROM/HiROM detection, SRAM.

use std::fmt;

use crate::SnesError;
use framestep_core::logging::{log, LogCategory, LogLevel};

/// Smallest image that can hold a LoROM header and vectors.
const MIN_ROM_SIZE: usize = 0x8000;
const COPIER_HEADER_SIZE: usize = 512;
const LOROM_HEADER: usize = 0x7FC0;
const HIROM_HEADER: usize = 0xFFC0;
/// Largest SRAM a header may declare (256 KiB).
const MAX_SRAM_SIZE: usize = 0x40000;

/// ROM mapping mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    LoRom,
    HiRom,
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mapping::LoRom => write!(f, "LoROM"),
            Mapping::HiRom => write!(f, "HiROM"),
        }
    }
}

/// Summary of a loaded cartridge, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartridgeInfo {
    pub title: String,
    pub mapping: Mapping,
    pub rom_size: usize,
    pub sram_size: usize,
    pub has_copier_header: bool,
    /// CRC-32 of the ROM image without the copier header
    pub crc32: u32,
}

/// SNES cartridge
#[derive(Debug, Clone)]
pub struct Cartridge {
    rom: Vec<u8>,
    sram: Vec<u8>,
    mapping: Mapping,
    title: String,
    has_copier_header: bool,
    crc32: u32,
}

impl Cartridge {
    pub fn load(data: &[u8]) -> Result<Self, SnesError> {
        // Copier dumps carry a 512-byte header in front of the image
        let header_offset = if data.len() % 1024 == COPIER_HEADER_SIZE {
            COPIER_HEADER_SIZE
        } else {
            0
        };
        let rom = &data[header_offset..];

        if rom.len() < MIN_ROM_SIZE {
            log(LogCategory::Bus, LogLevel::Error, || {
                format!(
                    "cartridge: ROM too small ({} bytes, minimum 32KB)",
                    rom.len()
                )
            });
            return Err(SnesError::InvalidRom(format!(
                "image is {} bytes, minimum is {} bytes",
                rom.len(),
                MIN_ROM_SIZE
            )));
        }

        let mapping = Self::detect_mapping(rom);
        let header = match mapping {
            Mapping::LoRom => LOROM_HEADER,
            Mapping::HiRom => HIROM_HEADER,
        };
        let title = parse_title(&rom[header..header + 21]);
        let sram_size = match rom[header + 0x18] {
            0 => 0,
            n => (1024usize << n.min(8)).min(MAX_SRAM_SIZE),
        };

        let cart = Self {
            rom: rom.to_vec(),
            sram: vec![0; sram_size],
            mapping,
            title,
            has_copier_header: header_offset > 0,
            crc32: crc32fast::hash(rom),
        };

        log(LogCategory::Bus, LogLevel::Info, || {
            format!(
                "cartridge: \"{}\" {} KB {}, SRAM {} KB, copier header: {}",
                cart.title,
                cart.rom.len() / 1024,
                cart.mapping,
                cart.sram.len() / 1024,
                if cart.has_copier_header { "yes" } else { "no" }
            )
        });

        Ok(cart)
    }

    /// Pick the header location that looks most like a real header.
    fn detect_mapping(rom: &[u8]) -> Mapping {
        let lorom_score = Self::score_header(rom, LOROM_HEADER);
        let hirom_score = Self::score_header(rom, HIROM_HEADER);

        if hirom_score > lorom_score {
            Mapping::HiRom
        } else {
            Mapping::LoRom
        }
    }

    /// Score a potential header location (higher = more likely valid)
    fn score_header(rom: &[u8], offset: usize) -> u32 {
        if offset + 0x40 > rom.len() {
            return 0;
        }

        let mut score = 0u32;

        // Map mode byte at +$15: $20/$30 LoROM, $21/$31 HiROM
        let map_mode = rom[offset + 0x15];
        if map_mode & 0xE0 == 0x20 {
            let lo = map_mode & 0x01 == 0;
            if lo == (offset == LOROM_HEADER) {
                score += 2;
            }
        }

        // ROM size byte at +$17 (should be 0x07-0x0D typically)
        let rom_size = rom[offset + 0x17];
        if (0x07..=0x0D).contains(&rom_size) {
            score += 2;
        }

        // Checksum complement at +$1C-$1D and checksum at +$1E-$1F
        let checksum_comp = u16::from_le_bytes([rom[offset + 0x1C], rom[offset + 0x1D]]);
        let checksum = u16::from_le_bytes([rom[offset + 0x1E], rom[offset + 0x1F]]);
        if checksum_comp == !checksum {
            score += 4;
        }

        // Emulation reset vector at +$3C-$3D should point into ROM
        let reset_vector = u16::from_le_bytes([rom[offset + 0x3C], rom[offset + 0x3D]]);
        if reset_vector >= 0x8000 {
            score += 2;
        }

        score
    }

    /// Read a byte; `None` if the address is not decoded by the cartridge.
    pub fn read(&self, addr: u32) -> Option<u8> {
        let bank = (addr >> 16) as u8;
        let offset = addr as u16;

        if let Some(index) = self.sram_index(bank, offset) {
            return Some(self.sram[index]);
        }

        let rom_offset = match self.mapping {
            Mapping::LoRom => {
                if offset < 0x8000 {
                    return None;
                }
                ((bank & 0x7F) as usize) << 15 | (offset as usize & 0x7FFF)
            }
            Mapping::HiRom => match bank {
                0x40..=0x7D | 0xC0..=0xFF => ((bank & 0x3F) as usize) << 16 | offset as usize,
                _ if offset >= 0x8000 => ((bank & 0x3F) as usize) << 16 | offset as usize,
                _ => return None,
            },
        };

        // Images smaller than the mapped space mirror
        Some(self.rom[rom_offset % self.rom.len()])
    }

    /// Write a byte; only SRAM is writable.
    pub fn write(&mut self, addr: u32, val: u8) {
        let bank = (addr >> 16) as u8;
        if let Some(index) = self.sram_index(bank, addr as u16) {
            log(LogCategory::Bus, LogLevel::Trace, || {
                format!("cartridge: SRAM write ${:06X} = ${:02X}", addr, val)
            });
            self.sram[index] = val;
        }
    }

    fn sram_index(&self, bank: u8, offset: u16) -> Option<usize> {
        if self.sram.is_empty() {
            return None;
        }
        let index = match self.mapping {
            // Banks $70-$7D and $F0-$FF at $0000-$7FFF
            Mapping::LoRom if matches!(bank, 0x70..=0x7D | 0xF0..=0xFF) && offset < 0x8000 => {
                ((bank & 0x0F) as usize) << 15 | offset as usize
            }
            // Banks $20-$3F and $A0-$BF at $6000-$7FFF
            Mapping::HiRom
                if matches!(bank, 0x20..=0x3F | 0xA0..=0xBF)
                    && (0x6000..0x8000).contains(&offset) =>
            {
                ((bank & 0x1F) as usize) << 13 | (offset - 0x6000) as usize
            }
            _ => return None,
        };
        Some(index % self.sram.len())
    }

    pub fn sram(&self) -> &[u8] {
        &self.sram
    }

    /// Replace SRAM contents; false if the size does not match.
    pub fn restore_sram(&mut self, data: &[u8]) -> bool {
        if data.len() != self.sram.len() {
            return false;
        }
        self.sram.copy_from_slice(data);
        true
    }

    pub fn clear_sram(&mut self) {
        self.sram.fill(0);
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn info(&self) -> CartridgeInfo {
        CartridgeInfo {
            title: self.title.clone(),
            mapping: self.mapping,
            rom_size: self.rom.len(),
            sram_size: self.sram.len(),
            has_copier_header: self.has_copier_header,
            crc32: self.crc32,
        }
    }
}

fn parse_title(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}
