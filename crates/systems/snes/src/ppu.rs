//! SNES PPU (Picture Processing Unit) - minimal implementation
//!
//! Supports:
//! - VRAM access via $2115-$2119 with increment modes and read prefetch ($2139/$213A)
//! - CGRAM (palette) access via $2121/$2122 and reads via $213B
//! - Brightness and forced blank via $2100
//! - BG1 with 32/64-tile tilemaps, scrolling and tile flips
//!   (2bpp in mode 0, 4bpp in modes 1-6)
//! - Output size from BGMODE/SETINI: 512 wide in modes 5/6, 239 lines with
//!   overscan, doubled lines when interlaced
//!
//! NOT implemented:
//! - BG2-BG4, sprites (OAM), mode 7
//! - Windows, color math, mosaic, HDMA effects

use framestep_core::logging::{log, LogCategory, LogLevel};
use framestep_core::types::Frame;
use serde::{Deserialize, Serialize};

pub const VRAM_WORDS: usize = 0x8000; // 64KB VRAM
pub const CGRAM_COLORS: usize = 256; // 15-bit BGR colors

/// BG scroll registers hold 10 bits
const SCROLL_MASK: u16 = 0x3FF;
const NORMAL_LINES: u32 = 224;
const OVERSCAN_LINES: u32 = 239;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ppu {
    /// VRAM (32K 16-bit words)
    vram: Vec<u16>,
    /// CGRAM (256 BGR555 colors)
    cgram: Vec<u16>,

    /// $2100 INIDISP - bit 7 = force blank, bits 0-3 = brightness
    inidisp: u8,
    /// $2105 BGMODE - bits 0-2 = BG mode
    bgmode: u8,
    /// $2107 BG1SC - bits 2-7 = tilemap word address >> 10, bits 0-1 = size
    bg1sc: u8,
    /// $210B BG12NBA - bits 0-3 = BG1 CHR word address >> 12
    bg12nba: u8,
    /// $212C TM - main screen layers
    tm: u8,
    /// $2133 SETINI - bit 0 = interlace, bit 2 = overscan
    setini: u8,

    /// BG1 scroll offsets (10-bit)
    bg1_hofs: u16,
    bg1_vofs: u16,
    /// Last byte written to any BG scroll register
    scroll_prev: u8,

    /// $2115 VMAIN
    vmain: u8,
    /// $2116/$2117 VRAM word address
    vram_addr: u16,
    /// Word fetched ahead for $2139/$213A reads
    vram_prefetch: u16,

    /// $2121 CGRAM word address
    cgram_addr: u8,
    /// Second access of a CGRAM word pair (write or read)
    cgram_high: bool,
    /// Low byte held until the high byte write
    cgram_latch: u8,
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            vram: vec![0; VRAM_WORDS],
            cgram: vec![0; CGRAM_COLORS],
            inidisp: 0x80, // Start with screen blanked
            bgmode: 0,
            bg1sc: 0,
            bg12nba: 0,
            tm: 0,
            setini: 0,
            bg1_hofs: 0,
            bg1_vofs: 0,
            scroll_prev: 0,
            vmain: 0,
            vram_addr: 0,
            vram_prefetch: 0,
            cgram_addr: 0,
            cgram_high: false,
            cgram_latch: 0,
        }
    }

    /// Write to PPU registers
    pub fn write_register(&mut self, addr: u16, val: u8) {
        match addr {
            // $2100 - INIDISP - Screen Display Register
            0x2100 => self.inidisp = val,

            // $2105 - BGMODE - BG Mode and Character Size
            0x2105 => {
                if val & 0x07 != self.bgmode & 0x07 {
                    log(LogCategory::Ppu, LogLevel::Debug, || {
                        format!("BG mode {}", val & 0x07)
                    });
                }
                self.bgmode = val;
            }

            // $2107 - BG1SC - BG1 Tilemap Address and Size
            0x2107 => self.bg1sc = val,

            // $210B - BG12NBA - BG1/BG2 Character Data Address
            0x210B => self.bg12nba = val,

            // $210D/$210E - BG1 scroll (two writes, shared latch)
            0x210D => {
                self.bg1_hofs = self.scroll_value(val);
            }
            0x210E => {
                self.bg1_vofs = self.scroll_value(val);
            }
            // Other BG scroll registers only feed the latch
            0x210F..=0x2114 => {
                self.scroll_value(val);
            }

            // $2115 - VMAIN - VRAM Address Increment Mode
            0x2115 => self.vmain = val,

            // $2116/$2117 - VMADD - VRAM Address
            0x2116 => {
                self.vram_addr = (self.vram_addr & 0xFF00) | val as u16;
                self.prefetch();
            }
            0x2117 => {
                self.vram_addr = (self.vram_addr & 0x00FF) | ((val as u16) << 8);
                self.prefetch();
            }

            // $2118/$2119 - VMDATA - VRAM Data Write
            0x2118 => {
                let i = self.vram_index();
                self.vram[i] = (self.vram[i] & 0xFF00) | val as u16;
                if !self.increment_on_high() {
                    self.increment_vram();
                }
            }
            0x2119 => {
                let i = self.vram_index();
                self.vram[i] = (self.vram[i] & 0x00FF) | ((val as u16) << 8);
                if self.increment_on_high() {
                    self.increment_vram();
                }
            }

            // $2121 - CGADD - CGRAM Address
            0x2121 => {
                self.cgram_addr = val;
                self.cgram_high = false;
            }

            // $2122 - CGDATA - CGRAM Data Write (low byte, then high byte)
            0x2122 => {
                if self.cgram_high {
                    self.cgram[self.cgram_addr as usize] =
                        ((val as u16 & 0x7F) << 8) | self.cgram_latch as u16;
                    self.cgram_addr = self.cgram_addr.wrapping_add(1);
                } else {
                    self.cgram_latch = val;
                }
                self.cgram_high = !self.cgram_high;
            }

            // $212C - TM - Main Screen Designation
            0x212C => self.tm = val,

            // $2133 - SETINI - Display Control 2
            0x2133 => self.setini = val,

            // Other registers accept writes without effect
            _ => {}
        }
    }

    /// Read from PPU registers; `None` for write-only registers (open bus).
    pub fn read_register(&mut self, addr: u16) -> Option<u8> {
        match addr {
            // $2139/$213A - VMDATAREAD
            0x2139 => {
                let val = self.vram_prefetch as u8;
                if !self.increment_on_high() {
                    self.increment_vram();
                    self.prefetch();
                }
                Some(val)
            }
            0x213A => {
                let val = (self.vram_prefetch >> 8) as u8;
                if self.increment_on_high() {
                    self.increment_vram();
                    self.prefetch();
                }
                Some(val)
            }

            // $213B - CGDATAREAD
            0x213B => {
                let color = self.cgram[self.cgram_addr as usize];
                let val = if self.cgram_high {
                    self.cgram_addr = self.cgram_addr.wrapping_add(1);
                    (color >> 8) as u8
                } else {
                    color as u8
                };
                self.cgram_high = !self.cgram_high;
                Some(val)
            }

            // $213F - STAT78: PPU2 version 1
            0x213F => Some(0x01),

            _ => None,
        }
    }

    /// `((new << 8) | previous) & 0x3FF`, then remember the byte.
    fn scroll_value(&mut self, val: u8) -> u16 {
        let result = (((val as u16) << 8) | self.scroll_prev as u16) & SCROLL_MASK;
        self.scroll_prev = val;
        result
    }

    fn increment_on_high(&self) -> bool {
        self.vmain & 0x80 != 0
    }

    fn increment_vram(&mut self) {
        let step = match self.vmain & 0x03 {
            0 => 1,
            1 => 32,
            _ => 128,
        };
        self.vram_addr = self.vram_addr.wrapping_add(step);
    }

    fn prefetch(&mut self) {
        self.vram_prefetch = self.vram[self.vram_index()];
    }

    fn vram_index(&self) -> usize {
        self.vram_addr as usize & (VRAM_WORDS - 1)
    }

    fn vram_word(&self, addr: usize) -> u16 {
        self.vram[addr & (VRAM_WORDS - 1)]
    }

    pub fn mode(&self) -> u8 {
        self.bgmode & 0x07
    }

    /// Output dimensions for the current BGMODE/SETINI.
    pub fn output_size(&self) -> (u32, u32) {
        let width = if matches!(self.mode(), 5 | 6) { 512 } else { 256 };
        let lines = self.visible_lines();
        let height = if self.setini & 0x01 != 0 { lines * 2 } else { lines };
        (width, height)
    }

    /// Lines the picture covers before interlace doubling.
    pub fn visible_lines(&self) -> u32 {
        if self.setini & 0x04 != 0 {
            OVERSCAN_LINES
        } else {
            NORMAL_LINES
        }
    }

    /// Compose the picture into `frame`, resizing it to the current mode.
    pub fn render(&self, frame: &mut Frame) {
        let (width, height) = self.output_size();
        frame.resize(width, height);

        if self.inidisp & 0x80 != 0 {
            frame.fill([0, 0, 0, 0xFF]);
            return;
        }

        let brightness = (self.inidisp & 0x0F) as u32;
        let palette: Vec<[u8; 4]> = self
            .cgram
            .iter()
            .map(|&c| bgr555_to_rgba(c, brightness))
            .collect();

        let bpp = match self.mode() {
            0 => Some(2),
            1..=6 => Some(4),
            _ => None,
        }
        .filter(|_| self.tm & 0x01 != 0);

        let lines = self.visible_lines();
        let x_repeat = (width / 256) as usize;
        let y_repeat = height / lines;
        let mut line = vec![0u8; width as usize * 4];

        for y in 0..lines {
            for x in 0..256u16 {
                let index = bpp.map_or(0, |bpp| self.bg1_pixel(x, y as u16, bpp));
                let rgba = palette[index as usize];
                for rep in 0..x_repeat {
                    let px = (x as usize * x_repeat + rep) * 4;
                    line[px..px + 4].copy_from_slice(&rgba);
                }
            }
            for rep in 0..y_repeat {
                let start = ((y * y_repeat + rep) as usize) * line.len();
                frame.pixels[start..start + line.len()].copy_from_slice(&line);
            }
        }
    }

    /// CGRAM index of BG1 at screen position (x, y); 0 is transparent.
    fn bg1_pixel(&self, x: u16, y: u16, bpp: u16) -> u8 {
        let size = self.bg1sc & 0x03;
        let map_width: u16 = if size & 0x01 != 0 { 64 } else { 32 };
        let map_height: u16 = if size & 0x02 != 0 { 64 } else { 32 };

        let world_x = (x + self.bg1_hofs) % (map_width * 8);
        let world_y = (y + self.bg1_vofs) % (map_height * 8);
        let (tile_x, tile_y) = (world_x / 8, world_y / 8);

        // 32x32 screens laid out left-to-right, then top-to-bottom
        let screen = match size {
            1 => tile_x / 32,
            2 => tile_y / 32,
            3 => tile_x / 32 + 2 * (tile_y / 32),
            _ => 0,
        };
        let map_base = ((self.bg1sc as usize) >> 2) << 10;
        let entry_addr =
            map_base + screen as usize * 0x400 + (tile_y % 32) as usize * 32 + (tile_x % 32) as usize;

        // Tilemap entry: vhopppcc cccccccc
        let entry = self.vram_word(entry_addr);
        let tile = (entry & 0x03FF) as usize;
        let palette = (entry >> 10) & 0x07;
        let flip_x = entry & 0x4000 != 0;
        let flip_y = entry & 0x8000 != 0;

        let row = (if flip_y { 7 - world_y % 8 } else { world_y % 8 }) as usize;
        let bit = if flip_x { world_x % 8 } else { 7 - world_x % 8 };

        // 2bpp tiles are 8 words, 4bpp tiles 16; each word holds two planes of a row
        let chr_base = ((self.bg12nba & 0x0F) as usize) << 12;
        let tile_addr = chr_base + tile * (bpp as usize * 4);
        let mut color = 0u16;
        for pair in 0..(bpp / 2) as usize {
            let word = self.vram_word(tile_addr + pair * 8 + row);
            let lo = (word >> bit) & 1;
            let hi = (word >> (8 + bit)) & 1;
            color |= (lo | (hi << 1)) << (pair * 2);
        }

        if color == 0 {
            0
        } else {
            (palette * (1 << bpp) + color) as u8
        }
    }

    /// Check buffer sizes after deserializing.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.vram.len() != VRAM_WORDS {
            return Err(format!("VRAM is {} words, expected {}", self.vram.len(), VRAM_WORDS));
        }
        if self.cgram.len() != CGRAM_COLORS {
            return Err(format!(
                "CGRAM is {} colors, expected {}",
                self.cgram.len(),
                CGRAM_COLORS
            ));
        }
        if self.bg1_hofs > SCROLL_MASK || self.bg1_vofs > SCROLL_MASK {
            return Err(format!(
                "BG1 scroll ({:#X}, {:#X}) exceeds 10 bits",
                self.bg1_hofs, self.bg1_vofs
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn with_scroll(hofs: u16, vofs: u16) -> Self {
        Self {
            bg1_hofs: hofs,
            bg1_vofs: vofs,
            ..Self::new()
        }
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

/// SNES color format: 15-bit BGR (0bbbbbgggggrrrrr), scaled by brightness 0-15.
fn bgr555_to_rgba(color: u16, brightness: u32) -> [u8; 4] {
    let channel = |c: u16| {
        let c = (c & 0x1F) as u32;
        let c8 = (c << 3) | (c >> 2);
        (c8 * brightness / 15) as u8
    };
    [channel(color), channel(color >> 5), channel(color >> 10), 0xFF]
}
