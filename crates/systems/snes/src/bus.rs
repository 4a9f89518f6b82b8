//! SNES memory bus implementation
//!
//! Address map (banks $00-$3F mirror into $80-$BF):
//!
//! | range              | device                                  |
//! |--------------------|-----------------------------------------|
//! | `$00-$3F:0000-1FFF`| WRAM low 8 KiB                          |
//! | `$00-$3F:2100-213F`| PPU registers                           |
//! | `$00-$3F:2180-2183`| WRAM data port                          |
//! | `$00-$3F:4016-4017`| serial joypad                           |
//! | `$00-$3F:4200-421F`| CPU I/O (NMI, math, DMA enable, joypad) |
//! | `$00-$3F:4300-437F`| DMA channels                            |
//! | `$7E-$7F`          | WRAM, all 128 KiB                       |
//! | everything else    | cartridge                               |
//!
//! Reads nothing answers return the last value seen on the data bus.

use serde::{Deserialize, Serialize};

use crate::cartridge::Cartridge;
use crate::cpu::CpuBus;
use crate::ppu::Ppu;
use framestep_core::logging::{log, LogCategory, LogLevel};
use framestep_core::RAM_SIZE;

pub const DMA_CHANNELS: usize = 8;
/// CPU cycles charged per byte moved by general DMA.
const DMA_CYCLES_PER_BYTE: u64 = 8;
const CPU_VERSION: u8 = 0x02;

/// CPU-side I/O registers and the controller port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoRegisters {
    /// $4200 NMITIMEN: bit 7 NMI enable, bit 0 auto-joypad read
    pub nmitimen: u8,
    /// $4202 WRMPYA
    pub wrmpya: u8,
    /// $4204/$4205 WRDIV
    pub wrdiv: u16,
    /// $4214/$4215 RDDIV
    pub rddiv: u16,
    /// $4216/$4217 RDMPY
    pub rdmpy: u16,
    /// $4210 bit 7, cleared by reading
    pub nmi_flag: bool,
    /// $4212 bit 7
    pub vblank: bool,
    /// NMI waiting to be taken by the CPU
    pub nmi_pending: bool,
    /// Buttons held on port 1 this frame, in hardware bit order
    pub pad: u16,
    /// $4218/$4219 auto-read result
    pub joy1: u16,
    /// $4016 strobe
    pub joypad_strobe: bool,
    /// Serial shift register behind $4016
    pub joypad_shift: u16,
    /// $2181-$2183 WMADD (17 bits)
    pub wram_port: u32,
}

/// One DMA channel's `$43x0-$43xF` register file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaChannel {
    regs: [u8; 16],
}

impl DmaChannel {
    /// $43x0 DMAP
    fn params(&self) -> u8 {
        self.regs[0]
    }

    /// $43x1 BBAD
    fn b_address(&self) -> u8 {
        self.regs[1]
    }

    /// $43x2-$43x4 A1T/A1B
    fn a_address(&self) -> (u8, u16) {
        (self.regs[4], u16::from_le_bytes([self.regs[2], self.regs[3]]))
    }

    fn set_a_offset(&mut self, offset: u16) {
        [self.regs[2], self.regs[3]] = offset.to_le_bytes();
    }

    /// $43x5/$43x6 DAS; zero means 65536 bytes
    fn byte_count(&self) -> u32 {
        match u16::from_le_bytes([self.regs[5], self.regs[6]]) {
            0 => 0x10000,
            n => n as u32,
        }
    }

    fn clear_count(&mut self) {
        self.regs[5] = 0;
        self.regs[6] = 0;
    }
}

/// B-bus register offsets written per transfer unit for each DMAP pattern.
fn transfer_pattern(params: u8) -> &'static [u8] {
    match params & 0x07 {
        0 => &[0],
        1 => &[0, 1],
        2 | 6 => &[0, 0],
        3 | 7 => &[0, 0, 1, 1],
        4 => &[0, 1, 2, 3],
        _ => &[0, 1, 0, 1],
    }
}

/// SNES memory bus
#[derive(Debug, Clone)]
pub struct Bus {
    pub(crate) wram: Vec<u8>,
    pub(crate) cart: Option<Cartridge>,
    pub(crate) ppu: Ppu,
    pub(crate) io: IoRegisters,
    pub(crate) dma: [DmaChannel; DMA_CHANNELS],
    /// Last value driven on the data bus
    pub(crate) mdr: u8,
    /// CPU cycles consumed by DMA since the last `take_stall_cycles`
    stall_cycles: u64,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            wram: vec![0; RAM_SIZE],
            cart: None,
            ppu: Ppu::new(),
            io: IoRegisters::default(),
            dma: [DmaChannel::default(); DMA_CHANNELS],
            mdr: 0,
            stall_cycles: 0,
        }
    }

    /// Back to power-on state, keeping the cartridge (SRAM is cleared).
    pub fn reset(&mut self) {
        self.wram.fill(0);
        self.ppu = Ppu::new();
        self.io = IoRegisters::default();
        self.dma = [DmaChannel::default(); DMA_CHANNELS];
        self.mdr = 0;
        self.stall_cycles = 0;
        if let Some(cart) = self.cart.as_mut() {
            cart.clear_sram();
        }
    }

    /// Start of vertical blank: raise the NMI flag and run auto-joypad read.
    pub fn enter_vblank(&mut self) {
        self.io.vblank = true;
        self.io.nmi_flag = true;
        if self.io.nmitimen & 0x80 != 0 {
            self.io.nmi_pending = true;
        }
        if self.io.nmitimen & 0x01 != 0 {
            self.io.joy1 = self.io.pad;
        }
    }

    /// Start of a new frame.
    pub fn leave_vblank(&mut self) {
        self.io.vblank = false;
        self.io.nmi_flag = false;
    }

    /// Consume a pending NMI request.
    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.io.nmi_pending)
    }

    pub fn take_stall_cycles(&mut self) -> u64 {
        std::mem::take(&mut self.stall_cycles)
    }

    fn read_cart(&self, addr: u32) -> Option<u8> {
        self.cart.as_ref().and_then(|cart| cart.read(addr))
    }

    fn write_cart(&mut self, addr: u32, val: u8) {
        if let Some(cart) = self.cart.as_mut() {
            cart.write(addr, val);
        }
    }

    fn read_system(&mut self, addr: u32, offset: u16) -> Option<u8> {
        match offset {
            0x0000..=0x1FFF => Some(self.wram[offset as usize]),
            0x2100..=0x21FF => self.read_b(offset as u8),
            0x4016 => Some(self.read_serial_joypad()),
            // Port 2 has nothing attached; bits 2-4 read high
            0x4017 => Some(0x1C),
            0x4200..=0x421F => self.read_cpu_io(offset),
            0x4300..=0x437F => {
                let (ch, reg) = dma_register(offset);
                Some(self.dma[ch].regs[reg])
            }
            0x2000..=0x5FFF => None,
            _ => self.read_cart(addr),
        }
    }

    fn write_system(&mut self, addr: u32, offset: u16, val: u8) {
        match offset {
            0x0000..=0x1FFF => self.wram[offset as usize] = val,
            0x2100..=0x21FF => self.write_b(offset as u8, val),
            0x4016 => {
                self.io.joypad_strobe = val & 0x01 != 0;
                if self.io.joypad_strobe {
                    self.io.joypad_shift = self.io.pad;
                }
            }
            0x4200..=0x421F => self.write_cpu_io(offset, val),
            0x4300..=0x437F => {
                let (ch, reg) = dma_register(offset);
                self.dma[ch].regs[reg] = val;
            }
            0x2000..=0x5FFF => {
                log(LogCategory::Bus, LogLevel::Trace, || {
                    format!("unmapped write ${:06X} = ${:02X}", addr, val)
                });
            }
            _ => self.write_cart(addr, val),
        }
    }

    /// B-bus read ($21xx).
    fn read_b(&mut self, reg: u8) -> Option<u8> {
        match reg {
            0x00..=0x3F => self.ppu.read_register(0x2100 | reg as u16),
            0x80 => {
                let val = self.wram[self.io.wram_port as usize];
                self.advance_wram_port();
                Some(val)
            }
            _ => None,
        }
    }

    /// B-bus write ($21xx).
    fn write_b(&mut self, reg: u8, val: u8) {
        match reg {
            0x00..=0x3F => self.ppu.write_register(0x2100 | reg as u16, val),
            0x80 => {
                self.wram[self.io.wram_port as usize] = val;
                self.advance_wram_port();
            }
            0x81 => self.io.wram_port = (self.io.wram_port & 0x1FF00) | val as u32,
            0x82 => self.io.wram_port = (self.io.wram_port & 0x100FF) | (val as u32) << 8,
            0x83 => self.io.wram_port = (self.io.wram_port & 0x0FFFF) | ((val & 0x01) as u32) << 16,
            _ => {}
        }
    }

    fn advance_wram_port(&mut self) {
        self.io.wram_port = (self.io.wram_port + 1) & (RAM_SIZE as u32 - 1);
    }

    /// $4016: one bit per read, MSB first; 1s once all 16 bits are out.
    fn read_serial_joypad(&mut self) -> u8 {
        if self.io.joypad_strobe {
            return (self.io.pad >> 15) as u8;
        }
        let bit = (self.io.joypad_shift >> 15) as u8;
        self.io.joypad_shift = (self.io.joypad_shift << 1) | 1;
        bit
    }

    fn read_cpu_io(&mut self, offset: u16) -> Option<u8> {
        let io = &mut self.io;
        let val = match offset {
            0x4210 => {
                let flag = if io.nmi_flag { 0x80 } else { 0 };
                io.nmi_flag = false;
                flag | CPU_VERSION
            }
            0x4211 => 0,
            0x4212 => {
                if io.vblank {
                    0x80
                } else {
                    0
                }
            }
            0x4214 => io.rddiv as u8,
            0x4215 => (io.rddiv >> 8) as u8,
            0x4216 => io.rdmpy as u8,
            0x4217 => (io.rdmpy >> 8) as u8,
            0x4218 => io.joy1 as u8,
            0x4219 => (io.joy1 >> 8) as u8,
            0x421A..=0x421F => 0,
            _ => return None,
        };
        Some(val)
    }

    fn write_cpu_io(&mut self, offset: u16, val: u8) {
        match offset {
            0x4200 => {
                // Enabling NMI during vblank fires it straight away
                let enabling = val & 0x80 != 0 && self.io.nmitimen & 0x80 == 0;
                if enabling && self.io.nmi_flag {
                    self.io.nmi_pending = true;
                }
                self.io.nmitimen = val;
            }
            0x4202 => self.io.wrmpya = val,
            0x4203 => {
                self.io.rdmpy = self.io.wrmpya as u16 * val as u16;
                self.io.rddiv = val as u16;
            }
            0x4204 => self.io.wrdiv = (self.io.wrdiv & 0xFF00) | val as u16,
            0x4205 => self.io.wrdiv = (self.io.wrdiv & 0x00FF) | (val as u16) << 8,
            0x4206 => {
                if val == 0 {
                    self.io.rddiv = 0xFFFF;
                    self.io.rdmpy = self.io.wrdiv;
                } else {
                    self.io.rddiv = self.io.wrdiv / val as u16;
                    self.io.rdmpy = self.io.wrdiv % val as u16;
                }
            }
            0x420B => self.run_dma(val),
            _ => {}
        }
    }

    /// General-purpose DMA for every channel set in `mask`, lowest first.
    fn run_dma(&mut self, mask: u8) {
        for ch in (0..DMA_CHANNELS).filter(|ch| mask & (1 << ch) != 0) {
            let channel = self.dma[ch];
            let params = channel.params();
            let to_cpu = params & 0x80 != 0;
            let fixed = params & 0x08 != 0;
            let decrement = params & 0x10 != 0;
            let pattern = transfer_pattern(params);
            let (bank, mut offset) = channel.a_address();
            let count = channel.byte_count();

            log(LogCategory::Bus, LogLevel::Debug, || {
                format!(
                    "DMA{} {} ${:02X}:{:04X} {} $21{:02X}, {} bytes",
                    ch,
                    if to_cpu { "to" } else { "from" },
                    bank,
                    offset,
                    if to_cpu { "from" } else { "to" },
                    channel.b_address(),
                    count
                )
            });

            for i in 0..count as usize {
                let b_reg = channel.b_address().wrapping_add(pattern[i % pattern.len()]);
                let a_addr = (bank as u32) << 16 | offset as u32;
                if to_cpu {
                    let val = self.read_b(b_reg).unwrap_or(self.mdr);
                    self.write(a_addr, val);
                } else {
                    let val = self.read(a_addr);
                    self.write_b(b_reg, val);
                }
                if !fixed {
                    offset = if decrement {
                        offset.wrapping_sub(1)
                    } else {
                        offset.wrapping_add(1)
                    };
                }
            }

            self.dma[ch].set_a_offset(offset);
            self.dma[ch].clear_count();
            self.stall_cycles += count as u64 * DMA_CYCLES_PER_BYTE;
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBus for Bus {
    fn read(&mut self, addr: u32) -> u8 {
        let bank = (addr >> 16) as u8;
        let offset = addr as u16;

        let val = match bank {
            // Banks $00-$3F and $80-$BF: System area
            0x00..=0x3F | 0x80..=0xBF => self.read_system(addr, offset),
            // Banks $7E-$7F: Full WRAM
            0x7E..=0x7F => Some(self.wram[(addr & 0x1FFFF) as usize]),
            // Banks $40-$7D and $C0-$FF: Cartridge
            _ => self.read_cart(addr),
        };

        let val = val.unwrap_or(self.mdr);
        self.mdr = val;
        val
    }

    fn write(&mut self, addr: u32, val: u8) {
        let bank = (addr >> 16) as u8;
        let offset = addr as u16;
        self.mdr = val;

        match bank {
            0x00..=0x3F | 0x80..=0xBF => self.write_system(addr, offset, val),
            0x7E..=0x7F => self.wram[(addr & 0x1FFFF) as usize] = val,
            _ => self.write_cart(addr, val),
        }
    }
}

fn dma_register(offset: u16) -> (usize, usize) {
    (((offset >> 4) & 0x07) as usize, (offset & 0x0F) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with_rom() -> Bus {
        let mut rom = vec![0; 0x8000];
        rom[0] = 0x42;
        let mut bus = Bus::new();
        bus.cart = Some(Cartridge::load(&rom).unwrap());
        bus
    }

    #[test]
    fn test_wram_mirrors() {
        let mut bus = Bus::new();
        bus.write(0x000010, 0xAB);
        assert_eq!(bus.read(0x7E0010), 0xAB);
        assert_eq!(bus.read(0x800010), 0xAB);
        bus.write(0x7F0000, 0xCD);
        assert_eq!(bus.wram[0x10000], 0xCD);
        assert_eq!(bus.read(0x3F1FFF), bus.wram[0x1FFF]);
    }

    #[test]
    fn test_cartridge_reads() {
        let mut bus = bus_with_rom();
        assert_eq!(bus.read(0x008000), 0x42);
        assert_eq!(bus.read(0x808000), 0x42);
    }

    #[test]
    fn test_open_bus_returns_last_value() {
        let mut bus = Bus::new();
        bus.write(0x000000, 0x5A);
        bus.read(0x000000);
        assert_eq!(bus.read(0x005000), 0x5A);
        // No cartridge: ROM area is open bus too
        assert_eq!(bus.read(0x008000), 0x5A);
    }

    #[test]
    fn test_wram_port() {
        let mut bus = Bus::new();
        bus.write(0x002181, 0xFF);
        bus.write(0x002182, 0xFF);
        bus.write(0x002183, 0x01);
        bus.write(0x002180, 0x11);
        // Address wraps to the start of WRAM
        bus.write(0x002180, 0x22);
        assert_eq!(bus.wram[0x1FFFF], 0x11);
        assert_eq!(bus.wram[0], 0x22);

        bus.write(0x002181, 0xFF);
        bus.write(0x002182, 0xFF);
        bus.write(0x002183, 0x01);
        assert_eq!(bus.read(0x002180), 0x11);
        assert_eq!(bus.read(0x002180), 0x22);
    }

    #[test]
    fn test_multiply() {
        let mut bus = Bus::new();
        bus.write(0x004202, 200);
        bus.write(0x004203, 100);
        assert_eq!(bus.read(0x004216), (20000u16 & 0xFF) as u8);
        assert_eq!(bus.read(0x004217), (20000u16 >> 8) as u8);
    }

    #[test]
    fn test_divide() {
        let mut bus = Bus::new();
        bus.write(0x004204, 0x39); // 12345 = $3039
        bus.write(0x004205, 0x30);
        bus.write(0x004206, 100);
        assert_eq!(bus.io.rddiv, 123);
        assert_eq!(bus.io.rdmpy, 45);

        bus.write(0x004206, 0);
        assert_eq!(bus.io.rddiv, 0xFFFF);
        assert_eq!(bus.io.rdmpy, 12345);
    }

    #[test]
    fn test_rdnmi_clears_on_read() {
        let mut bus = Bus::new();
        bus.enter_vblank();
        assert_eq!(bus.read(0x004210), 0x80 | CPU_VERSION);
        assert_eq!(bus.read(0x004210), CPU_VERSION);
        assert_eq!(bus.read(0x004212), 0x80);
        bus.leave_vblank();
        assert_eq!(bus.read(0x004212), 0x00);
    }

    #[test]
    fn test_nmi_only_when_enabled() {
        let mut bus = Bus::new();
        bus.enter_vblank();
        assert!(!bus.take_nmi());

        bus.leave_vblank();
        bus.write(0x004200, 0x80);
        bus.enter_vblank();
        assert!(bus.take_nmi());
        assert!(!bus.take_nmi());
    }

    #[test]
    fn test_enabling_nmi_inside_vblank_fires() {
        let mut bus = Bus::new();
        bus.enter_vblank();
        bus.write(0x004200, 0x80);
        assert!(bus.take_nmi());
    }

    #[test]
    fn test_auto_joypad_read() {
        let mut bus = Bus::new();
        bus.io.pad = 0x8100;
        bus.enter_vblank();
        assert_eq!(bus.read(0x004219), 0); // disabled

        bus.write(0x004200, 0x01);
        bus.enter_vblank();
        assert_eq!(bus.read(0x004218), 0x00);
        assert_eq!(bus.read(0x004219), 0x81);
    }

    #[test]
    fn test_serial_joypad() {
        let mut bus = Bus::new();
        bus.io.pad = 0x8000 | 0x0080; // B and A
        bus.write(0x004016, 1);
        bus.write(0x004016, 0);
        let bits: Vec<u8> = (0..17).map(|_| bus.read(0x004016) & 1).collect();
        assert_eq!(bits[0], 1); // B
        assert_eq!(bits[8], 1); // A
        assert_eq!(bits[1..8].iter().sum::<u8>(), 0);
        assert_eq!(bits[16], 1);
    }

    #[test]
    fn test_dma_to_vram() {
        let mut bus = Bus::new();
        for (i, b) in [0x11u8, 0x22, 0x33, 0x44].iter().enumerate() {
            bus.wram[0x100 + i] = *b;
        }
        bus.write(0x002115, 0x80);
        bus.write(0x002116, 0x00);
        bus.write(0x002117, 0x00);

        // Channel 1: pattern 1 (two registers) to $2118, source $7E:0100, 4 bytes
        bus.write(0x004310, 0x01);
        bus.write(0x004311, 0x18);
        bus.write(0x004312, 0x00);
        bus.write(0x004313, 0x01);
        bus.write(0x004314, 0x7E);
        bus.write(0x004315, 0x04);
        bus.write(0x004316, 0x00);
        bus.write(0x00420B, 0x02);

        bus.write(0x002116, 0x00);
        bus.write(0x002117, 0x00);
        let read: Vec<u8> = (0..4)
            .map(|i| bus.read(if i % 2 == 0 { 0x002139 } else { 0x00213A }))
            .collect();
        assert_eq!(read, vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(bus.read(0x004315), 0);
        assert_eq!(bus.read(0x004312), 0x04);
        assert_eq!(bus.take_stall_cycles(), 4 * DMA_CYCLES_PER_BYTE);
        assert_eq!(bus.take_stall_cycles(), 0);
    }

    #[test]
    fn test_dma_fixed_source_fill() {
        let mut bus = Bus::new();
        bus.wram[0x50] = 0x99;
        // Fixed source, B-bus $2180 (WRAM port) -> copy $7E:0050 into $7E:1000..
        bus.write(0x002181, 0x00);
        bus.write(0x002182, 0x10);
        bus.write(0x002183, 0x00);
        bus.write(0x004300, 0x08);
        bus.write(0x004301, 0x80);
        bus.write(0x004302, 0x50);
        bus.write(0x004303, 0x00);
        bus.write(0x004304, 0x7E);
        bus.write(0x004305, 0x10);
        bus.write(0x004306, 0x00);
        bus.write(0x00420B, 0x01);
        assert!(bus.wram[0x1000..0x1010].iter().all(|&b| b == 0x99));
        assert_eq!(bus.wram[0x1010], 0);
    }

    #[test]
    fn test_reset_clears_everything_but_cartridge() {
        let mut bus = bus_with_rom();
        bus.write(0x000000, 0x12);
        bus.write(0x004200, 0x81);
        bus.reset();
        assert_eq!(bus.wram[0], 0);
        assert_eq!(bus.io, IoRegisters::default());
        assert_eq!(bus.read(0x008000), 0x42);
    }
}
