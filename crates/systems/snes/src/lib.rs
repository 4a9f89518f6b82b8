//! SNES-class engine behind the frame-stepped [`Engine`] contract.
//!
//! - **CPU**: WDC 65C816 interpreter, one cycle per bus access
//! - **PPU**: register file, VRAM/CGRAM ports and a backdrop + BG1 compositor
//! - **Memory**: 128KB WRAM + cartridge ROM/SRAM (LoROM and HiROM)
//! - **Timing**: NTSC, 262 scanlines of 341 CPU cycles, vblank from line 225
//!
//! There is no audio processor; writes to the APU ports are ignored.

#![allow(clippy::upper_case_acronyms)]

mod bus;
mod cartridge;
mod cpu;
mod joypad;
mod ppu;
mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use bus::Bus;
use cartridge::Cartridge;
use framestep_core::logging::{log, LogCategory, LogLevel};
use framestep_core::types::Frame;
use framestep_core::{Engine, EngineError, EngineStatus, InputVector};
use thiserror::Error;

pub use cartridge::{CartridgeInfo, Mapping};
pub use cpu::{Cpu, CpuBus};
pub use joypad::pad_word;

/// CPU cycles per scanline (1364 master clocks / 4).
pub const CYCLES_PER_LINE: u64 = 341;
pub const LINES_PER_FRAME: u16 = 262;
/// First scanline of vertical blank.
pub const VBLANK_LINE: u16 = 225;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnesError {
    #[error("Invalid ROM format: {0}")]
    InvalidRom(String),
    #[error("No cartridge mounted")]
    NoCartridge,
}

impl From<SnesError> for EngineError {
    fn from(e: SnesError) -> Self {
        match e {
            SnesError::InvalidRom(msg) => EngineError::RomLoad(msg),
            SnesError::NoCartridge => EngineError::NotReady,
        }
    }
}

/// SNES system implementation
#[derive(Debug, Clone)]
pub struct SnesEngine {
    cpu: Cpu,
    bus: Bus,
    frame: Frame,
    status: EngineStatus,
    /// Cycles the CPU ran past the end of the previous scanline
    cycle_carry: u64,
    frame_number: u64,
}

impl SnesEngine {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            frame: blank_frame(),
            status: EngineStatus::Unloaded,
            cycle_carry: 0,
            frame_number: 0,
        }
    }

    /// Header summary of the installed cartridge.
    pub fn cartridge_info(&self) -> Option<CartridgeInfo> {
        self.bus.cart.as_ref().map(Cartridge::info)
    }

    /// Frames stepped since load or reset.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// CPU registers, for debugging.
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    fn ensure_ready(&self) -> Result<(), EngineError> {
        if self.status.is_ready() {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }

    fn power_on(&mut self) {
        self.bus.reset();
        self.cpu.reset(&mut self.bus);
        self.frame = blank_frame();
        self.cycle_carry = 0;
        self.frame_number = 0;
    }

    fn run_frame(&mut self, render: bool) {
        for line in 0..LINES_PER_FRAME {
            if line == 0 {
                self.bus.leave_vblank();
            }
            if line == VBLANK_LINE {
                if render {
                    self.bus.ppu.render(&mut self.frame);
                }
                self.bus.enter_vblank();
            }
            self.run_line();
        }
        self.frame_number += 1;
    }

    fn run_line(&mut self) {
        let mut elapsed = self.cycle_carry;
        while elapsed < CYCLES_PER_LINE {
            if self.bus.take_nmi() {
                log(LogCategory::Cpu, LogLevel::Debug, || {
                    format!("NMI at frame {}", self.frame_number)
                });
                elapsed += self.cpu.nmi(&mut self.bus) as u64;
                continue;
            }
            if self.cpu.is_halted() {
                // Nothing can wake the CPU before the next line boundary
                elapsed = CYCLES_PER_LINE;
                break;
            }
            elapsed += self.cpu.step(&mut self.bus) as u64;
            elapsed += self.bus.take_stall_cycles();
        }
        self.cycle_carry = elapsed - CYCLES_PER_LINE;
    }
}

impl Default for SnesEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn blank_frame() -> Frame {
    let mut frame = Frame::default();
    frame.fill([0, 0, 0, 0xFF]);
    frame
}

impl Engine for SnesEngine {
    fn load_rom(&mut self, rom: &[u8]) -> Result<(), EngineError> {
        let cart = Cartridge::load(rom)?;
        let info = cart.info();
        log(LogCategory::State, LogLevel::Info, || {
            format!(
                "loaded \"{}\" ({}, {} KB ROM, {} KB SRAM, CRC32 {:08X})",
                info.title,
                info.mapping,
                info.rom_size / 1024,
                info.sram_size / 1024,
                info.crc32
            )
        });
        self.bus.cart = Some(cart);
        self.power_on();
        self.status = EngineStatus::Loaded;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.ensure_ready()?;
        self.power_on();
        self.status = EngineStatus::Loaded;
        log(LogCategory::State, LogLevel::Info, || "reset".to_string());
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        self.status
    }

    fn step(&mut self, input: InputVector, render: bool) -> Result<&Frame, EngineError> {
        self.ensure_ready()?;
        self.bus.io.pad = pad_word(input);
        self.run_frame(render);
        self.status = EngineStatus::Running;
        Ok(&self.frame)
    }

    fn tick(&mut self, count: u32, render: bool, input: InputVector) -> Result<u32, EngineError> {
        self.ensure_ready()?;
        if count == 0 {
            return Ok(0);
        }
        self.bus.io.pad = pad_word(input);
        for i in 0..count {
            self.run_frame(render && i + 1 == count);
        }
        self.status = EngineStatus::Running;
        Ok(count)
    }

    fn screen(&self) -> &Frame {
        &self.frame
    }

    fn memory(&self) -> &[u8] {
        &self.bus.wram
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.bus.wram
    }

    fn save_state(&self) -> Result<Vec<u8>, EngineError> {
        self.save_machine_state()
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.load_machine_state(data)
    }
}
