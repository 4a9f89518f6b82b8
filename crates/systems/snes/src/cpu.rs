//! WDC 65C816 interpreter.
//!
//! The CPU holds registers only; every bus access goes through [`CpuBus`],
//! so the whole register file can be serialized into a save state. Each bus
//! access costs one cycle and internal operations are charged with `idle`,
//! which keeps timing deterministic without a per-opcode cycle table.
//!
//! Implemented:
//! - all 256 opcodes, native and emulation mode
//! - 8/16-bit accumulator and index registers (m/x flags)
//! - binary and decimal ADC/SBC in both widths
//! - MVN/MVP block moves (one byte per instruction execution)
//! - BRK/COP/NMI vectors, WAI and STP

use framestep_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// Memory interface for the CPU. Reads take `&mut self` because many I/O
/// registers change state when read.
pub trait CpuBus {
    fn read(&mut self, addr: u32) -> u8;
    fn write(&mut self, addr: u32, val: u8);
}

// Status register flags
const FLAG_NEGATIVE: u8 = 0b1000_0000;
const FLAG_OVERFLOW: u8 = 0b0100_0000;
const FLAG_MEMORY: u8 = 0b0010_0000; // m flag: 0=16-bit A, 1=8-bit A
const FLAG_INDEX: u8 = 0b0001_0000; // x flag: 0=16-bit X/Y, 1=8-bit X/Y
const FLAG_DECIMAL: u8 = 0b0000_1000;
const FLAG_IRQ_DISABLE: u8 = 0b0000_0100;
const FLAG_ZERO: u8 = 0b0000_0010;
const FLAG_CARRY: u8 = 0b0000_0001;

/// Break flag as pushed in emulation mode (shares the x flag's bit).
const FLAG_BREAK: u8 = 0b0001_0000;

// Interrupt vectors (bank $00)
const VEC_COP_NATIVE: u32 = 0xFFE4;
const VEC_BRK_NATIVE: u32 = 0xFFE6;
const VEC_NMI_NATIVE: u32 = 0xFFEA;
const VEC_COP_EMULATION: u32 = 0xFFF4;
const VEC_NMI_EMULATION: u32 = 0xFFFA;
const VEC_RESET: u32 = 0xFFFC;
const VEC_BRK_EMULATION: u32 = 0xFFFE;

const ADDR_MASK: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Immediate,
    Direct,
    DirectX,
    DirectY,
    DirectIndirect,
    DirectIndirectLong,
    DirectXIndirect,
    DirectIndirectY,
    DirectIndirectLongY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Long,
    LongX,
    StackRelative,
    StackRelativeIndirectY,
}

/// Addressing mode of the eight accumulator opcodes (ORA AND EOR ADC STA
/// LDA CMP SBC), encoded in the low five bits.
fn alu_mode(opcode: u8) -> Mode {
    match opcode & 0x1F {
        0x01 => Mode::DirectXIndirect,
        0x03 => Mode::StackRelative,
        0x05 => Mode::Direct,
        0x07 => Mode::DirectIndirectLong,
        0x09 => Mode::Immediate,
        0x0D => Mode::Absolute,
        0x0F => Mode::Long,
        0x11 => Mode::DirectIndirectY,
        0x12 => Mode::DirectIndirect,
        0x13 => Mode::StackRelativeIndirectY,
        0x15 => Mode::DirectX,
        0x17 => Mode::DirectIndirectLongY,
        0x19 => Mode::AbsoluteY,
        0x1D => Mode::AbsoluteX,
        _ => Mode::LongX,
    }
}

type ModifyOp = fn(&mut Cpu, u16, bool) -> u16;

/// 65C816 register file and execution state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    /// Accumulator (C: 16-bit, A is the low byte)
    pub c: u16,
    pub x: u16,
    pub y: u16,
    /// Stack pointer
    pub s: u16,
    /// Direct page register
    pub d: u16,
    /// Data bank register
    pub dbr: u8,
    /// Program bank register
    pub pbr: u8,
    pub pc: u16,
    /// NVmxDIZC
    pub status: u8,
    /// 6502 emulation mode
    pub emulation: bool,
    /// Halted by WAI until the next interrupt
    pub waiting: bool,
    /// Halted by STP until reset
    pub stopped: bool,
    /// Total cycles executed
    pub cycles: u64,
}

impl Cpu {
    /// Power-on register state. Call [`Cpu::reset`] to load the reset vector.
    pub fn new() -> Self {
        Self {
            c: 0,
            x: 0,
            y: 0,
            s: 0x01FF,
            d: 0,
            dbr: 0,
            pbr: 0,
            pc: 0,
            status: 0x34, // m=1, x=1, I=1
            emulation: true,
            waiting: false,
            stopped: false,
            cycles: 0,
        }
    }

    /// Reset to emulation mode and jump through the reset vector.
    pub fn reset<B: CpuBus>(&mut self, bus: &mut B) {
        *self = Self::new();
        self.pc = self.read_word_bank0(bus, VEC_RESET);
    }

    /// True while WAI or STP is holding the CPU.
    pub fn is_halted(&self) -> bool {
        self.waiting || self.stopped
    }

    /// Take a non-maskable interrupt now. Returns the cycles used.
    pub fn nmi<B: CpuBus>(&mut self, bus: &mut B) -> u32 {
        if self.stopped {
            return 0;
        }
        let start = self.cycles;
        self.waiting = false;
        self.interrupt(bus, VEC_NMI_NATIVE, VEC_NMI_EMULATION, false);
        (self.cycles - start) as u32
    }

    /// Execute a single instruction and return cycles consumed
    pub fn step<B: CpuBus>(&mut self, bus: &mut B) -> u32 {
        if self.is_halted() {
            self.idle(1);
            return 1;
        }
        let start = self.cycles;
        let opcode = self.fetch_byte(bus);
        log(LogCategory::Cpu, LogLevel::Trace, || {
            format!(
                "{:02X}:{:04X} op={:02X} C={:04X} X={:04X} Y={:04X} S={:04X} P={:02X}{}",
                self.pbr,
                self.pc.wrapping_sub(1),
                opcode,
                self.c,
                self.x,
                self.y,
                self.s,
                self.status,
                if self.emulation { " E" } else { "" }
            )
        });
        self.execute(bus, opcode);
        (self.cycles - start) as u32
    }

    fn execute<B: CpuBus>(&mut self, bus: &mut B, opcode: u8) {
        use Mode::*;

        match opcode {
            // Interrupts and halts
            0x00 => {
                self.fetch_byte(bus); // signature
                self.interrupt(bus, VEC_BRK_NATIVE, VEC_BRK_EMULATION, true);
            }
            0x02 => {
                self.fetch_byte(bus);
                log(LogCategory::Cpu, LogLevel::Debug, || {
                    format!("COP at {:02X}:{:04X}", self.pbr, self.pc.wrapping_sub(2))
                });
                self.interrupt(bus, VEC_COP_NATIVE, VEC_COP_EMULATION, true);
            }
            0x40 => {
                self.idle(2);
                let p = self.pop_byte(bus);
                self.set_status(p);
                self.pc = self.pop_word(bus);
                if !self.emulation {
                    self.pbr = self.pop_byte(bus);
                }
            }
            0xCB => {
                self.idle(2);
                self.waiting = true;
            }
            0xDB => {
                self.idle(2);
                self.stopped = true;
                log(LogCategory::Cpu, LogLevel::Warn, || {
                    format!("STP at {:02X}:{:04X}", self.pbr, self.pc.wrapping_sub(1))
                });
            }
            0xEA => self.idle(1),
            0x42 => {
                self.fetch_byte(bus); // WDM
            }

            // Flags
            0x18 => self.flag_op(FLAG_CARRY, false),
            0x38 => self.flag_op(FLAG_CARRY, true),
            0x58 => self.flag_op(FLAG_IRQ_DISABLE, false),
            0x78 => self.flag_op(FLAG_IRQ_DISABLE, true),
            0xB8 => self.flag_op(FLAG_OVERFLOW, false),
            0xD8 => self.flag_op(FLAG_DECIMAL, false),
            0xF8 => self.flag_op(FLAG_DECIMAL, true),
            0xC2 => {
                let mask = self.fetch_byte(bus);
                self.idle(1);
                self.set_status(self.status & !mask);
            }
            0xE2 => {
                let mask = self.fetch_byte(bus);
                self.idle(1);
                self.set_status(self.status | mask);
            }
            0xFB => self.xce(),

            // Transfers
            0xAA => {
                self.set_x(self.c);
                self.transfer_flags_x(self.x);
            }
            0xA8 => {
                self.set_y(self.c);
                self.transfer_flags_x(self.y);
            }
            0x8A => {
                self.set_a(self.x);
                self.transfer_flags_a();
            }
            0x98 => {
                self.set_a(self.y);
                self.transfer_flags_a();
            }
            0x9B => {
                self.set_y(self.x);
                self.transfer_flags_x(self.y);
            }
            0xBB => {
                self.set_x(self.y);
                self.transfer_flags_x(self.x);
            }
            0x9A => {
                self.set_s(self.x);
                self.idle(1);
            }
            0xBA => {
                self.set_x(self.s);
                self.transfer_flags_x(self.x);
            }
            0x1B => {
                self.set_s(self.c);
                self.idle(1);
            }
            0x3B => {
                self.c = self.s;
                self.set_nz(self.c, true);
                self.idle(1);
            }
            0x5B => {
                self.d = self.c;
                self.set_nz(self.d, true);
                self.idle(1);
            }
            0x7B => {
                self.c = self.d;
                self.set_nz(self.c, true);
                self.idle(1);
            }
            0xEB => {
                self.c = self.c.swap_bytes();
                self.set_nz(self.c & 0xFF, false);
                self.idle(2);
            }

            // Index increment/decrement
            0xE8 => self.step_index_x(1),
            0xCA => self.step_index_x(0xFFFF),
            0xC8 => self.step_index_y(1),
            0x88 => self.step_index_y(0xFFFF),

            // Read-modify-write
            0x0A => self.modify(bus, None, Self::asl),
            0x06 => self.modify(bus, Some(Direct), Self::asl),
            0x16 => self.modify(bus, Some(DirectX), Self::asl),
            0x0E => self.modify(bus, Some(Absolute), Self::asl),
            0x1E => self.modify(bus, Some(AbsoluteX), Self::asl),
            0x2A => self.modify(bus, None, Self::rol),
            0x26 => self.modify(bus, Some(Direct), Self::rol),
            0x36 => self.modify(bus, Some(DirectX), Self::rol),
            0x2E => self.modify(bus, Some(Absolute), Self::rol),
            0x3E => self.modify(bus, Some(AbsoluteX), Self::rol),
            0x4A => self.modify(bus, None, Self::lsr),
            0x46 => self.modify(bus, Some(Direct), Self::lsr),
            0x56 => self.modify(bus, Some(DirectX), Self::lsr),
            0x4E => self.modify(bus, Some(Absolute), Self::lsr),
            0x5E => self.modify(bus, Some(AbsoluteX), Self::lsr),
            0x6A => self.modify(bus, None, Self::ror),
            0x66 => self.modify(bus, Some(Direct), Self::ror),
            0x76 => self.modify(bus, Some(DirectX), Self::ror),
            0x6E => self.modify(bus, Some(Absolute), Self::ror),
            0x7E => self.modify(bus, Some(AbsoluteX), Self::ror),
            0x1A => self.modify(bus, None, Self::inc),
            0xE6 => self.modify(bus, Some(Direct), Self::inc),
            0xF6 => self.modify(bus, Some(DirectX), Self::inc),
            0xEE => self.modify(bus, Some(Absolute), Self::inc),
            0xFE => self.modify(bus, Some(AbsoluteX), Self::inc),
            0x3A => self.modify(bus, None, Self::dec),
            0xC6 => self.modify(bus, Some(Direct), Self::dec),
            0xD6 => self.modify(bus, Some(DirectX), Self::dec),
            0xCE => self.modify(bus, Some(Absolute), Self::dec),
            0xDE => self.modify(bus, Some(AbsoluteX), Self::dec),
            0x04 => self.modify(bus, Some(Direct), Self::tsb),
            0x0C => self.modify(bus, Some(Absolute), Self::tsb),
            0x14 => self.modify(bus, Some(Direct), Self::trb),
            0x1C => self.modify(bus, Some(Absolute), Self::trb),

            // Index loads, stores and compares
            0xA2 => self.ldx(bus, Immediate),
            0xA6 => self.ldx(bus, Direct),
            0xB6 => self.ldx(bus, DirectY),
            0xAE => self.ldx(bus, Absolute),
            0xBE => self.ldx(bus, AbsoluteY),
            0xA0 => self.ldy(bus, Immediate),
            0xA4 => self.ldy(bus, Direct),
            0xB4 => self.ldy(bus, DirectX),
            0xAC => self.ldy(bus, Absolute),
            0xBC => self.ldy(bus, AbsoluteX),
            0x86 => self.store(bus, Direct, self.x, !self.is_8bit_xy()),
            0x96 => self.store(bus, DirectY, self.x, !self.is_8bit_xy()),
            0x8E => self.store(bus, Absolute, self.x, !self.is_8bit_xy()),
            0x84 => self.store(bus, Direct, self.y, !self.is_8bit_xy()),
            0x94 => self.store(bus, DirectX, self.y, !self.is_8bit_xy()),
            0x8C => self.store(bus, Absolute, self.y, !self.is_8bit_xy()),
            0x64 => self.store(bus, Direct, 0, !self.is_8bit_a()),
            0x74 => self.store(bus, DirectX, 0, !self.is_8bit_a()),
            0x9C => self.store(bus, Absolute, 0, !self.is_8bit_a()),
            0x9E => self.store(bus, AbsoluteX, 0, !self.is_8bit_a()),
            0xE0 => self.compare_index(bus, Immediate, self.x),
            0xE4 => self.compare_index(bus, Direct, self.x),
            0xEC => self.compare_index(bus, Absolute, self.x),
            0xC0 => self.compare_index(bus, Immediate, self.y),
            0xC4 => self.compare_index(bus, Direct, self.y),
            0xCC => self.compare_index(bus, Absolute, self.y),

            // BIT
            0x89 => self.bit(bus, Immediate),
            0x24 => self.bit(bus, Direct),
            0x34 => self.bit(bus, DirectX),
            0x2C => self.bit(bus, Absolute),
            0x3C => self.bit(bus, AbsoluteX),

            // Branches
            0x10 => self.branch(bus, self.status & FLAG_NEGATIVE == 0),
            0x30 => self.branch(bus, self.status & FLAG_NEGATIVE != 0),
            0x50 => self.branch(bus, self.status & FLAG_OVERFLOW == 0),
            0x70 => self.branch(bus, self.status & FLAG_OVERFLOW != 0),
            0x90 => self.branch(bus, self.status & FLAG_CARRY == 0),
            0xB0 => self.branch(bus, self.status & FLAG_CARRY != 0),
            0xD0 => self.branch(bus, self.status & FLAG_ZERO == 0),
            0xF0 => self.branch(bus, self.status & FLAG_ZERO != 0),
            0x80 => self.branch(bus, true),
            0x82 => {
                let offset = self.fetch_word(bus);
                self.idle(1);
                self.pc = self.pc.wrapping_add(offset);
            }

            // Jumps and calls
            0x4C => self.pc = self.fetch_word(bus),
            0x5C => {
                let target = self.fetch_long(bus);
                self.jump_long(target);
            }
            0x6C => {
                let ptr = self.fetch_word(bus);
                self.pc = self.read_word_bank0(bus, ptr as u32);
            }
            0x7C => {
                let ptr = self.fetch_word(bus).wrapping_add(self.x);
                self.idle(1);
                self.pc = self.read_word_in_bank(bus, self.pbr, ptr);
            }
            0xDC => {
                let ptr = self.fetch_word(bus);
                let target = self.read_long_bank0(bus, ptr as u32);
                self.jump_long(target);
            }
            0x20 => {
                let target = self.fetch_word(bus);
                self.idle(1);
                self.push_word(bus, self.pc.wrapping_sub(1));
                self.pc = target;
            }
            0xFC => {
                let ptr = self.fetch_word(bus).wrapping_add(self.x);
                self.push_word(bus, self.pc.wrapping_sub(1));
                self.idle(1);
                self.pc = self.read_word_in_bank(bus, self.pbr, ptr);
            }
            0x22 => {
                let target = self.fetch_long(bus);
                self.push_byte(bus, self.pbr);
                self.idle(1);
                self.push_word(bus, self.pc.wrapping_sub(1));
                self.jump_long(target);
            }
            0x60 => {
                self.idle(2);
                self.pc = self.pop_word(bus).wrapping_add(1);
                self.idle(1);
            }
            0x6B => {
                self.idle(2);
                self.pc = self.pop_word(bus).wrapping_add(1);
                self.pbr = self.pop_byte(bus);
            }

            // Stack
            0x48 => {
                self.idle(1);
                self.push_data(bus, self.c, !self.is_8bit_a());
            }
            0x68 => {
                self.idle(2);
                let wide = !self.is_8bit_a();
                let val = self.pop_data(bus, wide);
                self.set_a(val);
                self.set_nz(val, wide);
            }
            0xDA => {
                self.idle(1);
                self.push_data(bus, self.x, !self.is_8bit_xy());
            }
            0xFA => {
                self.idle(2);
                let wide = !self.is_8bit_xy();
                let val = self.pop_data(bus, wide);
                self.set_x(val);
                self.set_nz(val, wide);
            }
            0x5A => {
                self.idle(1);
                self.push_data(bus, self.y, !self.is_8bit_xy());
            }
            0x7A => {
                self.idle(2);
                let wide = !self.is_8bit_xy();
                let val = self.pop_data(bus, wide);
                self.set_y(val);
                self.set_nz(val, wide);
            }
            0x08 => {
                self.idle(1);
                self.push_byte(bus, self.status);
            }
            0x28 => {
                self.idle(2);
                let p = self.pop_byte(bus);
                self.set_status(p);
            }
            0x8B => {
                self.idle(1);
                self.push_byte(bus, self.dbr);
            }
            0xAB => {
                self.idle(2);
                self.dbr = self.pop_byte(bus);
                self.set_nz(self.dbr as u16, false);
            }
            0x0B => {
                self.idle(1);
                self.push_word(bus, self.d);
            }
            0x2B => {
                self.idle(2);
                self.d = self.pop_word(bus);
                self.set_nz(self.d, true);
            }
            0x4B => {
                self.idle(1);
                self.push_byte(bus, self.pbr);
            }
            0xF4 => {
                let val = self.fetch_word(bus);
                self.push_word(bus, val);
            }
            0xD4 => {
                let offset = self.fetch_byte(bus) as u16;
                let addr = self.direct(offset);
                let val = self.read_word_bank0(bus, addr);
                self.push_word(bus, val);
            }
            0x62 => {
                let offset = self.fetch_word(bus);
                self.idle(1);
                self.push_word(bus, self.pc.wrapping_add(offset));
            }

            // Block moves
            0x54 => self.block_move(bus, 1),
            0x44 => self.block_move(bus, 0xFFFF),

            // Everything left is ORA/AND/EOR/ADC/STA/LDA/CMP/SBC
            _ => self.alu(bus, opcode >> 5, alu_mode(opcode)),
        }
    }

    fn alu<B: CpuBus>(&mut self, bus: &mut B, op: u8, mode: Mode) {
        let wide = !self.is_8bit_a();
        if op == 4 {
            self.store(bus, mode, self.c, wide);
            return;
        }
        let val = self.operand(bus, mode, wide);
        match op {
            0 => self.logic(self.get_a() | val),
            1 => self.logic(self.get_a() & val),
            2 => self.logic(self.get_a() ^ val),
            3 => self.adc(val),
            5 => {
                self.set_a(val);
                self.set_nz(val, wide);
            }
            6 => self.compare(self.get_a(), val, wide),
            _ => self.sbc(val),
        }
    }

    fn logic(&mut self, result: u16) {
        self.set_a(result);
        self.set_nz(result, !self.is_8bit_a());
    }

    /// ADC operation, binary or BCD depending on the D flag
    fn adc(&mut self, val: u16) {
        let wide = !self.is_8bit_a();
        let (mask, sign, digits) = width_params(wide);
        let a = self.get_a() as u32;
        let val = val as u32;
        let carry = (self.status & FLAG_CARRY) as u32;

        let sum = if self.status & FLAG_DECIMAL != 0 {
            let mut result = 0u32;
            let mut c = carry;
            for shift in (0..digits).map(|i| i * 4) {
                let mut digit = ((a >> shift) & 0xF) + ((val >> shift) & 0xF) + c;
                c = 0;
                if digit > 9 {
                    digit += 6;
                    c = 1;
                }
                result |= (digit & 0xF) << shift;
            }
            result | (c << (digits * 4))
        } else {
            a + val + carry
        };

        let result = sum & mask;
        self.set_flag(FLAG_CARRY, sum > mask);
        self.set_flag(FLAG_OVERFLOW, (!(a ^ val) & (a ^ result)) & sign != 0);
        self.set_a(result as u16);
        self.set_nz(result as u16, wide);
    }

    /// SBC operation, binary or BCD depending on the D flag
    fn sbc(&mut self, val: u16) {
        let wide = !self.is_8bit_a();
        let (mask, sign, digits) = width_params(wide);
        let a = self.get_a() as u32;
        let val = val as u32;
        let borrow_in = 1 - (self.status & FLAG_CARRY) as u32;
        let binary = a.wrapping_sub(val).wrapping_sub(borrow_in);

        let (result, borrow_out) = if self.status & FLAG_DECIMAL != 0 {
            let mut result = 0u32;
            let mut borrow = borrow_in as i32;
            for shift in (0..digits).map(|i| i * 4) {
                let mut digit = ((a >> shift) & 0xF) as i32 - ((val >> shift) & 0xF) as i32 - borrow;
                borrow = 0;
                if digit < 0 {
                    digit += 10;
                    borrow = 1;
                }
                result |= (digit as u32 & 0xF) << shift;
            }
            (result, borrow != 0)
        } else {
            (binary & mask, binary > mask)
        };

        self.set_flag(FLAG_CARRY, !borrow_out);
        self.set_flag(
            FLAG_OVERFLOW,
            ((a ^ val) & (a ^ (binary & mask))) & sign != 0,
        );
        self.set_a(result as u16);
        self.set_nz(result as u16, wide);
    }

    fn compare(&mut self, reg: u16, val: u16, wide: bool) {
        let mask = if wide { 0xFFFF } else { 0xFF };
        let (reg, val) = (reg & mask, val & mask);
        self.set_flag(FLAG_CARRY, reg >= val);
        self.set_nz(reg.wrapping_sub(val) & mask, wide);
    }

    fn compare_index<B: CpuBus>(&mut self, bus: &mut B, mode: Mode, reg: u16) {
        let wide = !self.is_8bit_xy();
        let val = self.operand(bus, mode, wide);
        self.compare(reg, val, wide);
    }

    fn ldx<B: CpuBus>(&mut self, bus: &mut B, mode: Mode) {
        let wide = !self.is_8bit_xy();
        let val = self.operand(bus, mode, wide);
        self.set_x(val);
        self.set_nz(val, wide);
    }

    fn ldy<B: CpuBus>(&mut self, bus: &mut B, mode: Mode) {
        let wide = !self.is_8bit_xy();
        let val = self.operand(bus, mode, wide);
        self.set_y(val);
        self.set_nz(val, wide);
    }

    fn store<B: CpuBus>(&mut self, bus: &mut B, mode: Mode, val: u16, wide: bool) {
        let addr = self.address(bus, mode);
        self.write_data(bus, addr, val, wide);
    }

    fn bit<B: CpuBus>(&mut self, bus: &mut B, mode: Mode) {
        let wide = !self.is_8bit_a();
        let val = self.operand(bus, mode, wide);
        self.set_flag(FLAG_ZERO, self.get_a() & val == 0);
        if mode != Mode::Immediate {
            let sign = if wide { 0x8000 } else { 0x80 };
            self.set_flag(FLAG_NEGATIVE, val & sign != 0);
            self.set_flag(FLAG_OVERFLOW, val & (sign >> 1) != 0);
        }
    }

    fn modify<B: CpuBus>(&mut self, bus: &mut B, mode: Option<Mode>, op: ModifyOp) {
        let wide = !self.is_8bit_a();
        match mode {
            None => {
                let result = op(self, self.get_a(), wide);
                self.set_a(result);
                self.idle(1);
            }
            Some(mode) => {
                let addr = self.address(bus, mode);
                let val = self.read_data(bus, addr, wide);
                self.idle(1);
                let result = op(self, val, wide);
                self.write_data(bus, addr, result, wide);
            }
        }
    }

    fn asl(&mut self, val: u16, wide: bool) -> u16 {
        let (mask, sign, _) = width_params(wide);
        self.set_flag(FLAG_CARRY, val as u32 & sign != 0);
        let result = ((val as u32) << 1 & mask) as u16;
        self.set_nz(result, wide);
        result
    }

    fn lsr(&mut self, val: u16, wide: bool) -> u16 {
        self.set_flag(FLAG_CARRY, val & 1 != 0);
        let result = val >> 1;
        self.set_nz(result, wide);
        result
    }

    fn rol(&mut self, val: u16, wide: bool) -> u16 {
        let (mask, sign, _) = width_params(wide);
        let carry_in = (self.status & FLAG_CARRY) as u32;
        self.set_flag(FLAG_CARRY, val as u32 & sign != 0);
        let result = (((val as u32) << 1 | carry_in) & mask) as u16;
        self.set_nz(result, wide);
        result
    }

    fn ror(&mut self, val: u16, wide: bool) -> u16 {
        let (_, sign, _) = width_params(wide);
        let carry_in = if self.status & FLAG_CARRY != 0 { sign as u16 } else { 0 };
        self.set_flag(FLAG_CARRY, val & 1 != 0);
        let result = (val >> 1) | carry_in;
        self.set_nz(result, wide);
        result
    }

    fn inc(&mut self, val: u16, wide: bool) -> u16 {
        let (mask, _, _) = width_params(wide);
        let result = (val.wrapping_add(1) as u32 & mask) as u16;
        self.set_nz(result, wide);
        result
    }

    fn dec(&mut self, val: u16, wide: bool) -> u16 {
        let (mask, _, _) = width_params(wide);
        let result = (val.wrapping_sub(1) as u32 & mask) as u16;
        self.set_nz(result, wide);
        result
    }

    fn tsb(&mut self, val: u16, _wide: bool) -> u16 {
        let a = self.get_a();
        self.set_flag(FLAG_ZERO, a & val == 0);
        val | a
    }

    fn trb(&mut self, val: u16, _wide: bool) -> u16 {
        let a = self.get_a();
        self.set_flag(FLAG_ZERO, a & val == 0);
        val & !a
    }

    fn branch<B: CpuBus>(&mut self, bus: &mut B, condition: bool) {
        let offset = self.fetch_byte(bus) as i8;
        if condition {
            self.idle(1);
            self.pc = self.pc.wrapping_add(offset as i16 as u16);
        }
    }

    /// One MVN/MVP iteration; the opcode re-executes until C wraps to $FFFF.
    fn block_move<B: CpuBus>(&mut self, bus: &mut B, delta: u16) {
        let dest = self.fetch_byte(bus);
        let src = self.fetch_byte(bus);
        self.dbr = dest;
        let val = self.read(bus, (src as u32) << 16 | self.x as u32);
        self.write(bus, (dest as u32) << 16 | self.y as u32, val);
        self.idle(2);
        self.set_x(self.x.wrapping_add(delta));
        self.set_y(self.y.wrapping_add(delta));
        self.c = self.c.wrapping_sub(1);
        if self.c != 0xFFFF {
            self.pc = self.pc.wrapping_sub(3);
        }
    }

    fn interrupt<B: CpuBus>(&mut self, bus: &mut B, native: u32, emulation: u32, brk: bool) {
        self.idle(2);
        let vector = if self.emulation {
            self.push_word(bus, self.pc);
            let p = if brk {
                self.status | FLAG_BREAK
            } else {
                self.status & !FLAG_BREAK
            };
            self.push_byte(bus, p);
            emulation
        } else {
            self.push_byte(bus, self.pbr);
            self.push_word(bus, self.pc);
            self.push_byte(bus, self.status);
            native
        };
        self.status = (self.status | FLAG_IRQ_DISABLE) & !FLAG_DECIMAL;
        self.pbr = 0;
        self.pc = self.read_word_bank0(bus, vector);
    }

    fn xce(&mut self) {
        let carry = self.status & FLAG_CARRY != 0;
        self.set_flag(FLAG_CARRY, self.emulation);
        self.emulation = carry;
        if self.emulation {
            self.status |= FLAG_MEMORY | FLAG_INDEX;
            self.x &= 0xFF;
            self.y &= 0xFF;
            self.s = 0x0100 | (self.s & 0xFF);
        }
        self.idle(1);
    }

    fn flag_op(&mut self, flag: u8, on: bool) {
        self.set_flag(flag, on);
        self.idle(1);
    }

    /// Write P, honoring emulation mode and the x flag.
    fn set_status(&mut self, val: u8) {
        self.status = if self.emulation {
            val | FLAG_MEMORY | FLAG_INDEX
        } else {
            val
        };
        if self.status & FLAG_INDEX != 0 {
            self.x &= 0xFF;
            self.y &= 0xFF;
        }
    }

    fn set_s(&mut self, val: u16) {
        self.s = if self.emulation {
            0x0100 | (val & 0xFF)
        } else {
            val
        };
    }

    fn transfer_flags_x(&mut self, val: u16) {
        self.set_nz(val, !self.is_8bit_xy());
        self.idle(1);
    }

    fn transfer_flags_a(&mut self) {
        self.set_nz(self.get_a(), !self.is_8bit_a());
        self.idle(1);
    }

    fn step_index_x(&mut self, delta: u16) {
        self.set_x(self.x.wrapping_add(delta));
        self.transfer_flags_x(self.x);
    }

    fn step_index_y(&mut self, delta: u16) {
        self.set_y(self.y.wrapping_add(delta));
        self.transfer_flags_x(self.y);
    }

    fn jump_long(&mut self, target: u32) {
        self.pbr = (target >> 16) as u8;
        self.pc = target as u16;
    }

    // Addressing

    /// Fetch an operand of the given width, immediate or from memory.
    fn operand<B: CpuBus>(&mut self, bus: &mut B, mode: Mode, wide: bool) -> u16 {
        if mode == Mode::Immediate {
            return if wide {
                self.fetch_word(bus)
            } else {
                self.fetch_byte(bus) as u16
            };
        }
        let addr = self.address(bus, mode);
        self.read_data(bus, addr, wide)
    }

    /// Effective 24-bit address. `Immediate` only occurs for operands and
    /// is handled by `operand`; it resolves to the operand byte here.
    fn address<B: CpuBus>(&mut self, bus: &mut B, mode: Mode) -> u32 {
        match mode {
            Mode::Immediate => {
                let addr = self.program_address();
                self.pc = self.pc.wrapping_add(1);
                addr
            }
            Mode::Direct => {
                let offset = self.fetch_byte(bus) as u16;
                self.direct(offset)
            }
            Mode::DirectX => {
                let offset = self.fetch_byte(bus) as u16;
                self.idle(1);
                self.direct(offset.wrapping_add(self.x))
            }
            Mode::DirectY => {
                let offset = self.fetch_byte(bus) as u16;
                self.idle(1);
                self.direct(offset.wrapping_add(self.y))
            }
            Mode::DirectIndirect => {
                let offset = self.fetch_byte(bus) as u16;
                let ptr = self.direct(offset);
                let target = self.read_word_bank0(bus, ptr);
                self.data_address(target)
            }
            Mode::DirectIndirectLong => {
                let offset = self.fetch_byte(bus) as u16;
                let ptr = self.direct(offset);
                self.read_long_bank0(bus, ptr)
            }
            Mode::DirectXIndirect => {
                let offset = self.fetch_byte(bus) as u16;
                self.idle(1);
                let ptr = self.direct(offset.wrapping_add(self.x));
                let target = self.read_word_bank0(bus, ptr);
                self.data_address(target)
            }
            Mode::DirectIndirectY => {
                let offset = self.fetch_byte(bus) as u16;
                let ptr = self.direct(offset);
                let target = self.read_word_bank0(bus, ptr);
                (self.data_address(target) + self.y as u32) & ADDR_MASK
            }
            Mode::DirectIndirectLongY => {
                let offset = self.fetch_byte(bus) as u16;
                let ptr = self.direct(offset);
                (self.read_long_bank0(bus, ptr) + self.y as u32) & ADDR_MASK
            }
            Mode::Absolute => {
                let addr = self.fetch_word(bus);
                self.data_address(addr)
            }
            Mode::AbsoluteX => {
                let addr = self.fetch_word(bus);
                (self.data_address(addr) + self.x as u32) & ADDR_MASK
            }
            Mode::AbsoluteY => {
                let addr = self.fetch_word(bus);
                (self.data_address(addr) + self.y as u32) & ADDR_MASK
            }
            Mode::Long => self.fetch_long(bus),
            Mode::LongX => (self.fetch_long(bus) + self.x as u32) & ADDR_MASK,
            Mode::StackRelative => {
                let offset = self.fetch_byte(bus) as u16;
                self.idle(1);
                self.s.wrapping_add(offset) as u32
            }
            Mode::StackRelativeIndirectY => {
                let offset = self.fetch_byte(bus) as u16;
                self.idle(1);
                let ptr = self.s.wrapping_add(offset) as u32;
                let target = self.read_word_bank0(bus, ptr);
                self.idle(1);
                (self.data_address(target) + self.y as u32) & ADDR_MASK
            }
        }
    }

    /// Direct page address in bank 0; a misaligned D costs a cycle.
    fn direct(&mut self, offset: u16) -> u32 {
        if self.d & 0xFF != 0 {
            self.idle(1);
        }
        self.d.wrapping_add(offset) as u32
    }

    fn data_address(&self, addr: u16) -> u32 {
        (self.dbr as u32) << 16 | addr as u32
    }

    fn program_address(&self) -> u32 {
        (self.pbr as u32) << 16 | self.pc as u32
    }

    // Bus access

    fn idle(&mut self, cycles: u32) {
        self.cycles += cycles as u64;
    }

    #[inline]
    fn read<B: CpuBus>(&mut self, bus: &mut B, addr: u32) -> u8 {
        self.cycles += 1;
        bus.read(addr & ADDR_MASK)
    }

    #[inline]
    fn write<B: CpuBus>(&mut self, bus: &mut B, addr: u32, val: u8) {
        self.cycles += 1;
        bus.write(addr & ADDR_MASK, val);
    }

    fn read_data<B: CpuBus>(&mut self, bus: &mut B, addr: u32, wide: bool) -> u16 {
        let lo = self.read(bus, addr) as u16;
        if !wide {
            return lo;
        }
        let hi = self.read(bus, addr + 1) as u16;
        (hi << 8) | lo
    }

    fn write_data<B: CpuBus>(&mut self, bus: &mut B, addr: u32, val: u16, wide: bool) {
        self.write(bus, addr, val as u8);
        if wide {
            self.write(bus, addr + 1, (val >> 8) as u8);
        }
    }

    /// 16-bit read that wraps within bank 0.
    fn read_word_bank0<B: CpuBus>(&mut self, bus: &mut B, addr: u32) -> u16 {
        self.read_word_in_bank(bus, 0, addr as u16)
    }

    fn read_word_in_bank<B: CpuBus>(&mut self, bus: &mut B, bank: u8, addr: u16) -> u16 {
        let base = (bank as u32) << 16;
        let lo = self.read(bus, base | addr as u32) as u16;
        let hi = self.read(bus, base | addr.wrapping_add(1) as u32) as u16;
        (hi << 8) | lo
    }

    fn read_long_bank0<B: CpuBus>(&mut self, bus: &mut B, addr: u32) -> u32 {
        let word = self.read_word_bank0(bus, addr) as u32;
        let bank = self.read(bus, (addr as u16).wrapping_add(2) as u32) as u32;
        bank << 16 | word
    }

    fn fetch_byte<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        let addr = self.program_address();
        self.pc = self.pc.wrapping_add(1);
        self.read(bus, addr)
    }

    fn fetch_word<B: CpuBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.fetch_byte(bus) as u16;
        let hi = self.fetch_byte(bus) as u16;
        (hi << 8) | lo
    }

    fn fetch_long<B: CpuBus>(&mut self, bus: &mut B) -> u32 {
        let word = self.fetch_word(bus) as u32;
        let bank = self.fetch_byte(bus) as u32;
        bank << 16 | word
    }

    // Stack

    fn push_byte<B: CpuBus>(&mut self, bus: &mut B, val: u8) {
        self.write(bus, self.s as u32, val);
        self.set_s(self.s.wrapping_sub(1));
    }

    fn pop_byte<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        self.set_s(self.s.wrapping_add(1));
        self.read(bus, self.s as u32)
    }

    fn push_word<B: CpuBus>(&mut self, bus: &mut B, val: u16) {
        self.push_byte(bus, (val >> 8) as u8);
        self.push_byte(bus, val as u8);
    }

    fn pop_word<B: CpuBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.pop_byte(bus) as u16;
        let hi = self.pop_byte(bus) as u16;
        (hi << 8) | lo
    }

    fn push_data<B: CpuBus>(&mut self, bus: &mut B, val: u16, wide: bool) {
        if wide {
            self.push_word(bus, val);
        } else {
            self.push_byte(bus, val as u8);
        }
    }

    fn pop_data<B: CpuBus>(&mut self, bus: &mut B, wide: bool) -> u16 {
        if wide {
            self.pop_word(bus)
        } else {
            self.pop_byte(bus) as u16
        }
    }

    // Registers

    /// Check if accumulator is in 8-bit mode
    pub fn is_8bit_a(&self) -> bool {
        self.emulation || (self.status & FLAG_MEMORY) != 0
    }

    /// Check if index registers are in 8-bit mode
    pub fn is_8bit_xy(&self) -> bool {
        self.emulation || (self.status & FLAG_INDEX) != 0
    }

    /// Accumulator at the current width
    pub fn get_a(&self) -> u16 {
        if self.is_8bit_a() {
            self.c & 0xFF
        } else {
            self.c
        }
    }

    /// Set the accumulator; in 8-bit mode the hidden B byte is kept.
    pub fn set_a(&mut self, val: u16) {
        if self.is_8bit_a() {
            self.c = (self.c & 0xFF00) | (val & 0xFF);
        } else {
            self.c = val;
        }
    }

    pub fn set_x(&mut self, val: u16) {
        self.x = if self.is_8bit_xy() { val & 0xFF } else { val };
    }

    pub fn set_y(&mut self, val: u16) {
        self.y = if self.is_8bit_xy() { val & 0xFF } else { val };
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.status |= flag;
        } else {
            self.status &= !flag;
        }
    }

    fn set_nz(&mut self, val: u16, wide: bool) {
        let (zero, negative) = if wide {
            (val == 0, val & 0x8000 != 0)
        } else {
            (val & 0xFF == 0, val & 0x80 != 0)
        };
        self.set_flag(FLAG_ZERO, zero);
        self.set_flag(FLAG_NEGATIVE, negative);
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

/// (value mask, sign bit, BCD digits) for an 8- or 16-bit operation.
fn width_params(wide: bool) -> (u32, u32, u32) {
    if wide {
        (0xFFFF, 0x8000, 4)
    } else {
        (0xFF, 0x80, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat 16 MiB address space with the reset vector pointing at $8000.
    struct FlatBus {
        data: Vec<u8>,
    }

    impl FlatBus {
        fn with_program(program: &[u8]) -> Self {
            let mut data = vec![0; 0x100_0000];
            data[0x8000..0x8000 + program.len()].copy_from_slice(program);
            data[0xFFFC] = 0x00;
            data[0xFFFD] = 0x80;
            Self { data }
        }
    }

    impl CpuBus for FlatBus {
        fn read(&mut self, addr: u32) -> u8 {
            self.data[addr as usize]
        }

        fn write(&mut self, addr: u32, val: u8) {
            self.data[addr as usize] = val;
        }
    }

    fn run(program: &[u8], instructions: usize) -> (Cpu, FlatBus) {
        let mut bus = FlatBus::with_program(program);
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        for _ in 0..instructions {
            cpu.step(&mut bus);
        }
        (cpu, bus)
    }

    /// CLC; XCE; REP #$30: native mode with 16-bit A and X/Y.
    const NATIVE16: [u8; 4] = [0x18, 0xFB, 0xC2, 0x30];

    fn native16(rest: &[u8]) -> Vec<u8> {
        let mut program = NATIVE16.to_vec();
        program.extend_from_slice(rest);
        program
    }

    #[test]
    fn test_reset() {
        let (cpu, _) = run(&[], 0);
        assert_eq!(cpu.pc, 0x8000);
        assert!(cpu.emulation);
        assert_eq!(cpu.s, 0x01FF);
        assert!(cpu.is_8bit_a() && cpu.is_8bit_xy());
    }

    #[test]
    fn test_lda_immediate_8bit() {
        let (cpu, _) = run(&[0xA9, 0x80], 1);
        assert_eq!(cpu.get_a(), 0x80);
        assert_ne!(cpu.status & FLAG_NEGATIVE, 0);
        assert_eq!(cpu.status & FLAG_ZERO, 0);
    }

    #[test]
    fn test_lda_immediate_16bit() {
        let (cpu, _) = run(&native16(&[0xA9, 0x34, 0x12]), 4);
        assert!(!cpu.emulation);
        assert_eq!(cpu.c, 0x1234);
        assert_eq!(cpu.pc, 0x8007);
    }

    #[test]
    fn test_xce_back_to_emulation_clears_index_high() {
        // native16; LDX #$1234; SEC; XCE
        let (cpu, _) = run(&native16(&[0xA2, 0x34, 0x12, 0x38, 0xFB]), 6);
        assert!(cpu.emulation);
        assert_eq!(cpu.x, 0x34);
        assert_eq!(cpu.s & 0xFF00, 0x0100);
    }

    #[test]
    fn test_sep_truncates_index_registers() {
        // native16; LDY #$ABCD; SEP #$10
        let (cpu, _) = run(&native16(&[0xA0, 0xCD, 0xAB, 0xE2, 0x10]), 5);
        assert_eq!(cpu.y, 0xCD);
        assert!(cpu.is_8bit_xy());
    }

    #[test]
    fn test_adc_binary_sets_carry_and_overflow() {
        // CLC; LDA #$7F; ADC #$01
        let (cpu, _) = run(&[0x18, 0xA9, 0x7F, 0x69, 0x01], 3);
        assert_eq!(cpu.get_a(), 0x80);
        assert_ne!(cpu.status & FLAG_OVERFLOW, 0);
        assert_eq!(cpu.status & FLAG_CARRY, 0);

        // SEC; LDA #$FF; ADC #$00
        let (cpu, _) = run(&[0x38, 0xA9, 0xFF, 0x69, 0x00], 3);
        assert_eq!(cpu.get_a(), 0x00);
        assert_ne!(cpu.status & FLAG_CARRY, 0);
        assert_ne!(cpu.status & FLAG_ZERO, 0);
    }

    #[test]
    fn test_adc_decimal() {
        // SED; CLC; LDA #$19; ADC #$01
        let (cpu, _) = run(&[0xF8, 0x18, 0xA9, 0x19, 0x69, 0x01], 4);
        assert_eq!(cpu.get_a(), 0x20);
        // SED; CLC; LDA #$99; ADC #$01
        let (cpu, _) = run(&[0xF8, 0x18, 0xA9, 0x99, 0x69, 0x01], 4);
        assert_eq!(cpu.get_a(), 0x00);
        assert_ne!(cpu.status & FLAG_CARRY, 0);
    }

    #[test]
    fn test_adc_decimal_16bit() {
        // native16; SED; LDA #$1999; ADC #$0001
        let (cpu, _) = run(&native16(&[0xF8, 0xA9, 0x99, 0x19, 0x69, 0x01, 0x00]), 6);
        assert_eq!(cpu.c, 0x2000);
        assert_eq!(cpu.status & FLAG_CARRY, 0);
    }

    #[test]
    fn test_sbc_binary_and_decimal() {
        // SEC; LDA #$10; SBC #$20
        let (cpu, _) = run(&[0x38, 0xA9, 0x10, 0xE9, 0x20], 3);
        assert_eq!(cpu.get_a(), 0xF0);
        assert_eq!(cpu.status & FLAG_CARRY, 0);

        // SED; SEC; LDA #$20; SBC #$01
        let (cpu, _) = run(&[0xF8, 0x38, 0xA9, 0x20, 0xE9, 0x01], 4);
        assert_eq!(cpu.get_a(), 0x19);
        assert_ne!(cpu.status & FLAG_CARRY, 0);

        // SED; SEC; LDA #$00; SBC #$01
        let (cpu, _) = run(&[0xF8, 0x38, 0xA9, 0x00, 0xE9, 0x01], 4);
        assert_eq!(cpu.get_a(), 0x99);
        assert_eq!(cpu.status & FLAG_CARRY, 0);
    }

    #[test]
    fn test_cmp_sets_carry_when_greater_or_equal() {
        // LDA #$40; CMP #$40
        let (cpu, _) = run(&[0xA9, 0x40, 0xC9, 0x40], 2);
        assert_ne!(cpu.status & FLAG_CARRY, 0);
        assert_ne!(cpu.status & FLAG_ZERO, 0);
        // LDA #$40; CMP #$41
        let (cpu, _) = run(&[0xA9, 0x40, 0xC9, 0x41], 2);
        assert_eq!(cpu.status & FLAG_CARRY, 0);
        assert_ne!(cpu.status & FLAG_NEGATIVE, 0);
    }

    #[test]
    fn test_store_and_indexed_load() {
        // LDA #$5A; STA $0200; LDX #$01; LDA $01FF,X
        let (cpu, bus) = run(&[0xA9, 0x5A, 0x8D, 0x00, 0x02, 0xA2, 0x01, 0xBD, 0xFF, 0x01], 4);
        assert_eq!(bus.data[0x0200], 0x5A);
        assert_eq!(cpu.get_a(), 0x5A);
    }

    #[test]
    fn test_long_and_indirect_long_addressing() {
        // LDA #$77; STA $7E1234 (long); LDA #$34 STA $10; LDA #$12 STA $11; LDA #$7E STA $12;
        // LDA #$00; LDA [$10]
        let program = [
            0xA9, 0x77, 0x8F, 0x34, 0x12, 0x7E, 0xA9, 0x34, 0x85, 0x10, 0xA9, 0x12, 0x85, 0x11,
            0xA9, 0x7E, 0x85, 0x12, 0xA9, 0x00, 0xA7, 0x10,
        ];
        let (cpu, bus) = run(&program, 10);
        assert_eq!(bus.data[0x7E1234], 0x77);
        assert_eq!(cpu.get_a(), 0x77);
    }

    #[test]
    fn test_rmw_shift_and_inc() {
        // LDA #$81; STA $20; ASL $20; INC $20
        let (cpu, bus) = run(&[0xA9, 0x81, 0x85, 0x20, 0x06, 0x20, 0xE6, 0x20], 4);
        assert_eq!(bus.data[0x20], 0x03);
        assert_ne!(cpu.status & FLAG_CARRY, 0);
    }

    #[test]
    fn test_rotate_through_carry() {
        // SEC; LDA #$01; ROR A; ROL A
        let (cpu, _) = run(&[0x38, 0xA9, 0x01, 0x6A], 3);
        assert_eq!(cpu.get_a(), 0x80);
        assert_ne!(cpu.status & FLAG_CARRY, 0);
        let (cpu, _) = run(&[0x38, 0xA9, 0x01, 0x6A, 0x2A], 4);
        assert_eq!(cpu.get_a(), 0x01);
        assert_ne!(cpu.status & FLAG_CARRY, 0);
    }

    #[test]
    fn test_tsb_trb() {
        // LDA #$0F; STA $30; LDA #$F1; TSB $30; TRB $30
        let (cpu, bus) = run(&[0xA9, 0x0F, 0x85, 0x30, 0xA9, 0xF1, 0x04, 0x30], 4);
        assert_eq!(bus.data[0x30], 0xFF);
        assert_eq!(cpu.status & FLAG_ZERO, 0);
        let (_, bus) = run(&[0xA9, 0x0F, 0x85, 0x30, 0xA9, 0xF1, 0x04, 0x30, 0x14, 0x30], 5);
        assert_eq!(bus.data[0x30], 0x0E);
    }

    #[test]
    fn test_branches() {
        // LDA #$00; BEQ +2; LDA #$01; NOP
        let (cpu, _) = run(&[0xA9, 0x00, 0xF0, 0x02, 0xA9, 0x01, 0xEA], 3);
        assert_eq!(cpu.get_a(), 0x00);
        assert_eq!(cpu.pc, 0x8007);
        // BRA -2 loops on itself
        let (cpu, _) = run(&[0x80, 0xFE], 5);
        assert_eq!(cpu.pc, 0x8000);
        // BRL +3
        let (cpu, _) = run(&[0x82, 0x03, 0x00], 1);
        assert_eq!(cpu.pc, 0x8006);
    }

    #[test]
    fn test_jsr_rts_and_jsl_rtl() {
        let mut program = vec![0x20, 0x10, 0x80, 0xEA]; // JSR $8010; NOP
        program.resize(0x10, 0xEA);
        program.push(0x60); // $8010: RTS
        let (cpu, _) = run(&program, 2);
        assert_eq!(cpu.pc, 0x8003);
        assert_eq!(cpu.s, 0x01FF);

        let mut bus = FlatBus::with_program(&[0x22, 0x00, 0x90, 0x01, 0xEA]); // JSL $019000
        bus.data[0x019000] = 0x6B; // RTL
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        cpu.step(&mut bus);
        assert_eq!((cpu.pbr, cpu.pc), (0x01, 0x9000));
        cpu.step(&mut bus);
        assert_eq!((cpu.pbr, cpu.pc), (0x00, 0x8004));
    }

    #[test]
    fn test_push_pull_16bit() {
        // native16; LDA #$BEEF; PHA; LDA #$0000; PLA
        let (cpu, _) = run(&native16(&[0xA9, 0xEF, 0xBE, 0x48, 0xA9, 0x00, 0x00, 0x68]), 7);
        assert_eq!(cpu.c, 0xBEEF);
        assert_eq!(cpu.s, 0x01FF);
    }

    #[test]
    fn test_pea_pld_tcd() {
        // native16; PEA $1234; PLD
        let (cpu, _) = run(&native16(&[0xF4, 0x34, 0x12, 0x2B]), 5);
        assert_eq!(cpu.d, 0x1234);
        // native16; LDA #$0300; TCD; LDA #$55; STA $10 (-> $0310)
        let (_, bus) = run(&native16(&[0xA9, 0x00, 0x03, 0x5B, 0xA9, 0x55, 0x00, 0x85, 0x10]), 7);
        assert_eq!(bus.data[0x0310], 0x55);
    }

    #[test]
    fn test_xba_swaps_accumulator_bytes() {
        // native16; LDA #$12AB; XBA
        let (cpu, _) = run(&native16(&[0xA9, 0xAB, 0x12, 0xEB]), 5);
        assert_eq!(cpu.c, 0xAB12);
        assert_eq!(cpu.status & FLAG_NEGATIVE, 0);
    }

    #[test]
    fn test_block_move_mvn() {
        // native16; LDA #$0002 (3 bytes); LDX #$1000; LDY #$2000; MVN $7E,$7E
        let program = native16(&[
            0xA9, 0x02, 0x00, 0xA2, 0x00, 0x10, 0xA0, 0x00, 0x20, 0x54, 0x7E, 0x7E,
        ]);
        let mut bus = FlatBus::with_program(&program);
        bus.data[0x7E1000..0x7E1003].copy_from_slice(&[1, 2, 3]);
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        for _ in 0..(3 + 3 + 3) {
            cpu.step(&mut bus);
        }
        assert_eq!(&bus.data[0x7E2000..0x7E2003], &[1, 2, 3]);
        assert_eq!(cpu.c, 0xFFFF);
        assert_eq!(cpu.x, 0x1003);
        assert_eq!(cpu.dbr, 0x7E);
        assert_eq!(cpu.pc, 0x8010);
    }

    #[test]
    fn test_brk_native_vector_and_rti() {
        let mut bus = FlatBus::with_program(&native16(&[0x00, 0xFF, 0xEA]));
        bus.data[0xFFE6] = 0x00;
        bus.data[0xFFE7] = 0x90;
        bus.data[0x9000] = 0x40; // RTI
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        for _ in 0..4 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.pc, 0x9000);
        assert_ne!(cpu.status & FLAG_IRQ_DISABLE, 0);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x8006);
        assert_eq!(cpu.status & FLAG_MEMORY, 0);
    }

    #[test]
    fn test_wai_halts_until_nmi() {
        let mut bus = FlatBus::with_program(&[0xCB, 0xEA]);
        bus.data[0xFFFA] = 0x00;
        bus.data[0xFFFB] = 0xA0;
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        cpu.step(&mut bus);
        assert!(cpu.is_halted());
        assert_eq!(cpu.step(&mut bus), 1);
        assert_eq!(cpu.pc, 0x8001);

        assert!(cpu.nmi(&mut bus) > 0);
        assert!(!cpu.is_halted());
        assert_eq!(cpu.pc, 0xA000);
        // Emulation-mode NMI pushes PC then P with the break bit clear.
        assert_eq!(bus.data[0x01FF], 0x80);
        assert_eq!(bus.data[0x01FE], 0x01);
        assert_eq!(bus.data[0x01FD] & FLAG_BREAK, 0);
    }

    #[test]
    fn test_stp_ignores_nmi() {
        let (mut cpu, mut bus) = run(&[0xDB], 1);
        assert!(cpu.stopped);
        assert_eq!(cpu.nmi(&mut bus), 0);
        assert!(cpu.stopped);
    }

    #[test]
    fn test_emulation_mode_forces_8bit() {
        // REP #$30 in emulation mode leaves m and x set
        let (cpu, _) = run(&[0xC2, 0x30], 1);
        assert!(cpu.is_8bit_a());
        assert!(cpu.is_8bit_xy());
    }

    #[test]
    fn test_transfers() {
        // native16; LDA #$8000; TAX; TXY; TYA
        let (cpu, _) = run(&native16(&[0xA9, 0x00, 0x80, 0xAA, 0x9B]), 6);
        assert_eq!(cpu.x, 0x8000);
        assert_eq!(cpu.y, 0x8000);
        assert_ne!(cpu.status & FLAG_NEGATIVE, 0);
    }

    #[test]
    fn test_bit_immediate_only_sets_zero() {
        // LDA #$0F; CLV; BIT #$F0
        let (cpu, _) = run(&[0xA9, 0x0F, 0xB8, 0x89, 0xF0], 3);
        assert_ne!(cpu.status & FLAG_ZERO, 0);
        assert_eq!(cpu.status & FLAG_NEGATIVE, 0);
        assert_eq!(cpu.status & FLAG_OVERFLOW, 0);
    }

    #[test]
    fn test_cycles_are_counted() {
        let (cpu, _) = run(&[0xEA, 0xA9, 0x01], 2);
        // Reset vector read (2) + NOP (2) + LDA # (2)
        assert_eq!(cpu.cycles, 6);
    }
}
