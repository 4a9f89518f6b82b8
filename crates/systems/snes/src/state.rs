//! Binary save states.
//!
//! The payload is a bincode image of [`MachineState`] wrapped in the shared
//! header from [`framestep_core::savestate`] (magic `FSNS`). Loading
//! validates everything before touching the running machine.

use serde::{Deserialize, Serialize};

use crate::bus::{DmaChannel, IoRegisters, DMA_CHANNELS};
use crate::cpu::Cpu;
use crate::ppu::Ppu;
use crate::SnesEngine;
use framestep_core::logging::{log, LogCategory, LogLevel};
use framestep_core::savestate;
use framestep_core::types::{Frame, MAX_SCREEN_HEIGHT, MAX_SCREEN_WIDTH};
use framestep_core::{EngineError, StateError, RAM_SIZE};

pub const STATE_MAGIC: [u8; 4] = *b"FSNS";
pub const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MachineState {
    /// CRC-32 of the ROM the state was taken from
    rom_crc: u32,
    cpu: Cpu,
    wram: Vec<u8>,
    io: IoRegisters,
    dma: [DmaChannel; DMA_CHANNELS],
    mdr: u8,
    ppu: Ppu,
    sram: Vec<u8>,
    frame: Frame,
    cycle_carry: u64,
    frame_number: u64,
}

impl MachineState {
    fn validate(&self, sram_size: usize) -> Result<(), StateError> {
        if self.wram.len() != RAM_SIZE {
            return Err(StateError::Inconsistent(format!(
                "WRAM is {} bytes, expected {}",
                self.wram.len(),
                RAM_SIZE
            )));
        }
        if self.sram.len() != sram_size {
            return Err(StateError::Inconsistent(format!(
                "SRAM is {} bytes, cartridge has {}",
                self.sram.len(),
                sram_size
            )));
        }
        if self.io.wram_port as usize >= RAM_SIZE {
            return Err(StateError::Inconsistent(format!(
                "WRAM port address {:#X} out of range",
                self.io.wram_port
            )));
        }
        self.ppu.validate().map_err(StateError::Inconsistent)?;

        let frame = &self.frame;
        let expected = frame.width as usize * frame.height as usize * 4;
        if frame.width > MAX_SCREEN_WIDTH
            || frame.height > MAX_SCREEN_HEIGHT
            || frame.pixels.len() != expected
        {
            return Err(StateError::Inconsistent(format!(
                "framebuffer {}x{} with {} bytes",
                frame.width,
                frame.height,
                frame.pixels.len()
            )));
        }
        Ok(())
    }
}

impl SnesEngine {
    pub(crate) fn save_machine_state(&self) -> Result<Vec<u8>, EngineError> {
        self.ensure_ready()?;
        let cart = self.bus.cart.as_ref().ok_or(EngineError::NotReady)?;

        let state = MachineState {
            rom_crc: cart.crc32(),
            cpu: self.cpu.clone(),
            wram: self.bus.wram.clone(),
            io: self.bus.io.clone(),
            dma: self.bus.dma,
            mdr: self.bus.mdr,
            ppu: self.bus.ppu.clone(),
            sram: cart.sram().to_vec(),
            frame: self.frame.clone(),
            cycle_carry: self.cycle_carry,
            frame_number: self.frame_number,
        };
        let payload =
            bincode::serialize(&state).map_err(|e| EngineError::Fault(e.to_string()))?;
        log(LogCategory::State, LogLevel::Debug, || {
            format!(
                "saved state at frame {} ({} bytes)",
                self.frame_number,
                payload.len()
            )
        });
        Ok(savestate::encode(STATE_MAGIC, STATE_VERSION, &payload))
    }

    pub(crate) fn load_machine_state(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let (rom_crc, sram_size) = match self.bus.cart.as_ref() {
            Some(cart) => (cart.crc32(), cart.sram().len()),
            None => return Err(EngineError::NotReady),
        };

        let result = decode_state(data, rom_crc, sram_size);
        let state = match result {
            Ok(state) => state,
            Err(e) => {
                log(LogCategory::State, LogLevel::Warn, || {
                    format!("rejected state: {}", e)
                });
                return Err(e.into());
            }
        };

        self.cpu = state.cpu;
        self.bus.wram = state.wram;
        self.bus.io = state.io;
        self.bus.dma = state.dma;
        self.bus.mdr = state.mdr;
        self.bus.ppu = state.ppu;
        if let Some(cart) = self.bus.cart.as_mut() {
            cart.restore_sram(&state.sram);
        }
        self.frame = state.frame;
        self.cycle_carry = state.cycle_carry;
        self.frame_number = state.frame_number;

        log(LogCategory::State, LogLevel::Debug, || {
            format!("loaded state at frame {}", self.frame_number)
        });
        Ok(())
    }
}

fn decode_state(data: &[u8], rom_crc: u32, sram_size: usize) -> Result<MachineState, StateError> {
    let payload = savestate::decode(STATE_MAGIC, STATE_VERSION, data)?;
    let state: MachineState =
        bincode::deserialize(payload).map_err(|e| StateError::Payload(e.to_string()))?;
    if state.rom_crc != rom_crc {
        return Err(StateError::RomMismatch);
    }
    state.validate(sram_size)?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBus;
    use crate::testing;
    use framestep_core::{Button, Engine, EngineStatus, InputVector};

    fn running(frames: u32) -> SnesEngine {
        let mut engine = SnesEngine::new();
        engine.load_rom(&testing::demo_rom()).unwrap();
        engine.tick(frames, true, InputVector::empty()).unwrap();
        engine
    }

    #[test]
    fn test_state_header() {
        let engine = running(2);
        let blob = engine.save_state().unwrap();
        assert_eq!(&blob[..4], b"FSNS");
        assert_eq!(
            savestate::peek_header(&blob),
            Some((STATE_MAGIC, STATE_VERSION))
        );
    }

    #[test]
    fn test_round_trip_resumes_identically() {
        let mut engine = running(5);
        let blob = engine.save_state().unwrap();

        let mut expected = Vec::new();
        for _ in 0..4 {
            let frame = engine.step(Button::Right.into(), false).unwrap().clone();
            expected.push((frame, engine.memory().to_vec()));
        }

        engine.load_state(&blob).unwrap();
        assert_eq!(engine.frame_number(), 5);
        for (frame, ram) in expected {
            let got = engine.step(Button::Right.into(), false).unwrap().clone();
            assert_eq!(got, frame);
            assert_eq!(engine.memory(), &ram[..]);
        }
    }

    #[test]
    fn test_save_is_stable() {
        let engine = running(3);
        assert_eq!(engine.save_state().unwrap(), engine.save_state().unwrap());
    }

    #[test]
    fn test_load_into_fresh_engine() {
        let source = running(6);
        let blob = source.save_state().unwrap();

        let mut target = SnesEngine::new();
        target.load_rom(&testing::demo_rom()).unwrap();
        target.load_state(&blob).unwrap();
        assert_eq!(target.memory(), source.memory());
        assert_eq!(target.screen(), source.screen());
        assert_eq!(target.cpu(), source.cpu());
        // Status is a lifecycle property of the engine, not of the state
        assert_eq!(target.status(), EngineStatus::Loaded);
    }

    #[test]
    fn test_rejected_blob_leaves_machine_untouched() {
        let mut engine = running(4);
        let mut blob = engine.save_state().unwrap();
        let ram = engine.memory().to_vec();
        let cpu = engine.cpu().clone();

        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert_eq!(
            engine.load_state(&blob),
            Err(EngineError::StateLoad(StateError::ChecksumMismatch))
        );
        assert!(matches!(
            engine.load_state(&blob[..10]),
            Err(EngineError::StateLoad(StateError::TooShort { .. }))
        ));
        assert_eq!(engine.memory(), &ram[..]);
        assert_eq!(engine.cpu(), &cpu);
        assert_eq!(engine.frame_number(), 4);
    }

    /// Re-encode `blob` with a valid header after editing its payload.
    fn tampered(blob: &[u8], edit: impl FnOnce(&mut MachineState)) -> Vec<u8> {
        let payload = savestate::decode(STATE_MAGIC, STATE_VERSION, blob).unwrap();
        let mut state: MachineState = bincode::deserialize(payload).unwrap();
        edit(&mut state);
        savestate::encode(STATE_MAGIC, STATE_VERSION, &bincode::serialize(&state).unwrap())
    }

    #[test]
    fn test_out_of_range_wram_port_is_rejected() {
        let mut engine = running(3);
        let ram = engine.memory().to_vec();
        let blob = tampered(&engine.save_state().unwrap(), |state| {
            state.io.wram_port = 0x30000;
        });
        assert!(matches!(
            engine.load_state(&blob),
            Err(EngineError::StateLoad(StateError::Inconsistent(_)))
        ));
        assert_eq!(engine.bus.io.wram_port & !0x1FFFF, 0);
        assert_eq!(engine.memory(), &ram[..]);

        // WMDATA still addresses WRAM after the rejected load
        engine.bus.read(0x002180);
        engine.step(InputVector::empty(), true).unwrap();
    }

    #[test]
    fn test_bad_ppu_registers_are_rejected() {
        let mut engine = running(2);
        let blob = tampered(&engine.save_state().unwrap(), |state| {
            state.ppu = Ppu::with_scroll(0xFFFF, 0);
        });
        assert!(matches!(
            engine.load_state(&blob),
            Err(EngineError::StateLoad(StateError::Inconsistent(_)))
        ));
        assert_eq!(engine.frame_number(), 2);
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        let mut engine = running(1);
        let blob = savestate::encode(STATE_MAGIC, STATE_VERSION, &[1, 2, 3]);
        assert!(matches!(
            engine.load_state(&blob),
            Err(EngineError::StateLoad(StateError::Payload(_)))
        ));
    }

    #[test]
    fn test_state_from_other_rom_is_rejected() {
        let source = running(2);
        let blob = source.save_state().unwrap();

        // Different program, different CRC
        let other = testing::lorom(&[0x78, 0xDB], 0x8000, 0);
        let mut engine = SnesEngine::new();
        engine.load_rom(&other).unwrap();
        assert_eq!(
            engine.load_state(&blob),
            Err(EngineError::StateLoad(StateError::RomMismatch))
        );
    }

    #[test]
    fn test_sram_is_saved() {
        // LDA #$5A; STA $700000 (long); STP
        let program = [0xA9, 0x5A, 0x8F, 0x00, 0x00, 0x70, 0xDB];
        let rom = testing::lorom(&program, 0x8000, 0x01);
        let mut engine = SnesEngine::new();
        engine.load_rom(&rom).unwrap();
        engine.tick(1, false, InputVector::empty()).unwrap();
        let blob = engine.save_state().unwrap();
        assert_eq!(engine.bus.cart.as_ref().unwrap().sram()[0], 0x5A);

        engine.reset().unwrap();
        assert_eq!(engine.bus.cart.as_ref().unwrap().sram()[0], 0x00);
        engine.load_state(&blob).unwrap();
        assert_eq!(engine.bus.cart.as_ref().unwrap().sram()[0], 0x5A);
    }
}
