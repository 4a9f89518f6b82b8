//! Deterministic stand-in engine for exercising sessions and the controller
//! without a real ROM.
//!
//! Every step writes the step number to `ram[0..2]` and the applied input
//! bits to `ram[2..4]` (little-endian), and appends the input to a history
//! so tests can check exactly what was applied on each frame.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::savestate;
use crate::types::Frame;
use crate::{Engine, EngineError, EngineStatus, InputVector, StateError, RAM_SIZE};

const MAGIC: [u8; 4] = *b"TEST";
const VERSION: u32 = 1;
const FRAME_SIZE: u32 = 8;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    steps: u64,
    ram: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    status: EngineStatus,
    steps: u64,
    rendered: u64,
    ram: Vec<u8>,
    frame: Frame,
    history: Vec<InputVector>,
    step_limit: Option<u64>,
    step_delay: Option<Duration>,
}

impl ScriptedEngine {
    /// A loaded engine with zeroed RAM.
    pub fn new() -> Self {
        Self {
            status: EngineStatus::Loaded,
            ..Self::unloaded()
        }
    }

    pub fn unloaded() -> Self {
        Self {
            status: EngineStatus::Unloaded,
            steps: 0,
            rendered: 0,
            ram: vec![0; RAM_SIZE],
            frame: Frame::new(FRAME_SIZE, FRAME_SIZE),
            history: Vec::new(),
            step_limit: None,
            step_delay: None,
        }
    }

    /// Fail with [`EngineError::Fault`] once `limit` steps have run.
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = Some(limit);
        self
    }

    /// Sleep inside every step, to simulate a slow machine.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn rendered_frames(&self) -> u64 {
        self.rendered
    }

    /// Inputs applied so far, one per step.
    pub fn history(&self) -> &[InputVector] {
        &self.history
    }

    fn render(&mut self) {
        let shade = (self.steps & 0xFF) as u8;
        self.frame.fill([shade, shade, shade, 0xFF]);
        self.rendered += 1;
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for ScriptedEngine {
    fn load_rom(&mut self, rom: &[u8]) -> Result<(), EngineError> {
        if rom.is_empty() {
            return Err(EngineError::RomLoad("empty image".to_string()));
        }
        *self = Self {
            step_limit: self.step_limit,
            step_delay: self.step_delay,
            ..Self::new()
        };
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        if !self.status.is_ready() {
            return Err(EngineError::NotReady);
        }
        self.steps = 0;
        self.ram.fill(0);
        self.status = EngineStatus::Loaded;
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        self.status
    }

    fn step(&mut self, input: InputVector, render: bool) -> Result<&Frame, EngineError> {
        if !self.status.is_ready() {
            return Err(EngineError::NotReady);
        }
        if self.step_limit.is_some_and(|limit| self.steps >= limit) {
            return Err(EngineError::Fault(format!(
                "step limit of {} reached",
                self.steps
            )));
        }
        if let Some(delay) = self.step_delay {
            thread::sleep(delay);
        }

        self.steps += 1;
        self.ram[0..2].copy_from_slice(&(self.steps as u16).to_le_bytes());
        self.ram[2..4].copy_from_slice(&input.bits().to_le_bytes());
        self.history.push(input);
        self.status = EngineStatus::Running;
        if render {
            self.render();
        }
        Ok(&self.frame)
    }

    fn screen(&self) -> &Frame {
        &self.frame
    }

    fn memory(&self) -> &[u8] {
        &self.ram
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    fn save_state(&self) -> Result<Vec<u8>, EngineError> {
        if !self.status.is_ready() {
            return Err(EngineError::NotReady);
        }
        let payload = serde_json::to_vec(&Snapshot {
            steps: self.steps,
            ram: self.ram.clone(),
        })
        .map_err(|e| EngineError::Fault(e.to_string()))?;
        Ok(savestate::encode(MAGIC, VERSION, &payload))
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), EngineError> {
        if !self.status.is_ready() {
            return Err(EngineError::NotReady);
        }
        let payload = savestate::decode(MAGIC, VERSION, data)?;
        let snapshot: Snapshot =
            serde_json::from_slice(payload).map_err(|e| StateError::Payload(e.to_string()))?;
        if snapshot.ram.len() != RAM_SIZE {
            return Err(StateError::Inconsistent(format!(
                "RAM is {} bytes, expected {}",
                snapshot.ram.len(),
                RAM_SIZE
            ))
            .into());
        }
        self.steps = snapshot.steps;
        self.ram = snapshot.ram;
        Ok(())
    }
}
