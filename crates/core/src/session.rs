//! Per-session context around a single engine.
//!
//! A `Session` owns one engine and the caller-side frame counter. Each
//! connection, script or training worker gets its own session, so
//! tearing one down never affects another.

use std::fs;
use std::path::Path;

use crate::error::EngineError;
use crate::input::{normalize, Action, InputVector};
use crate::logging::{log, LogCategory, LogLevel};
use crate::types::Frame;
use crate::{AsyncController, ControllerConfig, Engine};

pub struct Session<E: Engine> {
    engine: E,
    frame_count: u64,
}

impl<E: Engine> Session<E> {
    /// Wrap an engine, loaded or not.
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            frame_count: 0,
        }
    }

    /// Wrap an engine and load `rom` into it.
    pub fn open(engine: E, rom: &[u8]) -> Result<Self, EngineError> {
        let mut session = Self::new(engine);
        session.load_rom(rom)?;
        Ok(session)
    }

    pub fn load_rom(&mut self, rom: &[u8]) -> Result<(), EngineError> {
        self.engine.load_rom(rom)?;
        self.frame_count = 0;
        log(LogCategory::State, LogLevel::Info, || {
            format!("loaded ROM image ({} bytes)", rom.len())
        });
        Ok(())
    }

    /// Read a ROM file and load it. I/O failures surface as
    /// [`EngineError::RomLoad`].
    pub fn load_rom_from_path(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        let rom = fs::read(path)
            .map_err(|e| EngineError::RomLoad(format!("{}: {}", path.display(), e)))?;
        self.load_rom(&rom)
    }

    /// Advance one rendered frame. `None` means no buttons held.
    pub fn step(&mut self, action: Option<&Action>) -> Result<&Frame, EngineError> {
        let input = normalize(action)?;
        self.step_input(input)
    }

    pub fn step_input(&mut self, input: InputVector) -> Result<&Frame, EngineError> {
        self.advance(input, true)
    }

    /// One [`Engine::step`], rendering only when asked.
    pub fn advance(&mut self, input: InputVector, render: bool) -> Result<&Frame, EngineError> {
        self.engine.step(input, render)?;
        self.frame_count += 1;
        Ok(self.engine.screen())
    }

    /// Run `count` frames holding `action`; see [`Engine::tick`].
    pub fn tick(
        &mut self,
        count: u32,
        render: bool,
        action: Option<&Action>,
    ) -> Result<u32, EngineError> {
        let input = normalize(action)?;
        let executed = self.engine.tick(count, render, input)?;
        self.frame_count += u64::from(executed);
        Ok(executed)
    }

    /// Back to power-on; the frame counter restarts at zero.
    pub fn reset(&mut self) -> Result<&Frame, EngineError> {
        self.engine.reset()?;
        self.frame_count = 0;
        Ok(self.engine.screen())
    }

    pub fn save_state(&self) -> Result<Vec<u8>, EngineError> {
        self.engine.save_state()
    }

    /// Restore machine state. The frame counter belongs to the session and
    /// is left as is.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.engine.load_state(data)
    }

    pub fn screen(&self) -> &Frame {
        self.engine.screen()
    }

    pub fn memory(&self) -> &[u8] {
        self.engine.memory()
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        self.engine.memory_mut()
    }

    /// One RAM byte, or `None` past the end.
    pub fn peek(&self, addr: usize) -> Option<u8> {
        self.engine.memory().get(addr).copied()
    }

    /// Little-endian word at `addr`.
    pub fn peek_u16(&self, addr: usize) -> Option<u16> {
        let bytes = self.engine.memory().get(addr..addr.checked_add(2)?)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Frames stepped since the last ROM load or reset.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }
}

impl<E: Engine + Send + 'static> Session<E> {
    /// Hand the engine to a background controller.
    pub fn into_controller(self, config: ControllerConfig) -> AsyncController<E> {
        AsyncController::with_config(self.engine, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Button;
    use crate::testing::ScriptedEngine;
    use crate::{EngineStatus, InputError};

    fn session() -> Session<ScriptedEngine> {
        Session::open(ScriptedEngine::unloaded(), &[0xFF]).unwrap()
    }

    #[test]
    fn open_rejects_bad_rom() {
        assert!(matches!(
            Session::open(ScriptedEngine::unloaded(), &[]),
            Err(EngineError::RomLoad(_))
        ));
    }

    #[test]
    fn missing_rom_file_is_a_load_error() {
        let mut s = Session::new(ScriptedEngine::unloaded());
        let err = s
            .load_rom_from_path("/nonexistent/framestep/rom.sfc")
            .unwrap_err();
        assert!(matches!(err, EngineError::RomLoad(msg) if msg.contains("rom.sfc")));
        assert_eq!(s.engine().status(), EngineStatus::Unloaded);
    }

    #[test]
    fn step_counts_frames_and_applies_action() {
        let mut s = session();
        let action = Action::from_pairs([("B", true), ("Right", true)]);
        s.step(Some(&action)).unwrap();
        s.step(None).unwrap();
        assert_eq!(s.frame_count(), 2);
        assert_eq!(
            s.engine().history(),
            &[
                InputVector::empty().with(Button::B).with(Button::Right),
                InputVector::empty()
            ]
        );
    }

    #[test]
    fn advance_renders_only_when_asked() {
        let mut s = session();
        s.advance(Button::Left.into(), false).unwrap();
        assert_eq!(s.engine().rendered_frames(), 0);
        s.advance(InputVector::empty(), true).unwrap();
        assert_eq!(s.engine().rendered_frames(), 1);
        assert_eq!(s.frame_count(), 2);
        assert_eq!(s.engine().steps(), 2);
        assert_eq!(s.engine().history()[0], InputVector::from(Button::Left));
    }

    #[test]
    fn invalid_action_does_not_step() {
        let mut s = session();
        let err = s.step(Some(&Action::Sequence(vec![true; 3]))).unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidInput(InputError::WrongLength {
                expected: 12,
                actual: 3
            })
        );
        assert_eq!(s.frame_count(), 0);
        assert_eq!(s.engine().steps(), 0);
    }

    #[test]
    fn tick_adds_count() {
        let mut s = session();
        assert_eq!(s.tick(30, false, None).unwrap(), 30);
        assert_eq!(s.frame_count(), 30);
        assert_eq!(s.tick(0, true, None).unwrap(), 0);
        assert_eq!(s.frame_count(), 30);
    }

    #[test]
    fn reset_zeroes_counter_but_load_state_keeps_it() {
        let mut s = session();
        s.tick(4, false, None).unwrap();
        let blob = s.save_state().unwrap();
        s.tick(6, false, None).unwrap();
        s.load_state(&blob).unwrap();
        assert_eq!(s.frame_count(), 10);
        assert_eq!(s.peek(0), Some(4));

        s.reset().unwrap();
        assert_eq!(s.frame_count(), 0);
    }

    #[test]
    fn peek_reads_live_ram() {
        let mut s = session();
        s.memory_mut()[0x0DBF] = 0x34;
        s.memory_mut()[0x0DC0] = 0x12;
        assert_eq!(s.peek(0x0DBF), Some(0x34));
        assert_eq!(s.peek_u16(0x0DBF), Some(0x1234));
        assert_eq!(s.peek(crate::RAM_SIZE), None);
        assert_eq!(s.peek_u16(crate::RAM_SIZE - 1), None);
        assert_eq!(s.peek_u16(usize::MAX), None);
    }

    #[test]
    fn unloaded_session_refuses_to_step() {
        let mut s = Session::new(ScriptedEngine::unloaded());
        assert_eq!(s.step(None).unwrap_err(), EngineError::NotReady);
        assert_eq!(s.frame_count(), 0);
    }

    #[test]
    fn session_hands_engine_to_controller() {
        let mut s = session();
        s.tick(2, false, None).unwrap();
        let mut ctrl = s.into_controller(ControllerConfig::default());
        ctrl.start(0.0).unwrap();
        ctrl.wait_for_frame(5, std::time::Duration::from_secs(5)).unwrap();
        let engine = ctrl.into_engine().unwrap();
        assert!(engine.steps() >= 7);
    }
}
