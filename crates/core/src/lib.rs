//! Core primitives and traits for frame-stepped emulation engines.

pub mod controller;
pub mod error;
pub mod input;
pub mod logging;
pub mod savestate;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub mod types {
    use serde::{Deserialize, Serialize};

    /// Standard output width in pixels.
    pub const SCREEN_WIDTH: u32 = 256;
    /// Standard output height in pixels.
    pub const SCREEN_HEIGHT: u32 = 224;
    /// Widest output (hi-res modes).
    pub const MAX_SCREEN_WIDTH: u32 = 512;
    /// Tallest output (interlaced overscan).
    pub const MAX_SCREEN_HEIGHT: u32 = 478;
    pub const BYTES_PER_PIXEL: usize = 4;

    /// RGBA8888 framebuffer, row-major, no padding between rows.
    ///
    /// Dimensions change with the graphics mode, so consumers should read
    /// `width`/`height` on every frame instead of assuming 256x224.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u8>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
            }
        }

        /// Change dimensions, reusing the existing allocation where possible.
        pub fn resize(&mut self, width: u32, height: u32) {
            self.width = width;
            self.height = height;
            self.pixels
                .resize(width as usize * height as usize * BYTES_PER_PIXEL, 0);
        }

        pub fn fill(&mut self, rgba: [u8; 4]) {
            for px in self.pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
                px.copy_from_slice(&rgba);
            }
        }

        /// Bytes per row.
        pub fn stride(&self) -> usize {
            self.width as usize * BYTES_PER_PIXEL
        }

        pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
            if x >= self.width || y >= self.height {
                return None;
            }
            let i = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
            let px = self.pixels.get(i..i + BYTES_PER_PIXEL)?;
            Some([px[0], px[1], px[2], px[3]])
        }

        pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
            if x >= self.width || y >= self.height {
                return;
            }
            let i = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
            if let Some(px) = self.pixels.get_mut(i..i + BYTES_PER_PIXEL) {
                px.copy_from_slice(&rgba);
            }
        }

        pub fn row(&self, y: u32) -> Option<&[u8]> {
            if y >= self.height {
                return None;
            }
            let start = y as usize * self.stride();
            self.pixels.get(start..start + self.stride())
        }

        pub fn as_rgba(&self) -> &[u8] {
            &self.pixels
        }
    }

    impl Default for Frame {
        fn default() -> Self {
            Self::new(SCREEN_WIDTH, SCREEN_HEIGHT)
        }
    }
}

pub use controller::{AsyncController, ControllerConfig, ControllerHandle, FrameView, ObserverHandle};
pub use error::{ControllerError, EngineError, InputError, StateError};
pub use input::{normalize, Action, Button, InputVector, BUTTON_COUNT};
pub use session::Session;

use serde::{Deserialize, Serialize};
use types::Frame;

/// Size of the work RAM exposed through [`Engine::memory`].
pub const RAM_SIZE: usize = 0x20000;

/// Lifecycle of an engine: `Unloaded -> Loaded -> Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineStatus {
    /// No ROM installed; stepping is refused.
    Unloaded,
    /// ROM installed, no frame stepped since load or reset.
    Loaded,
    /// At least one frame has been stepped.
    Running,
}

impl EngineStatus {
    pub fn is_ready(self) -> bool {
        self != EngineStatus::Unloaded
    }
}

/// The capability set every consumer of an emulation engine relies on.
///
/// Operations on an `Unloaded` engine fail with [`EngineError::NotReady`].
pub trait Engine {
    /// Parse and install a ROM image. A malformed image is reported as
    /// [`EngineError::RomLoad`] and leaves any previously loaded machine
    /// untouched.
    fn load_rom(&mut self, rom: &[u8]) -> Result<(), EngineError>;

    /// Return to the post-load power-on state without re-reading the ROM.
    fn reset(&mut self) -> Result<(), EngineError>;

    fn status(&self) -> EngineStatus;

    /// Advance exactly one frame with `input` held for its whole duration.
    ///
    /// With `render == false` the picture is not composed; the previous
    /// framebuffer contents are stale until the next rendered frame.
    fn step(&mut self, input: InputVector, render: bool) -> Result<&Frame, EngineError>;

    /// Run `count` frames with `input` held, composing the picture only on
    /// the last one (and only if `render`). Returns `count`; any error
    /// aborts the whole batch.
    fn tick(&mut self, count: u32, render: bool, input: InputVector) -> Result<u32, EngineError> {
        if !self.status().is_ready() {
            return Err(EngineError::NotReady);
        }
        for i in 0..count {
            let last = i + 1 == count;
            self.step(input, render && last)?;
        }
        Ok(count)
    }

    /// The most recently composed frame.
    fn screen(&self) -> &Frame;

    /// Live view of work RAM ([`RAM_SIZE`] bytes).
    fn memory(&self) -> &[u8];

    /// Mutable work RAM, for debugging and cheats.
    fn memory_mut(&mut self) -> &mut [u8];

    /// Serialize the complete machine state into a versioned blob.
    fn save_state(&self) -> Result<Vec<u8>, EngineError>;

    /// Replace the machine state from a blob produced by `save_state`.
    /// A rejected blob leaves the current state untouched.
    fn load_state(&mut self, data: &[u8]) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;

    #[test]
    fn frame_initialization() {
        let f = types::Frame::new(10, 10);
        assert_eq!(f.pixels.len(), 400);
        assert_eq!(f.width, 10);
        assert_eq!(f.height, 10);
        assert_eq!(f.stride(), 40);
    }

    #[test]
    fn frame_pixel_access() {
        let mut f = types::Frame::new(4, 2);
        f.set_pixel(3, 1, [1, 2, 3, 4]);
        assert_eq!(f.pixel(3, 1), Some([1, 2, 3, 4]));
        assert_eq!(f.pixel(4, 1), None);
        assert_eq!(&f.row(1).unwrap()[12..16], &[1, 2, 3, 4]);
        assert!(f.row(2).is_none());
    }

    #[test]
    fn frame_resize_and_fill() {
        let mut f = types::Frame::default();
        assert_eq!((f.width, f.height), (256, 224));
        f.resize(512, 478);
        assert_eq!(f.pixels.len(), 512 * 478 * 4);
        f.fill([9, 8, 7, 255]);
        assert!(f.pixels.chunks_exact(4).all(|p| p == [9, 8, 7, 255]));
    }

    #[test]
    fn status_readiness() {
        assert!(!EngineStatus::Unloaded.is_ready());
        assert!(EngineStatus::Loaded.is_ready());
        assert!(EngineStatus::Running.is_ready());
    }

    #[test]
    fn default_tick_runs_every_frame() {
        let mut engine = ScriptedEngine::new();
        let right = InputVector::empty().with(Button::Right);
        assert_eq!(engine.tick(7, false, right).unwrap(), 7);
        assert_eq!(engine.steps(), 7);
        assert_eq!(engine.status(), EngineStatus::Running);
        // Only the last frame is rendered.
        assert_eq!(engine.rendered_frames(), 0);
        engine.tick(3, true, right).unwrap();
        assert_eq!(engine.rendered_frames(), 1);
    }

    #[test]
    fn default_tick_zero_count_is_noop() {
        let mut engine = ScriptedEngine::new();
        assert_eq!(engine.tick(0, true, InputVector::empty()).unwrap(), 0);
        assert_eq!(engine.steps(), 0);
        assert_eq!(engine.status(), EngineStatus::Loaded);
    }

    #[test]
    fn default_tick_refuses_unloaded_engine() {
        let mut engine = ScriptedEngine::unloaded();
        assert_eq!(
            engine.tick(1, false, InputVector::empty()),
            Err(EngineError::NotReady)
        );
    }
}
