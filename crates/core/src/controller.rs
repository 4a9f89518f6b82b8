//! Background scheduling of an [`Engine`] on its own thread.
//!
//! While running, the engine lives on the `framestep-engine` thread and the
//! caller only talks to it through the lock-protected entry points of
//! [`ControllerHandle`]: speed, queued actions and observers. `stop` hands
//! the engine back.
//!
//! Each loop iteration:
//!
//! 1. takes this frame's input from the action queue (no input when empty)
//! 2. steps the engine once
//! 3. bumps the frame counter
//! 4. runs the observers that are due, isolating their failures
//! 5. waits for the next deadline
//!
//! ```no_run
//! use framestep_core::{AsyncController, Button, InputVector};
//! # fn demo<E: framestep_core::Engine + Send + 'static>(engine: E) -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctrl = AsyncController::new(engine);
//! ctrl.add_observer(10, |view| {
//!     let coins = view.memory[0x0DBF];
//!     println!("frame {}: {} coins", view.frame_number, coins);
//!     Ok(())
//! });
//! ctrl.queue_action(InputVector::from(Button::Right), 30);
//! ctrl.start(1.0)?;
//! // ...
//! ctrl.stop();
//! # Ok(()) }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, EngineError, InputError};
use crate::input::{Action, InputVector};
use crate::logging::{log, LogCategory, LogLevel};
use crate::types::Frame;
use crate::Engine;

/// Longest frame time the pacer will wait for; slower speeds are clamped.
const MAX_FRAME_TIME_SECS: f64 = 3600.0;

/// How often `wait_for_frame` polls the counter.
const WAIT_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Frames per second at speed 1.0.
    pub base_fps: f64,
    /// Upper bound on how long `stop` waits for the engine thread.
    pub stop_timeout_ms: u64,
    /// How many frames the loop may fall behind before the schedule is
    /// re-anchored to the current time instead of catching up.
    pub max_lag_frames: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_fps: 60.0,
            stop_timeout_ms: 2000,
            max_lag_frames: 3,
        }
    }
}

impl ControllerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Target time per frame at `speed`, or `None` when uncapped.
    pub fn frame_time(&self, speed: f64) -> Option<Duration> {
        let fps = self.base_fps * speed;
        if !(speed > 0.0 && fps > 0.0 && fps.is_finite()) {
            return None;
        }
        Duration::try_from_secs_f64((1.0 / fps).min(MAX_FRAME_TIME_SECS)).ok()
    }
}

/// What an observer sees after a completed step.
///
/// Everything is borrowed from the engine thread and reused for the next
/// frame; copy what you need to keep.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    /// Frames completed since `start`, including this one.
    pub frame_number: u64,
    /// Input that was held during this frame.
    pub input: InputVector,
    pub screen: &'a Frame,
    pub memory: &'a [u8],
}

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

type ObserverFn = Box<dyn FnMut(&FrameView<'_>) -> Result<(), ObserverError> + Send>;

/// Returned by `add_observer`; pass it to `remove_observer` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

struct Observer {
    id: u64,
    interval: u64,
    counter: u64,
    callback: ObserverFn,
}

impl Observer {
    /// Count one completed step and fire when the interval is reached.
    fn deliver(&mut self, view: &FrameView<'_>) {
        self.counter += 1;
        if self.counter < self.interval {
            return;
        }
        self.counter = 0;

        let id = self.id;
        let callback = &mut self.callback;
        match panic::catch_unwind(AssertUnwindSafe(|| callback(view))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log(LogCategory::Scheduler, LogLevel::Warn, || {
                format!("observer {} failed on frame {}: {}", id, view.frame_number, e)
            }),
            Err(payload) => log(LogCategory::Scheduler, LogLevel::Error, || {
                format!(
                    "observer {} panicked on frame {}: {}",
                    id,
                    view.frame_number,
                    panic_message(payload.as_ref())
                )
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Observers, plus bookkeeping for the batch currently being notified.
///
/// The batch is taken out of the lock while callbacks run, so a callback
/// may add or remove observers through a handle without deadlocking.
#[derive(Default)]
struct ObserverList {
    entries: Vec<Observer>,
    in_flight: Vec<u64>,
    cancelled: Vec<u64>,
}

impl ObserverList {
    fn len(&self) -> usize {
        self.entries.len() + self.in_flight.len() - self.cancelled.len()
    }

    fn remove(&mut self, id: u64) -> bool {
        if let Some(pos) = self.entries.iter().position(|o| o.id == id) {
            self.entries.remove(pos);
            return true;
        }
        if self.in_flight.contains(&id) && !self.cancelled.contains(&id) {
            self.cancelled.push(id);
            return true;
        }
        false
    }
}

fn notify_observers(observers: &Mutex<ObserverList>, view: &FrameView<'_>) {
    let mut batch = {
        let mut list = lock(observers);
        if list.entries.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut list.entries);
        list.in_flight = batch.iter().map(|o| o.id).collect();
        batch
    };

    for observer in batch.iter_mut() {
        observer.deliver(view);
    }

    let mut list = lock(observers);
    let cancelled = std::mem::take(&mut list.cancelled);
    batch.retain(|o| !cancelled.contains(&o.id));
    batch.append(&mut list.entries);
    list.entries = batch;
    list.in_flight.clear();
}

/// FIFO of `(input, frames)` entries plus the entry currently held.
#[derive(Debug, Default)]
struct ActionQueue {
    pending: VecDeque<(InputVector, u32)>,
    current: InputVector,
    remaining: u32,
}

impl ActionQueue {
    fn push(&mut self, input: InputVector, frames: u32) {
        if frames > 0 {
            self.pending.push_back((input, frames));
        }
    }

    /// Input for the next frame.
    fn next_input(&mut self) -> InputVector {
        if self.remaining == 0 {
            match self.pending.pop_front() {
                Some((input, frames)) => {
                    self.current = input;
                    self.remaining = frames;
                }
                None => self.current = InputVector::empty(),
            }
        }
        self.remaining = self.remaining.saturating_sub(1);
        self.current
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.current = InputVector::empty();
        self.remaining = 0;
    }

    /// Entries not yet fully consumed, including the held one.
    fn len(&self) -> usize {
        self.pending.len() + usize::from(self.remaining > 0)
    }
}

struct Shared {
    frame_count: AtomicU64,
    speed: Mutex<f64>,
    actions: Mutex<ActionQueue>,
    observers: Mutex<ObserverList>,
    next_observer_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe entry points into a running (or stopped) controller.
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<Shared>,
}

impl ControllerHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                frame_count: AtomicU64::new(0),
                speed: Mutex::new(1.0),
                actions: Mutex::new(ActionQueue::default()),
                observers: Mutex::new(ObserverList::default()),
                next_observer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Takes effect from the next frame. `speed <= 0` is uncapped.
    pub fn set_speed(&self, speed: f64) {
        *lock(&self.shared.speed) = speed;
        log(LogCategory::Scheduler, LogLevel::Debug, || {
            format!("speed set to {}", speed)
        });
    }

    pub fn speed(&self) -> f64 {
        *lock(&self.shared.speed)
    }

    /// Hold `input` for `frames` frames once everything queued before it
    /// has been consumed. Zero-frame actions are dropped.
    pub fn queue_action(&self, input: InputVector, frames: u32) {
        lock(&self.shared.actions).push(input, frames);
    }

    /// Normalize `action` and queue it.
    pub fn queue(&self, action: &Action, frames: u32) -> Result<(), InputError> {
        let input = action.normalize()?;
        self.queue_action(input, frames);
        Ok(())
    }

    /// Drop everything queued and release the held input.
    pub fn clear_actions(&self) {
        lock(&self.shared.actions).clear();
    }

    pub fn pending_actions(&self) -> usize {
        lock(&self.shared.actions).len()
    }

    /// Frames completed since the last `start`.
    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count.load(Ordering::Acquire)
    }

    /// Call `callback` after every `interval`-th completed step, counted
    /// from now. An interval of 0 is treated as 1.
    pub fn add_observer<F>(&self, interval: u32, callback: F) -> ObserverHandle
    where
        F: FnMut(&FrameView<'_>) -> Result<(), ObserverError> + Send + 'static,
    {
        let id = self.shared.next_observer_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.observers).entries.push(Observer {
            id,
            interval: u64::from(interval.max(1)),
            counter: 0,
            callback: Box::new(callback),
        });
        ObserverHandle(id)
    }

    /// Returns false if the observer was already removed.
    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        lock(&self.shared.observers).remove(handle.0)
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.shared.observers).len()
    }
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("frame_count", &self.frame_count())
            .field("speed", &self.speed())
            .finish()
    }
}

struct LoopExit<E> {
    engine: E,
    fault: Option<EngineError>,
}

struct Worker<E> {
    thread: JoinHandle<()>,
    stop_tx: Sender<()>,
    exit_rx: Receiver<LoopExit<E>>,
}

/// Runs an engine on a background thread at a target speed.
pub struct AsyncController<E: Engine + Send + 'static> {
    engine: Option<E>,
    worker: Option<Worker<E>>,
    handle: ControllerHandle,
    config: ControllerConfig,
    fault: Option<EngineError>,
}

impl<E: Engine + Send + 'static> AsyncController<E> {
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, ControllerConfig::default())
    }

    pub fn with_config(engine: E, config: ControllerConfig) -> Self {
        Self {
            engine: Some(engine),
            worker: None,
            handle: ControllerHandle::new(),
            config,
            fault: None,
        }
    }

    /// A cloneable handle for other threads.
    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// True while the engine thread is alive. A loop that ended on an
    /// engine fault reports false even before `stop` collects it.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.thread.is_finished())
    }

    /// Start the loop at `speed` (1.0 is real time, `<= 0` uncapped) and
    /// reset the frame counter.
    pub fn start(&mut self, speed: f64) -> Result<(), ControllerError> {
        if self.worker.is_some() {
            if self.is_running() {
                return Err(ControllerError::AlreadyRunning);
            }
            // The previous loop ended on its own; collect its engine.
            self.stop();
        }

        let engine = self.engine.as_ref().ok_or(ControllerError::EngineLost)?;
        if !engine.status().is_ready() {
            return Err(EngineError::NotReady.into());
        }

        self.fault = None;
        self.handle.set_speed(speed);
        self.handle.shared.frame_count.store(0, Ordering::Release);

        let (engine_tx, engine_rx) = mpsc::channel::<E>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (exit_tx, exit_rx) = mpsc::channel::<LoopExit<E>>();
        let shared = Arc::clone(&self.handle.shared);
        let config = self.config.clone();

        let thread = thread::Builder::new()
            .name("framestep-engine".to_string())
            .spawn(move || {
                let Ok(mut engine) = engine_rx.recv() else {
                    return;
                };
                let fault = run_loop(&mut engine, &shared, &stop_rx, &config);
                let _ = exit_tx.send(LoopExit { engine, fault });
            })?;

        if let Some(engine) = self.engine.take() {
            if let Err(mpsc::SendError(engine)) = engine_tx.send(engine) {
                self.engine = Some(engine);
                let _ = thread.join();
                return Err(ControllerError::EngineLost);
            }
        }

        self.worker = Some(Worker {
            thread,
            stop_tx,
            exit_rx,
        });
        log(LogCategory::Scheduler, LogLevel::Info, || {
            format!("engine loop started at speed {}", speed)
        });
        Ok(())
    }

    /// Signal the loop to exit and wait up to the configured timeout.
    ///
    /// Returns true once the engine thread has terminated (or was never
    /// running), false if it did not finish in time; calling `stop` again
    /// keeps waiting.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let _ = worker.stop_tx.send(());

        match worker.exit_rx.recv_timeout(self.config.stop_timeout()) {
            Ok(exit) => {
                let _ = worker.thread.join();
                self.engine = Some(exit.engine);
                self.fault = exit.fault;
                log(LogCategory::Scheduler, LogLevel::Info, || {
                    format!("engine loop stopped after {} frames", self.frame_count())
                });
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log(LogCategory::Scheduler, LogLevel::Warn, || {
                    format!(
                        "engine thread did not stop within {:?}",
                        self.config.stop_timeout()
                    )
                });
                self.worker = Some(worker);
                false
            }
            Err(RecvTimeoutError::Disconnected) => {
                // The thread died without handing the engine back.
                let _ = worker.thread.join();
                log(LogCategory::Scheduler, LogLevel::Error, || {
                    "engine thread panicked; engine lost".to_string()
                });
                true
            }
        }
    }

    /// Block until at least `target` frames have completed or `timeout`
    /// elapses, returning the count observed.
    pub fn wait_for_frame(&self, target: u64, timeout: Duration) -> Result<u64, ControllerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let count = self.frame_count();
            if count >= target {
                return Ok(count);
            }
            if !self.is_running() {
                return Err(ControllerError::NotRunning);
            }
            if Instant::now() >= deadline {
                return Ok(count);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// The fault that ended the last loop, if any.
    pub fn take_fault(&mut self) -> Option<EngineError> {
        self.fault.take()
    }

    /// The engine, unless it is currently owned by the loop.
    pub fn engine(&self) -> Option<&E> {
        if self.worker.is_some() {
            return None;
        }
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> Option<&mut E> {
        if self.worker.is_some() {
            return None;
        }
        self.engine.as_mut()
    }

    /// Stop the loop and give the engine back.
    pub fn into_engine(mut self) -> Result<E, ControllerError> {
        if !self.stop() {
            return Err(ControllerError::AlreadyRunning);
        }
        self.engine.take().ok_or(ControllerError::EngineLost)
    }

    pub fn set_speed(&self, speed: f64) {
        self.handle.set_speed(speed);
    }

    pub fn speed(&self) -> f64 {
        self.handle.speed()
    }

    pub fn queue_action(&self, input: InputVector, frames: u32) {
        self.handle.queue_action(input, frames);
    }

    pub fn queue(&self, action: &Action, frames: u32) -> Result<(), InputError> {
        self.handle.queue(action, frames)
    }

    pub fn clear_actions(&self) {
        self.handle.clear_actions();
    }

    pub fn pending_actions(&self) -> usize {
        self.handle.pending_actions()
    }

    pub fn frame_count(&self) -> u64 {
        self.handle.frame_count()
    }

    pub fn add_observer<F>(&self, interval: u32, callback: F) -> ObserverHandle
    where
        F: FnMut(&FrameView<'_>) -> Result<(), ObserverError> + Send + 'static,
    {
        self.handle.add_observer(interval, callback)
    }

    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.handle.remove_observer(handle)
    }
}

impl<E: Engine + Send + 'static> Drop for AsyncController<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<E: Engine + Send + 'static> fmt::Debug for AsyncController<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncController")
            .field("running", &self.is_running())
            .field("frames", &self.frame_count())
            .field("speed", &self.speed())
            .finish()
    }
}

/// The engine thread body. Returns the fault that ended the loop, or
/// `None` when it was asked to stop.
fn run_loop<E: Engine>(
    engine: &mut E,
    shared: &Shared,
    stop_rx: &Receiver<()>,
    config: &ControllerConfig,
) -> Option<EngineError> {
    let mut deadline = Instant::now();

    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }

        let input = lock(&shared.actions).next_input();
        if let Err(e) = engine.step(input, true) {
            log(LogCategory::Scheduler, LogLevel::Error, || {
                format!("engine fault, stopping loop: {}", e)
            });
            return Some(e);
        }
        let frame_number = shared.frame_count.fetch_add(1, Ordering::AcqRel) + 1;

        let view = FrameView {
            frame_number,
            input,
            screen: engine.screen(),
            memory: engine.memory(),
        };
        notify_observers(&shared.observers, &view);

        let speed = *lock(&shared.speed);
        let Some(frame_time) = config.frame_time(speed) else {
            deadline = Instant::now();
            continue;
        };

        let now = Instant::now();
        deadline = deadline.checked_add(frame_time).unwrap_or(now);
        let lag = now.saturating_duration_since(deadline);
        if lag > frame_time.saturating_mul(config.max_lag_frames) {
            log(LogCategory::Scheduler, LogLevel::Debug, || {
                format!("loop {:?} behind schedule at frame {}, resyncing", lag, frame_number)
            });
            deadline = now;
            continue;
        }

        if deadline > now {
            match stop_rx.recv_timeout(deadline - now) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}
