//! # Capture Session Management
//!
//! Owns the single microphone capture session of a console. The device itself
//! is an external collaborator behind the [`CaptureDevice`] trait; this module
//! decides when it is acquired and released and which captured buffers are
//! still allowed to reach the socket.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: no device handle held
//! 2. **Active**: device acquired, buffers flow into the audio channel
//! 3. **Idle** again on toggle-off, a server `stop_audio`, or a device failure
//!    reported through [`FrameSink::fail`]; the device is released
//!
//! Every acquisition gets a new generation number. Buffers and failures carry
//! the generation they were captured under, so anything still queued from a
//! released session is discarded instead of sent.
//!
//! ## Rust Concepts:
//! - **Box<dyn CaptureDevice>**: the controller owns a trait object, so cpal,
//!   a test double or the no-microphone placeholder plug in the same way
//! - **mpsc::Sender::try_send**: the device callback never blocks; when the
//!   audio queue is full the buffer is dropped on the spot

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};

/// Buffers allowed to wait for the event loop. Anything captured while the
/// queue is full is dropped, so a slow loop never backs audio up.
pub const AUDIO_QUEUE_DEPTH: usize = 1;

/// One buffer handed over by a capture device.
#[derive(Debug, Clone)]
pub struct CapturedBuffer {
    pub generation: u64,
    pub samples: Vec<f32>,
}

/// A capture session that died on the device side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFailure {
    pub generation: u64,
    pub reason: String,
}

/// Where a device pushes its buffers and reports stream errors.
///
/// Cheap to clone; stamps everything with the generation of the capture
/// session it was created for.
#[derive(Debug, Clone)]
pub struct FrameSink {
    generation: u64,
    frames: mpsc::Sender<CapturedBuffer>,
    failures: mpsc::UnboundedSender<CaptureFailure>,
}

impl FrameSink {
    pub fn new(
        generation: u64,
        frames: mpsc::Sender<CapturedBuffer>,
        failures: mpsc::UnboundedSender<CaptureFailure>,
    ) -> Self {
        Self {
            generation,
            frames,
            failures,
        }
    }

    /// Hand one buffer to the console without blocking.
    ///
    /// A full queue drops the buffer. Returns `false` once the console is gone.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let buffer = CapturedBuffer {
            generation: self.generation,
            samples,
        };
        match self.frames.try_send(buffer) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(generation = self.generation, "Audio queue full, dropping buffer");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Report that the device stopped delivering audio for this session.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.failures
            .send(CaptureFailure {
                generation: self.generation,
                reason: reason.into(),
            })
            .is_ok()
    }
}

/// Turns device callbacks into mono buffers of a fixed size at the target rate.
///
/// Devices that cannot open mono at the wire rate are run at their default
/// configuration instead; interleaved channels are averaged and the rate is
/// converted by linear interpolation.
#[derive(Debug)]
pub struct FrameAssembler {
    channels: usize,
    /// Input samples per output sample
    step: f64,
    /// Position of the next output sample between `last` and the incoming one
    position: f64,
    last: f32,
    buffer_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(channels: u16, device_rate: u32, target_rate: u32, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            channels: usize::from(channels.max(1)),
            step: f64::from(device_rate.max(1)) / f64::from(target_rate.max(1)),
            position: 1.0,
            last: 0.0,
            buffer_size,
            pending: Vec::with_capacity(buffer_size),
        }
    }

    /// Feed interleaved samples; `emit` gets every buffer that fills up.
    pub fn feed(&mut self, interleaved: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        for frame in interleaved.chunks(self.channels) {
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            while self.position <= 1.0 {
                let sample = self.last + (mono - self.last) * self.position as f32;
                self.pending.push(sample);
                if self.pending.len() == self.buffer_size {
                    emit(std::mem::replace(
                        &mut self.pending,
                        Vec::with_capacity(self.buffer_size),
                    ));
                }
                self.position += self.step;
            }
            self.position -= 1.0;
            self.last = mono;
        }
    }
}

/// The microphone collaborator.
///
/// `acquire` starts delivering buffers into `sink`; `release` must stop the
/// device and drop its handle before returning, so a following `acquire`
/// never waits on a lingering stream.
pub trait CaptureDevice: Send {
    fn acquire(&mut self, sink: FrameSink) -> ClientResult<()>;
    fn release(&mut self);
}

/// Placeholder device for builds without microphone support.
///
/// Every acquisition is refused, which the console reports as a capture-device
/// error while the microphone stays muted.
#[derive(Debug, Default)]
pub struct UnavailableDevice;

impl CaptureDevice for UnavailableDevice {
    fn acquire(&mut self, _sink: FrameSink) -> ClientResult<()> {
        Err(ClientError::CaptureDevice(
            "no microphone support in this build (enable the `microphone` feature)".to_string(),
        ))
    }

    fn release(&mut self) {}
}

/// Result of a toggle, so the caller knows which `mic_state` to announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicTransition {
    Started,
    Stopped,
}

/// Tracks the single active capture session.
pub struct CaptureController {
    device: Box<dyn CaptureDevice>,
    frames_tx: mpsc::Sender<CapturedBuffer>,
    failures_tx: mpsc::UnboundedSender<CaptureFailure>,
    generation: u64,
    active: bool,
}

impl CaptureController {
    pub fn new(
        device: Box<dyn CaptureDevice>,
        frames_tx: mpsc::Sender<CapturedBuffer>,
        failures_tx: mpsc::UnboundedSender<CaptureFailure>,
    ) -> Self {
        Self {
            device,
            frames_tx,
            failures_tx,
            generation: 0,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Start capture when idle, stop it when active.
    ///
    /// ## Errors:
    /// A device refusal leaves the controller idle; there is no automatic retry.
    pub fn toggle(&mut self) -> ClientResult<MicTransition> {
        if self.active {
            self.stop();
            Ok(MicTransition::Stopped)
        } else {
            self.start()?;
            Ok(MicTransition::Started)
        }
    }

    fn start(&mut self) -> ClientResult<()> {
        let generation = self.generation + 1;
        let sink = FrameSink::new(generation, self.frames_tx.clone(), self.failures_tx.clone());

        match self.device.acquire(sink) {
            Ok(()) => {
                self.generation = generation;
                self.active = true;
                info!(generation, "Microphone capture started");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Microphone capture refused");
                Err(err)
            }
        }
    }

    /// Stop capture and release the device. Returns `false` if nothing was active.
    pub fn stop(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.device.release();
        self.active = false;
        info!(generation = self.generation, "Microphone capture stopped");
        true
    }

    /// Whether `generation` is the session that is capturing right now.
    pub fn is_current(&self, generation: u64) -> bool {
        self.active && generation == self.generation
    }

    /// Whether a buffer still belongs to the live session.
    pub fn accepts(&self, buffer: &CapturedBuffer) -> bool {
        let current = self.is_current(buffer.generation);
        if !current {
            debug!(
                generation = buffer.generation,
                live = self.generation,
                "Discarding buffer from a released capture session"
            );
        }
        current
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.stop();
    }
}
