//! # Audio Capture Module
//!
//! Microphone audio travels to the lab server as raw binary websocket frames.
//! This module covers everything between the capture device and the socket.
//!
//! ## Key Components:
//! - **Encoder**: float samples → clamped 16-bit PCM frame + level meter
//! - **Capture**: single active capture session, device acquire/release,
//!   a one-deep audio queue that drops rather than backs up
//! - **Microphone**: cpal-backed capture device (feature `microphone`)
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers
//! - **Framing**: one capture buffer (4096 samples ≈ 256ms) per binary frame

pub mod capture;    // Capture session lifecycle and device seam
pub mod encoder;    // PCM conversion and level metering
#[cfg(feature = "microphone")]
pub mod microphone; // cpal input device

pub use capture::{
    CaptureController, CaptureDevice, CaptureFailure, CapturedBuffer, FrameAssembler, FrameSink,
    MicTransition, UnavailableDevice, AUDIO_QUEUE_DEPTH,
};
pub use encoder::{AudioEncoder, AudioFrame};
#[cfg(feature = "microphone")]
pub use microphone::MicrophoneDevice;
