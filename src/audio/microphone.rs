//! Live microphone capture through cpal (feature `microphone`).
//!
//! cpal streams are not `Send` on every platform, so each capture session owns
//! a small worker thread that builds the stream, keeps it alive, and drops it
//! when told to stop. `release` joins that thread, which makes the release
//! synchronous from the console's point of view.
//!
//! Mono f32 at the wire rate is requested first. Devices that do not offer it
//! run at their default input configuration, and [`FrameAssembler`] downmixes
//! and resamples. Stream errors go back to the console through
//! [`FrameSink::fail`], which ends the session.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tracing::{error, info, warn};

use super::capture::{CaptureDevice, FrameAssembler, FrameSink};
use crate::config::AudioConfig;
use crate::error::{ClientError, ClientResult};

struct Worker {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Default input device of the default cpal host, delivering mono at the
/// configured rate.
pub struct MicrophoneDevice {
    sample_rate: u32,
    buffer_size: usize,
    worker: Option<Worker>,
}

impl MicrophoneDevice {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            buffer_size: config.buffer_size,
            worker: None,
        }
    }
}

impl CaptureDevice for MicrophoneDevice {
    fn acquire(&mut self, sink: FrameSink) -> ClientResult<()> {
        if self.worker.is_some() {
            self.release();
        }

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<ClientResult<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let sample_rate = self.sample_rate;
        let buffer_size = self.buffer_size;

        let thread = std::thread::Builder::new()
            .name("lab-console-mic".to_string())
            .spawn(move || {
                let stream = match open_stream(sample_rate, buffer_size, sink) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Keep the stream alive until release (or the device is dropped)
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| ClientError::CaptureDevice(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(Worker { stop_tx, thread });
                info!(sample_rate, buffer_size, "Microphone stream running");
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(ClientError::CaptureDevice("capture thread exited before starting".to_string()))
            }
        }
    }

    fn release(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                error!("Microphone capture thread panicked");
            }
        }
    }
}

impl Drop for MicrophoneDevice {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_stream(sample_rate: u32, buffer_size: usize, sink: FrameSink) -> ClientResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| ClientError::CaptureDevice("no input device available".to_string()))?;

    let supported = input_config(&device, sample_rate)?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    info!(
        device_rate = config.sample_rate.0,
        channels = config.channels,
        format = ?format,
        "Opening input stream"
    );

    let assembler = FrameAssembler::new(config.channels, config.sample_rate.0, sample_rate, buffer_size);
    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, assembler, sink)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, assembler, sink)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, assembler, sink)?,
        other => {
            return Err(ClientError::CaptureDevice(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| ClientError::CaptureDevice(e.to_string()))?;
    Ok(stream)
}

/// Mono f32 at `sample_rate` when the device offers it, else its default.
fn input_config(device: &cpal::Device, sample_rate: u32) -> ClientResult<cpal::SupportedStreamConfig> {
    let wanted = cpal::SampleRate(sample_rate);
    if let Ok(ranges) = device.supported_input_configs() {
        for range in ranges {
            if range.channels() == 1
                && range.sample_format() == SampleFormat::F32
                && range.min_sample_rate() <= wanted
                && wanted <= range.max_sample_rate()
            {
                return Ok(range.with_sample_rate(wanted));
            }
        }
    }

    warn!(sample_rate, "Mono input at the wire rate not offered, using the device default");
    device
        .default_input_config()
        .map_err(|e| ClientError::CaptureDevice(format!("no usable input configuration: {}", e)))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: FrameAssembler,
    sink: FrameSink,
) -> ClientResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let error_sink = sink.clone();
    let mut converted: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                converted.clear();
                converted.extend(data.iter().map(|&sample| sample.to_sample::<f32>()));
                assembler.feed(&converted, |buffer| {
                    sink.push(buffer);
                });
            },
            move |err| {
                error!(error = %err, "Microphone stream error");
                error_sink.fail(err.to_string());
            },
            None,
        )
        .map_err(|e| ClientError::CaptureDevice(e.to_string()))
}
