//! cpal-backed output graph.
//!
//! The cpal stream is created and owned by a dedicated thread because
//! `cpal::Stream` is not `Send`; everything the rest of the engine needs
//! lives in shared mixer state behind a mutex. The clock is the count of
//! frames the callback has rendered, so it freezes exactly while the graph
//! is suspended.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::{Error, Result};
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::graph::{EndedCallback, OutputGraph, PcmSource, SourceId};
use crate::resample::resample_planar;

/// One queued or playing source, already converted to the device format.
struct ActiveSource {
    id: SourceId,
    start_frame: u64,
    frames: usize,
    /// Interleaved samples at the device rate and channel count.
    data: Vec<f32>,
    on_ended: Option<EndedCallback>,
}

#[derive(Default)]
struct MixerState {
    sources: Vec<ActiveSource>,
    frames_rendered: u64,
    next_id: u64,
    suspended: bool,
    closed: bool,
    gain: f32,
    gain_target: f32,
    /// Per-frame gain delta; zero means jump straight to the target.
    gain_step: f32,
}

struct DeviceConfig {
    sample_rate: u32,
    channels: u16,
    device_name: String,
}

/// Output graph playing through the default cpal device.
pub struct CpalGraph {
    state: Arc<Mutex<MixerState>>,
    sample_rate: u32,
    channels: u16,
    device_name: String,
}

impl CpalGraph {
    /// Open the default output device.
    pub fn new() -> Result<Self> {
        let state = Arc::new(Mutex::new(MixerState::default()));
        let (config_tx, config_rx) = crossbeam_channel::bounded::<Result<DeviceConfig>>(1);

        let thread_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || match open_stream(&thread_state) {
                Ok((stream, config)) => {
                    let _ = config_tx.send(Ok(config));
                    // The stream must stay alive on this thread until close().
                    let _stream = stream;
                    loop {
                        if thread_state.lock().closed {
                            break;
                        }
                        std::thread::park_timeout(Duration::from_millis(100));
                    }
                    debug!("audio output thread exiting");
                }
                Err(e) => {
                    let _ = config_tx.send(Err(e));
                }
            })
            .map_err(|e| Error::Output(format!("failed to spawn output thread: {e}")))?;

        let config = config_rx
            .recv()
            .map_err(|_| Error::Output("output thread exited before reporting".to_string()))??;

        info!(
            "audio output initialized: {} Hz, {} channels, device: {}",
            config.sample_rate, config.channels, config.device_name
        );

        Ok(Self {
            state,
            sample_rate: config.sample_rate,
            channels: config.channels,
            device_name: config.device_name,
        })
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn channels(&self) -> u16 {
        self.channels
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Convert a planar source to interleaved samples at the device format.
    fn prepare(&self, source: PcmSource) -> Result<Vec<f32>> {
        let channels = usize::from(source.channels.max(1));
        let frames = source.frames();
        let planes: Vec<Vec<f32>> = (0..channels)
            .map(|ch| source.samples[ch * frames..(ch + 1) * frames].to_vec())
            .collect();

        let resampled = resample_planar(&planes, source.sample_rate, self.sample_rate)?;
        let adapted = adapt_channels(resampled, usize::from(self.channels));
        Ok(interleave(&adapted))
    }
}

impl OutputGraph for CpalGraph {
    fn now(&self) -> f64 {
        let frames = self.state.lock().frames_rendered;
        frames as f64 / f64::from(self.sample_rate)
    }

    fn schedule(&self, source: PcmSource, when: f64, on_ended: EndedCallback) -> SourceId {
        let prepared = match self.prepare(source) {
            Ok(data) => data,
            Err(e) => {
                error!("failed to prepare source for output: {e}");
                // Degenerate source: completes immediately so the
                // scheduler's bookkeeping stays consistent.
                let id = {
                    let mut mixer = self.state.lock();
                    mixer.next_id += 1;
                    SourceId(mixer.next_id)
                };
                on_ended(id);
                return id;
            }
        };

        let mut mixer = self.state.lock();
        mixer.next_id += 1;
        let id = SourceId(mixer.next_id);
        let start_frame = ((when * f64::from(self.sample_rate)).round() as u64)
            .max(mixer.frames_rendered);
        let frames = prepared.len() / usize::from(self.channels.max(1));
        mixer.sources.push(ActiveSource {
            id,
            start_frame,
            frames,
            data: prepared,
            on_ended: Some(on_ended),
        });
        id
    }

    fn stop(&self, id: SourceId) {
        self.state.lock().sources.retain(|s| s.id != id);
    }

    fn suspend(&self) {
        self.state.lock().suspended = true;
    }

    fn resume(&self) {
        self.state.lock().suspended = false;
    }

    fn set_gain(&self, target: f32, ramp_secs: f64) {
        let mut mixer = self.state.lock();
        let target = target.clamp(0.0, 1.0);
        mixer.gain_target = target;
        mixer.gain_step = if ramp_secs <= 0.0 {
            0.0
        } else {
            (target - mixer.gain) / (ramp_secs * f64::from(self.sample_rate)) as f32
        };
    }

    fn close(&self) {
        let mut mixer = self.state.lock();
        mixer.closed = true;
        mixer.sources.clear();
    }
}

fn open_stream(state: &Arc<Mutex<MixerState>>) -> Result<(Stream, DeviceConfig)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Output("no output device found".to_string()))?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported_config = device
        .default_output_config()
        .map_err(|e| Error::Output(format!("failed to get output config: {e}")))?;
    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    let device_config = DeviceConfig {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
        device_name,
    };

    debug!(
        "output config: {} Hz, {} channels, format {:?}",
        device_config.sample_rate, device_config.channels, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, Arc::clone(state))?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, Arc::clone(state))?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, Arc::clone(state))?,
        _ => {
            return Err(Error::Output(format!(
                "unsupported sample format: {sample_format:?}"
            )));
        }
    };

    stream
        .play()
        .map_err(|e| Error::Output(format!("failed to start stream: {e}")))?;

    Ok((stream, device_config))
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &Device,
    config: &StreamConfig,
    state: Arc<Mutex<MixerState>>,
) -> Result<Stream> {
    let channels = usize::from(config.channels);

    let err_fn = |err| {
        error!("audio stream error: {err}");
    };

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut finished: Vec<(SourceId, EndedCallback)> = Vec::new();
                {
                    let mixer = &mut *state.lock();
                    let frames = data.len() / channels;

                    if mixer.suspended || mixer.closed {
                        for sample in data.iter_mut() {
                            *sample = T::from_sample(0.0f32);
                        }
                        return;
                    }

                    let base = mixer.frames_rendered;
                    let mut acc = vec![0.0f32; channels];

                    for f in 0..frames {
                        let global = base + f as u64;

                        // Advance the gain ramp one frame.
                        if (mixer.gain - mixer.gain_target).abs() > f32::EPSILON {
                            let step = mixer.gain_step;
                            let next = mixer.gain + step;
                            let overshot = (step > 0.0 && next >= mixer.gain_target)
                                || (step < 0.0 && next <= mixer.gain_target)
                                || step == 0.0;
                            mixer.gain = if overshot { mixer.gain_target } else { next };
                        }

                        acc.iter_mut().for_each(|v| *v = 0.0);
                        for source in &mixer.sources {
                            if source.start_frame > global {
                                continue;
                            }
                            let idx = (global - source.start_frame) as usize;
                            if idx >= source.frames {
                                continue;
                            }
                            for (c, value) in acc.iter_mut().enumerate() {
                                *value += source.data[idx * channels + c];
                            }
                        }

                        for (c, value) in acc.iter().enumerate() {
                            let s = *value * mixer.gain;
                            // Soft clipping for smooth limiting
                            let limited = if s.abs() > 0.9 { s.tanh() } else { s };
                            data[f * channels + c] = T::from_sample(limited);
                        }
                    }

                    mixer.frames_rendered += frames as u64;
                    let rendered = mixer.frames_rendered;
                    mixer.sources.retain_mut(|s| {
                        if s.start_frame + s.frames as u64 <= rendered {
                            if let Some(cb) = s.on_ended.take() {
                                finished.push((s.id, cb));
                            }
                            false
                        } else {
                            true
                        }
                    });
                }
                for (id, cb) in finished {
                    cb(id);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::Output(format!("failed to build stream: {e}")))?;

    Ok(stream)
}

/// Naive channel mapping: duplicate mono upward, keep the leading channels
/// when downmixing.
fn adapt_channels(planes: Vec<Vec<f32>>, out_channels: usize) -> Vec<Vec<f32>> {
    if planes.len() == out_channels || planes.is_empty() {
        return planes;
    }
    if planes.len() > out_channels {
        warn!(
            "downmixing {} channels to {out_channels} by truncation",
            planes.len()
        );
        let mut planes = planes;
        planes.truncate(out_channels);
        return planes;
    }
    let mut out = Vec::with_capacity(out_channels);
    for ch in 0..out_channels {
        out.push(planes[ch % planes.len()].clone());
    }
    out
}

/// Interleave planar channels frame by frame.
fn interleave(planes: &[Vec<f32>]) -> Vec<f32> {
    if planes.is_empty() || planes[0].is_empty() {
        return Vec::new();
    }
    let frames = planes[0].len();
    let mut output = Vec::with_capacity(frames * planes.len());
    for frame in 0..frames {
        for plane in planes {
            output.push(plane[frame]);
        }
    }
    output
}
