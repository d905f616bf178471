//! CPAL output stream driving a [`Device`].
//!
//! Picks a host and output device, builds a stream in the device's native
//! sample format and renders straight from the mixer in the callback.

use anyhow::Context as _;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, HostId, SampleFormat, SizedSample, StreamConfig, SupportedBufferSize};
use crossbeam::channel::{Receiver, Sender};
use dasp_sample::FromSample;
use spatial_mixer::{Device, OutputBuffer};

const ALSA_HOST_BUFFER: u32 = 1024;
const DEFAULT_HOST_BUFFER: u32 = 512;

pub const PREFERRED_SAMPLE_RATE: u32 = 48000;

/// What the chosen output device will accept.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub host_name: String,
    pub device_name: String,
}

pub struct OutputHost {
    device: cpal::Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    format: OutputFormat,
}

impl OutputHost {
    pub fn list_hosts() -> Vec<HostId> {
        cpal::available_hosts()
    }

    /// Finds an output device, trying `preferred_host` first.
    pub fn open(preferred_host: Option<&str>) -> anyhow::Result<Self> {
        let mut last_error: Option<anyhow::Error> = None;
        let available = cpal::available_hosts();

        let mut priority: Vec<HostId> = available
            .iter()
            .copied()
            .filter(|h| Some(h.name()) == preferred_host)
            .collect();
        priority.extend(available.iter().copied().filter(|h| Some(h.name()) != preferred_host));

        for host_id in priority {
            let host = cpal::host_from_id(host_id)?;
            let host_name = host_id.name().to_string();
            let Some(device) = host.default_output_device() else {
                last_error = Some(anyhow::anyhow!("host {} has no default output device", host_name));
                continue;
            };
            match pick_config(&device, &host_name) {
                Ok((config, sample_format)) => {
                    let format = OutputFormat {
                        sample_rate: config.sample_rate.0,
                        channels: config.channels,
                        device_name: device.name().unwrap_or_else(|_| "Unknown device".to_string()),
                        host_name,
                    };
                    log::info!(
                        "Output: host '{}', device '{}', {} Hz, {} channels, {:?}",
                        format.host_name,
                        format.device_name,
                        format.sample_rate,
                        format.channels,
                        sample_format
                    );
                    return Ok(Self {
                        device,
                        config,
                        sample_format,
                        format,
                    });
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no usable output device found")))
    }

    pub fn format(&self) -> &OutputFormat {
        &self.format
    }

    /// Starts the stream. The mixer moves into the callback; stream errors
    /// are reported to it as a disconnect.
    pub fn start(self, mixer: Device) -> anyhow::Result<cpal::Stream> {
        let (err_tx, err_rx) = crossbeam::channel::bounded(4);
        let stream = match self.sample_format {
            SampleFormat::F32 => build_stream::<f32>(&self.device, &self.config, mixer, err_tx, err_rx)?,
            SampleFormat::I16 => build_stream::<i16>(&self.device, &self.config, mixer, err_tx, err_rx)?,
            SampleFormat::U16 => build_stream::<u16>(&self.device, &self.config, mixer, err_tx, err_rx)?,
            other => anyhow::bail!("unsupported sample format: {:?}", other),
        };
        stream.play().context("failed to start stream")?;
        Ok(stream)
    }
}

fn pick_config(device: &cpal::Device, host_name: &str) -> anyhow::Result<(StreamConfig, SampleFormat)> {
    let configs = device
        .supported_output_configs()
        .with_context(|| format!("failed to enumerate output configs for host {}", host_name))?;
    for supported in configs {
        let sample_format = supported.sample_format();
        if !matches!(sample_format, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16) {
            continue;
        }
        if supported.min_sample_rate().0 <= PREFERRED_SAMPLE_RATE
            && supported.max_sample_rate().0 >= PREFERRED_SAMPLE_RATE
        {
            let supported = supported.with_sample_rate(cpal::SampleRate(PREFERRED_SAMPLE_RATE));
            let mut config = supported.config();
            config.buffer_size = choose_buffer_size(supported.buffer_size(), host_name);
            return Ok((config, sample_format));
        }
    }

    let supported = device
        .default_output_config()
        .with_context(|| format!("failed to query default output config for host {}", host_name))?;
    let sample_format = supported.sample_format();
    let mut config = supported.config();
    config.buffer_size = choose_buffer_size(supported.buffer_size(), host_name);
    log::info!(
        "Preferred rate {} Hz not available, using {} Hz",
        PREFERRED_SAMPLE_RATE,
        config.sample_rate.0
    );
    Ok((config, sample_format))
}

fn choose_buffer_size(supported: &SupportedBufferSize, host_name: &str) -> BufferSize {
    let preferred = match host_name {
        // JACK sets its own period size.
        "JACK" => return BufferSize::Default,
        "ALSA" => ALSA_HOST_BUFFER,
        _ => DEFAULT_HOST_BUFFER,
    };
    match supported {
        SupportedBufferSize::Range { min, max } => BufferSize::Fixed(preferred.clamp(*min, *max)),
        SupportedBufferSize::Unknown => BufferSize::Fixed(preferred),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut mixer: Device,
    err_tx: Sender<String>,
    err_rx: Receiver<String>,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels);
    let mut scratch: Vec<f32> = Vec::new();
    let mut first_call = true;

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if first_call {
                    log::debug!("First callback: {} frames", data.len() / channels.max(1));
                    first_call = false;
                }
                if let Ok(message) = err_rx.try_recv() {
                    mixer.handle_disconnect(&message);
                }
                let frames = data.len() / channels.max(1);
                scratch.resize(data.len(), 0.0);
                mixer.render_samples(&mut OutputBuffer::F32(&mut scratch[..]), frames, channels);
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample);
                }
            },
            move |err| {
                log::error!("Stream error: {}", err);
                let _ = err_tx.try_send(err.to_string());
            },
            None,
        )
        .context("failed to build stream")?;
    Ok(stream)
}
