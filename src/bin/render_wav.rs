//! Offline renderer: mixes a JSON scene description into a WAV file.
//!
//! ```text
//! render_wav scene.json out.wav
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use serde::Deserialize;
use spatial_mixer::{
    Buffer, ChannelLayout, Context, ContextProps, DevSampleType, Device, DeviceConfig,
    EffectSlotProps, Event, HrtfStore, OutputBuffer, StereoEncoding, VoiceProps,
};

/// Frames rendered per call, like a host callback would ask for.
const RENDER_CHUNK: usize = 512;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Scene {
    device: DeviceConfig,
    listener: ContextProps,
    /// Seconds of output.
    duration: f32,
    slots: Vec<EffectSlotProps>,
    sources: Vec<SceneSource>,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            listener: ContextProps::default(),
            duration: 5.0,
            slots: Vec::new(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SourceAudio {
    /// WAV file, relative to the scene file.
    File(PathBuf),
    /// Mono sine tone.
    Tone { frequency: f32, seconds: f32 },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SceneSource {
    audio: SourceAudio,
    #[serde(default)]
    props: VoiceProps,
    #[serde(default)]
    looping: bool,
    /// Indices into `slots`, one per send.
    #[serde(default)]
    sends: Vec<usize>,
}

fn load_audio(audio: &SourceAudio, base: &Path, rate: u32) -> anyhow::Result<Arc<Buffer>> {
    let buffer = match audio {
        SourceAudio::File(path) => {
            let path = base.join(path);
            Buffer::from_wav(&path).with_context(|| format!("loading {}", path.display()))?
        }
        SourceAudio::Tone { frequency, seconds } => {
            let len = (seconds * rate as f32) as usize;
            let step = std::f32::consts::TAU * frequency / rate as f32;
            let samples: Vec<f32> = (0..len).map(|i| (i as f32 * step).sin() * 0.5).collect();
            Buffer::from_f32(rate, ChannelLayout::Mono, &samples)?
        }
    };
    Ok(Arc::new(buffer))
}

fn build_scene(ctx: &mut Context, scene: &Scene, base: &Path) -> anyhow::Result<()> {
    ctx.set_props(scene.listener.clone())?;

    let slots = scene
        .slots
        .iter()
        .map(|_| ctx.create_slot())
        .collect::<Result<Vec<_>, _>>()?;
    // Every slot exists before any target is set.
    for (id, props) in slots.iter().zip(&scene.slots) {
        ctx.set_slot_props(*id, props)?;
    }

    let rate = ctx.device().frequency;
    for (index, src) in scene.sources.iter().enumerate() {
        let buffer = load_audio(&src.audio, base, rate)?;
        let id = ctx.create_source();
        let mut props = src.props.clone();
        for (send, &slot) in props.sends.iter_mut().zip(&src.sends) {
            match slots.get(slot) {
                Some(&slot) => send.slot = Some(slot),
                None => bail!("source {} sends to missing slot {}", index, slot),
            }
        }
        ctx.set_source_props(id, props)?;
        ctx.set_looping(id, src.looping)?;
        ctx.set_buffer(id, Some(buffer))?;
        ctx.play(id)?;
    }
    Ok(())
}

fn wav_spec(sample_type: DevSampleType, rate: u32, channels: usize) -> anyhow::Result<hound::WavSpec> {
    let (bits_per_sample, sample_format) = match sample_type {
        DevSampleType::I16 => (16, hound::SampleFormat::Int),
        DevSampleType::I32 => (32, hound::SampleFormat::Int),
        DevSampleType::F32 => (32, hound::SampleFormat::Float),
        other => bail!("WAV output does not support {:?} samples", other),
    };
    Ok(hound::WavSpec {
        channels: channels as u16,
        sample_rate: rate,
        bits_per_sample,
        sample_format,
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(scene_path), Some(out_path)) = (args.next(), args.next()) else {
        bail!("usage: render_wav <scene.json> <out.wav>");
    };
    let scene_path = PathBuf::from(scene_path);
    let text = std::fs::read_to_string(&scene_path)
        .with_context(|| format!("reading {}", scene_path.display()))?;
    let scene: Scene = serde_json::from_str(&text).context("parsing scene")?;
    let base = scene_path.parent().unwrap_or(Path::new("."));

    let hrtf = match scene.device.stereo_encoding {
        StereoEncoding::Hrtf => Some(HrtfStore::synthetic(scene.device.frequency)?),
        _ => None,
    };
    let mut device = Device::new(&scene.device, hrtf)?;
    let mut ctx = device.create_context()?;
    build_scene(&mut ctx, &scene, base)?;

    let info = device.info().clone();
    let channels = info.output_channels();
    let spec = wav_spec(info.sample_type, info.frequency, channels)?;
    let mut writer = hound::WavWriter::create(&out_path, spec)
        .with_context(|| format!("creating {}", out_path))?;

    let total = (scene.duration.max(0.0) * info.frequency as f32) as usize;
    let mut done = 0;
    let mut floats = vec![0.0f32; RENDER_CHUNK * channels];
    let mut ints16 = vec![0i16; RENDER_CHUNK * channels];
    let mut ints32 = vec![0i32; RENDER_CHUNK * channels];
    while done < total {
        let frames = RENDER_CHUNK.min(total - done);
        let len = frames * channels;
        match info.sample_type {
            DevSampleType::I16 => {
                device.render_samples(&mut OutputBuffer::I16(&mut ints16[..len]), frames, channels);
                ints16[..len].iter().try_for_each(|&s| writer.write_sample(s))?;
            }
            DevSampleType::I32 => {
                device.render_samples(&mut OutputBuffer::I32(&mut ints32[..len]), frames, channels);
                ints32[..len].iter().try_for_each(|&s| writer.write_sample(s))?;
            }
            _ => {
                device.render_samples(&mut OutputBuffer::F32(&mut floats[..len]), frames, channels);
                floats[..len].iter().try_for_each(|&s| writer.write_sample(s))?;
            }
        }
        done += frames;

        for event in ctx.poll_events() {
            match event {
                Event::Warning(kind) => log::warn!("{:?}", kind),
                other => log::debug!("{:?}", other),
            }
        }
    }
    writer.finalize()?;

    log::info!(
        "Rendered {:.2}s of {} channel audio to {}",
        total as f32 / info.frequency as f32,
        channels,
        out_path
    );
    Ok(())
}
