//! Live playback demo: a tone circling the listener, with a reverb send.
//!
//! ```text
//! cpal_host [host-name]
//! ```

mod host;

use std::time::{Duration, Instant};

use host::OutputHost;
use spatial_mixer::effects::ReverbProps;
use spatial_mixer::{
    Buffer, ChannelLayout, DevChannels, Device, DeviceConfig, EffectProps, Event, VoiceProps,
};

const ORBIT_RADIUS: f32 = 3.0;
const ORBIT_SECONDS: f32 = 8.0;

fn channels_for(count: u16) -> DevChannels {
    match count {
        1 => DevChannels::Mono,
        4 => DevChannels::Quad,
        6 => DevChannels::Surround51,
        7 => DevChannels::Surround61,
        8 => DevChannels::Surround71,
        _ => DevChannels::Stereo,
    }
}

/// A plucked-ish tone: harmonics with a decaying envelope, repeated.
fn pluck(rate: u32) -> anyhow::Result<Buffer> {
    let len = rate as usize / 2;
    let samples: Vec<f32> = (0..len)
        .map(|i| {
            let t = i as f32 / rate as f32;
            let env = (-t * 6.0).exp();
            let tone: f32 = (1..=4)
                .map(|h| (std::f32::consts::TAU * 220.0 * h as f32 * t).sin() / h as f32)
                .sum();
            tone * env * 0.3
        })
        .collect();
    Ok(Buffer::from_f32(rate, ChannelLayout::Mono, &samples)?)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    for host in OutputHost::list_hosts() {
        log::info!("Available host: {}", host.name());
    }
    let preferred = std::env::args().nth(1);
    let output = OutputHost::open(preferred.as_deref())?;
    let format = output.format().clone();

    let config = DeviceConfig {
        frequency: format.sample_rate,
        channels: channels_for(format.channels),
        ..DeviceConfig::default()
    };
    let mut device = Device::new(&config, None)?;
    let mut ctx = device.create_context()?;

    let slot = ctx.create_slot()?;
    ctx.slot_mut(slot)?.set_effect(EffectProps::Reverb(ReverbProps::default()))?;

    let src = ctx.create_source();
    ctx.set_source_props(
        src,
        VoiceProps {
            position: [0.0, 0.0, -ORBIT_RADIUS],
            ..VoiceProps::default()
        },
    )?;
    ctx.update_source(src, |p| p.sends[0].slot = Some(slot))?;
    ctx.set_buffer(src, Some(std::sync::Arc::new(pluck(format.sample_rate)?)))?;
    ctx.set_looping(src, true)?;
    ctx.play(src)?;

    let clock = device.clock();
    let _stream = output.start(device)?;
    println!("Playing on '{}'. Press Ctrl+C to stop.", format.device_name);

    let started = Instant::now();
    loop {
        for event in ctx.wait_events(Duration::from_millis(20)) {
            match event {
                Event::Disconnected { message } => {
                    log::error!("Device lost: {}", message);
                    return Ok(());
                }
                other => log::debug!("{:?}", other),
            }
        }

        let angle = started.elapsed().as_secs_f32() / ORBIT_SECONDS * std::f32::consts::TAU;
        let position = [angle.sin() * ORBIT_RADIUS, 0.0, -angle.cos() * ORBIT_RADIUS];
        let velocity = [
            angle.cos() * ORBIT_RADIUS * std::f32::consts::TAU / ORBIT_SECONDS,
            0.0,
            angle.sin() * ORBIT_RADIUS * std::f32::consts::TAU / ORBIT_SECONDS,
        ];
        ctx.update_source(src, |p| {
            p.position = position;
            p.velocity = velocity;
        })?;
        log::trace!("Device time {:?}", clock.time());
    }
}
