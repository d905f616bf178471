use std::f32::consts::TAU;
use std::sync::Arc;

use spatial_mixer::effects::ReverbProps;
use spatial_mixer::{
    Buffer, ChannelLayout, Context, Device, DeviceConfig, EffectProps, Event, HrtfStore,
    OutputBuffer, SourceState, StereoEncoding,
};

const RATE: u32 = 44100;

fn stereo_device() -> Device {
    Device::new(&DeviceConfig::default(), None).unwrap()
}

fn sine(frequency: f32, frames: usize) -> Arc<Buffer> {
    let step = TAU * frequency / RATE as f32;
    let samples: Vec<f32> = (0..frames).map(|i| (i as f32 * step).sin() * 0.5).collect();
    Arc::new(Buffer::from_f32(RATE, ChannelLayout::Mono, &samples).unwrap())
}

/// Renders `frames` of stereo output, split into left and right.
fn render(device: &mut Device, frames: usize) -> (Vec<f32>, Vec<f32>) {
    let mut out = vec![0.0f32; frames * 2];
    device.render_samples(&mut OutputBuffer::F32(&mut out), frames, 2);
    let left = out.iter().step_by(2).copied().collect();
    let right = out.iter().skip(1).step_by(2).copied().collect();
    (left, right)
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

fn energy(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s * s).sum()
}

fn play_front(ctx: &mut Context, buffer: Arc<Buffer>, gain: f32) {
    let src = ctx.create_source();
    ctx.update_source(src, |p| {
        p.position = [0.0, 0.0, -1.0];
        p.gain = gain;
    })
    .unwrap();
    ctx.set_buffer(src, Some(buffer)).unwrap();
    ctx.play(src).unwrap();
}

#[test]
fn front_source_is_centred_and_scales_with_gain() {
    let mut peaks = Vec::new();
    for (source_gain, listener_gain) in [(1.0, 1.0), (0.5, 1.0), (1.0, 0.5)] {
        let mut device = stereo_device();
        let mut ctx = device.create_context().unwrap();
        ctx.set_listener_gain(listener_gain).unwrap();
        play_front(&mut ctx, sine(440.0, RATE as usize), source_gain);

        let (left, right) = render(&mut device, 4096);
        for (i, (l, r)) in left.iter().zip(&right).enumerate() {
            assert!((l - r).abs() < 1e-5, "frame {}: {} vs {}", i, l, r);
        }
        let correlation: f32 = left.iter().zip(&right).map(|(l, r)| l * r).sum();
        assert!(correlation > 0.0);
        peaks.push(peak(&left[1024..]));
    }

    assert!(peaks[0] > 0.1 && peaks[0] < 0.5, "front peak {}", peaks[0]);
    for (i, p) in peaks[1..].iter().enumerate() {
        let ratio = p / peaks[0];
        assert!((ratio - 0.5).abs() < 0.01, "case {}: ratio {}", i + 1, ratio);
    }
}

#[test]
fn looped_buffer_repeats_without_completing() {
    let mut device = stereo_device();
    let mut ctx = device.create_context().unwrap();
    let samples: Vec<f32> = (0..100).map(|i| (i + 1) as f32 / 100.0).collect();
    let buffer = Buffer::from_f32(RATE, ChannelLayout::Mono, &samples)
        .unwrap()
        .with_loop_points(0, 100)
        .unwrap();
    let src = ctx.create_source();
    ctx.set_looping(src, true).unwrap();
    ctx.update_source(src, |p| p.position = [0.0, 0.0, -1.0]).unwrap();
    ctx.set_buffer(src, Some(Arc::new(buffer))).unwrap();
    ctx.play(src).unwrap();

    let (left, _) = render(&mut device, 250);
    assert!(left[99] > 0.0);
    for i in 0..100 {
        let expected = left[99] * (i + 1) as f32 / 100.0;
        assert!((left[i] - expected).abs() < 1e-5, "frame {}: {} vs {}", i, left[i], expected);
    }
    for i in 0..150 {
        assert!((left[i] - left[i + 100]).abs() < 1e-5, "frame {} does not repeat", i);
    }

    assert_eq!(ctx.source_state(src).unwrap(), SourceState::Playing);
    let completed = ctx
        .poll_events()
        .into_iter()
        .filter(|e| matches!(e, Event::BufferCompleted { .. }))
        .count();
    assert_eq!(completed, 0);
}

#[test]
fn queued_buffers_complete_then_stop() {
    let mut device = stereo_device();
    let mut ctx = device.create_context().unwrap();
    let src = ctx.create_source();
    let buffers: Vec<_> = (0..3).map(|_| sine(440.0, 100)).collect();
    ctx.queue_buffers(src, &buffers).unwrap();
    ctx.play(src).unwrap();

    render(&mut device, 512);
    let events = ctx.poll_events();
    let completed: u32 = events
        .iter()
        .filter_map(|e| match e {
            Event::BufferCompleted { id, count } if *id == src => Some(*count),
            _ => None,
        })
        .sum();
    assert_eq!(completed, 3);
    let completed_at = events
        .iter()
        .position(|e| matches!(e, Event::BufferCompleted { .. }))
        .unwrap();
    let stopped_at = events
        .iter()
        .position(|e| matches!(e, Event::SourceStateChange { state: SourceState::Stopped, .. }))
        .unwrap();
    assert!(completed_at < stopped_at);

    assert_eq!(ctx.source_state(src).unwrap(), SourceState::Stopped);
    assert_eq!(ctx.buffers_processed(src).unwrap(), 3);
    assert_eq!(ctx.unqueue_buffers(src, 3).unwrap().len(), 3);
}

#[test]
fn fast_approach_saturates_the_pitch() {
    let mut device = stereo_device();
    let mut ctx = device.create_context().unwrap();
    ctx.set_speed_of_sound(343.0).unwrap();
    let src = ctx.create_source();
    ctx.update_source(src, |p| {
        p.position = [0.0, 0.0, -10.0];
        p.velocity = [0.0, 0.0, 340.0];
    })
    .unwrap();
    ctx.set_buffer(src, Some(sine(1000.0, RATE as usize))).unwrap();
    ctx.play(src).unwrap();

    let (left, _) = render(&mut device, 4096);
    assert!(left.iter().all(|s| s.is_finite()));
    let tail = &left[512..];
    let crossings = tail.windows(2).filter(|w| (w[0] < 0.0) != (w[1] < 0.0)).count();
    let expected = 2.0 * 10_000.0 * tail.len() as f32 / RATE as f32;
    let error = (crossings as f32 - expected).abs() / expected;
    assert!(error < 0.1, "{} crossings, expected about {}", crossings, expected);
}

#[test]
fn hrtf_follows_the_source_across_the_head() {
    let config = DeviceConfig {
        stereo_encoding: StereoEncoding::Hrtf,
        ..DeviceConfig::default()
    };
    let store = HrtfStore::synthetic(RATE).unwrap();
    let mut device = Device::new(&config, Some(store)).unwrap();
    let mut ctx = device.create_context().unwrap();
    let src = ctx.create_source();
    ctx.update_source(src, |p| p.position = [1.0, 0.0, 0.0]).unwrap();
    ctx.set_buffer(src, Some(sine(500.0, RATE as usize))).unwrap();
    ctx.play(src).unwrap();

    render(&mut device, 1024);
    let (left, right) = render(&mut device, 1024);
    assert!(energy(&right) > energy(&left) * 1.5, "right {} left {}", energy(&right), energy(&left));

    ctx.update_source(src, |p| p.position = [-1.0, 0.0, 0.0]).unwrap();
    let (moving_l, moving_r) = render(&mut device, 1024);
    assert!(moving_l.iter().chain(&moving_r).all(|s| s.is_finite()));
    let (left, right) = render(&mut device, 1024);
    assert!(energy(&left) > energy(&right) * 1.5, "left {} right {}", energy(&left), energy(&right));
}

#[test]
fn moved_hrtf_source_settles_on_the_new_direction() {
    let config = DeviceConfig {
        stereo_encoding: StereoEncoding::Hrtf,
        ..DeviceConfig::default()
    };
    let store = HrtfStore::synthetic(RATE).unwrap();
    let buffer = sine(500.0, RATE as usize);
    let start = |position: [f32; 3]| {
        let mut device = Device::new(&config, Some(store.clone())).unwrap();
        let mut ctx = device.create_context().unwrap();
        let src = ctx.create_source();
        ctx.update_source(src, |p| p.position = position).unwrap();
        ctx.set_buffer(src, Some(buffer.clone())).unwrap();
        ctx.play(src).unwrap();
        (device, ctx, src)
    };
    let (mut moved, mut moved_ctx, src) = start([1.0, 0.0, 0.0]);
    let (mut fixed, _fixed_ctx, _) = start([-1.0, 0.0, 0.0]);

    render(&mut moved, 2048);
    render(&mut fixed, 2048);
    moved_ctx.update_source(src, |p| p.position = [-1.0, 0.0, 0.0]).unwrap();
    let (fade_l, fade_r) = render(&mut moved, 1024);
    let (ref_l, ref_r) = render(&mut fixed, 1024);
    // The old direction still dominates the start of the fade.
    assert!(energy(&fade_r[..128]) > energy(&ref_r[..128]));
    assert!(fade_l.iter().chain(&fade_r).all(|s| s.is_finite()));
    assert!(energy(&ref_l) > 0.0);

    let (moved_l, moved_r) = render(&mut moved, 1024);
    let (fixed_l, fixed_r) = render(&mut fixed, 1024);
    // Past the carried-over convolution tail both renders agree.
    for i in 64..1024 {
        assert!((moved_l[i] - fixed_l[i]).abs() < 1e-4, "left frame {}: {} vs {}", i, moved_l[i], fixed_l[i]);
        assert!((moved_r[i] - fixed_r[i]).abs() < 1e-4, "right frame {}: {} vs {}", i, moved_r[i], fixed_r[i]);
    }
}

#[test]
fn reverb_send_rings_on_and_survives_a_density_change() {
    let mut device = stereo_device();
    let mut ctx = device.create_context().unwrap();
    let slot = ctx.create_slot().unwrap();
    ctx.slot_mut(slot)
        .unwrap()
        .set_effect(EffectProps::Reverb(ReverbProps::default()))
        .unwrap();

    let src = ctx.create_source();
    ctx.update_source(src, |p| {
        p.position = [0.0, 0.0, -1.0];
        p.direct.gain = 0.0;
        p.sends[0].slot = Some(slot);
    })
    .unwrap();
    ctx.set_buffer(src, Some(sine(440.0, 4096))).unwrap();
    ctx.play(src).unwrap();

    let (wet, _) = render(&mut device, 8192);
    assert!(peak(&wet[4096..]) > 1e-4, "no reverb tail");

    let props = ReverbProps {
        density: 0.25,
        ..ReverbProps::default()
    };
    ctx.slot_mut(slot).unwrap().set_effect(EffectProps::Reverb(props)).unwrap();
    let (left, right) = render(&mut device, 2048);
    assert!(left.iter().chain(&right).all(|s| s.is_finite() && s.abs() < 2.0));
}
