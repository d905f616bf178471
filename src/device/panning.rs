//! Output layout setup: which dry bus the mixer renders into and how that
//! bus reaches the speakers.

use std::sync::Arc;

use crate::ambisonic::{
    ambi_2d_channels_from_order, ambi_channels_from_order, scales_for, BFChannelConfig,
    FROM_ACN_2D_INDEX, FROM_FUMA_INDEX, FROM_UHJ, MAX_AMBI2D_CHANNELS, MAX_AMBI_CHANNELS,
    MAX_AMBI_ORDER, ORDER_FROM_2D_CHANNEL,
};
use crate::audio::{
    AmbiScaling, Channel, FloatBufferLine, MixParams, BUFFER_LINE_SIZE, SPEED_OF_SOUND_METERS_PER_SEC,
};
use crate::config::{DevChannels, DeviceConfig, HrtfMode, RenderMode, StereoEncoding};
use crate::hrtf::{build_bformat_hrtf, DirectHrtfState, HrtfStore, HRTF_XOVER_FREQ, MIN_IR_LENGTH};
use crate::mixer::mix_direct_hrtf;
use crate::postprocess::{BFormatDec, Bs2b, ChannelDec, FrontStablizer, UhjEncoder};

use super::DeviceInfo;

const DEFAULT_XOVER_FREQ: f32 = 400.0;

/// Where one input channel goes when the device lacks its speaker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemixEntry {
    pub channel: Channel,
    pub targets: [(Channel, f32); 2],
}

const fn remix(channel: Channel, a: (Channel, f32), b: (Channel, f32)) -> RemixEntry {
    RemixEntry {
        channel,
        targets: [a, b],
    }
}

use Channel::{
    BackCenter as BC, BackLeft as BL, BackRight as BR, FrontCenter as FC, FrontLeft as FL,
    FrontRight as FR, Lfe as LFE, SideLeft as SL, SideRight as SR,
};

pub(crate) static STEREO_DOWNMIX: [RemixEntry; 6] = [
    remix(FC, (FL, 0.5), (FR, 0.5)),
    remix(SL, (FL, 1.0 / 9.0), (FR, 0.0)),
    remix(SR, (FL, 0.0), (FR, 1.0 / 9.0)),
    remix(BL, (FL, 1.0 / 9.0), (FR, 0.0)),
    remix(BR, (FL, 0.0), (FR, 1.0 / 9.0)),
    remix(BC, (FL, 0.5 / 9.0), (FR, 0.5 / 9.0)),
];
static QUAD_DOWNMIX: [RemixEntry; 4] = [
    remix(FC, (FL, 0.5), (FR, 0.5)),
    remix(SL, (FL, 0.5), (BL, 0.5)),
    remix(SR, (FR, 0.5), (BR, 0.5)),
    remix(BC, (BL, 0.5), (BR, 0.5)),
];
static X51_DOWNMIX: [RemixEntry; 3] = [
    remix(BL, (SL, 1.0), (SR, 0.0)),
    remix(BR, (SL, 0.0), (SR, 1.0)),
    remix(BC, (SL, 0.5), (SR, 0.5)),
];
static X61_DOWNMIX: [RemixEntry; 2] = [
    remix(BL, (BC, 0.5), (SL, 0.5)),
    remix(BR, (BC, 0.5), (SR, 0.5)),
];
static X71_DOWNMIX: [RemixEntry; 1] = [remix(BC, (BL, 0.5), (BR, 0.5))];

/// Speaker order of each output layout, as the backend sees it.
pub(crate) fn speaker_channels(channels: DevChannels, ambi_order: u32) -> Vec<Channel> {
    match channels {
        DevChannels::Mono => vec![FC],
        DevChannels::Stereo => vec![FL, FR],
        DevChannels::Quad => vec![FL, FR, BL, BR],
        DevChannels::Surround51 => vec![FL, FR, FC, LFE, SL, SR],
        DevChannels::Surround61 => vec![FL, FR, FC, LFE, BC, SL, SR],
        DevChannels::Surround71 => vec![FL, FR, FC, LFE, BL, BR, SL, SR],
        DevChannels::Ambi3d => (0..channels.count(ambi_order)).map(Channel::aux).collect(),
    }
}

type DecoderRow = [f32; MAX_AMBI2D_CHANNELS];

/// A fixed horizontal decoder. Rows follow `channels`, columns the 2D ACN
/// channel order of the dry bus.
struct DecoderConfig {
    order: usize,
    channels: &'static [Channel],
    scaling: AmbiScaling,
    order_gain: [f32; MAX_AMBI_ORDER + 1],
    coeffs: &'static [DecoderRow],
    order_gain_lf: [f32; MAX_AMBI_ORDER + 1],
    coeffs_lf: &'static [DecoderRow],
}

const fn row5(v: [f32; 5]) -> DecoderRow {
    [v[0], v[1], v[2], v[3], v[4], 0.0, 0.0]
}

static MONO_CONFIG: DecoderConfig = DecoderConfig {
    order: 0,
    channels: &[FC],
    scaling: AmbiScaling::N3d,
    order_gain: [1.0, 0.0, 0.0, 0.0],
    coeffs: &[[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]],
    order_gain_lf: [0.0; 4],
    coeffs_lf: &[],
};

static STEREO_CONFIG: DecoderConfig = DecoderConfig {
    order: 1,
    channels: &[FL, FR],
    scaling: AmbiScaling::N3d,
    order_gain: [1.0, 1.0, 0.0, 0.0],
    coeffs: &[
        [5.000_000_0e-1, 2.886_751_4e-1, 5.523_056_4e-2, 0.0, 0.0, 0.0, 0.0],
        [5.000_000_0e-1, -2.886_751_4e-1, 5.523_056_4e-2, 0.0, 0.0, 0.0, 0.0],
    ],
    order_gain_lf: [0.0; 4],
    coeffs_lf: &[],
};

const QUAD_ROWS: [DecoderRow; 4] = [
    row5([2.500_000_0e-1, 2.041_241_5e-1, -2.041_241_5e-1, -1.290_994_4e-1, 0.0]),
    row5([2.500_000_0e-1, 2.041_241_5e-1, 2.041_241_5e-1, 1.290_994_4e-1, 0.0]),
    row5([2.500_000_0e-1, -2.041_241_5e-1, 2.041_241_5e-1, -1.290_994_4e-1, 0.0]),
    row5([2.500_000_0e-1, -2.041_241_5e-1, -2.041_241_5e-1, 1.290_994_4e-1, 0.0]),
];

static QUAD_CONFIG: DecoderConfig = DecoderConfig {
    order: 2,
    channels: &[BL, FL, FR, BR],
    scaling: AmbiScaling::N3d,
    order_gain: [1.154_700_5, 1.0, 5.773_502_7e-1, 0.0],
    coeffs: &QUAD_ROWS,
    order_gain_lf: [1.0, 1.0, 1.0, 0.0],
    coeffs_lf: &QUAD_ROWS,
};

static X51_CONFIG: DecoderConfig = DecoderConfig {
    order: 2,
    channels: &[SL, FL, FC, FR, SR],
    scaling: AmbiScaling::FuMa,
    order_gain: [1.0, 1.0, 1.0, 0.0],
    coeffs: &[
        row5([5.673_16e-1, 4.229_2e-1, -3.154_95e-1, -6.344_9e-2, -2.923_8e-2]),
        row5([3.685_84e-1, 2.723_49e-1, 3.216_16e-1, 1.926_45e-1, 4.826e-2]),
        row5([1.835_79e-1, 0.0, 1.995_88e-1, 0.0, 9.628_2e-2]),
        row5([3.685_84e-1, -2.723_49e-1, 3.216_16e-1, -1.926_45e-1, 4.826e-2]),
        row5([5.673_16e-1, -4.229_2e-1, -3.154_95e-1, 6.344_9e-2, -2.923_8e-2]),
    ],
    order_gain_lf: [1.0, 1.0, 1.0, 0.0],
    coeffs_lf: &[
        row5([4.901_098_5e-1, 3.773_050_1e-1, -3.731_069_9e-1, -1.259_145_3e-1, 1.451_33e-2]),
        row5([1.490_857_3e-1, 3.035_616_8e-1, 1.532_900_6e-1, 2.451_124_8e-1, -1.507_531_3e-1]),
        row5([1.376_549_2e-1, 0.0, 4.494_179_4e-1, 0.0, 2.578_440_7e-1]),
        row5([1.490_857_3e-1, -3.035_616_8e-1, 1.532_900_6e-1, -2.451_124_8e-1, -1.507_531_3e-1]),
        row5([4.901_098_5e-1, -3.773_050_1e-1, -3.731_069_9e-1, 1.259_145_3e-1, 1.451_33e-2]),
    ],
};

static X61_CONFIG: DecoderConfig = DecoderConfig {
    order: 2,
    channels: &[SL, FL, FR, SR, BC],
    scaling: AmbiScaling::N3d,
    order_gain: [1.0, 1.0, 1.0, 0.0],
    coeffs: &[
        row5([2.044_603_4e-1, 2.171_779_3e-1, -4.399_967_8e-2, -2.607_902_7e-2, -6.872_397_9e-2]),
        row5([1.589_231_6e-1, 9.217_726_8e-2, 1.596_587_9e-1, 6.662_780_8e-2, 3.846_868_5e-2]),
        row5([1.589_231_6e-1, -9.217_726_8e-2, 1.596_587_9e-1, -6.662_780_8e-2, 3.846_868_5e-2]),
        row5([2.044_603_4e-1, -2.171_779_3e-1, -4.399_967_8e-2, 2.607_902_7e-2, -6.872_397_9e-2]),
        row5([2.500_016_9e-1, 0.0, -2.500_000_9e-1, 0.0, 6.051_334e-2]),
    ],
    order_gain_lf: [0.0; 4],
    coeffs_lf: &[],
};

const X71_ROWS: [DecoderRow; 6] = [
    [1.666_666_7e-1, 9.622_504_5e-2, -1.666_666_7e-1, -1.490_712e-1, 8.606_629_7e-2, 7.968_190_7e-2, 0.0],
    [1.666_666_7e-1, 1.924_500_9e-1, 0.0, 0.0, -1.721_325_9e-1, -7.968_190_7e-2, 0.0],
    [1.666_666_7e-1, 9.622_504_5e-2, 1.666_666_7e-1, 1.490_712e-1, 8.606_629_7e-2, 7.968_190_7e-2, 0.0],
    [1.666_666_7e-1, -9.622_504_5e-2, 1.666_666_7e-1, -1.490_712e-1, 8.606_629_7e-2, -7.968_190_7e-2, 0.0],
    [1.666_666_7e-1, -1.924_500_9e-1, 0.0, 0.0, -1.721_325_9e-1, 7.968_190_7e-2, 0.0],
    [1.666_666_7e-1, -9.622_504_5e-2, -1.666_666_7e-1, 1.490_712e-1, 8.606_629_7e-2, -7.968_190_7e-2, 0.0],
];

static X71_CONFIG: DecoderConfig = DecoderConfig {
    order: 3,
    channels: &[BL, SL, FL, FR, SR, BR],
    scaling: AmbiScaling::N3d,
    order_gain: [1.224_744_9, 1.131_516_7, 8.660_254e-1, 4.686_895_7e-1],
    coeffs: &X71_ROWS,
    order_gain_lf: [1.0; 4],
    coeffs_lf: &X71_ROWS,
};

/// The stage that turns the dry bus into speaker feeds after mixing.
pub(crate) enum PostProcess {
    /// The dry bus is the output.
    None,
    AmbiDec(Box<BFormatDec>),
    Hrtf(Box<HrtfDecode>),
    Uhj(Box<UhjEncoder>),
    Bs2b {
        decoder: Box<BFormatDec>,
        bs2b: Box<Bs2b>,
    },
}

pub(crate) struct HrtfDecode {
    state: DirectHrtfState,
    temp: Vec<f32>,
}

impl PostProcess {
    pub fn name(&self) -> &'static str {
        match self {
            PostProcess::None => "none",
            PostProcess::AmbiDec(dec) if dec.has_stablizer() => "ambisonic decode (stabilized)",
            PostProcess::AmbiDec(_) => "ambisonic decode",
            PostProcess::Hrtf(_) => "hrtf",
            PostProcess::Uhj(_) => "uhj encode",
            PostProcess::Bs2b { .. } => "bs2b",
        }
    }

    /// Renders the dry bus (and, for HRTF, the voices' binaural accumulation)
    /// into the speaker bus.
    pub fn process(
        &mut self,
        device: &DeviceInfo,
        dry: &[FloatBufferLine],
        real: &mut [FloatBufferLine],
        hrtf_accum: &mut [[f32; 2]],
        samples_to_do: usize,
    ) {
        let front = |chan| device.real_out.index_of(chan);
        match self {
            PostProcess::None => {}
            PostProcess::AmbiDec(decoder) => {
                match (front(FL), front(FR), front(FC), decoder.has_stablizer()) {
                    (Some(l), Some(r), Some(c), true) => {
                        decoder.process_stablize(real, dry, l, r, c, samples_to_do)
                    }
                    _ => decoder.process(real, dry, samples_to_do),
                }
            }
            PostProcess::Hrtf(hrtf) => {
                let (Some(l), Some(r)) = (front(FL), front(FR)) else {
                    return;
                };
                let Some((left, right)) = crate::effect_slot::pair_mut(real, l, r) else {
                    return;
                };
                mix_direct_hrtf(
                    left,
                    right,
                    dry,
                    hrtf_accum,
                    &mut hrtf.temp,
                    &mut hrtf.state.channels,
                    hrtf.state.ir_size,
                    samples_to_do,
                );
            }
            PostProcess::Uhj(encoder) => {
                let (Some(l), Some(r)) = (front(FL), front(FR)) else {
                    return;
                };
                if let Some((left, right)) = crate::effect_slot::pair_mut(real, l, r) {
                    encoder.encode(left, right, dry, samples_to_do);
                }
            }
            PostProcess::Bs2b { decoder, bs2b } => {
                decoder.process(real, dry, samples_to_do);
                let (Some(l), Some(r)) = (front(FL), front(FR)) else {
                    return;
                };
                if let Some((left, right)) = crate::effect_slot::pair_mut(real, l, r) {
                    bs2b.cross_feed(&mut left[..samples_to_do], &mut right[..samples_to_do]);
                }
            }
        }
    }
}

/// Fills in the bus layout of `info` for `config` and returns the matching
/// post-process stage.
pub(crate) fn init_renderer(
    info: &mut DeviceInfo,
    config: &DeviceConfig,
    hrtf: Option<Arc<HrtfStore>>,
) -> PostProcess {
    info.xover_freq = DEFAULT_XOVER_FREQ;
    info.render_mode = RenderMode::Normal;
    info.hrtf = None;
    info.ir_size = 0;
    info.uhj_encoder = false;

    let post = match config.channels {
        DevChannels::Stereo => init_stereo(info, config, hrtf),
        DevChannels::Ambi3d => {
            init_ambi3d(info, config);
            PostProcess::None
        }
        layout => {
            if config.stereo_encoding == StereoEncoding::Hrtf {
                log::warn!("HRTF requested for a {:?} device, which only supports it for stereo", layout);
            }
            let decoder = match layout {
                DevChannels::Mono => &MONO_CONFIG,
                DevChannels::Quad => &QUAD_CONFIG,
                DevChannels::Surround51 => &X51_CONFIG,
                DevChannels::Surround61 => &X61_CONFIG,
                _ => &X71_CONFIG,
            };
            let stablize = [FC, FL, FR].iter().all(|&c| info.real_out.index_of(c).is_some())
                && config.front_stablizer;
            info.render_mode = user_render_mode(config, RenderMode::Normal);
            let post = PostProcess::AmbiDec(Box::new(init_panning(info, decoder, config.hq_decoder, stablize)));
            init_near_field(info, config, control_distance(config), decoder.order, false);
            post
        }
    };

    info.remix = match (config.channels, info.uhj_encoder) {
        (DevChannels::Stereo, false) => &STEREO_DOWNMIX,
        (DevChannels::Quad, _) => &QUAD_DOWNMIX,
        (DevChannels::Surround51, _) => &X51_DOWNMIX,
        (DevChannels::Surround61, _) => &X61_DOWNMIX,
        (DevChannels::Surround71, _) => &X71_DOWNMIX,
        _ => &[],
    };

    log::info!(
        "Output: {:?}, ambisonic order {}, {} dry channel(s), post-process {}, render mode {:?}",
        config.channels,
        info.ambi_order,
        info.dry.num_channels(),
        post.name(),
        info.render_mode
    );
    post
}

fn user_render_mode(config: &DeviceConfig, default: RenderMode) -> RenderMode {
    match config.render_mode {
        Some(RenderMode::Hrtf) | None => default,
        Some(mode) => mode,
    }
}

/// The NFC control distance: the explicit reference, or else the mean of
/// the configured speaker distances.
fn control_distance(config: &DeviceConfig) -> f32 {
    if config.nfc_ref_distance > 0.0 {
        return config.nfc_ref_distance;
    }
    let Some(dists) = &config.speaker_distances else {
        return 0.0;
    };
    let (sum, count) = dists
        .iter()
        .filter(|&&d| d > 0.0)
        .fold((0.0f32, 0usize), |(s, c), &d| (s + d, c + 1));
    if count > 0 {
        sum / count as f32
    } else {
        0.0
    }
}

fn init_stereo(info: &mut DeviceInfo, config: &DeviceConfig, hrtf: Option<Arc<HrtfStore>>) -> PostProcess {
    if config.stereo_encoding == StereoEncoding::Hrtf {
        match hrtf {
            Some(store) if store.sample_rate() == info.frequency => {
                return init_hrtf(info, config, store);
            }
            Some(store) => log::warn!(
                "HRTF data is {}hz but the device runs at {}hz; using stereo panning",
                store.sample_rate(),
                info.frequency
            ),
            None => log::warn!("HRTF requested without HRTF data; using stereo panning"),
        }
    }

    if config.stereo_encoding == StereoEncoding::Uhj {
        init_uhj(info);
        log::info!("UHJ enabled");
        return PostProcess::Uhj(Box::new(UhjEncoder::new()));
    }

    info.render_mode = user_render_mode(config, RenderMode::Pairwise);
    let decoder = init_panning(info, &STEREO_CONFIG, config.hq_decoder, false);
    if (1..=6).contains(&config.cf_level) {
        log::info!("BS2B enabled at level {}", config.cf_level);
        return PostProcess::Bs2b {
            decoder: Box::new(decoder),
            bs2b: Box::new(Bs2b::new(config.cf_level as u8, info.frequency)),
        };
    }
    log::info!("Stereo rendering");
    PostProcess::AmbiDec(Box::new(decoder))
}

/// Builds the dry bus and decoder for one of the fixed speaker layouts.
fn init_panning(info: &mut DeviceInfo, decoder: &DecoderConfig, hq: bool, stablize: bool) -> BFormatDec {
    let ambicount = ambi_2d_channels_from_order(decoder.order);
    let scales = scales_for(decoder.scaling);
    info.ambi_order = decoder.order;
    info.dry = MixParams {
        ambi_map: FROM_ACN_2D_INDEX[..ambicount]
            .iter()
            .map(|&acn| BFChannelConfig {
                scale: 1.0 / scales[acn as usize],
                index: acn as usize,
            })
            .collect(),
    };
    info.dry_is_real = false;

    let dual_band = hq && !decoder.coeffs_lf.is_empty();
    let num_outputs = info.real_out.num_channels;
    let mut coeffs: Vec<ChannelDec> = vec![[0.0; MAX_AMBI_CHANNELS]; num_outputs];
    let mut coeffs_lf: Vec<ChannelDec> = Vec::new();
    if dual_band {
        coeffs_lf = vec![[0.0; MAX_AMBI_CHANNELS]; num_outputs];
    }
    for (i, &chan) in decoder.channels.iter().enumerate() {
        let Some(idx) = info.real_out.index_of(chan) else {
            log::error!("Failed to look up {} channel for the decoder", chan.label());
            continue;
        };
        for ambichan in 0..ambicount {
            let order = ORDER_FROM_2D_CHANNEL[ambichan] as usize;
            coeffs[idx][ambichan] = decoder.coeffs[i][ambichan] * decoder.order_gain[order];
            if dual_band {
                coeffs_lf[idx][ambichan] = decoder.coeffs_lf[i][ambichan] * decoder.order_gain_lf[order];
            }
        }
    }

    // The stabilizer only helps decoders that leave the centre speaker
    // silent.
    let mut stablizer = None;
    if stablize {
        let has_fc = info.real_out.index_of(FC).is_some_and(|c| {
            coeffs[c].iter().any(|&v| v != 0.0) || coeffs_lf.get(c).is_some_and(|row| row.iter().any(|&v| v != 0.0))
        });
        if has_fc {
            log::debug!("Decoder feeds the front-centre speaker; front stabilizer not used");
        } else {
            stablizer = Some(Box::new(FrontStablizer::new(num_outputs, info.frequency)));
            log::info!("Front stabilizer enabled");
        }
    }

    log::debug!(
        "Enabling {}-band {}-order{} ambisonic decoder",
        if dual_band { "dual" } else { "single" },
        match decoder.order {
            0 => "zeroth",
            1 => "first",
            2 => "second",
            _ => "third",
        },
        if matches!(decoder.scaling, AmbiScaling::FuMa) { " FuMa" } else { "" }
    );
    BFormatDec::new(
        ambicount,
        &coeffs,
        &coeffs_lf,
        info.xover_freq / info.frequency as f32,
        stablizer,
    )
}

fn init_ambi3d(info: &mut DeviceInfo, config: &DeviceConfig) {
    let order = (config.ambi_order as usize).clamp(1, MAX_AMBI_ORDER);
    info.ambi_order = order;
    info.dry = MixParams::acn_identity(ambi_channels_from_order(order));
    info.dry_is_real = true;
    info.render_mode = user_render_mode(config, RenderMode::Normal);
    init_near_field(info, config, control_distance(config), order, true);
}

fn init_uhj(info: &mut DeviceInfo) {
    let count = ambi_2d_channels_from_order(1);
    info.ambi_order = 1;
    info.dry = MixParams {
        ambi_map: FROM_FUMA_INDEX[..count]
            .iter()
            .map(|&acn| BFChannelConfig {
                scale: 1.0 / FROM_UHJ[acn as usize],
                index: acn as usize,
            })
            .collect(),
    };
    info.dry_is_real = false;
    info.uhj_encoder = true;
}

fn init_hrtf(info: &mut DeviceInfo, config: &DeviceConfig, store: Arc<HrtfStore>) -> PostProcess {
    let mut ir_size = store.ir_size();
    if let Some(size) = config.hrtf_size.map(|s| s as usize) {
        if size > 0 && size < ir_size {
            ir_size = size.max(MIN_IR_LENGTH);
        }
    }

    // Full rendering filters each source on its own, so the dry bus only
    // needs first order for what is left (effects, ambisonic sources).
    let order = match config.hrtf_mode {
        HrtfMode::Full => {
            info.render_mode = RenderMode::Hrtf;
            1
        }
        HrtfMode::Ambi1 => 1,
        HrtfMode::Ambi2 | HrtfMode::Ambi3 => 2,
    };
    info.xover_freq = HRTF_XOVER_FREQ;
    info.ambi_order = order;
    info.dry = MixParams::acn_identity(ambi_channels_from_order(order));
    info.dry_is_real = false;
    info.ir_size = ir_size;

    let state = build_bformat_hrtf(&store, order, ir_size);
    log::info!(
        "HRTF enabled: {:?} mode, order {}, {} sample IRs",
        config.hrtf_mode,
        order,
        ir_size
    );
    init_near_field(info, config, store.reference_distance(), order, true);
    info.hrtf = Some(store);
    PostProcess::Hrtf(Box::new(HrtfDecode {
        state,
        temp: vec![0.0; BUFFER_LINE_SIZE],
    }))
}

/// Sets up the speaker-distance term of the voices' NFC filters.
fn init_near_field(info: &mut DeviceInfo, config: &DeviceConfig, ctrl_dist: f32, order: usize, is_3d: bool) {
    const CHANS_PER_ORDER_2D: [usize; MAX_AMBI_ORDER + 1] = [1, 2, 2, 2];
    const CHANS_PER_ORDER_3D: [usize; MAX_AMBI_ORDER + 1] = [1, 3, 5, 7];
    if !config.nfc || ctrl_dist.is_nan() || ctrl_dist <= 0.0 {
        return;
    }
    info.avg_speaker_dist = ctrl_dist.clamp(0.1, 10.0);
    let w1 = SPEED_OF_SOUND_METERS_PER_SEC / (info.avg_speaker_dist * info.frequency as f32);
    info.nfc_filter.init(w1);

    let per_order = if is_3d { &CHANS_PER_ORDER_3D } else { &CHANS_PER_ORDER_2D };
    for (o, count) in info.num_channels_per_order.iter_mut().enumerate() {
        *count = if o <= order { per_order[o] } else { 0 };
    }
    log::debug!("NFC enabled at {:.3}m", info.avg_speaker_dist);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambisonic::FROM_FUMA;
    use crate::audio::new_lines;

    fn setup(config: &DeviceConfig, hrtf: Option<Arc<HrtfStore>>) -> (DeviceInfo, PostProcess) {
        let mut info = DeviceInfo::from_config(config);
        let post = init_renderer(&mut info, config, hrtf);
        (info, post)
    }

    fn config(channels: DevChannels) -> DeviceConfig {
        DeviceConfig {
            frequency: 48000,
            channels,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn stereo_uses_a_first_order_pairwise_decoder() {
        let (info, post) = setup(&config(DevChannels::Stereo), None);
        assert_eq!(info.ambi_order, 1);
        assert_eq!(info.dry.num_channels(), 3);
        assert_eq!(info.render_mode, RenderMode::Pairwise);
        assert_eq!(info.remix.len(), STEREO_DOWNMIX.len());
        assert!(matches!(post, PostProcess::AmbiDec(_)));
    }

    #[test]
    fn front_signal_decodes_equally_to_both_speakers() {
        let (info, mut post) = setup(&config(DevChannels::Stereo), None);
        let mut dry = new_lines(info.dry.num_channels());
        // W only.
        dry[0][..64].fill(1.0);
        let mut real = new_lines(2);
        let mut accum = vec![[0.0f32; 2]; 16];
        post.process(&info, &dry, &mut real, &mut accum, 64);
        assert!((real[0][10] - 0.5).abs() < 1e-6, "left {}", real[0][10]);
        assert_eq!(real[0][10], real[1][10]);
    }

    #[test]
    fn surround_layouts_pick_their_decoder_order() {
        for (channels, order, dry) in [
            (DevChannels::Mono, 0, 1),
            (DevChannels::Quad, 2, 5),
            (DevChannels::Surround51, 2, 5),
            (DevChannels::Surround61, 2, 5),
            (DevChannels::Surround71, 3, 7),
        ] {
            let (info, post) = setup(&config(channels), None);
            assert_eq!(info.ambi_order, order, "{:?}", channels);
            assert_eq!(info.dry.num_channels(), dry, "{:?}", channels);
            assert_eq!(info.real_out.num_channels, channels.count(1));
            assert!(matches!(post, PostProcess::AmbiDec(_)));
        }
    }

    #[test]
    fn surround51_bus_carries_fuma_scaling() {
        let (info, _) = setup(&config(DevChannels::Surround51), None);
        assert!((info.dry.ambi_map[0].scale - 1.0 / FROM_FUMA[0]).abs() < 1e-6);
        assert_eq!(info.dry.ambi_map[2].index, 3);
    }

    #[test]
    fn stabilizer_needs_a_silent_centre_row() {
        let mut cfg = config(DevChannels::Surround51);
        cfg.front_stablizer = true;
        let (_, post) = setup(&cfg, None);
        assert_eq!(post.name(), "ambisonic decode");

        let mut cfg = config(DevChannels::Surround71);
        cfg.front_stablizer = true;
        let (_, post) = setup(&cfg, None);
        assert_eq!(post.name(), "ambisonic decode (stabilized)");
    }

    #[test]
    fn uhj_drops_the_stereo_downmix() {
        let mut cfg = config(DevChannels::Stereo);
        cfg.stereo_encoding = StereoEncoding::Uhj;
        let (info, post) = setup(&cfg, None);
        assert!(info.uhj_encoder);
        assert!(info.remix.is_empty());
        assert_eq!(info.dry.ambi_map.iter().map(|m| m.index).collect::<Vec<_>>(), vec![0, 3, 1]);
        assert!(matches!(post, PostProcess::Uhj(_)));
    }

    #[test]
    fn crossfeed_level_enables_bs2b() {
        let mut cfg = config(DevChannels::Stereo);
        cfg.cf_level = 3;
        let (_, post) = setup(&cfg, None);
        assert!(matches!(post, PostProcess::Bs2b { .. }));
    }

    #[test]
    fn hrtf_falls_back_without_data() {
        let mut cfg = config(DevChannels::Stereo);
        cfg.stereo_encoding = StereoEncoding::Hrtf;
        let (info, post) = setup(&cfg, None);
        assert!(info.hrtf.is_none());
        assert!(matches!(post, PostProcess::AmbiDec(_)));
    }

    #[test]
    fn hrtf_full_mode_renders_sources_directly() {
        let mut cfg = config(DevChannels::Stereo);
        cfg.stereo_encoding = StereoEncoding::Hrtf;
        cfg.hrtf_size = Some(4);
        let store = HrtfStore::synthetic(48000).unwrap();
        let (info, post) = setup(&cfg, Some(store.clone()));
        assert_eq!(info.render_mode, RenderMode::Hrtf);
        assert_eq!(info.dry.num_channels(), 4);
        assert_eq!(info.xover_freq, HRTF_XOVER_FREQ);
        assert_eq!(info.ir_size, MIN_IR_LENGTH);
        assert!(matches!(post, PostProcess::Hrtf(_)));

        cfg.hrtf_mode = HrtfMode::Ambi2;
        let (info, _) = setup(&cfg, Some(store));
        assert_eq!(info.render_mode, RenderMode::Normal);
        assert_eq!(info.dry.num_channels(), 9);
    }

    #[test]
    fn ambi3d_output_is_the_dry_bus() {
        let mut cfg = config(DevChannels::Ambi3d);
        cfg.ambi_order = 2;
        cfg.nfc = true;
        cfg.nfc_ref_distance = 1.5;
        let (info, post) = setup(&cfg, None);
        assert!(info.dry_is_real);
        assert_eq!(info.dry.num_channels(), 9);
        assert_eq!(info.real_out.num_channels, 9);
        assert!(matches!(post, PostProcess::None));
        assert_eq!(info.avg_speaker_dist, 1.5);
        assert_eq!(info.num_channels_per_order, [1, 3, 5, 0]);
    }

    #[test]
    fn nfc_needs_a_distance() {
        let mut cfg = config(DevChannels::Quad);
        cfg.nfc = true;
        let (info, _) = setup(&cfg, None);
        assert_eq!(info.avg_speaker_dist, 0.0);

        cfg.speaker_distances = Some(vec![1.0, 2.0, 0.0, 3.0]);
        let (info, _) = setup(&cfg, None);
        assert!((info.avg_speaker_dist - 2.0).abs() < 1e-6);
        assert_eq!(info.num_channels_per_order, [1, 2, 2, 0]);
    }
}
