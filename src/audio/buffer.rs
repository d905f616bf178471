use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{MixerError, Result};

static NEXT_BUFFER_ID: AtomicU32 = AtomicU32::new(1);

/// Storage format of buffer samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    I16,
    F32,
    F64,
    Mulaw,
    Alaw,
}

impl SampleType {
    pub fn bytes(self) -> usize {
        match self {
            SampleType::U8 | SampleType::Mulaw | SampleType::Alaw => 1,
            SampleType::I16 => 2,
            SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Rear,
    Quad,
    X51,
    X61,
    X71,
    BFormat2D,
    BFormat3D,
    Uhj2,
    Uhj3,
    Uhj4,
    SuperStereo,
}

impl ChannelLayout {
    /// Number of stored channels for the layout.
    pub fn channel_count(self, ambi_order: u32) -> usize {
        let order = ambi_order as usize;
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo | ChannelLayout::Rear => 2,
            ChannelLayout::Quad => 4,
            ChannelLayout::X51 => 6,
            ChannelLayout::X61 => 7,
            ChannelLayout::X71 => 8,
            ChannelLayout::BFormat2D => order * 2 + 1,
            ChannelLayout::BFormat3D => (order + 1) * (order + 1),
            ChannelLayout::Uhj2 | ChannelLayout::SuperStereo => 2,
            ChannelLayout::Uhj3 => 3,
            ChannelLayout::Uhj4 => 4,
        }
    }

    pub fn is_bformat(self) -> bool {
        matches!(self, ChannelLayout::BFormat2D | ChannelLayout::BFormat3D)
    }

    pub fn is_uhj(self) -> bool {
        matches!(
            self,
            ChannelLayout::Uhj2 | ChannelLayout::Uhj3 | ChannelLayout::Uhj4 | ChannelLayout::SuperStereo
        )
    }

    /// Layouts rendered through the ambisonic path (after any UHJ decode).
    pub fn is_ambisonic(self) -> bool {
        self.is_bformat() || self.is_uhj()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbiLayout {
    FuMa,
    Acn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbiScaling {
    FuMa,
    Sn3d,
    N3d,
    Uhj,
}

/// Pull-style sample source. `fill` writes up to `dst.len()` bytes in the
/// buffer's storage format and returns the byte count written; a negative
/// return marks the end of the stream.
pub trait BufferCallback: Send {
    fn fill(&mut self, dst: &mut [u8]) -> isize;
}

pub(crate) enum BufferData {
    Static(Box<[u8]>),
    Callback(Mutex<Box<dyn BufferCallback>>),
}

/// Immutable PCM data (or a callback producing it) plus its format.
pub struct Buffer {
    id: u32,
    frequency: u32,
    sample_type: SampleType,
    layout: ChannelLayout,
    ambi_layout: AmbiLayout,
    ambi_scaling: AmbiScaling,
    ambi_order: u32,
    sample_len: u32,
    loop_start: u32,
    loop_end: u32,
    pub(crate) data: BufferData,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("frequency", &self.frequency)
            .field("sample_type", &self.sample_type)
            .field("layout", &self.layout)
            .field("sample_len", &self.sample_len)
            .field("loop_start", &self.loop_start)
            .field("loop_end", &self.loop_end)
            .finish()
    }
}

impl Buffer {
    /// Creates a static buffer from raw interleaved bytes.
    pub fn new(
        frequency: u32,
        sample_type: SampleType,
        layout: ChannelLayout,
        data: Vec<u8>,
    ) -> Result<Self> {
        if frequency == 0 {
            return Err(MixerError::InvalidValue("buffer frequency must be positive".into()));
        }
        let frame_size = layout.channel_count(1) * sample_type.bytes();
        if data.len() % frame_size != 0 {
            return Err(MixerError::InvalidValue(format!(
                "data size {} is not a multiple of the frame size {}",
                data.len(),
                frame_size
            )));
        }
        let sample_len = (data.len() / frame_size) as u32;
        Ok(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            frequency,
            sample_type,
            layout,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::Sn3d,
            ambi_order: 1,
            sample_len,
            loop_start: 0,
            loop_end: sample_len,
            data: BufferData::Static(data.into_boxed_slice()),
        })
    }

    /// Creates a B-Format buffer with an explicit order, layout and scaling.
    pub fn new_ambisonic(
        frequency: u32,
        sample_type: SampleType,
        layout: ChannelLayout,
        order: u32,
        ambi_layout: AmbiLayout,
        ambi_scaling: AmbiScaling,
        data: Vec<u8>,
    ) -> Result<Self> {
        if !(1..=3).contains(&order) {
            return Err(MixerError::InvalidValue(format!("ambisonic order {} out of range", order)));
        }
        if (ambi_layout == AmbiLayout::FuMa || ambi_scaling == AmbiScaling::FuMa) && order > 3 {
            return Err(MixerError::InvalidValue("FuMa only supports up to third order".into()));
        }
        if !layout.is_bformat() {
            return Err(MixerError::InvalidEnum(format!("{:?} is not a B-Format layout", layout)));
        }
        let frame_size = layout.channel_count(order) * sample_type.bytes();
        if data.len() % frame_size != 0 {
            return Err(MixerError::InvalidValue(format!(
                "data size {} is not a multiple of the frame size {}",
                data.len(),
                frame_size
            )));
        }
        let sample_len = (data.len() / frame_size) as u32;
        Ok(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            frequency,
            sample_type,
            layout,
            ambi_layout,
            ambi_scaling,
            ambi_order: order,
            sample_len,
            loop_start: 0,
            loop_end: sample_len,
            data: BufferData::Static(data.into_boxed_slice()),
        })
    }

    pub fn from_f32(frequency: u32, layout: ChannelLayout, samples: &[f32]) -> Result<Self> {
        let bytes = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        Self::new(frequency, SampleType::F32, layout, bytes)
    }

    pub fn from_i16(frequency: u32, layout: ChannelLayout, samples: &[i16]) -> Result<Self> {
        let bytes = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        Self::new(frequency, SampleType::I16, layout, bytes)
    }

    /// Creates a callback buffer. Its samples are pulled while mixing.
    pub fn from_callback(
        frequency: u32,
        sample_type: SampleType,
        layout: ChannelLayout,
        callback: Box<dyn BufferCallback>,
    ) -> Result<Self> {
        if frequency == 0 {
            return Err(MixerError::InvalidValue("buffer frequency must be positive".into()));
        }
        Ok(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            frequency,
            sample_type,
            layout,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::Sn3d,
            ambi_order: 1,
            sample_len: 0,
            loop_start: 0,
            loop_end: 0,
            data: BufferData::Callback(Mutex::new(callback)),
        })
    }

    /// Loads a WAV file. The channel layout follows the file's channel count.
    pub fn from_wav(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_wav_reader(hound::WavReader::open(path.as_ref())?)
    }

    /// Loads WAV data held in memory.
    pub fn from_wav_bytes(data: &[u8]) -> Result<Self> {
        Self::from_wav_reader(hound::WavReader::new(Cursor::new(data))?)
    }

    fn from_wav_reader<R: Read>(mut reader: hound::WavReader<R>) -> Result<Self> {
        let spec = reader.spec();
        let layout = match spec.channels {
            1 => ChannelLayout::Mono,
            2 => ChannelLayout::Stereo,
            4 => ChannelLayout::Quad,
            6 => ChannelLayout::X51,
            7 => ChannelLayout::X61,
            8 => ChannelLayout::X71,
            n => {
                return Err(MixerError::Format(format!("unsupported WAV channel count {}", n)));
            }
        };
        match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, bits) if bits <= 16 => {
                let shift = 16 - bits as u32;
                let samples = reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| (v << shift) as i16))
                    .collect::<std::result::Result<Vec<i16>, _>>()?;
                Self::from_i16(spec.sample_rate, layout, &samples)
            }
            (hound::SampleFormat::Int, bits) => {
                let scale = 1.0 / (1u64 << (bits - 1)) as f32;
                let samples = reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<std::result::Result<Vec<f32>, _>>()?;
                Self::from_f32(spec.sample_rate, layout, &samples)
            }
            (hound::SampleFormat::Float, _) => {
                let samples = reader
                    .samples::<f32>()
                    .collect::<std::result::Result<Vec<f32>, _>>()?;
                Self::from_f32(spec.sample_rate, layout, &samples)
            }
        }
    }

    /// Sets the loop points. Requires `start < end <= sample_len`.
    pub fn with_loop_points(mut self, start: u32, end: u32) -> Result<Self> {
        if start >= end || end > self.sample_len {
            return Err(MixerError::InvalidValue(format!(
                "invalid loop points {}..{} for {} samples",
                start, end, self.sample_len
            )));
        }
        self.loop_start = start;
        self.loop_end = end;
        Ok(self)
    }

    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn frequency(&self) -> u32 {
        self.frequency
    }
    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }
    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }
    pub fn ambi_layout(&self) -> AmbiLayout {
        self.ambi_layout
    }
    pub fn ambi_scaling(&self) -> AmbiScaling {
        self.ambi_scaling
    }
    pub fn ambi_order(&self) -> u32 {
        self.ambi_order
    }
    pub fn sample_len(&self) -> u32 {
        self.sample_len
    }
    pub fn loop_start(&self) -> u32 {
        self.loop_start
    }
    pub fn loop_end(&self) -> u32 {
        self.loop_end
    }
    pub fn channel_count(&self) -> usize {
        self.layout.channel_count(self.ambi_order)
    }
    pub fn frame_size(&self) -> usize {
        self.channel_count() * self.sample_type.bytes()
    }
    pub fn is_callback(&self) -> bool {
        matches!(self.data, BufferData::Callback(_))
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match &self.data {
            BufferData::Static(data) => data,
            BufferData::Callback(_) => &[],
        }
    }

    /// Decodes all frames of one channel to float. Used off the render path
    /// (impulse response loading).
    pub fn channel_to_f32(&self, channel: usize) -> Vec<f32> {
        let mut out = vec![0.0; self.sample_len as usize];
        load_samples(
            &mut out,
            self.bytes(),
            channel,
            self.channel_count(),
            self.sample_type,
        );
        out
    }
}

/// A node in a source's buffer queue. Nodes are appended at the tail from the
/// app thread and only read by the mixer, so `next` is set at most once.
pub struct BufferQueueItem {
    pub buffer: Arc<Buffer>,
    next: OnceLock<Arc<BufferQueueItem>>,
}

impl BufferQueueItem {
    pub fn new(buffer: Arc<Buffer>) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            next: OnceLock::new(),
        })
    }

    pub fn next(&self) -> Option<&Arc<BufferQueueItem>> {
        self.next.get()
    }

    /// Links `item` after this node. Fails if the node already has a successor.
    pub fn set_next(&self, item: Arc<BufferQueueItem>) -> Result<()> {
        self.next
            .set(item)
            .map_err(|_| MixerError::InvalidOperation("queue item already linked".into()))
    }

    /// Builds a queue from a list of buffers, returning the head.
    pub fn chain(buffers: &[Arc<Buffer>]) -> Option<Arc<BufferQueueItem>> {
        let mut iter = buffers.iter().rev();
        let mut head = BufferQueueItem::new(iter.next()?.clone());
        for buffer in iter {
            let item = BufferQueueItem::new(buffer.clone());
            // A fresh node has no successor, so linking cannot fail.
            let _ = item.next.set(head);
            head = item;
        }
        Some(head)
    }

    /// Walks to the last node of the queue.
    pub fn tail(self: &Arc<Self>) -> Arc<BufferQueueItem> {
        let mut cur = self.clone();
        while let Some(next) = cur.next().cloned() {
            cur = next;
        }
        cur
    }
}

// --- Sample decoding ---

static MULAW_DECOMP: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (i, v) in table.iter_mut().enumerate() {
        let val = !(i as u8);
        let sign = val & 0x80;
        let exponent = ((val >> 4) & 0x07) as i32;
        let mantissa = (val & 0x0f) as i32;
        let sample = (((mantissa << 3) + 0x84) << exponent) - 0x84;
        *v = if sign != 0 { -sample } else { sample } as i16;
    }
    table
});

static ALAW_DECOMP: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (i, v) in table.iter_mut().enumerate() {
        let val = (i as u8) ^ 0x55;
        let sign = val & 0x80;
        let exponent = ((val & 0x70) >> 4) as i32;
        let mantissa = (val & 0x0f) as i32;
        let sample = if exponent == 0 {
            (mantissa << 4) + 8
        } else {
            ((mantissa << 4) + 0x108) << (exponent - 1)
        };
        *v = if sign != 0 { sample } else { -sample } as i16;
    }
    table
});

/// Decodes `dst.len()` frames of channel `chan` from interleaved `src`.
pub(crate) fn load_samples(
    dst: &mut [f32],
    src: &[u8],
    chan: usize,
    num_chans: usize,
    sample_type: SampleType,
) {
    let bytes = sample_type.bytes();
    let step = num_chans * bytes;
    let frames = dst.len().min(src.len() / step.max(1));
    let (dst, rest) = dst.split_at_mut(frames);
    rest.fill(0.0);
    for (i, out) in dst.iter_mut().enumerate() {
        let off = i * step + chan * bytes;
        let raw = &src[off..off + bytes];
        *out = match sample_type {
            SampleType::U8 => (raw[0] as f32 - 128.0) * (1.0 / 128.0),
            SampleType::I16 => i16::from_ne_bytes([raw[0], raw[1]]) as f32 * (1.0 / 32768.0),
            SampleType::F32 => f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
            SampleType::F64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                f64::from_ne_bytes(b) as f32
            }
            SampleType::Mulaw => MULAW_DECOMP[raw[0] as usize] as f32 * (1.0 / 32768.0),
            SampleType::Alaw => ALAW_DECOMP[raw[0] as usize] as f32 * (1.0 / 32768.0),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn i16_decodes_to_unit_range() {
        let buf = Buffer::from_i16(44100, ChannelLayout::Stereo, &[i16::MIN, 16384, 0, i16::MAX])
            .unwrap();
        assert_eq!(buf.sample_len(), 2);
        let left = buf.channel_to_f32(0);
        let right = buf.channel_to_f32(1);
        assert!((left[0] + 1.0).abs() < EPSILON);
        assert!((left[1]).abs() < EPSILON);
        assert!((right[0] - 0.5).abs() < EPSILON);
        assert!((right[1] - 32767.0 / 32768.0).abs() < EPSILON);
    }

    #[test]
    fn mulaw_and_alaw_silence_is_near_zero() {
        // 0xff is mu-law zero, 0xd5 is A-law's smallest positive step.
        assert_eq!(MULAW_DECOMP[0xff], 0);
        assert!(ALAW_DECOMP[0xd5].abs() <= 8);
        assert!(MULAW_DECOMP[0x00] < -30000);
        assert!(MULAW_DECOMP[0x80] > 30000);
    }

    #[test]
    fn loop_points_are_validated() {
        let buf = Buffer::from_f32(8000, ChannelLayout::Mono, &[0.0; 100]).unwrap();
        assert!(buf.with_loop_points(50, 10).is_err());
        let buf = Buffer::from_f32(8000, ChannelLayout::Mono, &[0.0; 100]).unwrap();
        assert!(buf.with_loop_points(0, 101).is_err());
        let buf = Buffer::from_f32(8000, ChannelLayout::Mono, &[0.0; 100]).unwrap();
        let buf = buf.with_loop_points(10, 100).unwrap();
        assert_eq!((buf.loop_start(), buf.loop_end()), (10, 100));
    }

    #[test]
    fn queue_chain_links_in_order() {
        let bufs: Vec<_> = (0..3)
            .map(|_| Arc::new(Buffer::from_f32(8000, ChannelLayout::Mono, &[0.0; 4]).unwrap()))
            .collect();
        let head = BufferQueueItem::chain(&bufs).unwrap();
        assert_eq!(head.buffer.id(), bufs[0].id());
        let second = head.next().unwrap();
        assert_eq!(second.buffer.id(), bufs[1].id());
        assert_eq!(head.tail().buffer.id(), bufs[2].id());
        assert!(head.tail().next().is_none());
    }

    #[test]
    fn short_source_zero_fills() {
        let src: Vec<u8> = [0.25f32, 0.5].iter().flat_map(|s| s.to_ne_bytes()).collect();
        let mut dst = [1.0f32; 4];
        load_samples(&mut dst, &src, 0, 1, SampleType::F32);
        assert_eq!(dst, [0.25, 0.5, 0.0, 0.0]);
    }
}
