//! Wire formats shared by both ends of the channel.
//!
//! Control messages travel host -> coprocessor, frames travel the other way.
//! Everything is little-endian and every field access goes through a
//! bounds-checked cursor.

use thiserror::Error;

use crate::{LANES, MAX_PAYLOAD};

/// Sentinel that marks a control message as ours rather than channel noise
pub const COMMAND_MAGIC: u16 = 0xbeef;
/// magic + kind
pub const HEADER_LEN: usize = 4;
/// Header plus the start configuration body
pub const START_LEN: usize = HEADER_LEN + 4 + 4 + LANES + 4 + 4 + 4;
/// record_count + dropped_count
pub const FRAME_HEADER_LEN: usize = 4;
/// Channel map entry for a lane that was not requested
pub const UNUSED_LANE: u8 = 0xff;
/// Deepest hardware averaging the converter supports (2^4 = 16 samples)
pub const MAX_AVERAGING_EXPONENT: u32 = 4;
/// `dropped_count` value meaning "lost an unknown number of sample sets"
pub const DROPPED_SATURATED: u16 = u16::MAX;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("needed {needed} bytes at offset {offset}, buffer holds {len}")]
    OutOfBounds {
        offset: usize,
        needed: usize,
        len: usize,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("channel count {0} is outside 1..=8")]
    ChannelCount(u32),
    #[error("lane {0} does not exist")]
    InvalidLane(u8),
    #[error("lane {0} requested more than once")]
    DuplicateLane(u8),
    #[error("unused channel map entry {index} holds {lane:#04x}")]
    UnusedLane { index: usize, lane: u8 },
    #[error("averaging exponent {0} is larger than 4")]
    Averaging(u32),
    #[error("peripheral refused the configuration")]
    Rejected,
}

/// Writes fields sequentially into a byte buffer
pub struct WireWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self::at(buf, 0)
    }

    /// Start writing at `pos` instead of the beginning of `buf`
    pub fn at(buf: &'a mut [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = self.buf.len();
        let end = self.pos + bytes.len();
        let dst = self
            .buf
            .get_mut(self.pos..end)
            .ok_or(WireError::OutOfBounds {
                offset: self.pos,
                needed: bytes.len(),
                len,
            })?;
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), WireError> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), WireError> {
        self.put_bytes(&v.to_le_bytes())
    }
}

/// Reads fields sequentially out of a byte buffer
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let src = self
            .buf
            .get(self.pos..self.pos + N)
            .ok_or(WireError::OutOfBounds {
                offset: self.pos,
                needed: N,
                len: self.buf.len(),
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(src);
        self.pos += N;
        Ok(out)
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        self.get_array().map(u16::from_le_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        self.get_array().map(u32::from_le_bytes)
    }
}

#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Start = 1,
    Stop = 2,
    Ack = 3,
}

impl CommandKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Start),
            2 => Some(Self::Stop),
            3 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Everything the coprocessor needs to begin a capture session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartConfig {
    /// ADC clock divider, 0 is the fastest conversion rate
    pub clock_divider: u32,
    pub channel_count: u32,
    /// Physical lanes in output order, unused entries hold [`UNUSED_LANE`]
    pub channel_map: [u8; LANES],
    /// Hardware averages 2^n conversions per result, 0 disables averaging
    pub averaging_exponent: u32,
    /// Caps records per frame independently of the byte size, 0 is no cap
    pub max_records_per_frame: u32,
    /// Minimum cycle ticks between two accepted sample sets
    pub min_cycle_gap: u32,
}

impl StartConfig {
    /// Capture `channels` (physical lane numbers, in output order) as fast as
    /// possible
    pub fn new(channels: &[u8]) -> Self {
        let mut channel_map = [UNUSED_LANE; LANES];
        for (dst, src) in channel_map.iter_mut().zip(channels) {
            *dst = *src;
        }
        Self {
            clock_divider: 0,
            channel_count: channels.len() as u32,
            channel_map,
            averaging_exponent: 0,
            max_records_per_frame: 0,
            min_cycle_gap: 0,
        }
    }

    pub fn with_clock_divider(mut self, clock_divider: u32) -> Self {
        self.clock_divider = clock_divider;
        self
    }

    pub fn with_averaging(mut self, exponent: u32) -> Self {
        self.averaging_exponent = exponent;
        self
    }

    pub fn with_max_records(mut self, max_records: u32) -> Self {
        self.max_records_per_frame = max_records;
        self
    }

    pub fn with_min_cycle_gap(mut self, gap: u32) -> Self {
        self.min_cycle_gap = gap;
        self
    }

    pub fn channel_count(&self) -> usize {
        (self.channel_count as usize).min(LANES)
    }

    /// The requested lanes, in output order
    pub fn channels(&self) -> &[u8] {
        &self.channel_map[..self.channel_count()]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_count == 0 || self.channel_count as usize > LANES {
            return Err(ConfigError::ChannelCount(self.channel_count));
        }
        let mut seen = [false; LANES];
        for &lane in self.channels() {
            let idx = lane as usize;
            if idx >= LANES {
                return Err(ConfigError::InvalidLane(lane));
            }
            if seen[idx] {
                return Err(ConfigError::DuplicateLane(lane));
            }
            seen[idx] = true;
        }
        for (index, &lane) in self.channel_map.iter().enumerate().skip(self.channel_count()) {
            if lane != UNUSED_LANE {
                return Err(ConfigError::UnusedLane { index, lane });
            }
        }
        if self.averaging_exponent > MAX_AVERAGING_EXPONENT {
            return Err(ConfigError::Averaging(self.averaging_exponent));
        }
        Ok(())
    }

    /// Records in every frame this session delivers
    pub fn records_per_frame(&self) -> usize {
        records_per_frame(self.channel_count(), self.max_records_per_frame)
    }

    /// Byte size of every frame this session delivers
    pub fn frame_len(&self) -> usize {
        frame_len(self.channel_count(), self.records_per_frame())
    }

    fn encode_body(&self, w: &mut WireWriter<'_>) -> Result<(), WireError> {
        w.put_u32(self.clock_divider)?;
        w.put_u32(self.channel_count)?;
        w.put_bytes(&self.channel_map)?;
        w.put_u32(self.averaging_exponent)?;
        w.put_u32(self.max_records_per_frame)?;
        w.put_u32(self.min_cycle_gap)
    }

    fn decode_body(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            clock_divider: r.get_u32()?,
            channel_count: r.get_u32()?,
            channel_map: r.get_array()?,
            averaging_exponent: r.get_u32()?,
            max_records_per_frame: r.get_u32()?,
            min_cycle_gap: r.get_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Start(StartConfig),
    Stop,
    Ack,
}

impl ControlMessage {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Start(_) => CommandKind::Start,
            Self::Stop => CommandKind::Stop,
            Self::Ack => CommandKind::Ack,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Start(_) => START_LEN,
            _ => HEADER_LEN,
        }
    }

    /// Serialize into `buf`, returning the number of bytes written
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        let mut w = WireWriter::new(buf);
        w.put_u16(COMMAND_MAGIC)?;
        w.put_u16(self.kind() as u16)?;
        if let Self::Start(config) = self {
            config.encode_body(&mut w)?;
        }
        Ok(w.position())
    }

    /// Parse a received message. Anything that isn't one of ours (short,
    /// wrong magic, unknown kind, truncated start body) yields `None`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = WireReader::new(bytes);
        if r.get_u16().ok()? != COMMAND_MAGIC {
            return None;
        }
        match CommandKind::from_u16(r.get_u16().ok()?)? {
            CommandKind::Start => StartConfig::decode_body(&mut r).ok().map(Self::Start),
            CommandKind::Stop => Some(Self::Stop),
            CommandKind::Ack => Some(Self::Ack),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub record_count: u16,
    pub dropped_count: u16,
}

impl FrameHeader {
    pub fn write(&self, buf: &mut [u8]) -> Result<(), WireError> {
        let mut w = WireWriter::new(buf);
        w.put_u16(self.record_count)?;
        w.put_u16(self.dropped_count)
    }

    pub fn read(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(buf);
        Ok(Self {
            record_count: r.get_u16()?,
            dropped_count: r.get_u16()?,
        })
    }
}

/// Bytes taken by one record: elapsed cycles plus one code per channel
pub const fn record_len(channel_count: usize) -> usize {
    4 + 2 * channel_count
}

/// How many records fit in one frame, honoring an optional record cap
pub fn records_per_frame(channel_count: usize, max_records: u32) -> usize {
    let fit = (MAX_PAYLOAD - FRAME_HEADER_LEN) / record_len(channel_count);
    if max_records == 0 {
        fit
    } else {
        fit.min(max_records as usize)
    }
}

pub fn frame_len(channel_count: usize, records: usize) -> usize {
    FRAME_HEADER_LEN + records * record_len(channel_count)
}

/// Append one record at `offset`, returning the offset past it
pub fn write_record(
    buf: &mut [u8],
    offset: usize,
    elapsed_cycles: u32,
    samples: &[u16],
) -> Result<usize, WireError> {
    let mut w = WireWriter::at(buf, offset);
    w.put_u32(elapsed_cycles)?;
    for &s in samples {
        w.put_u16(s)?;
    }
    Ok(w.position())
}

/// Borrowed view over a received frame
#[derive(Clone, Copy, Debug)]
pub struct FrameView<'a> {
    header: FrameHeader,
    channel_count: usize,
    body: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// Check that `bytes` holds the header and every record it declares
    pub fn parse(bytes: &'a [u8], channel_count: usize) -> Result<Self, WireError> {
        let header = FrameHeader::read(bytes)?;
        let needed = frame_len(channel_count, header.record_count as usize);
        let body = bytes
            .get(FRAME_HEADER_LEN..needed)
            .ok_or(WireError::OutOfBounds {
                offset: 0,
                needed,
                len: bytes.len(),
            })?;
        Ok(Self {
            header,
            channel_count,
            body,
        })
    }

    pub fn header(&self) -> FrameHeader {
        self.header
    }

    pub fn record_count(&self) -> usize {
        self.header.record_count as usize
    }

    pub fn dropped_count(&self) -> u16 {
        self.header.dropped_count
    }

    pub fn records(&self) -> impl Iterator<Item = RecordView<'a>> + 'a {
        self.body
            .chunks_exact(record_len(self.channel_count))
            .map(|bytes| RecordView { bytes })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RecordView<'a> {
    bytes: &'a [u8],
}

impl<'a> RecordView<'a> {
    pub fn elapsed_cycles(&self) -> u32 {
        u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    pub fn samples(&self) -> impl Iterator<Item = u16> + 'a {
        self.bytes[4..]
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }
}
