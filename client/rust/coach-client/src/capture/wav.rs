//! Streaming WAV container for captured audio: mono, 32-bit IEEE float.
//!
//! The header is written before the length is known, with every size field
//! set to `0xFFFFFFFF`. `repair` stamps the real sizes once recording ends.

use crate::error::{ClientError, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use bytes::Bytes;
use std::time::Duration;

pub const HEADER_LEN: usize = 58;
const UNKNOWN_SIZE: u32 = u32::MAX;
const FORMAT_IEEE_FLOAT: u16 = 3;
const BYTES_PER_SAMPLE: usize = 4;

const RIFF_SIZE_AT: usize = 4;
const SAMPLE_RATE_AT: usize = 24;
const FACT_LEN_AT: usize = 46;
const DATA_SIZE_AT: usize = 54;

pub fn streaming_header(sample_rate_hz: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(HEADER_LEN);
    // Writes into a Vec cannot fail.
    let _ = write_header(&mut h, sample_rate_hz);
    h
}

fn write_header(h: &mut Vec<u8>, sample_rate_hz: u32) -> std::io::Result<()> {
    h.extend_from_slice(b"RIFF");
    h.write_u32::<LittleEndian>(UNKNOWN_SIZE)?;
    h.extend_from_slice(b"WAVE");
    h.extend_from_slice(b"fmt ");
    h.write_u32::<LittleEndian>(18)?;
    h.write_u16::<LittleEndian>(FORMAT_IEEE_FLOAT)?;
    h.write_u16::<LittleEndian>(1)?;
    h.write_u32::<LittleEndian>(sample_rate_hz)?;
    h.write_u32::<LittleEndian>(sample_rate_hz * BYTES_PER_SAMPLE as u32)?;
    h.write_u16::<LittleEndian>(BYTES_PER_SAMPLE as u16)?;
    h.write_u16::<LittleEndian>(32)?;
    h.write_u16::<LittleEndian>(0)?;
    h.extend_from_slice(b"fact");
    h.write_u32::<LittleEndian>(4)?;
    h.write_u32::<LittleEndian>(UNKNOWN_SIZE)?;
    h.extend_from_slice(b"data");
    h.write_u32::<LittleEndian>(UNKNOWN_SIZE)?;
    Ok(())
}

pub fn append_samples(buf: &mut Vec<u8>, samples: &[f32]) {
    let start = buf.len();
    buf.resize(start + samples.len() * BYTES_PER_SAMPLE, 0);
    LittleEndian::write_f32_into(samples, &mut buf[start..]);
}

/// Stamps size metadata from the recorded wall-clock `duration`.
///
/// The sample count is the smaller of what the data holds and what the
/// duration implies; trailing samples beyond the duration are cut.
pub fn repair(raw: &[u8], duration: Duration) -> Result<Bytes> {
    if raw.len() < HEADER_LEN
        || &raw[0..4] != b"RIFF"
        || &raw[8..12] != b"WAVE"
        || &raw[50..54] != b"data"
    {
        return Err(ClientError::Protocol("not a streaming wav container".to_string()));
    }
    let sample_rate_hz = LittleEndian::read_u32(&raw[SAMPLE_RATE_AT..]);
    if sample_rate_hz == 0 {
        return Err(ClientError::Protocol("wav header has no sample rate".to_string()));
    }
    let available = (raw.len() - HEADER_LEN) / BYTES_PER_SAMPLE;
    let expected = (duration.as_secs_f64() * f64::from(sample_rate_hz)).round() as usize;
    let frames = available.min(expected);
    let data_len = frames * BYTES_PER_SAMPLE;
    let data_len_u32 = u32::try_from(data_len)
        .ok()
        .filter(|n| *n <= u32::MAX - (HEADER_LEN as u32 - 8))
        .ok_or_else(|| ClientError::Protocol("recording too long for wav".to_string()))?;

    let mut out = raw[..HEADER_LEN + data_len].to_vec();
    LittleEndian::write_u32(&mut out[RIFF_SIZE_AT..], HEADER_LEN as u32 - 8 + data_len_u32);
    LittleEndian::write_u32(&mut out[FACT_LEN_AT..], frames as u32);
    LittleEndian::write_u32(&mut out[DATA_SIZE_AT..], data_len_u32);
    Ok(Bytes::from(out))
}
