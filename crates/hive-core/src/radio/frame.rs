//! Wire format of one relay frame.
//!
//! ```text
//! [seq:4 LE][marker:1][count:1][record:6]*count
//! record = [bus_id][address][humidity lo][humidity hi][temperature lo][temperature hi]
//! ```
//!
//! All multi-byte fields are little-endian. Validity is decided by length
//! alone: the frame must hold the preamble and exactly `count` records, and
//! must fit into [`MAX_FRAME_LEN`]. The marker is reserved for protocol
//! versioning and is not checked on receive.

use alloc::vec::Vec;

use thiserror_no_std::Error;

use crate::sensors::{RawValues, ReadingBatch, SensorId, SensorReading};

pub const PREAMBLE_LEN: usize = 6;
pub const RECORD_LEN: usize = 6;
pub const MAX_FRAME_LEN: usize = 128;
pub const MAX_RECORDS: usize = (MAX_FRAME_LEN - PREAMBLE_LEN) / RECORD_LEN;
pub const MARKER: u8 = 1;

pub type FrameBuffer = heapless::Vec<u8, MAX_FRAME_LEN>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("batch of {count} readings exceeds the {max} records a frame can carry")]
    TooManyReadings { count: usize, max: usize },
    #[error("frame of {len} bytes is shorter than the preamble")]
    TooShort { len: usize },
    #[error("frame of {len} bytes does not match its record count {count}")]
    LengthMismatch { len: usize, count: usize },
    #[error("record count {count} exceeds the frame budget")]
    Oversized { count: usize },
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sequence: u32,
    pub readings: ReadingBatch,
}

/// Encode `batch` under sequence number `sequence`.
///
/// A batch that does not fit is rejected as a whole; nothing is truncated.
pub fn encode(sequence: u32, batch: &[SensorReading]) -> Result<FrameBuffer, FrameError> {
    if batch.len() > MAX_RECORDS {
        return Err(FrameError::TooManyReadings {
            count: batch.len(),
            max: MAX_RECORDS,
        });
    }

    let mut frame = FrameBuffer::new();
    // Capacity is checked above, the pushes cannot overflow
    let _ = frame.extend_from_slice(&sequence.to_le_bytes());
    let _ = frame.push(MARKER);
    let _ = frame.push(batch.len() as u8);
    for reading in batch {
        let _ = frame.push(reading.bus_id);
        let _ = frame.push(reading.address);
        let _ = frame.extend_from_slice(&reading.raw_humidity.to_le_bytes());
        let _ = frame.extend_from_slice(&reading.raw_temperature.to_le_bytes());
    }
    Ok(frame)
}

/// Check that `bytes` is a well-formed frame and return its record count.
pub fn validate(bytes: &[u8]) -> Result<usize, FrameError> {
    let len = bytes.len();
    if len < PREAMBLE_LEN {
        return Err(FrameError::TooShort { len });
    }
    let count = bytes[5] as usize;
    if PREAMBLE_LEN + count * RECORD_LEN > MAX_FRAME_LEN {
        return Err(FrameError::Oversized { count });
    }
    if len != PREAMBLE_LEN + count * RECORD_LEN {
        return Err(FrameError::LengthMismatch { len, count });
    }
    Ok(count)
}

/// Validate and decode `bytes`, reconstructing engineering values from the
/// raw words.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let count = validate(bytes)?;
    let sequence = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    let mut readings = Vec::with_capacity(count);
    for record in bytes[PREAMBLE_LEN..].chunks_exact(RECORD_LEN) {
        let sensor = SensorId::new(record[0], record[1]);
        let raw = RawValues {
            humidity: u16::from_le_bytes([record[2], record[3]]),
            temperature: u16::from_le_bytes([record[4], record[5]]),
        };
        readings.push(SensorReading::from_raw(sensor, raw));
    }

    Ok(Frame { sequence, readings })
}
