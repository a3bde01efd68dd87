// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The on-wire event record: a CRC-protected frame with a duplicated size field at both ends,
//! so a reader can locate the last complete record from an arbitrary (possibly truncated)
//! suffix of the stream. See `RawEvent` for the in-memory shape and `write`/`try_parse` for the
//! codec itself.

use bytes::Bytes;

use crate::constants::{MAX_PAYLOAD_SIZE, PAYLOAD_WORD_SIZE, RECORD_OVERHEAD};
use crate::error::{Error, Result};

/// One event as it exists independent of any particular driver: a sequence number and an
/// opaque payload. `payload.len()` must be a multiple of 8 and strictly less than 512 KiB;
/// `sequence` must be nonzero (0 is reserved to mean "no sequence").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub sequence: u32,
    pub payload: Bytes,
}

impl RawEvent {
    pub fn new(sequence: u32, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if sequence == 0 {
            return Err(Error::InvalidPayload(
                "event sequence must be nonzero".into(),
            ));
        }
        validate_payload_len(payload.len())?;
        Ok(Self { sequence, payload })
    }

    /// Total size this event occupies on the wire, header and trailer included.
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload.len()
    }
}

fn validate_payload_len(len: usize) -> Result<()> {
    if len % PAYLOAD_WORD_SIZE != 0 {
        return Err(Error::InvalidPayload(format!(
            "payload length {len} is not a multiple of {PAYLOAD_WORD_SIZE}"
        )));
    }
    if len >= MAX_PAYLOAD_SIZE {
        return Err(Error::InvalidPayload(format!(
            "payload length {len} must be < {MAX_PAYLOAD_SIZE}"
        )));
    }
    Ok(())
}

/// Seeds a CRC-32/IEEE (reversed polynomial `0xEDB88320`) hasher on the event's key and folds
/// in only the payload bytes, per §9 "checksum seed = sequence".
fn crc_for(sequence: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(sequence);
    hasher.update(payload);
    hasher.finalize()
}

/// Encodes `event` into `buf`, appending rather than overwriting. Returns the number of bytes
/// written (`12 + payload.len()`).
pub fn write(buf: &mut Vec<u8>, event: &RawEvent) -> Result<usize> {
    validate_payload_len(event.payload.len())?;
    let n_words = (event.payload.len() / PAYLOAD_WORD_SIZE) as u16;
    let crc = crc_for(event.sequence, &event.payload);

    let start = buf.len();
    buf.extend_from_slice(&n_words.to_le_bytes());
    buf.extend_from_slice(&event.sequence.to_le_bytes());
    buf.extend_from_slice(&event.payload);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&n_words.to_le_bytes());
    Ok(buf.len() - start)
}

/// Attempts to parse one record from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` holds fewer bytes than a complete record needs (including the
/// case of fewer than 2 bytes, where the leading size cannot even be read). Returns
/// `Err(Error::Corruption)` if a complete record's leading/trailing sizes disagree or its CRC
/// does not match. The returned payload is a zero-copy slice of `buf`.
pub fn try_parse(buf: &Bytes) -> Result<Option<(RawEvent, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let n_words = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let payload_len = n_words * PAYLOAD_WORD_SIZE;
    let total_len = RECORD_OVERHEAD + payload_len;
    if buf.len() < total_len {
        return Ok(None);
    }

    let sequence = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
    let payload = buf.slice(6..6 + payload_len);
    let crc_offset = 6 + payload_len;
    let crc = u32::from_le_bytes([
        buf[crc_offset],
        buf[crc_offset + 1],
        buf[crc_offset + 2],
        buf[crc_offset + 3],
    ]);
    let trailer_offset = crc_offset + 4;
    let trailer_words = u16::from_le_bytes([buf[trailer_offset], buf[trailer_offset + 1]]);

    if trailer_words as usize != n_words {
        return Err(Error::Corruption(format!(
            "leading size {n_words} disagrees with trailing size {trailer_words}"
        )));
    }
    let expected_crc = crc_for(sequence, &payload);
    if expected_crc != crc {
        return Err(Error::Corruption(format!(
            "CRC mismatch for sequence {sequence}: expected {expected_crc:#010x}, got {crc:#010x}"
        )));
    }

    Ok(Some((RawEvent { sequence, payload }, total_len)))
}

/// Extracts the sequence of the last complete record ending at the end of `tail`, where `tail`
/// is assumed to be a suffix of a valid stream (typically the last `MAX_EVENT_FOOTPRINT` bytes,
/// or the whole stream if shorter). Returns 0 for an empty stream. Mirrors the driver-level
/// `get_last_sequence`: seek `-2` from the end for the trailing size, then `-(8n + 10)` for the
/// key.
pub fn last_sequence_from_tail(tail: &[u8]) -> Result<u32> {
    if tail.is_empty() {
        return Ok(0);
    }
    if tail.len() < 2 {
        return Err(Error::EndOfFile {
            expected: 2,
            actual: tail.len(),
        });
    }
    let end = tail.len();
    let n_words = u16::from_le_bytes([tail[end - 2], tail[end - 1]]) as usize;
    let record_len = RECORD_OVERHEAD + n_words * PAYLOAD_WORD_SIZE;
    if tail.len() < record_len {
        return Err(Error::EndOfFile {
            expected: record_len,
            actual: tail.len(),
        });
    }
    let record_start = end - record_len;
    let key = u32::from_le_bytes([
        tail[record_start + 2],
        tail[record_start + 3],
        tail[record_start + 4],
        tail[record_start + 5],
    ]);
    Ok(key)
}
