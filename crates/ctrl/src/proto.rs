// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame codec for the RS-485 module protocol.
//!
//! Wire layout: `STX | AA | OP | PAYLOAD | ETX | CS1 CS2` where `AA` is the
//! module address as two decimal ASCII digits, `OP` is two ASCII characters,
//! and `CS1 CS2` is the low byte of the arithmetic sum of every byte from STX
//! through ETX inclusive, as two uppercase hex digits.  Everything here is
//! pure; the scheduler owns all state.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Local};

/// ASCII start-of-text frame delimiter.
pub const STX: u8 = 0x02;
/// ASCII end-of-text frame delimiter.
pub const ETX: u8 = 0x03;

/// Shortest well-formed frame: `STX AA OP ETX CS CS`.
pub const MIN_FRAME_LEN: usize = 7;

/// Read-status opcode.
pub const OP_READ_STATUS: &str = "S0";
/// Status-with-buffered-novelty opcode.
pub const OP_STATUS_NOVELTY: &str = "S6";
/// Continue-sequence (actuator open) opcode.
pub const OP_CONTINUE: &str = "K1";
/// Stop-sequence opcode.
pub const OP_STOP: &str = "K0";
/// Acknowledge that the module may drop its buffered novelty.
pub const OP_OK_DOWNLOAD_NOVELTY: &str = "O1";
/// Clock synchronization opcode, payload `YYMMDDhhmmss`.
pub const OP_SET_TIME: &str = "T0";

fn build(addr: u8, op: &str, payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
    frame.push(STX);
    frame.extend_from_slice(format!("{addr:02}").as_bytes());
    frame.extend_from_slice(op.as_bytes());
    frame.extend_from_slice(payload);
    frame.push(ETX);
    let cs = checksum(&frame);
    frame.extend_from_slice(&cs);
    Bytes::from(frame)
}

/// Low byte of the arithmetic sum of `bytes`, as two uppercase hex digits.
pub fn checksum(bytes: &[u8]) -> [u8; 2] {
    let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
    let hex = format!("{:02X}", sum & 0xFF);
    let h = hex.as_bytes();
    [h[0], h[1]]
}

/// `S0` status poll with an empty payload.
pub fn encode_read_status(addr: u8) -> Bytes {
    build(addr, OP_READ_STATUS, &[])
}

/// `T0` clock sync; payload is `YYMMDDhhmmss` (two-digit year).
pub fn encode_set_time(addr: u8, at: DateTime<Local>) -> Bytes {
    let stamp = at.format("%y%m%d%H%M%S").to_string();
    build(addr, OP_SET_TIME, stamp.as_bytes())
}

/// `K1` continue-sequence (open the actuator), with optional extra payload.
pub fn encode_continue(addr: u8, extra: &str) -> Bytes {
    build(addr, OP_CONTINUE, extra.as_bytes())
}

/// `K0` stop-sequence.
pub fn encode_stop(addr: u8) -> Bytes {
    build(addr, OP_STOP, &[])
}

/// `O1` acknowledgement that the buffered novelty may be dropped.
pub fn encode_ok_download_novelty(addr: u8) -> Bytes {
    build(addr, OP_OK_DOWNLOAD_NOVELTY, &[])
}

/// `P<n>` pulse of output `output` (1..=8) for `duration_ms` (0..=9999).
///
/// Out-of-range arguments are clamped; the wire field is fixed at four
/// zero-padded digits.
pub fn encode_pulse(addr: u8, output: u8, duration_ms: u16) -> Bytes {
    let output = output.clamp(1, 8);
    let duration = duration_ms.min(9999);
    let op = format!("P{output}");
    build(addr, &op, format!("{duration:04}").as_bytes())
}

/// Arbitrary frame with the standard layout; bench and test tooling.
pub fn encode_custom(addr: u8, op: &str, payload: &[u8]) -> Bytes {
    build(addr, op, payload)
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFault {
    TooShort,
    MissingStx,
    MissingEtx,
    MissingChecksum,
    ChecksumMismatch { expected: String, got: String },
    AddressMismatch { expected: u8, got: u8 },
    AddressNotNumeric,
    UnknownOp { op: String },
}

impl FrameFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooShort => "too_short",
            Self::MissingStx => "missing_stx",
            Self::MissingEtx => "missing_etx",
            Self::MissingChecksum => "missing_checksum",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::AddressMismatch { .. } => "address_mismatch",
            Self::AddressNotNumeric => "address_not_numeric",
            Self::UnknownOp { .. } => "unknown_op",
        }
    }
}

impl fmt::Display for FrameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch { expected, got } => {
                write!(f, "checksum_mismatch (expected {expected}, got {got})")
            }
            Self::AddressMismatch { expected, got } => {
                write!(f, "address_mismatch (expected {expected:02}, got {got:02})")
            }
            Self::UnknownOp { op } => write!(f, "unknown_op ({op})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Outcome of [`validate_and_parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateResult {
    Valid { addr: u8, op: String, payload: Vec<u8> },
    Invalid { reason: FrameFault },
}

/// Validate an inbound frame against the expected module address.
///
/// Checks, in order: minimum length, STX, ETX presence, checksum presence and
/// value, address digits, address match.  The opcode is the two bytes after
/// the address; the payload is everything between opcode and ETX.
pub fn validate_and_parse(frame: &[u8], expected_addr: u8) -> ValidateResult {
    use ValidateResult::{Invalid, Valid};

    if frame.len() < MIN_FRAME_LEN {
        return Invalid { reason: FrameFault::TooShort };
    }
    if frame[0] != STX {
        return Invalid { reason: FrameFault::MissingStx };
    }
    let Some(etx) = frame.iter().position(|&b| b == ETX) else {
        return Invalid { reason: FrameFault::MissingEtx };
    };
    if etx < 5 {
        // ETX before the opcode field: the frame cannot carry an address+op.
        return Invalid { reason: FrameFault::TooShort };
    }
    if frame.len() < etx + 3 {
        return Invalid { reason: FrameFault::MissingChecksum };
    }

    let expected_cs = checksum(&frame[..=etx]);
    let got_cs = [frame[etx + 1], frame[etx + 2]];
    if !got_cs.eq_ignore_ascii_case(&expected_cs) {
        return Invalid {
            reason: FrameFault::ChecksumMismatch {
                expected: latin1(&expected_cs),
                got: latin1(&got_cs),
            },
        };
    }

    let Some(addr) = parse_address(&frame[1..3]) else {
        return Invalid { reason: FrameFault::AddressNotNumeric };
    };
    if addr != expected_addr {
        return Invalid {
            reason: FrameFault::AddressMismatch { expected: expected_addr, got: addr },
        };
    }

    Valid { addr, op: latin1(&frame[3..5]), payload: frame[5..etx].to_vec() }
}

fn parse_address(digits: &[u8]) -> Option<u8> {
    if digits.len() != 2 || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some((digits[0] - b'0') * 10 + (digits[1] - b'0'))
}

/// Opcode of an encoded frame, for deadline selection.
pub fn opcode_of(frame: &[u8]) -> Option<&str> {
    if frame.len() < 5 {
        return None;
    }
    std::str::from_utf8(&frame[3..5]).ok()
}

/// Address field of an encoded frame.
pub fn parse_address_of(frame: &[u8]) -> Option<u8> {
    frame.get(1..3).and_then(parse_address)
}

/// Decoded first status byte (plus the digital-input vector when present).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusBits {
    pub barrier_open: bool,
    pub sensor_occupied: bool,
    pub has_novelty: bool,
    /// Second payload byte: one bit per digital input, when the module
    /// reports it.
    pub inputs: Option<u8>,
}

/// Decode a status payload: bit0 = barrier open, bit1 = sensor occupied,
/// bit7 = novelty buffered.  Extra bytes are ignored.
pub fn parse_status(payload: &[u8]) -> StatusBits {
    let Some(&first) = payload.first() else {
        return StatusBits::default();
    };
    StatusBits {
        barrier_open: first & 0x01 != 0,
        sensor_occupied: first & 0x02 != 0,
        has_novelty: first & 0x80 != 0,
        inputs: payload.get(1).copied(),
    }
}

/// How many leading payload bytes are status bytes; novelty data follows.
pub const STATUS_PREFIX_LEN: usize = 2;

/// Novelty bytes of a status payload: everything after the status prefix.
pub fn novelty_bytes(payload: &[u8]) -> &[u8] {
    payload.get(STATUS_PREFIX_LEN..).unwrap_or(&[])
}

/// A buffered access event reported by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Novelty {
    /// Eight Latin-1 characters of identifier.
    pub identifier: String,
    /// Raw `DDHHMMSS`-style fragment when the firmware appends one.
    pub timestamp_raw: Option<String>,
}

/// Parse a novelty: 8 identifier characters, optionally 6 more of timestamp.
/// Trailing bytes beyond that are tolerated and ignored.
pub fn parse_novelty(bytes: &[u8]) -> Option<Novelty> {
    if bytes.len() < 8 {
        return None;
    }
    let identifier = latin1(&bytes[..8]);
    let timestamp_raw = (bytes.len() >= 14).then(|| latin1(&bytes[8..14]));
    Some(Novelty { identifier, timestamp_raw })
}

/// Protocol-defined read deadline for an opcode.
pub fn read_timeout_for(op: &str) -> Duration {
    let ms = match op {
        "S0" | "S6" => 2000,
        "K0" | "K1" | "O1" => 1000,
        "T0" => 3000,
        // Person-admin opcodes: deadline declared, no scheduler wiring.
        "O5" | "O6" | "O8" | "O9" => 5000,
        _ => 2000,
    };
    Duration::from_millis(ms)
}

/// Render bytes as Latin-1 text (1 byte ⇄ 1 character, infallible).
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

#[cfg(test)]
#[path = "proto_tests.rs"]
mod tests;
