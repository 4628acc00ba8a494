//! Binary trace records for election diagnostics.
//!
//! Two record kinds are emitted: election state changes and new
//! leadership terms. Records are write-only diagnostics consumed by
//! external tooling; decoding exists for that tooling and for tests,
//! never for protocol decisions.
//!
//! # Layout
//! Every record starts with a 16-byte little-endian header:
//! `[capture_length: i32][length: i32][tag: i64]` where `tag` is a
//! monotonic non-zero sequence value. `length` is the true payload size;
//! `capture_length <= length`, smaller only when the payload was
//! truncated to fit `MAX_EVENT_LENGTH`.

use std::fmt;

pub const SIZE_OF_INT: usize = 4;
pub const SIZE_OF_LONG: usize = 8;

/// Header: capture_length + length + tag.
pub const LOG_HEADER_LENGTH: usize = SIZE_OF_INT * 2 + SIZE_OF_LONG;

/// Maximum total encoded record size.
pub const MAX_EVENT_LENGTH: usize = 4096;

/// Maximum payload bytes that can be captured in one record.
pub const MAX_CAPTURE_LENGTH: usize = MAX_EVENT_LENGTH - LOG_HEADER_LENGTH;

/// Separator between the from/to state names in a state-change payload.
pub const SEPARATOR: &str = " -> ";

/// Errors surfaced by the record decoders.
#[derive(Debug, PartialEq, Eq)]
pub enum TraceDecodeError {
    /// capture_length claims more bytes than the true length.
    InconsistentCaptureLength { capture_length: i32, length: i32 },
    /// The buffer ends before the encoded record does.
    Underflow { required: usize, available: usize },
}

impl fmt::Display for TraceDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceDecodeError::InconsistentCaptureLength {
                capture_length,
                length,
            } => write!(
                f,
                "capture_length {} exceeds length {}",
                capture_length, length
            ),
            TraceDecodeError::Underflow {
                required,
                available,
            } => write!(
                f,
                "record needs {} bytes but only {} available",
                required, available
            ),
        }
    }
}

impl std::error::Error for TraceDecodeError {}

/// Payload length of a state-change record: the textual
/// `"<from> -> <to>"` plus member id and string length prefix.
pub fn state_change_length(from: &str, to: &str) -> usize {
    from.len() + SEPARATOR.len() + to.len() + SIZE_OF_INT * 2
}

/// Payload length of a new-leadership-term record.
pub fn new_leadership_term_length() -> usize {
    SIZE_OF_LONG * 4 + SIZE_OF_INT * 2
}

/// Clamp a payload length to what fits in a single record.
pub fn capture_length(length: usize) -> usize {
    length.min(MAX_CAPTURE_LENGTH)
}

/// Total encoded size for a given captured payload length.
pub fn encoded_length(captured: usize) -> usize {
    LOG_HEADER_LENGTH + captured
}

fn put_i32(buffer: &mut [u8], offset: usize, value: i32) {
    buffer[offset..offset + SIZE_OF_INT].copy_from_slice(&value.to_le_bytes());
}

fn put_i64(buffer: &mut [u8], offset: usize, value: i64) {
    buffer[offset..offset + SIZE_OF_LONG].copy_from_slice(&value.to_le_bytes());
}

fn get_i32(buffer: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; SIZE_OF_INT];
    bytes.copy_from_slice(&buffer[offset..offset + SIZE_OF_INT]);
    i32::from_le_bytes(bytes)
}

fn get_i64(buffer: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; SIZE_OF_LONG];
    bytes.copy_from_slice(&buffer[offset..offset + SIZE_OF_LONG]);
    i64::from_le_bytes(bytes)
}

// Bounded reads for truncated records: a field lying past `limit`
// decodes as zero rather than reading beyond the captured bytes.

fn get_i32_bounded(buffer: &[u8], offset: usize, limit: usize) -> i32 {
    if offset + SIZE_OF_INT <= limit {
        get_i32(buffer, offset)
    } else {
        0
    }
}

fn get_i64_bounded(buffer: &[u8], offset: usize, limit: usize) -> i64 {
    if offset + SIZE_OF_LONG <= limit {
        get_i64(buffer, offset)
    } else {
        0
    }
}

fn encode_header(buffer: &mut [u8], offset: usize, captured: usize, length: usize, tag: i64) {
    put_i32(buffer, offset, captured as i32);
    put_i32(buffer, offset + SIZE_OF_INT, length as i32);
    put_i64(buffer, offset + SIZE_OF_INT * 2, tag);
}

/// Encode an election state change at `offset`.
///
/// `captured`/`length` come from [`capture_length`]/[`state_change_length`].
/// `tag` must be monotonic and non-zero. Returns the encoded size.
pub fn encode_state_change(
    buffer: &mut [u8],
    offset: usize,
    captured: usize,
    length: usize,
    tag: i64,
    from: &str,
    to: &str,
    member_id: i32,
) -> usize {
    debug_assert!(tag != 0, "trace tag must be non-zero");
    encode_header(buffer, offset, captured, length, tag);

    let mut relative = offset + LOG_HEADER_LENGTH;
    put_i32(buffer, relative, member_id);
    relative += SIZE_OF_INT;

    let payload = format!("{}{}{}", from, SEPARATOR, to);
    // The string length prefix always records the true length; only the
    // string bytes themselves are truncated.
    put_i32(buffer, relative, payload.len() as i32);
    relative += SIZE_OF_INT;

    let writable = captured.saturating_sub(SIZE_OF_INT * 2).min(payload.len());
    buffer[relative..relative + writable].copy_from_slice(&payload.as_bytes()[..writable]);

    encoded_length(captured)
}

/// Encode a new-leadership-term record at `offset`. Returns the encoded size.
#[allow(clippy::too_many_arguments)]
pub fn encode_new_leadership_term(
    buffer: &mut [u8],
    offset: usize,
    captured: usize,
    length: usize,
    tag: i64,
    log_leadership_term_id: i64,
    leadership_term_id: i64,
    log_position: i64,
    timestamp: i64,
    leader_member_id: i32,
    log_session_id: i32,
) -> usize {
    debug_assert!(tag != 0, "trace tag must be non-zero");
    encode_header(buffer, offset, captured, length, tag);

    let mut relative = offset + LOG_HEADER_LENGTH;
    put_i64(buffer, relative, log_leadership_term_id);
    relative += SIZE_OF_LONG;
    put_i64(buffer, relative, leadership_term_id);
    relative += SIZE_OF_LONG;
    put_i64(buffer, relative, log_position);
    relative += SIZE_OF_LONG;
    put_i64(buffer, relative, timestamp);
    relative += SIZE_OF_LONG;
    put_i32(buffer, relative, leader_member_id);
    relative += SIZE_OF_INT;
    put_i32(buffer, relative, log_session_id);

    encoded_length(captured)
}

/// A decoded state-change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeRecord {
    pub capture_length: i32,
    pub length: i32,
    pub tag: i64,
    pub member_id: i32,
    /// Possibly truncated `"<from> -> <to>"` text.
    pub payload: String,
    pub truncated: bool,
}

/// A decoded new-leadership-term record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLeadershipTermRecord {
    pub capture_length: i32,
    pub length: i32,
    pub tag: i64,
    pub log_leadership_term_id: i64,
    pub leadership_term_id: i64,
    pub log_position: i64,
    pub timestamp: i64,
    pub leader_member_id: i32,
    pub log_session_id: i32,
}

fn decode_header(buffer: &[u8], offset: usize) -> Result<(i32, i32, i64), TraceDecodeError> {
    if buffer.len() < offset + LOG_HEADER_LENGTH {
        return Err(TraceDecodeError::Underflow {
            required: offset + LOG_HEADER_LENGTH,
            available: buffer.len(),
        });
    }
    let captured = get_i32(buffer, offset);
    let length = get_i32(buffer, offset + SIZE_OF_INT);
    let tag = get_i64(buffer, offset + SIZE_OF_INT * 2);
    if captured > length {
        return Err(TraceDecodeError::InconsistentCaptureLength {
            capture_length: captured,
            length,
        });
    }
    Ok((captured, length, tag))
}

/// Decode a state-change record. `capture_length < length` is a valid
/// truncation, not an error.
pub fn decode_state_change(
    buffer: &[u8],
    offset: usize,
) -> Result<StateChangeRecord, TraceDecodeError> {
    let (captured, length, tag) = decode_header(buffer, offset)?;
    let end = offset + LOG_HEADER_LENGTH + captured as usize;
    if buffer.len() < end {
        return Err(TraceDecodeError::Underflow {
            required: end,
            available: buffer.len(),
        });
    }
    // The member id and string length prefix precede the text; a capture
    // too short to hold them is undecodable.
    if (captured as usize) < SIZE_OF_INT * 2 {
        return Err(TraceDecodeError::Underflow {
            required: offset + LOG_HEADER_LENGTH + SIZE_OF_INT * 2,
            available: end,
        });
    }

    let member_id = get_i32(buffer, offset + LOG_HEADER_LENGTH);
    let true_text_length = get_i32(buffer, offset + LOG_HEADER_LENGTH + SIZE_OF_INT) as usize;
    let captured_text = (captured as usize).saturating_sub(SIZE_OF_INT * 2);
    let text_start = offset + LOG_HEADER_LENGTH + SIZE_OF_INT * 2;
    let payload = String::from_utf8_lossy(&buffer[text_start..text_start + captured_text]).to_string();

    Ok(StateChangeRecord {
        capture_length: captured,
        length,
        tag,
        member_id,
        payload,
        truncated: captured_text < true_text_length,
    })
}

/// Decode a new-leadership-term record.
pub fn decode_new_leadership_term(
    buffer: &[u8],
    offset: usize,
) -> Result<NewLeadershipTermRecord, TraceDecodeError> {
    let (captured, length, tag) = decode_header(buffer, offset)?;
    let end = offset + LOG_HEADER_LENGTH + captured as usize;
    if buffer.len() < end {
        return Err(TraceDecodeError::Underflow {
            required: end,
            available: buffer.len(),
        });
    }

    // A truncated record carries a prefix of the fields; the ones past
    // the captured bytes decode as zero, with `capture_length < length`
    // marking the truncation for the reader.
    let mut relative = offset + LOG_HEADER_LENGTH;
    let log_leadership_term_id = get_i64_bounded(buffer, relative, end);
    relative += SIZE_OF_LONG;
    let leadership_term_id = get_i64_bounded(buffer, relative, end);
    relative += SIZE_OF_LONG;
    let log_position = get_i64_bounded(buffer, relative, end);
    relative += SIZE_OF_LONG;
    let timestamp = get_i64_bounded(buffer, relative, end);
    relative += SIZE_OF_LONG;
    let leader_member_id = get_i32_bounded(buffer, relative, end);
    relative += SIZE_OF_INT;
    let log_session_id = get_i32_bounded(buffer, relative, end);

    Ok(NewLeadershipTermRecord {
        capture_length: captured,
        length,
        tag,
        log_leadership_term_id,
        leadership_term_id,
        log_position,
        timestamp,
        leader_member_id,
        log_session_id,
    })
}

/// Append-only buffer of trace records for one member.
///
/// The tag is a per-recorder monotonic sequence starting at 1, distinct
/// from the domain clock so that records remain well-formed under replay.
pub struct EventRecorder {
    member_id: i32,
    buffer: Vec<u8>,
    next_tag: i64,
    record_count: usize,
}

impl EventRecorder {
    pub fn new(member_id: i32) -> Self {
        EventRecorder {
            member_id,
            buffer: Vec::new(),
            next_tag: 1,
            record_count: 0,
        }
    }

    /// Raw encoded records, in append order.
    pub fn records(&self) -> &[u8] {
        &self.buffer
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    fn take_tag(&mut self) -> i64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    /// Append a state-change record for this member.
    pub fn state_change(&mut self, from: &str, to: &str) {
        let length = state_change_length(from, to);
        let captured = capture_length(length);
        let offset = self.buffer.len();
        self.buffer.resize(offset + encoded_length(captured), 0);
        let tag = self.take_tag();
        let member_id = self.member_id;
        encode_state_change(
            &mut self.buffer,
            offset,
            captured,
            length,
            tag,
            from,
            to,
            member_id,
        );
        self.record_count += 1;
    }

    /// Append a new-leadership-term record.
    pub fn new_leadership_term(
        &mut self,
        log_leadership_term_id: i64,
        leadership_term_id: i64,
        log_position: i64,
        timestamp: i64,
        leader_member_id: i32,
        log_session_id: i32,
    ) {
        let length = new_leadership_term_length();
        let captured = capture_length(length);
        let offset = self.buffer.len();
        self.buffer.resize(offset + encoded_length(captured), 0);
        let tag = self.take_tag();
        encode_new_leadership_term(
            &mut self.buffer,
            offset,
            captured,
            length,
            tag,
            log_leadership_term_id,
            leadership_term_id,
            log_position,
            timestamp,
            leader_member_id,
            log_session_id,
        );
        self.record_count += 1;
    }
}
