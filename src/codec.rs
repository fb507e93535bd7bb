//! Byte encoding of [`RecoveryRecord`]s.
//!
//! Layout of format version 1, all integers big-endian:
//!
//! ```text
//! version: u8
//! section_id: u32
//! recovery_unit_id: u64
//! sequence_number: u64
//! payload_len: u64
//! payload: [u8; payload_len]
//! checksum: u64   seahash of every preceding byte
//! ```
//!
//! The version byte comes first so a reader can refuse a format it
//! does not know before trusting any other field.

use crate::errors::RecoveryLogError;
use crate::errors::Result;
use crate::model::RecoveryRecord;
use crate::model::RecoveryUnitId;
use crate::model::SectionId;
use crate::model::SequenceNumber;

/// Newest format this build writes and reads.
pub const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + 4 + 8 + 8 + 8;
const CHECKSUM_LEN: usize = 8;

pub fn encode(record: &RecoveryRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + record.payload.len() + CHECKSUM_LEN);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(&record.section_id.0.to_be_bytes());
    buf.extend_from_slice(&record.recovery_unit_id.0.to_be_bytes());
    buf.extend_from_slice(&record.sequence_number.0.to_be_bytes());
    buf.extend_from_slice(&(record.payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(&record.payload);
    let checksum = seahash::hash(&buf);
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf
}

pub fn decode(bytes: &[u8]) -> Result<RecoveryRecord> {
    let version = *bytes
        .first()
        .ok_or_else(|| RecoveryLogError::CorruptRecord("empty record".to_owned()))?;
    match version {
        0 => {
            return Err(RecoveryLogError::CorruptRecord(
                "format version 0 is never written".to_owned(),
            ))
        }
        FORMAT_VERSION => {}
        found => {
            return Err(RecoveryLogError::UnsupportedVersion {
                found,
                supported: FORMAT_VERSION,
            })
        }
    }

    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(RecoveryLogError::CorruptRecord(format!(
            "record of {} bytes is shorter than the {} byte minimum",
            bytes.len(),
            HEADER_LEN + CHECKSUM_LEN
        )));
    }

    let mut reader = Reader::new(&bytes[1..HEADER_LEN]);
    let section_id = SectionId(reader.u32());
    let recovery_unit_id = RecoveryUnitId(reader.u64());
    let sequence_number = SequenceNumber(reader.u64());
    let payload_len = reader.u64();

    let expected_len = usize::try_from(payload_len)
        .ok()
        .and_then(|len| len.checked_add(HEADER_LEN + CHECKSUM_LEN));
    if expected_len != Some(bytes.len()) {
        return Err(RecoveryLogError::CorruptRecord(format!(
            "payload length {payload_len} inconsistent with record length {}",
            bytes.len()
        )));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let stored = Reader::new(trailer).u64();
    let computed = seahash::hash(body);
    if stored != computed {
        return Err(RecoveryLogError::CorruptRecord(format!(
            "checksum mismatch for unit {recovery_unit_id} in section {section_id}: \
             stored {stored:#018x}, computed {computed:#018x}"
        )));
    }

    Ok(RecoveryRecord {
        section_id,
        recovery_unit_id,
        sequence_number,
        payload: body[HEADER_LEN..].to_vec(),
    })
}

/// Fixed-width big-endian reads over a slice whose length was already
/// checked.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[..N]);
        self.buf = &self.buf[N..];
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take())
    }
}

#[cfg(test)]
fn sample(payload: &[u8]) -> RecoveryRecord {
    RecoveryRecord {
        section_id: SectionId(3),
        recovery_unit_id: RecoveryUnitId(42),
        sequence_number: SequenceNumber(7),
        payload: payload.to_vec(),
    }
}

#[test]
fn round_trip() {
    let big = vec![0xffu8; 4096];
    for payload in [&b""[..], &b"P"[..], &big[..]] {
        let record = sample(payload);
        assert_eq!(decode(&encode(&record)).unwrap(), record);
    }
}

#[test]
fn encode_is_deterministic() {
    let record = sample(b"prepared");
    assert_eq!(encode(&record), encode(&record));
}

#[test]
fn flipped_payload_byte_is_corrupt() {
    let mut bytes = encode(&sample(b"prepared"));
    bytes[HEADER_LEN + 2] ^= 0x01;
    assert!(matches!(
        decode(&bytes),
        Err(RecoveryLogError::CorruptRecord(..))
    ));
}

#[test]
fn truncated_record_is_corrupt() {
    let bytes = encode(&sample(b"prepared"));
    for cut in [1, HEADER_LEN, bytes.len() - 1] {
        assert!(matches!(
            decode(&bytes[..cut]),
            Err(RecoveryLogError::CorruptRecord(..))
        ));
    }
    assert!(matches!(
        decode(&[]),
        Err(RecoveryLogError::CorruptRecord(..))
    ));
}

#[test]
fn lying_length_is_corrupt() {
    let mut bytes = encode(&sample(b"prepared"));
    // Bump the low byte of payload_len.
    bytes[HEADER_LEN - 1] += 1;
    assert!(matches!(
        decode(&bytes),
        Err(RecoveryLogError::CorruptRecord(..))
    ));
}

#[test]
fn future_version_is_distinct_error() {
    let mut bytes = encode(&sample(b"prepared"));
    bytes[0] = FORMAT_VERSION + 1;
    assert!(matches!(
        decode(&bytes),
        Err(RecoveryLogError::UnsupportedVersion { found, supported })
            if found == FORMAT_VERSION + 1 && supported == FORMAT_VERSION
    ));
}
