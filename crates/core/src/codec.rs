//! Binary codecs for the persisted object and the client context token.
//!
//! One explicit serialization, little-endian throughout:
//!
//! Object (the serialized clock, stored under the encoded bkey):
//! ```text
//! [u32 entry count]
//!   per entry: [u32 partition][u32 epoch][u64 max counter]
//!              [u32 value count] per value: [u64 counter][value]
//! [u32 anonymous count] per value: [value]
//! value: [u8 tag] tag 0 = data, followed by [u32 len][bytes];
//!                 tag 1 = delete tombstone, no payload
//! ```
//!
//! Context token (opaque to clients, echoed on writes):
//! ```text
//! [u32 crc32 of payload][payload]
//! payload: [u32 entry count] per entry: [u32 partition][u32 epoch][u64 counter]
//! ```
//!
//! A token that fails framing or checksum is rejected as malformed, never
//! merged.

use crate::dvv::{DottedValue, Dvv, Value, VersionVector};
use dotkv_common::VnodeId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated input")]
    Truncated,
    #[error("unknown value tag {0:#04x}")]
    BadTag(u8),
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("{0} trailing bytes after decode")]
    Trailing(usize),
}

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

pub fn encode_object(object: &Dvv) -> Vec<u8> {
    let parts = object.entry_counts();
    let mut out = Vec::new();
    put_u32(&mut out, parts.len() as u32);
    for (id, max, values) in &parts {
        put_u32(&mut out, id.index);
        put_u32(&mut out, id.epoch);
        put_u64(&mut out, *max);
        put_u32(&mut out, values.len() as u32);
        for dv in values {
            put_u64(&mut out, dv.counter);
            put_value(&mut out, &dv.value);
        }
    }
    let anonymous = object.anonymous_values();
    put_u32(&mut out, anonymous.len() as u32);
    for v in anonymous {
        put_value(&mut out, v);
    }
    out
}

pub fn decode_object(bytes: &[u8]) -> Result<Dvv, CodecError> {
    let mut r = Reader::new(bytes);
    let n_entries = r.take_u32()? as usize;
    let mut parts = Vec::with_capacity(n_entries);
    for _ in 0..n_entries {
        let index = r.take_u32()?;
        let epoch = r.take_u32()?;
        let max = r.take_u64()?;
        let n_values = r.take_u32()? as usize;
        let mut values = Vec::with_capacity(n_values);
        for _ in 0..n_values {
            let counter = r.take_u64()?;
            let value = take_value(&mut r)?;
            values.push(DottedValue { counter, value });
        }
        parts.push((VnodeId::new(index, epoch), max, values));
    }
    let n_anon = r.take_u32()? as usize;
    let mut anonymous = Vec::with_capacity(n_anon);
    for _ in 0..n_anon {
        anonymous.push(take_value(&mut r)?);
    }
    r.finish()?;
    Ok(Dvv::from_parts(parts, anonymous))
}

// ---------------------------------------------------------------------------
// Context token
// ---------------------------------------------------------------------------

pub fn encode_context(ctx: &VersionVector) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + 16 * ctx.len());
    put_u32(&mut payload, ctx.len() as u32);
    for (id, &counter) in ctx.iter() {
        put_u32(&mut payload, id.index);
        put_u32(&mut payload, id.epoch);
        put_u64(&mut payload, counter);
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(4 + payload.len());
    put_u32(&mut out, crc);
    out.extend_from_slice(&payload);
    out
}

pub fn decode_context(bytes: &[u8]) -> Result<VersionVector, CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::Truncated);
    }
    let expected = u32::from_le_bytes(bytes[..4].try_into().expect("4-byte slice"));
    let payload = &bytes[4..];

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(CodecError::Checksum { expected, actual });
    }

    let mut r = Reader::new(payload);
    let n = r.take_u32()? as usize;
    let mut ctx = VersionVector::new();
    for _ in 0..n {
        let index = r.take_u32()?;
        let epoch = r.take_u32()?;
        let counter = r.take_u64()?;
        ctx.set(VnodeId::new(index, epoch), counter);
    }
    r.finish()?;
    Ok(ctx)
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Data(bytes) => {
            out.push(0);
            put_u32(out, bytes.len() as u32);
            out.extend_from_slice(bytes);
        }
        Value::Tombstone => out.push(1),
    }
}

fn take_value(r: &mut Reader<'_>) -> Result<Value, CodecError> {
    match r.take_u8()? {
        0 => {
            let len = r.take_u32()? as usize;
            Ok(Value::Data(r.take_bytes(len)?.to_vec()))
        }
        1 => Ok(Value::Tombstone),
        tag => Err(CodecError::BadTag(tag)),
    }
}

struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.rest.first().ok_or(CodecError::Truncated)?;
        self.rest = &self.rest[1..];
        Ok(b)
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn take_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.rest.len() < len {
            return Err(CodecError::Truncated);
        }
        let (head, rest) = self.rest.split_at(len);
        self.rest = rest;
        Ok(head)
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(CodecError::Trailing(self.rest.len()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
