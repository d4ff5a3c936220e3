//! Wire encoding for buffered documents.
//!
//! Documents travel through store lists (the collection buffer and the
//! sealed pipe buffer) as base64 text wrapping a versioned binary record:
//!
//! ```text
//! | version (u8) | id (16 bytes) | posted_at ns (var_u64) |
//! | collection (len-tagged) | schema (len-tagged) | body (len-tagged) |
//! ```
//!
//! Variable-length fields carry a `var_u64` byte length followed by the
//! raw bytes. The format is backend-private; the only requirement is that
//! it round-trips exactly, including nanosecond timestamps.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::document::Document;
use crate::error::{Error, Result};

/// Wire format version (currently 0x01).
pub(crate) const WIRE_VERSION: u8 = 0x01;

/// Variable-length u64 encoding, 7 bits per byte, little groups first,
/// high bit set on continuation bytes.
pub(crate) mod var_u64 {
    use bytes::{BufMut, BytesMut};

    use crate::error::Error;

    pub(crate) fn serialize(mut value: u64, buf: &mut BytesMut) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                buf.put_u8(byte);
                return;
            }
            buf.put_u8(byte | 0x80);
        }
    }

    pub(crate) fn deserialize(buf: &mut &[u8]) -> Result<u64, Error> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let Some((&byte, rest)) = buf.split_first() else {
                return Err(Error::Encoding("truncated var_u64".to_string()));
            };
            *buf = rest;
            if shift >= 64 {
                return Err(Error::Encoding("var_u64 overflow".to_string()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

fn put_bytes(data: &[u8], buf: &mut BytesMut) {
    var_u64::serialize(data.len() as u64, buf);
    buf.put_slice(data);
}

fn take_bytes(buf: &mut &[u8]) -> Result<Bytes> {
    let len = var_u64::deserialize(buf)? as usize;
    if buf.len() < len {
        return Err(Error::Encoding("truncated field".to_string()));
    }
    let (data, rest) = buf.split_at(len);
    let data = Bytes::copy_from_slice(data);
    *buf = rest;
    Ok(data)
}

fn take_string(buf: &mut &[u8]) -> Result<String> {
    let data = take_bytes(buf)?;
    String::from_utf8(data.to_vec()).map_err(|_| Error::Encoding("invalid utf-8".to_string()))
}

impl Document {
    /// Encodes the document for storage in a buffer or pipe list.
    pub fn encode(&self) -> String {
        let mut buf = BytesMut::new();
        buf.put_u8(WIRE_VERSION);
        buf.put_slice(self.id.as_bytes());
        let nanos = self.posted_at.timestamp_nanos_opt().unwrap_or(0);
        var_u64::serialize(nanos as u64, &mut buf);
        put_bytes(self.collection.as_bytes(), &mut buf);
        put_bytes(self.schema.as_bytes(), &mut buf);
        put_bytes(&self.body, &mut buf);
        BASE64.encode(&buf)
    }

    /// Decodes a document previously produced by [`Document::encode`].
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let data = BASE64
            .decode(encoded)
            .map_err(|e| Error::Encoding(format!("invalid base64: {e}")))?;
        let mut buf = data.as_slice();

        let Some((&version, rest)) = buf.split_first() else {
            return Err(Error::Encoding("empty document record".to_string()));
        };
        buf = rest;
        if version != WIRE_VERSION {
            return Err(Error::Encoding(format!(
                "unsupported wire version: 0x{version:02x}"
            )));
        }

        if buf.len() < 16 {
            return Err(Error::Encoding("truncated document id".to_string()));
        }
        let (id_bytes, rest) = buf.split_at(16);
        let id = Uuid::from_slice(id_bytes)
            .map_err(|e| Error::Encoding(format!("invalid document id: {e}")))?;
        buf = rest;

        let nanos = var_u64::deserialize(&mut buf)? as i64;
        let posted_at = chrono::DateTime::from_timestamp_nanos(nanos);

        let collection = take_string(&mut buf)?;
        let schema = take_string(&mut buf)?;
        let body = take_bytes(&mut buf)?;

        Ok(Document {
            id,
            posted_at,
            collection,
            schema,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_round_trip_document() {
        // given
        let doc = Document::new("audit", "v2", br#"{"event": "login", "n": 7}"#).unwrap();

        // when
        let decoded = Document::decode(doc.encode().as_bytes()).unwrap();

        // then
        assert_eq!(decoded, doc);
    }

    #[test]
    fn should_preserve_nanosecond_timestamps() {
        // given
        let doc = Document::new("c", "s", b"{}").unwrap();

        // when
        let decoded = Document::decode(doc.encode().as_bytes()).unwrap();

        // then
        assert_eq!(decoded.posted_at, doc.posted_at);
    }

    #[test]
    fn should_reject_corrupt_base64() {
        let result = Document::decode(b"not base64!!");
        assert!(matches!(result, Err(Error::Encoding(_))));
    }

    #[test]
    fn should_reject_unknown_wire_version() {
        // given - a record with a bumped version byte
        let doc = Document::new("c", "s", b"{}").unwrap();
        let mut raw = BASE64.decode(doc.encode()).unwrap();
        raw[0] = 0x7f;
        let reencoded = BASE64.encode(&raw);

        // when
        let result = Document::decode(reencoded.as_bytes());

        // then
        assert!(matches!(result, Err(Error::Encoding(_))));
    }

    #[test]
    fn should_reject_truncated_record() {
        // given
        let doc = Document::new("c", "s", b"{}").unwrap();
        let raw = BASE64.decode(doc.encode()).unwrap();
        let truncated = BASE64.encode(&raw[..raw.len() / 2]);

        // when
        let result = Document::decode(truncated.as_bytes());

        // then
        assert!(matches!(result, Err(Error::Encoding(_))));
    }

    #[test]
    fn should_round_trip_var_u64_boundaries() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = BytesMut::new();
            var_u64::serialize(value, &mut buf);
            let mut slice = &buf[..];
            assert_eq!(var_u64::deserialize(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }
}
