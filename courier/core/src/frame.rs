//! Wire Framing
//!
//! Every message on the wire is a fixed-size header followed by raw
//! payload bytes:
//!
//! ```text
//! +-------------+-------------+----------+----------+------------------+
//! | origin (8)  | dest (8)    | tag (4)  | seq (4)  | payload (var)    |
//! | job + rank  | job + rank  | u32      | u32      | raw bytes        |
//! +-------------+-------------+----------+----------+------------------+
//! ```
//!
//! All header fields are big-endian `u32`. There is no length field: the
//! payload length is derived from the byte count the fabric reports with
//! the receive completion.

use thiserror::Error;

use crate::message::{Payload, ProcessName, Tag};

/// Size of the fixed wire header in bytes.
pub const HEADER_LEN: usize = 24;

/// Errors produced while decoding a wire header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The completed byte count is smaller than the fixed header.
    #[error("truncated message: {got} bytes, header needs {HEADER_LEN}")]
    Truncated {
        /// Number of bytes actually available.
        got: usize,
    },
}

/// Fixed-size header prepended to every payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sending process.
    pub origin: ProcessName,
    /// Destination process.
    pub destination: ProcessName,
    /// Message tag.
    pub tag: Tag,
    /// Sender-assigned sequence number.
    pub seq: u32,
}

impl MessageHeader {
    /// Append the encoded header to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.origin.job.to_be_bytes());
        out.extend_from_slice(&self.origin.rank.to_be_bytes());
        out.extend_from_slice(&self.destination.job.to_be_bytes());
        out.extend_from_slice(&self.destination.rank.to_be_bytes());
        out.extend_from_slice(&self.tag.0.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
    }

    /// Decode a header from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Truncated`] if fewer than [`HEADER_LEN`]
    /// bytes are available.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated { got: bytes.len() });
        }
        let field = |i: usize| {
            let start = i * 4;
            u32::from_be_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ])
        };
        Ok(Self {
            origin: ProcessName::new(field(0), field(1)),
            destination: ProcessName::new(field(2), field(3)),
            tag: Tag(field(4)),
            seq: field(5),
        })
    }
}

/// Build the contiguous wire blob for one message: header first, then the
/// flattened payload.
#[must_use]
pub fn build_message(header: &MessageHeader, payload: &Payload) -> Vec<u8> {
    let mut blob = Vec::with_capacity(HEADER_LEN + payload.total_len());
    header.encode_into(&mut blob);
    payload.extend_into(&mut blob);
    blob
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_header() -> MessageHeader {
        MessageHeader {
            origin: ProcessName::new(1, 4),
            destination: ProcessName::new(1, 9),
            tag: Tag(7),
            seq: 42,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let mut bytes = Vec::new();
        header.encode_into(&mut bytes);
        assert_eq!(bytes.len(), HEADER_LEN);

        let decoded = MessageHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let mut bytes = Vec::new();
        sample_header().encode_into(&mut bytes);
        // origin.job = 1
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        // destination.rank = 9
        assert_eq!(&bytes[12..16], &[0, 0, 0, 9]);
        // tag = 7
        assert_eq!(&bytes[16..20], &[0, 0, 0, 7]);
        // seq = 42
        assert_eq!(&bytes[20..24], &[0, 0, 0, 42]);
    }

    #[test]
    fn test_decode_truncated() {
        let err = MessageHeader::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, FrameError::Truncated { got: 10 });
    }

    #[test]
    fn test_build_message_header_first() {
        let header = sample_header();
        let blob = build_message(&header, &Payload::Single(b"ping".to_vec()));
        assert_eq!(blob.len(), HEADER_LEN + 4);
        assert_eq!(MessageHeader::decode(&blob).unwrap(), header);
        assert_eq!(&blob[HEADER_LEN..], b"ping");
    }

    #[test]
    fn test_build_message_flattens_gather_list() {
        let header = sample_header();
        let blob = build_message(
            &header,
            &Payload::Gather(vec![b"pi".to_vec(), b"ng".to_vec()]),
        );
        assert_eq!(&blob[HEADER_LEN..], b"ping");
    }

    #[test]
    fn test_build_message_empty_payload() {
        let blob = build_message(&sample_header(), &Payload::Single(Vec::new()));
        assert_eq!(blob.len(), HEADER_LEN);
    }
}
