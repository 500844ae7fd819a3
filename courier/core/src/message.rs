//! Message Types
//!
//! Core types exchanged between the transport and the layers above it:
//! logical process names, message tags, the payload descriptor accepted by
//! the send pipeline, and the records handed upward on delivery and on
//! send completion.
//!
//! # Design Philosophy
//!
//! The transport never interprets payload bytes. Everything it needs to
//! route and account for a message lives in these small fixed types; the
//! upward routing service owns all semantics beyond that.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical name of a process: a job identifier plus a rank within the job.
///
/// Names are assigned by an external naming service; the transport only
/// compares and forwards them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessName {
    /// Job identifier.
    pub job: u32,
    /// Rank of the process within the job.
    pub rank: u32,
}

impl ProcessName {
    /// Reserved invalid name. Never routable; rejected by the send pipeline.
    pub const INVALID: Self = Self {
        job: u32::MAX,
        rank: u32::MAX,
    };

    /// Create a name from job and rank.
    #[must_use]
    pub const fn new(job: u32, rank: u32) -> Self {
        Self { job, rank }
    }

    /// Whether this is the reserved invalid name.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job, self.rank)
    }
}

/// Parse error for [`ProcessName`] (`job.rank` form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNameParseError;

impl fmt::Display for ProcessNameParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected process name as <job>.<rank>")
    }
}

impl std::error::Error for ProcessNameParseError {}

impl FromStr for ProcessName {
    type Err = ProcessNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (job, rank) = s.split_once('.').ok_or(ProcessNameParseError)?;
        Ok(Self {
            job: job.parse().map_err(|_| ProcessNameParseError)?,
            rank: rank.parse().map_err(|_| ProcessNameParseError)?,
        })
    }
}

/// Message tag, matched by the upward routing service.
///
/// Tag `0` is the reserved invalid sentinel and is never accepted for a
/// real send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub u32);

impl Tag {
    /// Reserved invalid tag.
    pub const INVALID: Self = Self(0);

    /// Whether this tag may be used for a real send.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound payload descriptor.
///
/// The caller supplies exactly one shape; the variants are mutually
/// exclusive by construction. The send pipeline flattens either shape into
/// one contiguous wire blob behind the fixed header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// One contiguous buffer.
    Single(Vec<u8>),
    /// A scatter/gather list, transmitted in order.
    Gather(Vec<Vec<u8>>),
}

impl Payload {
    /// Total number of payload bytes across all segments.
    #[must_use]
    pub fn total_len(&self) -> usize {
        match self {
            Self::Single(buf) => buf.len(),
            Self::Gather(segments) => segments.iter().map(Vec::len).sum(),
        }
    }

    /// Append every payload byte to `out`, in order.
    pub fn extend_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Single(buf) => out.extend_from_slice(buf),
            Self::Gather(segments) => {
                for segment in segments {
                    out.extend_from_slice(segment);
                }
            }
        }
    }
}

/// Terminal status of an accepted send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// The fabric reported the transmission complete.
    Success,
    /// The destination could not be resolved to a fabric address; the
    /// message never reached the fabric.
    AddresseeUnknown,
    /// The fabric reported an error for this send.
    TransportFailure,
}

/// Application-visible record of one send, released exactly once at
/// completion time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendRecord {
    /// Origin process (the local name at submission time).
    pub origin: ProcessName,
    /// Destination process.
    pub destination: ProcessName,
    /// Message tag.
    pub tag: Tag,
    /// Sequence number assigned at submission.
    pub seq: u32,
}

/// The single terminal notification for an accepted send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendOutcome {
    /// The send this outcome belongs to.
    pub record: SendRecord,
    /// How the send ended.
    pub status: SendStatus,
}

/// One received message, copied out of a conduit's shared receive region
/// and owned by the receiver from here on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Process that sent the message.
    pub origin: ProcessName,
    /// Message tag.
    pub tag: Tag,
    /// Sender-assigned sequence number.
    pub seq: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}
