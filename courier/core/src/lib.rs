//! Courier Core - Fabric Conduit Messaging Transport
//!
//! A reliable-datagram messaging transport that multiplexes one or more
//! independent fabric endpoints ("conduits"), each built from a distinct
//! provider, to move tagged, length-framed messages between processes
//! identified by logical names. It is the transport layer beneath a
//! message-routing service: it accepts outbound (destination, tag,
//! payload) requests and delivers inbound messages upward; routing,
//! retransmission topology, and process naming live above it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Message-Routing Service                   │
//! │        send_async(dst, tag, payload)   deliver(msg)          │
//! └───────────────┬─────────────────────────────▲────────────────┘
//!                 │ command channel             │ inbound channel
//! ┌───────────────▼─────────────────────────────┴────────────────┐
//! │                       Progress Engine                        │
//! │   one task owning every conduit, the in-flight send table,   │
//! │   and the sequence counter; woken per-conduit on completion  │
//! │   queue readiness                                            │
//! │  ┌────────────┐  ┌────────────┐       ┌────────────┐         │
//! │  │ Conduit 0  │  │ Conduit 1  │  ...  │ Conduit N  │         │
//! │  │ endpoint   │  │ endpoint   │       │ endpoint   │         │
//! │  │ cq + table │  │ cq + table │       │ cq + table │         │
//! │  │ recv region│  │ recv region│       │ recv region│         │
//! │  └─────┬──────┘  └─────┬──────┘       └─────┬──────┘         │
//! └────────┼───────────────┼────────────────────┼────────────────┘
//!          │               │                    │
//!     loopback fabric   UDP fabric           ... providers
//! ```
//!
//! # Key Types
//!
//! - [`Courier`]: opens conduits and runs the progress engine
//! - [`Messenger`]: cloneable send handle with synchronous validation
//! - [`fabric::FabricProvider`]: the provider trait family conduits are
//!   built from ([`fabric::loopback`] and [`fabric::udp`] ship here)
//! - [`rendezvous::Rendezvous`]: external address publication/resolution
//! - [`InboundMessage`] / [`SendOutcome`]: what goes up
//!
//! # Delivery contract
//!
//! Every accepted send receives exactly one terminal notification,
//! strictly after acceptance: success when the fabric reports the
//! transmission complete, `AddresseeUnknown` when the destination cannot
//! be resolved (the fabric is never touched), `TransportFailure` for
//! fabric-reported errors. Rejected sends fail synchronously and never
//! complete. Inbound messages are copied out of the conduit's shared
//! receive region and owned by the receiver.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod conduit;
pub mod config;
mod courier;
mod engine;
pub mod error;
pub mod fabric;
pub mod frame;
pub mod message;
mod receive;
pub mod rendezvous;
mod send;

// Re-exports for convenience
pub use conduit::ConduitInfo;
pub use config::CourierConfig;
pub use courier::{Courier, Messenger};
pub use error::CourierError;
pub use frame::{MessageHeader, HEADER_LEN};
pub use message::{
    InboundMessage, Payload, ProcessName, SendOutcome, SendRecord, SendStatus, Tag,
};
