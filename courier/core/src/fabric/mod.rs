//! Fabric Provider Abstraction
//!
//! Object-safe traits over the fabric resources a conduit is built from:
//! fabric → domain → endpoint, plus the completion queue, address table,
//! and registered multi-use receive region bound to each endpoint.
//!
//! The conduit manager drives these traits step by step and never touches
//! provider internals; each provider supplies the whole resource family.
//! Two providers ship with the crate:
//!
//! - [`loopback`]: in-process fabric over an explicitly-owned
//!   [`loopback::LoopbackNetwork`], for tests, simulations, and embedded use
//! - [`udp`]: datagram fabric over a bound UDP socket per endpoint
//!
//! # Completion model
//!
//! Completions are reported through the completion queue as flag-bit
//! combinations ([`flags`]), one entry at a time. Error completions are
//! signalled out of band ([`CqPoll::ErrorAvailable`]) and read through
//! [`CompletionQueue::read_error`]. A queue that becomes readable while
//! idle notifies the event loop through its registered [`WakeupHandle`];
//! the progress engine is the only drainer of any queue.

pub mod address;
mod buffer;
mod cq;
pub mod loopback;
pub mod udp;

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

pub use address::{AddressFormat, FabricAddr, RawAddress};

/// Completion flag bits, combined per entry.
pub mod flags {
    /// The entry refers to a send operation.
    pub const SEND: u32 = 1;
    /// Transmission of the send has finished.
    pub const TRANSMIT_COMPLETE: u32 = 1 << 1;
    /// The entry carries a received message.
    pub const RECV: u32 = 1 << 2;
    /// The shared multi-use receive buffer was released and must be
    /// reposted before further messages can land.
    pub const MULTI_RECV: u32 = 1 << 3;
}

/// Token correlating an in-flight operation with its later completion.
///
/// Allocated by the send pipeline, carried opaquely by the provider, and
/// echoed back in the matching completion entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationToken(pub u64);

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provider-internal identifier for a created resource, used to wire
/// resources together across object-safe trait boundaries (e.g. binding a
/// completion queue to an endpoint).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceToken(pub u64);

/// One completion queue entry.
#[derive(Clone, Debug)]
pub struct Completion {
    /// Flag-bit combination from [`flags`].
    pub flags: u32,
    /// Completed byte count. For receives this is the full message length
    /// (header plus payload) placed in the receive region.
    pub len: usize,
    /// Offset of the completed bytes within the receive region. Zero and
    /// meaningless for send completions.
    pub buf_offset: usize,
    /// Correlation context for operations that carry one (sends).
    pub context: Option<CorrelationToken>,
}

/// Result of polling a completion queue for one entry.
#[derive(Debug)]
pub enum CqPoll {
    /// A completion entry was dequeued.
    Entry(Completion),
    /// An error completion is pending; read it with
    /// [`CompletionQueue::read_error`].
    ErrorAvailable,
    /// The queue is empty.
    Empty,
}

/// Detailed record for one error completion.
#[derive(Clone, Debug)]
pub struct CqErrorEntry {
    /// Correlation context of the failed operation, if it carried one.
    pub context: Option<CorrelationToken>,
    /// Provider-reported description of the failure.
    pub message: String,
}

/// Readiness-notification handle a completion queue holds while registered
/// with the event loop.
///
/// The queue fires it on the idle-to-readable transition; the payload is
/// the owning conduit's identifier so one channel can serve every conduit.
#[derive(Clone, Debug)]
pub struct WakeupHandle {
    conduit_id: usize,
    tx: mpsc::UnboundedSender<usize>,
}

impl WakeupHandle {
    /// Create a handle that wakes the event loop for `conduit_id`.
    #[must_use]
    pub fn new(conduit_id: usize, tx: mpsc::UnboundedSender<usize>) -> Self {
        Self { conduit_id, tx }
    }

    /// Conduit this handle wakes.
    #[must_use]
    pub fn conduit_id(&self) -> usize {
        self.conduit_id
    }

    /// Fire the notification. A closed event loop is ignored; the queue
    /// keeps its entries either way.
    pub fn notify(&self) {
        let _ = self.tx.send(self.conduit_id);
    }
}

/// Endpoint style a provider exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    /// Reliable datagram: connectionless, message-bounded, delivered
    /// reliably by the provider. The only type conduits are built from.
    ReliableDatagram,
}

/// Wire protocol spoken by a provider's endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// In-process loopback delivery.
    Loopback,
    /// UDP datagrams.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Discovered fabric capability. Immutable once enumerated.
#[derive(Clone, Debug)]
pub struct ProviderDescriptor {
    /// Provider name, unique within one discovery pass.
    pub name: String,
    /// Address format its endpoints publish and resolve.
    pub address_format: AddressFormat,
    /// Wire protocol of its endpoints.
    pub protocol: Protocol,
    /// Endpoint style offered.
    pub endpoint_type: EndpointType,
}

/// Errors from fabric resource setup and teardown.
#[derive(Debug, Error)]
pub enum FabricError {
    /// A resource could not be created or wired up.
    #[error("fabric resource setup failed: {0}")]
    Create(String),
    /// An address blob did not match the expected format.
    #[error("invalid fabric address: {0}")]
    InvalidAddress(&'static str),
    /// An operation was attempted before the endpoint reached the
    /// required lifecycle stage.
    #[error("endpoint not ready: {0}")]
    NotReady(&'static str),
    /// Underlying I/O failure.
    #[error("fabric I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from submitting a send to an endpoint.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Transient local resource exhaustion; the submission may be retried.
    #[error("transient local resource exhaustion")]
    Busy,
    /// Non-transient failure; the submission must not be retried.
    #[error("submission failed: {0}")]
    Terminal(String),
}

/// A discovered provider a conduit can be opened from.
pub trait FabricProvider: Send {
    /// Capability descriptor for this provider.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Open the fabric: the root resource everything else hangs off.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the fabric cannot be instantiated.
    fn open_fabric(&self) -> Result<Box<dyn Fabric>, FabricError>;
}

/// An opened fabric.
pub trait Fabric: Send {
    /// Open the access domain used to create endpoint-side resources.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the domain cannot be opened.
    fn open_domain(&mut self) -> Result<Box<dyn Domain>, FabricError>;
}

/// An access domain: the factory for endpoints, queues, tables, and
/// registered memory.
pub trait Domain: Send {
    /// Create a communication endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the endpoint cannot be created.
    fn create_endpoint(&mut self) -> Result<Box<dyn Endpoint>, FabricError>;

    /// Create a completion queue.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the queue cannot be created.
    fn create_completion_queue(&mut self) -> Result<Box<dyn CompletionQueue>, FabricError>;

    /// Create an address table mapping raw peer addresses to compact
    /// fabric addresses.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the table cannot be created.
    fn create_address_table(&mut self) -> Result<Box<dyn AddressTable>, FabricError>;

    /// Allocate and register a multi-use receive region of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if registration fails.
    fn register_receive_region(&mut self, len: usize) -> Result<Box<dyn ReceiveRegion>, FabricError>;
}

/// A communication endpoint.
///
/// Lifecycle: bind the completion queue and address table, `enable`, then
/// the local address becomes available and receives can be posted.
pub trait Endpoint: Send {
    /// Bind the completion queue that will report this endpoint's send and
    /// receive completions.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the queue does not belong to the same
    /// domain.
    fn bind_completion_queue(&mut self, cq: &dyn CompletionQueue) -> Result<(), FabricError>;

    /// Bind the address table consulted for destination lookup on send.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the table does not belong to the same
    /// domain.
    fn bind_address_table(&mut self, table: &dyn AddressTable) -> Result<(), FabricError>;

    /// Commit the bindings and enable communication.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the endpoint cannot be enabled.
    fn enable(&mut self) -> Result<(), FabricError>;

    /// The endpoint's own fabric address, for publication.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError::NotReady`] before [`Endpoint::enable`].
    fn local_address(&self) -> Result<RawAddress, FabricError>;

    /// Set the remaining-space threshold below which the receive region is
    /// considered exhausted and released for reposting.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the endpoint rejects the setting.
    fn set_min_multi_recv(&mut self, bytes: usize) -> Result<(), FabricError>;

    /// Post (or repost) the multi-use receive region. Messages queued by
    /// the provider while no region was active are delivered immediately.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if the region cannot be posted.
    fn post_receive(&mut self, region: &dyn ReceiveRegion) -> Result<(), FabricError>;

    /// Submit one contiguous message blob to `destination`.
    ///
    /// On acceptance the operation is outstanding and will produce exactly
    /// one completion (success or error) carrying `context`.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Busy`] signals transient local exhaustion and may be
    /// retried; [`SubmitError::Terminal`] must not be.
    fn submit_send(
        &mut self,
        blob: &[u8],
        destination: FabricAddr,
        context: CorrelationToken,
    ) -> Result<(), SubmitError>;
}

/// A completion queue.
pub trait CompletionQueue: Send {
    /// Provider-internal identity, used when binding to an endpoint.
    fn token(&self) -> ResourceToken;

    /// Dequeue at most one entry.
    fn poll(&mut self) -> CqPoll;

    /// Read the detailed record for a pending error completion.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError`] if no error record is available; callers
    /// treat that as an accounting-integrity failure.
    fn read_error(&mut self) -> Result<CqErrorEntry, FabricError>;

    /// Install the readiness-notification handle fired on the
    /// idle-to-readable transition.
    fn register_wakeup(&mut self, handle: WakeupHandle);

    /// Remove the readiness-notification handle, if any.
    fn deregister_wakeup(&mut self);
}

/// An address table: raw peer address blobs in, compact fabric addresses
/// out.
pub trait AddressTable: Send {
    /// Provider-internal identity, used when binding to an endpoint.
    fn token(&self) -> ResourceToken;

    /// Insert a raw address, returning its fabric address. Inserting the
    /// same address again returns the existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError::InvalidAddress`] if the blob does not parse
    /// in this provider's format.
    fn insert(&mut self, address: &RawAddress) -> Result<FabricAddr, FabricError>;
}

/// A registered multi-use receive region.
///
/// The region is shared between the provider (which deposits inbound
/// messages) and the progress engine (which copies completed messages
/// out); delivery and repost happen back-to-back inside the engine, so
/// completed spans are stable until the region is reposted.
pub trait ReceiveRegion: Send {
    /// Provider-internal identity, used when posting.
    fn token(&self) -> ResourceToken;

    /// Region capacity in bytes.
    fn len(&self) -> usize;

    /// Whether the region has zero capacity.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `len` bytes starting at `offset` out of the region.
    fn copy_out(&self, offset: usize, len: usize) -> Vec<u8>;
}
