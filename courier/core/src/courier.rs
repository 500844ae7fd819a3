//! Courier Facade
//!
//! Wires the pieces together: opens one conduit per usable provider,
//! spawns the progress engine that owns them, and hands back the
//! [`Messenger`] send handle plus the upward delivery channel.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use courier_core::fabric::loopback::{LoopbackNetwork, LoopbackProvider};
//! use courier_core::fabric::FabricProvider;
//! use courier_core::rendezvous::InMemoryRendezvous;
//! use courier_core::{Courier, CourierConfig, Payload, ProcessName, Tag};
//! use tokio::sync::oneshot;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let network = LoopbackNetwork::new();
//! let rendezvous = Arc::new(InMemoryRendezvous::new());
//!
//! let providers: Vec<Box<dyn FabricProvider>> =
//!     vec![Box::new(LoopbackProvider::new("lo0", network.clone()))];
//! let (courier, mut inbound) = Courier::open(
//!     CourierConfig::default(),
//!     ProcessName::new(1, 0),
//!     providers,
//!     rendezvous.clone(),
//! )
//! .await
//! .unwrap();
//!
//! // Loopback to ourselves: resolve our own published address.
//! let (done_tx, done_rx) = oneshot::channel();
//! courier
//!     .messenger()
//!     .send_async(
//!         0,
//!         ProcessName::new(1, 0),
//!         Tag(7),
//!         Payload::Single(b"ping".to_vec()),
//!         done_tx,
//!     )
//!     .unwrap();
//!
//! let outcome = done_rx.await.unwrap();
//! let message = inbound.recv().await.unwrap();
//! assert_eq!(message.payload, b"ping");
//! # drop(outcome);
//! # courier.shutdown().await;
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::conduit::{ConduitInfo, ConduitManager};
use crate::config::CourierConfig;
use crate::engine::{Command, Engine};
use crate::error::CourierError;
use crate::fabric::FabricProvider;
use crate::message::{InboundMessage, Payload, ProcessName, SendOutcome, Tag};
use crate::rendezvous::Rendezvous;
use crate::send::{self, PendingSend};

/// Cloneable send handle onto a running transport.
#[derive(Clone)]
pub struct Messenger {
    cmd_tx: mpsc::UnboundedSender<Command>,
    directory: Arc<Vec<ConduitInfo>>,
    local_name: ProcessName,
}

impl Messenger {
    /// Accept a send for asynchronous submission on `conduit_id`.
    ///
    /// Parameters are validated synchronously; on acceptance the send is
    /// deferred onto the progress engine and this call returns
    /// immediately. `completion` receives the single terminal
    /// notification once the send is accepted; a rejected send never
    /// completes (the sender is dropped).
    ///
    /// # Errors
    ///
    /// [`CourierError::BadParameter`] for an out-of-range conduit id, the
    /// reserved tag sentinel, or an invalid destination name, with no
    /// side effects. [`CourierError::EngineUnavailable`] if the engine
    /// has stopped.
    pub fn send_async(
        &self,
        conduit_id: usize,
        destination: ProcessName,
        tag: Tag,
        payload: Payload,
        completion: oneshot::Sender<SendOutcome>,
    ) -> Result<(), CourierError> {
        send::validate(self.directory.len(), conduit_id, destination, tag)?;
        self.cmd_tx
            .send(Command::Send(PendingSend {
                conduit_id,
                destination,
                tag,
                payload,
                completion,
            }))
            .map_err(|_| CourierError::EngineUnavailable("progress engine stopped"))
    }

    /// Read-only snapshot of the opened conduits, for diagnostics and for
    /// upper layers selecting a conduit.
    #[must_use]
    pub fn conduits(&self) -> &[ConduitInfo] {
        &self.directory
    }

    /// The local process name sends originate from.
    #[must_use]
    pub fn local_name(&self) -> ProcessName {
        self.local_name
    }
}

/// A running transport instance.
pub struct Courier {
    messenger: Messenger,
    engine: tokio::task::JoinHandle<()>,
}

impl Courier {
    /// Open conduits over `providers` and start the progress engine.
    ///
    /// Each usable provider contributes one conduit; providers that fail
    /// to initialize are skipped. Local addresses are published through
    /// `rendezvous` during setup.
    ///
    /// Returns the running transport and the upward delivery channel on
    /// which every received message arrives.
    ///
    /// # Errors
    ///
    /// [`CourierError::BadParameter`] if `local_name` is the invalid
    /// sentinel; [`CourierError::NoTransport`] if no conduit could be
    /// opened at all.
    pub async fn open(
        config: CourierConfig,
        local_name: ProcessName,
        providers: Vec<Box<dyn FabricProvider>>,
        rendezvous: Arc<dyn Rendezvous>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>), CourierError> {
        if !local_name.is_valid() {
            return Err(CourierError::BadParameter("local process name is invalid"));
        }
        let config = config.sanitized();

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let manager =
            ConduitManager::open_all(providers, local_name, &rendezvous, &wake_tx, &config).await;
        if manager.opened() == 0 {
            warn!("no conduit could be opened");
            return Err(CourierError::NoTransport);
        }
        let directory = Arc::new(manager.enumerate());
        info!(
            local = %local_name,
            conduits = directory.len(),
            "transport ready"
        );

        let engine = Engine {
            manager,
            rendezvous,
            config,
            local_name,
            inflight: send::InFlightTable::default(),
            next_seq: 1,
            inbound_tx,
            cmd_rx,
            wake_rx,
        };
        let engine = tokio::spawn(engine.run());

        Ok((
            Self {
                messenger: Messenger {
                    cmd_tx,
                    directory,
                    local_name,
                },
                engine,
            },
            inbound_rx,
        ))
    }

    /// The send handle; clone it freely.
    #[must_use]
    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    /// Close every conduit and stop the engine. Outstanding sends are
    /// abandoned, not flushed.
    pub async fn shutdown(self) {
        let _ = self.messenger.cmd_tx.send(Command::Shutdown);
        if let Err(e) = self.engine.await {
            warn!(error = %e, "progress engine ended abnormally");
        }
    }
}
