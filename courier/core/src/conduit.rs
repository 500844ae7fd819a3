//! Conduit Lifecycle
//!
//! A conduit is one fully-initialized fabric endpoint together with its
//! bound completion queue, address table, and registered multi-use
//! receive region. The manager owns the whole set: it opens one conduit
//! per usable discovered provider, tears each down independently, and
//! exposes a read-only enumeration for the layers above.
//!
//! # Initialization contract
//!
//! A conduit is either fully initialized or fully torn down; there is no
//! partially-initialized steady state. Setup failure at any step releases
//! that conduit's partial resources and startup continues with the next
//! provider. Startup as a whole succeeds if at least one conduit opens.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CourierConfig;
use crate::fabric::{
    AddressFormat, AddressTable, CompletionQueue, Domain, Endpoint, EndpointType, Fabric,
    FabricError, FabricProvider, Protocol, RawAddress, ReceiveRegion, WakeupHandle,
};
use crate::message::ProcessName;
use crate::rendezvous::Rendezvous;

/// Read-only description of one opened conduit.
#[derive(Clone, Debug)]
pub struct ConduitInfo {
    /// Conduit identifier: its index among the opened conduits.
    pub conduit_id: usize,
    /// Name of the provider it was built from.
    pub provider_name: String,
    /// Wire protocol its endpoint speaks.
    pub protocol: Protocol,
}

/// One opened fabric endpoint and its resources.
///
/// Every resource field is individually guarded so teardown is safe on a
/// partially-built conduit.
pub(crate) struct Conduit {
    id: usize,
    provider_name: String,
    protocol: Protocol,
    address_format: AddressFormat,
    fabric: Option<Box<dyn Fabric>>,
    domain: Option<Box<dyn Domain>>,
    endpoint: Option<Box<dyn Endpoint>>,
    cq: Option<Box<dyn CompletionQueue>>,
    address_table: Option<Box<dyn AddressTable>>,
    recv_region: Option<Box<dyn ReceiveRegion>>,
    local_address: Option<RawAddress>,
    wakeup_registered: bool,
}

impl Conduit {
    fn empty(id: usize, provider_name: String, protocol: Protocol, format: AddressFormat) -> Self {
        Self {
            id,
            provider_name,
            protocol,
            address_format: format,
            fabric: None,
            domain: None,
            endpoint: None,
            cq: None,
            address_table: None,
            recv_region: None,
            local_address: None,
            wakeup_registered: false,
        }
    }

    pub(crate) fn address_format(&self) -> AddressFormat {
        self.address_format
    }

    pub(crate) fn address_table_mut(&mut self) -> Option<&mut (dyn AddressTable + 'static)> {
        self.address_table.as_deref_mut()
    }

    pub(crate) fn endpoint_mut(&mut self) -> Option<&mut (dyn Endpoint + 'static)> {
        self.endpoint.as_deref_mut()
    }

    /// Split borrows for one progress cycle: the completion queue to
    /// drain, the endpoint for reposting, and the receive region to copy
    /// completed messages out of.
    pub(crate) fn progress_parts(
        &mut self,
    ) -> Option<(
        &mut dyn CompletionQueue,
        &mut dyn Endpoint,
        &dyn ReceiveRegion,
    )> {
        match (&mut self.cq, &mut self.endpoint, &self.recv_region) {
            (Some(cq), Some(endpoint), Some(region)) => {
                Some((cq.as_mut(), endpoint.as_mut(), region.as_ref()))
            }
            _ => None,
        }
    }

    /// Release every resource this conduit acquired, in dependency order.
    /// Idempotent; safe on a partially-initialized conduit.
    fn release_resources(&mut self) {
        debug!(
            conduit_id = self.id,
            provider = %self.provider_name,
            "releasing conduit resources"
        );
        if self.wakeup_registered {
            if let Some(cq) = self.cq.as_mut() {
                cq.deregister_wakeup();
            }
            self.wakeup_registered = false;
        }
        self.recv_region = None;
        self.cq = None;
        self.address_table = None;
        self.endpoint = None;
        self.domain = None;
        self.fabric = None;
        self.local_address = None;
    }
}

impl Drop for Conduit {
    fn drop(&mut self) {
        self.release_resources();
    }
}

/// Log and forward one setup step's outcome.
fn step<T>(name: &'static str, result: Result<T, FabricError>) -> Result<T, FabricError> {
    if let Err(e) = &result {
        debug!(step = name, error = %e, "conduit setup step failed");
    }
    result
}

/// Drive the full setup sequence for one provider.
///
/// Resources are held in locals until every step has succeeded, so an
/// early return releases exactly the resources acquired so far; only a
/// complete set is assembled into a [`Conduit`].
async fn open_conduit(
    provider: &dyn FabricProvider,
    id: usize,
    local_name: ProcessName,
    rendezvous: &Arc<dyn Rendezvous>,
    wake_tx: &mpsc::UnboundedSender<usize>,
    config: &CourierConfig,
) -> Result<Conduit, FabricError> {
    let descriptor = provider.descriptor();

    let mut fabric = step("open_fabric", provider.open_fabric())?;
    let mut domain = step("open_domain", fabric.open_domain())?;
    let mut endpoint = step("create_endpoint", domain.create_endpoint())?;
    let cq = step("create_completion_queue", domain.create_completion_queue())?;
    let address_table = step("create_address_table", domain.create_address_table())?;

    step(
        "bind_completion_queue",
        endpoint.bind_completion_queue(cq.as_ref()),
    )?;
    step(
        "bind_address_table",
        endpoint.bind_address_table(address_table.as_ref()),
    )?;
    step("enable", endpoint.enable())?;

    let local_address = step("local_address", endpoint.local_address())?;
    debug!(
        conduit_id = id,
        provider = %descriptor.name,
        address = ?local_address,
        "publishing local endpoint address"
    );
    step(
        "publish_address",
        rendezvous
            .publish(local_name, descriptor.address_format, &local_address)
            .await
            .map_err(|e| FabricError::Create(format!("address publication failed: {e}"))),
    )?;

    let recv_region = step(
        "register_receive_region",
        domain.register_receive_region(config.recv_buffer_size),
    )?;
    step(
        "set_min_multi_recv",
        endpoint.set_min_multi_recv(config.min_multi_recv),
    )?;
    step("post_receive", endpoint.post_receive(recv_region.as_ref()))?;

    let mut conduit = Conduit::empty(
        id,
        descriptor.name.clone(),
        descriptor.protocol,
        descriptor.address_format,
    );
    conduit.fabric = Some(fabric);
    conduit.domain = Some(domain);
    conduit.endpoint = Some(endpoint);
    conduit.cq = Some(cq);
    conduit.address_table = Some(address_table);
    conduit.recv_region = Some(recv_region);
    conduit.local_address = Some(local_address);

    // Readiness registration is last: from here the event loop may be
    // woken for this conduit at any time.
    if let Some(cq) = conduit.cq.as_mut() {
        cq.register_wakeup(WakeupHandle::new(id, wake_tx.clone()));
        conduit.wakeup_registered = true;
    }
    Ok(conduit)
}

/// Owner of every opened conduit.
pub(crate) struct ConduitManager {
    conduits: Vec<Conduit>,
}

impl ConduitManager {
    /// Attempt to open one conduit per discovered provider.
    ///
    /// Providers that are not reliable-datagram capable are skipped, and a
    /// provider whose setup fails at any step is torn down and skipped;
    /// neither aborts startup. The caller decides whether zero opened
    /// conduits is fatal.
    pub(crate) async fn open_all(
        providers: Vec<Box<dyn FabricProvider>>,
        local_name: ProcessName,
        rendezvous: &Arc<dyn Rendezvous>,
        wake_tx: &mpsc::UnboundedSender<usize>,
        config: &CourierConfig,
    ) -> Self {
        let mut conduits = Vec::new();
        for provider in providers {
            let descriptor = provider.descriptor();
            if descriptor.endpoint_type != EndpointType::ReliableDatagram {
                debug!(
                    provider = %descriptor.name,
                    "provider does not offer reliable-datagram endpoints; skipping"
                );
                continue;
            }
            let id = conduits.len();
            let name = descriptor.name.clone();
            match open_conduit(
                provider.as_ref(),
                id,
                local_name,
                rendezvous,
                wake_tx,
                config,
            )
            .await
            {
                Ok(conduit) => {
                    info!(
                        conduit_id = id,
                        provider = %name,
                        protocol = %conduit.protocol,
                        "conduit opened"
                    );
                    conduits.push(conduit);
                }
                Err(e) => {
                    warn!(
                        provider = %name,
                        error = %e,
                        "failed to open conduit; trying next provider"
                    );
                }
            }
        }
        Self { conduits }
    }

    pub(crate) fn opened(&self) -> usize {
        self.conduits.len()
    }

    pub(crate) fn conduit_mut(&mut self, id: usize) -> Option<&mut Conduit> {
        self.conduits.get_mut(id)
    }

    /// Read-only snapshot of the opened conduits.
    pub(crate) fn enumerate(&self) -> Vec<ConduitInfo> {
        self.conduits
            .iter()
            .map(|conduit| ConduitInfo {
                conduit_id: conduit.id,
                provider_name: conduit.provider_name.clone(),
                protocol: conduit.protocol,
            })
            .collect()
    }

    /// Tear down every conduit.
    pub(crate) fn close_all(&mut self) {
        for conduit in &mut self.conduits {
            conduit.release_resources();
        }
        self.conduits.clear();
        info!("all conduits closed");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::fabric::loopback::{LoopbackNetwork, LoopbackProvider};
    use crate::rendezvous::InMemoryRendezvous;

    fn rendezvous() -> Arc<dyn Rendezvous> {
        Arc::new(InMemoryRendezvous::new())
    }

    #[tokio::test]
    async fn test_open_all_publishes_and_enumerates() {
        let network = LoopbackNetwork::new();
        let providers: Vec<Box<dyn FabricProvider>> = vec![
            Box::new(LoopbackProvider::new("lo0", network.clone())),
            Box::new(LoopbackProvider::new("lo1", network.clone())),
        ];
        let rendezvous = rendezvous();
        let (wake_tx, _wake_rx) = mpsc::unbounded_channel();
        let name = ProcessName::new(1, 0);

        let manager = ConduitManager::open_all(
            providers,
            name,
            &rendezvous,
            &wake_tx,
            &CourierConfig::default(),
        )
        .await;

        assert_eq!(manager.opened(), 2);
        let info = manager.enumerate();
        assert_eq!(info[0].conduit_id, 0);
        assert_eq!(info[0].provider_name, "lo0");
        assert_eq!(info[1].conduit_id, 1);
        assert_eq!(info[1].provider_name, "lo1");

        // The last provider's publication wins for the shared format key;
        // either way an address must be resolvable after startup.
        assert!(rendezvous
            .resolve(name, AddressFormat::Local)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let network = LoopbackNetwork::new();
        let providers: Vec<Box<dyn FabricProvider>> =
            vec![Box::new(LoopbackProvider::new("lo0", network.clone()))];
        let (wake_tx, _wake_rx) = mpsc::unbounded_channel();

        let mut manager = ConduitManager::open_all(
            providers,
            ProcessName::new(1, 0),
            &rendezvous(),
            &wake_tx,
            &CourierConfig::default(),
        )
        .await;
        assert_eq!(manager.opened(), 1);

        manager.close_all();
        assert_eq!(manager.opened(), 0);
        manager.close_all();
        assert_eq!(manager.opened(), 0);
    }
}
