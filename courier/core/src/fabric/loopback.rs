//! Loopback Fabric Provider
//!
//! In-process delivery between endpoints registered on one
//! [`LoopbackNetwork`]. The network handle is explicitly owned and cloned
//! into every provider built over it; there is no ambient registry.
//!
//! Used by tests, simulations, and embedded single-process setups. Sends
//! to an endpoint that has left the network produce error completions on
//! the sender's queue, and [`LoopbackNetwork::inject_busy`] can make a
//! number of submissions report transient exhaustion, so the failure
//! paths of the layers above are exercisable without real hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::address::{decode_local, encode_local};
use super::buffer::{Deposit, MultiRecvBuffer, RegionHandle};
use super::cq::{push_deposit, CqHandle, CqState};
use super::{
    flags, AddressFormat, AddressTable, Completion, CompletionQueue, CorrelationToken, CqErrorEntry,
    Domain, Endpoint, EndpointType, Fabric, FabricAddr, FabricError, FabricProvider, Protocol,
    ProviderDescriptor, RawAddress, ReceiveRegion, ResourceToken, SubmitError,
};

/// Shared in-process fabric medium.
///
/// Endpoints register at enable time and receive a unique endpoint number;
/// that number, encoded as a [`AddressFormat::Local`] blob, is the address
/// peers resolve and insert into their tables.
#[derive(Clone, Debug, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    next_endpoint: u64,
    endpoints: HashMap<u64, Arc<Mutex<Inbox>>>,
    busy_budget: HashMap<u64, u32>,
}

/// Per-endpoint delivery state shared with the network.
#[derive(Debug, Default)]
struct Inbox {
    region: Option<Arc<Mutex<MultiRecvBuffer>>>,
    cq: Option<Arc<Mutex<CqState>>>,
    /// Messages that arrived before a receive region was registered.
    early: VecDeque<Vec<u8>>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: make the next `submissions` sends from `endpoint`
    /// report transient local exhaustion.
    pub fn inject_busy(&self, endpoint: u64, submissions: u32) {
        self.inner.lock().busy_budget.insert(endpoint, submissions);
    }

    /// Fault injection: remove `endpoint` from the network so sends to it
    /// fail with an error completion, as if the peer vanished.
    pub fn drop_endpoint(&self, endpoint: u64) {
        self.inner.lock().endpoints.remove(&endpoint);
    }

    fn register(&self, inbox: Arc<Mutex<Inbox>>) -> u64 {
        let mut state = self.inner.lock();
        state.next_endpoint += 1;
        let addr = state.next_endpoint;
        state.endpoints.insert(addr, inbox);
        addr
    }

    fn deregister(&self, endpoint: u64) {
        let mut state = self.inner.lock();
        state.endpoints.remove(&endpoint);
        state.busy_budget.remove(&endpoint);
    }

    fn lookup(&self, endpoint: u64) -> Option<Arc<Mutex<Inbox>>> {
        self.inner.lock().endpoints.get(&endpoint).cloned()
    }

    fn consume_busy(&self, endpoint: u64) -> bool {
        let mut state = self.inner.lock();
        match state.busy_budget.get_mut(&endpoint) {
            Some(budget) if *budget > 0 => {
                *budget -= 1;
                true
            }
            _ => false,
        }
    }
}

fn deliver_to(inbox: &Arc<Mutex<Inbox>>, bytes: Vec<u8>) {
    let (region, cq) = {
        let mut inbox = inbox.lock();
        match (inbox.region.clone(), inbox.cq.clone()) {
            (Some(region), Some(cq)) => (region, cq),
            _ => {
                inbox.early.push_back(bytes);
                return;
            }
        }
    };
    let deposit = region.lock().deposit(bytes);
    if deposit == Deposit::Dropped {
        tracing::warn!("loopback message larger than the receive region; discarded");
    }
    push_deposit(&cq, &deposit);
}

/// Loopback provider over an explicitly-owned [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackProvider {
    descriptor: ProviderDescriptor,
    network: LoopbackNetwork,
}

impl LoopbackProvider {
    /// Create a provider named `name` on `network`.
    #[must_use]
    pub fn new(name: &str, network: LoopbackNetwork) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                name: name.to_string(),
                address_format: AddressFormat::Local,
                protocol: Protocol::Loopback,
                endpoint_type: EndpointType::ReliableDatagram,
            },
            network,
        }
    }
}

impl FabricProvider for LoopbackProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn open_fabric(&self) -> Result<Box<dyn Fabric>, FabricError> {
        Ok(Box::new(LoopbackFabric {
            network: self.network.clone(),
        }))
    }
}

struct LoopbackFabric {
    network: LoopbackNetwork,
}

impl Fabric for LoopbackFabric {
    fn open_domain(&mut self) -> Result<Box<dyn Domain>, FabricError> {
        Ok(Box::new(LoopbackDomain {
            network: self.network.clone(),
            shared: Arc::new(Mutex::new(DomainState::default())),
            next_token: 0,
        }))
    }
}

#[derive(Default)]
struct DomainState {
    cqs: HashMap<u64, Arc<Mutex<CqState>>>,
    tables: HashMap<u64, Arc<Mutex<TableState>>>,
    regions: HashMap<u64, Arc<Mutex<MultiRecvBuffer>>>,
}

struct LoopbackDomain {
    network: LoopbackNetwork,
    shared: Arc<Mutex<DomainState>>,
    next_token: u64,
}

impl LoopbackDomain {
    fn allocate_token(&mut self) -> ResourceToken {
        self.next_token += 1;
        ResourceToken(self.next_token)
    }
}

impl Domain for LoopbackDomain {
    fn create_endpoint(&mut self) -> Result<Box<dyn Endpoint>, FabricError> {
        Ok(Box::new(LoopbackEndpoint {
            network: self.network.clone(),
            domain: Arc::clone(&self.shared),
            inbox: Arc::new(Mutex::new(Inbox::default())),
            addr: None,
            cq: None,
            table: None,
            min_multi_recv: 0,
            enabled: false,
        }))
    }

    fn create_completion_queue(&mut self) -> Result<Box<dyn CompletionQueue>, FabricError> {
        let token = self.allocate_token();
        let state = Arc::new(Mutex::new(CqState::default()));
        self.shared.lock().cqs.insert(token.0, Arc::clone(&state));
        Ok(Box::new(CqHandle::new(token, state)))
    }

    fn create_address_table(&mut self) -> Result<Box<dyn AddressTable>, FabricError> {
        let token = self.allocate_token();
        let state = Arc::new(Mutex::new(TableState::default()));
        self.shared
            .lock()
            .tables
            .insert(token.0, Arc::clone(&state));
        Ok(Box::new(LoopbackTable { token, state }))
    }

    fn register_receive_region(
        &mut self,
        len: usize,
    ) -> Result<Box<dyn ReceiveRegion>, FabricError> {
        if len == 0 {
            return Err(FabricError::Create(
                "receive region must not be empty".into(),
            ));
        }
        let token = self.allocate_token();
        let state = Arc::new(Mutex::new(MultiRecvBuffer::new(len)));
        self.shared
            .lock()
            .regions
            .insert(token.0, Arc::clone(&state));
        Ok(Box::new(RegionHandle::new(token, state)))
    }
}

#[derive(Debug, Default)]
struct TableState {
    by_blob: HashMap<Vec<u8>, FabricAddr>,
    endpoints: Vec<u64>,
}

struct LoopbackTable {
    token: ResourceToken,
    state: Arc<Mutex<TableState>>,
}

impl AddressTable for LoopbackTable {
    fn token(&self) -> ResourceToken {
        self.token
    }

    fn insert(&mut self, address: &RawAddress) -> Result<FabricAddr, FabricError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.by_blob.get(address.as_bytes()) {
            return Ok(*existing);
        }
        let endpoint = decode_local(address)?;
        let fabric_addr = FabricAddr(state.endpoints.len() as u64);
        state.endpoints.push(endpoint);
        state.by_blob.insert(address.as_bytes().to_vec(), fabric_addr);
        Ok(fabric_addr)
    }
}

struct LoopbackEndpoint {
    network: LoopbackNetwork,
    domain: Arc<Mutex<DomainState>>,
    inbox: Arc<Mutex<Inbox>>,
    addr: Option<u64>,
    cq: Option<Arc<Mutex<CqState>>>,
    table: Option<Arc<Mutex<TableState>>>,
    min_multi_recv: usize,
    enabled: bool,
}

impl Endpoint for LoopbackEndpoint {
    fn bind_completion_queue(&mut self, cq: &dyn CompletionQueue) -> Result<(), FabricError> {
        let state = self
            .domain
            .lock()
            .cqs
            .get(&cq.token().0)
            .cloned()
            .ok_or_else(|| FabricError::Create("completion queue from another domain".into()))?;
        self.inbox.lock().cq = Some(Arc::clone(&state));
        self.cq = Some(state);
        Ok(())
    }

    fn bind_address_table(&mut self, table: &dyn AddressTable) -> Result<(), FabricError> {
        let state = self
            .domain
            .lock()
            .tables
            .get(&table.token().0)
            .cloned()
            .ok_or_else(|| FabricError::Create("address table from another domain".into()))?;
        self.table = Some(state);
        Ok(())
    }

    fn enable(&mut self) -> Result<(), FabricError> {
        if self.cq.is_none() {
            return Err(FabricError::Create(
                "endpoint has no completion queue bound".into(),
            ));
        }
        if self.enabled {
            return Ok(());
        }
        self.addr = Some(self.network.register(Arc::clone(&self.inbox)));
        self.enabled = true;
        Ok(())
    }

    fn local_address(&self) -> Result<RawAddress, FabricError> {
        self.addr
            .map(encode_local)
            .ok_or(FabricError::NotReady("endpoint is not enabled"))
    }

    fn set_min_multi_recv(&mut self, bytes: usize) -> Result<(), FabricError> {
        self.min_multi_recv = bytes;
        Ok(())
    }

    fn post_receive(&mut self, region: &dyn ReceiveRegion) -> Result<(), FabricError> {
        let region_state = self
            .domain
            .lock()
            .regions
            .get(&region.token().0)
            .cloned()
            .ok_or_else(|| FabricError::Create("receive region from another domain".into()))?;
        let cq = self
            .cq
            .clone()
            .ok_or(FabricError::NotReady("no completion queue bound"))?;

        let early: Vec<Vec<u8>> = {
            let mut inbox = self.inbox.lock();
            if inbox.region.is_none() {
                inbox.region = Some(Arc::clone(&region_state));
            }
            inbox.early.drain(..).collect()
        };

        let deposits = {
            let mut region = region_state.lock();
            region.set_min_multi_recv(self.min_multi_recv);
            for bytes in early {
                // Region is not yet posted here, so these only queue.
                let _ = region.deposit(bytes);
            }
            region.post()
        };
        for deposit in &deposits {
            if *deposit == Deposit::Dropped {
                tracing::warn!("queued loopback message larger than the receive region; discarded");
            }
            push_deposit(&cq, deposit);
        }
        Ok(())
    }

    fn submit_send(
        &mut self,
        blob: &[u8],
        destination: FabricAddr,
        context: CorrelationToken,
    ) -> Result<(), SubmitError> {
        if !self.enabled {
            return Err(SubmitError::Terminal("endpoint is not enabled".into()));
        }
        let Some(addr) = self.addr else {
            return Err(SubmitError::Terminal("endpoint has no address".into()));
        };
        let cq = self
            .cq
            .clone()
            .ok_or_else(|| SubmitError::Terminal("no completion queue bound".into()))?;
        let table = self
            .table
            .clone()
            .ok_or_else(|| SubmitError::Terminal("no address table bound".into()))?;

        if self.network.consume_busy(addr) {
            return Err(SubmitError::Busy);
        }

        let peer = {
            let table = table.lock();
            #[allow(clippy::cast_possible_truncation)]
            table
                .endpoints
                .get(destination.0 as usize)
                .copied()
                .ok_or_else(|| SubmitError::Terminal("unknown fabric address".into()))?
        };

        match self.network.lookup(peer) {
            Some(inbox) => {
                deliver_to(&inbox, blob.to_vec());
                cq.lock().push(Completion {
                    flags: flags::SEND | flags::TRANSMIT_COMPLETE,
                    len: blob.len(),
                    buf_offset: 0,
                    context: Some(context),
                });
            }
            None => {
                cq.lock().push_error(CqErrorEntry {
                    context: Some(context),
                    message: format!("loopback endpoint {peer} is unreachable"),
                });
            }
        }
        Ok(())
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        if let Some(addr) = self.addr.take() {
            self.network.deregister(addr);
        }
    }
}
