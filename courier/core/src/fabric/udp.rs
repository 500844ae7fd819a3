//! UDP Datagram Fabric Provider
//!
//! One bound UDP socket per endpoint. A per-endpoint reader task moves
//! datagrams from the socket into the registered receive region and
//! reports them through the completion queue; sends go out through
//! `try_send_to`, with `WouldBlock` surfaced as transient exhaustion so
//! the send pipeline's bounded retry applies.
//!
//! Endpoints must be created inside a tokio runtime: the socket is
//! registered with the runtime's reactor at creation time.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;

use super::address::{decode_inet4, encode_inet4};
use super::buffer::{Deposit, MultiRecvBuffer, RegionHandle};
use super::cq::{push_deposit, CqHandle, CqState};
use super::{
    flags, AddressFormat, AddressTable, Completion, CompletionQueue, CorrelationToken, Domain,
    Endpoint, EndpointType, Fabric, FabricAddr, FabricError, FabricProvider, Protocol,
    ProviderDescriptor, RawAddress, ReceiveRegion, ResourceToken, SubmitError,
};

/// Largest datagram the reader task accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

/// UDP provider; endpoints bind to `bind_addr` (use port 0 for an
/// ephemeral port per endpoint).
#[derive(Debug)]
pub struct UdpProvider {
    descriptor: ProviderDescriptor,
    bind_addr: SocketAddrV4,
}

impl UdpProvider {
    /// Create a provider named `name` binding endpoints to `bind_addr`.
    #[must_use]
    pub fn new(name: &str, bind_addr: SocketAddrV4) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                name: name.to_string(),
                address_format: AddressFormat::Inet4,
                protocol: Protocol::Udp,
                endpoint_type: EndpointType::ReliableDatagram,
            },
            bind_addr,
        }
    }
}

impl FabricProvider for UdpProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn open_fabric(&self) -> Result<Box<dyn Fabric>, FabricError> {
        Ok(Box::new(UdpFabric {
            bind_addr: self.bind_addr,
        }))
    }
}

struct UdpFabric {
    bind_addr: SocketAddrV4,
}

impl Fabric for UdpFabric {
    fn open_domain(&mut self) -> Result<Box<dyn Domain>, FabricError> {
        Ok(Box::new(UdpDomain {
            bind_addr: self.bind_addr,
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

struct UdpDomain {
    bind_addr: SocketAddrV4,
    shared: Arc<Mutex<DomainState>>,
    next_token: u64,
}

impl UdpDomain {
    fn allocate_token(&mut self) -> ResourceToken {
        self.next_token += 1;
        ResourceToken(self.next_token)
    }
}

impl Domain for UdpDomain {
    fn create_endpoint(&mut self) -> Result<Box<dyn Endpoint>, FabricError> {
        let socket = std::net::UdpSocket::bind(self.bind_addr)?;
        socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket)?;
        Ok(Box::new(UdpEndpoint {
            socket: Arc::new(socket),
            domain: Arc::clone(&self.shared),
            cq: None,
            table: None,
            region: None,
            reader: None,
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
        Ok(Box::new(UdpTable { token, state }))
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
    peers: Vec<SocketAddr>,
}

struct UdpTable {
    token: ResourceToken,
    state: Arc<Mutex<TableState>>,
}

impl AddressTable for UdpTable {
    fn token(&self) -> ResourceToken {
        self.token
    }

    fn insert(&mut self, address: &RawAddress) -> Result<FabricAddr, FabricError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.by_blob.get(address.as_bytes()) {
            return Ok(*existing);
        }
        let peer = decode_inet4(address)?;
        let fabric_addr = FabricAddr(state.peers.len() as u64);
        state.peers.push(SocketAddr::V4(peer));
        state.by_blob.insert(address.as_bytes().to_vec(), fabric_addr);
        Ok(fabric_addr)
    }
}

struct UdpEndpoint {
    socket: Arc<tokio::net::UdpSocket>,
    domain: Arc<Mutex<DomainState>>,
    cq: Option<Arc<Mutex<CqState>>>,
    table: Option<Arc<Mutex<TableState>>>,
    region: Option<Arc<Mutex<MultiRecvBuffer>>>,
    reader: Option<tokio::task::JoinHandle<()>>,
    min_multi_recv: usize,
    enabled: bool,
}

impl UdpEndpoint {
    fn spawn_reader(&mut self) {
        let (Some(cq), Some(region)) = (self.cq.clone(), self.region.clone()) else {
            return;
        };
        let socket = Arc::clone(&self.socket);
        self.reader = Some(tokio::spawn(async move {
            let mut staging = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut staging).await {
                    Ok((len, _peer)) => {
                        let deposit = region.lock().deposit(staging[..len].to_vec());
                        if deposit == Deposit::Dropped {
                            tracing::warn!(
                                len,
                                "datagram larger than the receive region; discarded"
                            );
                        }
                        push_deposit(&cq, &deposit);
                    }
                    Err(e) => {
                        // ICMP-induced errors surface here on some
                        // platforms; they do not invalidate the socket.
                        tracing::debug!(error = %e, "datagram receive error");
                    }
                }
            }
        }));
    }
}

impl Endpoint for UdpEndpoint {
    fn bind_completion_queue(&mut self, cq: &dyn CompletionQueue) -> Result<(), FabricError> {
        let state = self
            .domain
            .lock()
            .cqs
            .get(&cq.token().0)
            .cloned()
            .ok_or_else(|| FabricError::Create("completion queue from another domain".into()))?;
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
        self.enabled = true;
        Ok(())
    }

    fn local_address(&self) -> Result<RawAddress, FabricError> {
        if !self.enabled {
            return Err(FabricError::NotReady("endpoint is not enabled"));
        }
        match self.socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(encode_inet4(addr)),
            SocketAddr::V6(_) => Err(FabricError::InvalidAddress(
                "endpoint bound to an IPv6 address",
            )),
        }
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
        if self.region.is_none() {
            self.region = Some(Arc::clone(&region_state));
        }

        let deposits = {
            let mut region = region_state.lock();
            region.set_min_multi_recv(self.min_multi_recv);
            region.post()
        };
        for deposit in &deposits {
            if *deposit == Deposit::Dropped {
                tracing::warn!("queued datagram larger than the receive region; discarded");
            }
            push_deposit(&cq, deposit);
        }

        if self.reader.is_none() {
            self.spawn_reader();
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
        let cq = self
            .cq
            .clone()
            .ok_or_else(|| SubmitError::Terminal("no completion queue bound".into()))?;
        let peer = {
            let table = self
                .table
                .as_ref()
                .ok_or_else(|| SubmitError::Terminal("no address table bound".into()))?
                .lock();
            #[allow(clippy::cast_possible_truncation)]
            table
                .peers
                .get(destination.0 as usize)
                .copied()
                .ok_or_else(|| SubmitError::Terminal("unknown fabric address".into()))?
        };

        match self.socket.try_send_to(blob, peer) {
            Ok(_) => {
                cq.lock().push(Completion {
                    flags: flags::SEND | flags::TRANSMIT_COMPLETE,
                    len: blob.len(),
                    buf_offset: 0,
                    context: Some(context),
                });
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(SubmitError::Busy),
            Err(e) => Err(SubmitError::Terminal(e.to_string())),
        }
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::CqPoll;
    use super::*;

    struct TestConduit {
        endpoint: Box<dyn Endpoint>,
        cq: Box<dyn CompletionQueue>,
        table: Box<dyn AddressTable>,
        region: Box<dyn ReceiveRegion>,
    }

    fn open_test_conduit(region_len: usize) -> TestConduit {
        let provider = UdpProvider::new("udp", "127.0.0.1:0".parse().unwrap());
        let mut fabric = provider.open_fabric().unwrap();
        let mut domain = fabric.open_domain().unwrap();
        let mut endpoint = domain.create_endpoint().unwrap();
        let cq = domain.create_completion_queue().unwrap();
        let table = domain.create_address_table().unwrap();
        let region = domain.register_receive_region(region_len).unwrap();
        endpoint.bind_completion_queue(cq.as_ref()).unwrap();
        endpoint.bind_address_table(table.as_ref()).unwrap();
        endpoint.enable().unwrap();
        endpoint.post_receive(region.as_ref()).unwrap();
        TestConduit {
            endpoint,
            cq,
            table,
            region,
        }
    }

    async fn wait_entry(cq: &mut Box<dyn CompletionQueue>) -> Completion {
        for _ in 0..200 {
            if let CqPoll::Entry(entry) = cq.poll() {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no completion arrived within the deadline");
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let mut a = open_test_conduit(1024);
        let mut b = open_test_conduit(1024);

        let b_addr = b.endpoint.local_address().unwrap();
        let dest = a.table.insert(&b_addr).unwrap();
        a.endpoint
            .submit_send(b"over the wire", dest, CorrelationToken(7))
            .unwrap();

        let send_done = wait_entry(&mut a.cq).await;
        assert_eq!(send_done.flags, flags::SEND | flags::TRANSMIT_COMPLETE);
        assert_eq!(send_done.context, Some(CorrelationToken(7)));

        let received = wait_entry(&mut b.cq).await;
        assert_eq!(received.flags & flags::RECV, flags::RECV);
        assert_eq!(
            b.region.copy_out(received.buf_offset, received.len),
            b"over the wire"
        );
    }

    #[tokio::test]
    async fn test_local_address_requires_enable() {
        let provider = UdpProvider::new("udp", "127.0.0.1:0".parse().unwrap());
        let mut fabric = provider.open_fabric().unwrap();
        let mut domain = fabric.open_domain().unwrap();
        let endpoint = domain.create_endpoint().unwrap();
        assert!(matches!(
            endpoint.local_address(),
            Err(FabricError::NotReady(_))
        ));
    }
}
