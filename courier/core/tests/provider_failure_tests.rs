//! Integration tests for degraded conduit startup
//!
//! Startup must open exactly the subset of providers that initialize
//! successfully, tearing down any partially-built conduit, and report
//! total failure only when that subset is empty. The failure-injecting
//! provider here wraps the loopback provider through the public fabric
//! traits and fails at one chosen setup step.

use std::sync::Arc;

use tokio::sync::oneshot;

use courier_core::fabric::loopback::{LoopbackNetwork, LoopbackProvider};
use courier_core::fabric::{
    AddressTable, CompletionQueue, Domain, Endpoint, Fabric, FabricError, FabricProvider,
    ProviderDescriptor, ReceiveRegion,
};
use courier_core::rendezvous::{InMemoryRendezvous, Rendezvous};
use courier_core::{Courier, CourierConfig, CourierError, Payload, ProcessName, Tag};

/// Setup step at which the flaky provider fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FailStep {
    OpenFabric,
    OpenDomain,
    CreateEndpoint,
    CreateCompletionQueue,
    Enable,
    RegisterReceiveRegion,
}

fn injected(step: FailStep) -> FabricError {
    FabricError::Create(format!("injected failure at {step:?}"))
}

struct FlakyProvider {
    inner: LoopbackProvider,
    fail: FailStep,
}

impl FlakyProvider {
    fn new(name: &str, network: LoopbackNetwork, fail: FailStep) -> Self {
        Self {
            inner: LoopbackProvider::new(name, network),
            fail,
        }
    }
}

impl FabricProvider for FlakyProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        self.inner.descriptor()
    }

    fn open_fabric(&self) -> Result<Box<dyn Fabric>, FabricError> {
        if self.fail == FailStep::OpenFabric {
            return Err(injected(self.fail));
        }
        Ok(Box::new(FlakyFabric {
            inner: self.inner.open_fabric()?,
            fail: self.fail,
        }))
    }
}

struct FlakyFabric {
    inner: Box<dyn Fabric>,
    fail: FailStep,
}

impl Fabric for FlakyFabric {
    fn open_domain(&mut self) -> Result<Box<dyn Domain>, FabricError> {
        if self.fail == FailStep::OpenDomain {
            return Err(injected(self.fail));
        }
        Ok(Box::new(FlakyDomain {
            inner: self.inner.open_domain()?,
            fail: self.fail,
        }))
    }
}

struct FlakyDomain {
    inner: Box<dyn Domain>,
    fail: FailStep,
}

impl Domain for FlakyDomain {
    fn create_endpoint(&mut self) -> Result<Box<dyn Endpoint>, FabricError> {
        if self.fail == FailStep::CreateEndpoint {
            return Err(injected(self.fail));
        }
        Ok(Box::new(FlakyEndpoint {
            inner: self.inner.create_endpoint()?,
            fail: self.fail,
        }))
    }

    fn create_completion_queue(&mut self) -> Result<Box<dyn CompletionQueue>, FabricError> {
        if self.fail == FailStep::CreateCompletionQueue {
            return Err(injected(self.fail));
        }
        self.inner.create_completion_queue()
    }

    fn create_address_table(&mut self) -> Result<Box<dyn AddressTable>, FabricError> {
        self.inner.create_address_table()
    }

    fn register_receive_region(
        &mut self,
        len: usize,
    ) -> Result<Box<dyn ReceiveRegion>, FabricError> {
        if self.fail == FailStep::RegisterReceiveRegion {
            return Err(injected(self.fail));
        }
        self.inner.register_receive_region(len)
    }
}

struct FlakyEndpoint {
    inner: Box<dyn Endpoint>,
    fail: FailStep,
}

impl Endpoint for FlakyEndpoint {
    fn bind_completion_queue(&mut self, cq: &dyn CompletionQueue) -> Result<(), FabricError> {
        self.inner.bind_completion_queue(cq)
    }

    fn bind_address_table(&mut self, table: &dyn AddressTable) -> Result<(), FabricError> {
        self.inner.bind_address_table(table)
    }

    fn enable(&mut self) -> Result<(), FabricError> {
        if self.fail == FailStep::Enable {
            return Err(injected(self.fail));
        }
        self.inner.enable()
    }

    fn local_address(&self) -> Result<courier_core::fabric::RawAddress, FabricError> {
        self.inner.local_address()
    }

    fn set_min_multi_recv(&mut self, bytes: usize) -> Result<(), FabricError> {
        self.inner.set_min_multi_recv(bytes)
    }

    fn post_receive(&mut self, region: &dyn ReceiveRegion) -> Result<(), FabricError> {
        self.inner.post_receive(region)
    }

    fn submit_send(
        &mut self,
        blob: &[u8],
        destination: courier_core::fabric::FabricAddr,
        context: courier_core::fabric::CorrelationToken,
    ) -> Result<(), courier_core::fabric::SubmitError> {
        self.inner.submit_send(blob, destination, context)
    }
}

async fn open_with_providers(
    providers: Vec<Box<dyn FabricProvider>>,
) -> Result<Courier, CourierError> {
    let rendezvous = Arc::new(InMemoryRendezvous::new());
    Courier::open(
        CourierConfig::default(),
        ProcessName::new(1, 0),
        providers,
        rendezvous as Arc<dyn Rendezvous>,
    )
    .await
    .map(|(courier, _inbound)| courier)
}

#[tokio::test]
async fn test_failing_provider_is_skipped_at_every_step() {
    for step in [
        FailStep::OpenFabric,
        FailStep::OpenDomain,
        FailStep::CreateEndpoint,
        FailStep::CreateCompletionQueue,
        FailStep::Enable,
        FailStep::RegisterReceiveRegion,
    ] {
        let network = LoopbackNetwork::new();
        let providers: Vec<Box<dyn FabricProvider>> = vec![
            Box::new(LoopbackProvider::new("good0", network.clone())),
            Box::new(FlakyProvider::new("flaky", network.clone(), step)),
            Box::new(LoopbackProvider::new("good1", network.clone())),
        ];

        let courier = open_with_providers(providers)
            .await
            .unwrap_or_else(|e| panic!("startup must survive a failure at {step:?}: {e}"));

        let conduits = courier.messenger().conduits();
        assert_eq!(conduits.len(), 2, "exactly the good subset opens ({step:?})");
        assert_eq!(conduits[0].provider_name, "good0");
        assert_eq!(conduits[1].provider_name, "good1");

        // The failed provider's would-be conduit id is out of range.
        let (tx, _rx) = oneshot::channel();
        let err = courier
            .messenger()
            .send_async(2, ProcessName::new(1, 1), Tag(1), Payload::Single(vec![1]), tx)
            .expect_err("the failed provider's slot must reject sends");
        assert!(matches!(err, CourierError::BadParameter(_)));

        courier.shutdown().await;
    }
}

#[tokio::test]
async fn test_all_providers_failing_is_total_failure() {
    let network = LoopbackNetwork::new();
    let providers: Vec<Box<dyn FabricProvider>> = vec![
        Box::new(FlakyProvider::new(
            "flaky0",
            network.clone(),
            FailStep::OpenFabric,
        )),
        Box::new(FlakyProvider::new(
            "flaky1",
            network.clone(),
            FailStep::Enable,
        )),
    ];

    let err = open_with_providers(providers)
        .await
        .err()
        .expect("startup must fail with zero conduits");
    assert!(matches!(err, CourierError::NoTransport));
}

#[tokio::test]
async fn test_no_providers_is_total_failure() {
    let err = open_with_providers(Vec::new())
        .await
        .err()
        .expect("startup must fail with no providers");
    assert!(matches!(err, CourierError::NoTransport));
}
