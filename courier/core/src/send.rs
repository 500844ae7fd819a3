//! Send Pipeline
//!
//! An outbound call is validated synchronously, then deferred onto the
//! progress engine's command channel so every conduit mutation happens in
//! the single progress context. The deferred handler resolves the
//! destination (once per send, no cache), inserts the address into the
//! conduit's table, flattens header plus payload into one contiguous
//! blob, and submits it through a bounded busy-retry. From acceptance on,
//! the request sits in the in-flight table until the progress engine
//! reports its one terminal completion.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::conduit::Conduit;
use crate::error::CourierError;
use crate::fabric::{CorrelationToken, Endpoint, FabricAddr, SubmitError};
use crate::frame::{self, MessageHeader};
use crate::message::{Payload, ProcessName, SendOutcome, SendRecord, SendStatus, Tag};
use crate::rendezvous::Rendezvous;

/// A validated send waiting for its turn in the progress context.
pub(crate) struct PendingSend {
    pub(crate) conduit_id: usize,
    pub(crate) destination: ProcessName,
    pub(crate) tag: Tag,
    pub(crate) payload: Payload,
    pub(crate) completion: oneshot::Sender<SendOutcome>,
}

/// One outstanding send: its record, the owned wire blob, the completion
/// counter, and the channel its terminal notification goes out on.
pub(crate) struct InFlightSend {
    record: SendRecord,
    /// Owned until completion; the fabric may reference it while the
    /// operation is outstanding.
    #[allow(dead_code)]
    blob: Vec<u8>,
    completions_remaining: u32,
    completion: oneshot::Sender<SendOutcome>,
}

impl InFlightSend {
    /// Deliver the terminal notification and release the request.
    pub(crate) fn finish(mut self, status: SendStatus) {
        debug_assert_eq!(self.completions_remaining, 1);
        self.completions_remaining = 0;
        trace!(
            destination = %self.record.destination,
            tag = %self.record.tag,
            seq = self.record.seq,
            ?status,
            "send complete"
        );
        if self
            .completion
            .send(SendOutcome {
                record: self.record,
                status,
            })
            .is_err()
        {
            trace!("send completion receiver dropped");
        }
    }
}

/// Explicit correlation table: token in, owning request out.
///
/// The send pipeline inserts on submission and the progress engine
/// removes on completion; a lookup miss in the completion path is an
/// accounting failure, never ignored.
#[derive(Default)]
pub(crate) struct InFlightTable {
    entries: HashMap<u64, InFlightSend>,
    next_token: u64,
}

impl InFlightTable {
    /// Allocate the correlation token for a submission about to happen.
    pub(crate) fn allocate_token(&mut self) -> CorrelationToken {
        self.next_token += 1;
        CorrelationToken(self.next_token)
    }

    pub(crate) fn insert(&mut self, token: CorrelationToken, send: InFlightSend) {
        self.entries.insert(token.0, send);
    }

    pub(crate) fn remove(&mut self, token: CorrelationToken) -> Option<InFlightSend> {
        self.entries.remove(&token.0)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.entries.len()
    }
}

/// Synchronous parameter validation, before any resource use.
pub(crate) fn validate(
    opened_conduits: usize,
    conduit_id: usize,
    destination: ProcessName,
    tag: Tag,
) -> Result<(), CourierError> {
    if conduit_id >= opened_conduits {
        return Err(CourierError::BadParameter(
            "conduit id does not index an opened conduit",
        ));
    }
    if !tag.is_valid() {
        return Err(CourierError::BadParameter("tag is the reserved sentinel"));
    }
    if !destination.is_valid() {
        return Err(CourierError::BadParameter("destination name is invalid"));
    }
    Ok(())
}

fn complete_without_submission(pending: PendingSend, record: SendRecord, status: SendStatus) {
    if pending
        .completion
        .send(SendOutcome { record, status })
        .is_err()
    {
        trace!("send completion receiver dropped");
    }
}

/// The deferred half of `send_async`, running in the progress context.
pub(crate) async fn run_submission(
    conduit: &mut Conduit,
    rendezvous: &Arc<dyn Rendezvous>,
    origin: ProcessName,
    seq: u32,
    retry_limit: u32,
    inflight: &mut InFlightTable,
    pending: PendingSend,
) {
    let record = SendRecord {
        origin,
        destination: pending.destination,
        tag: pending.tag,
        seq,
    };

    // One resolution per send; a miss completes the request without ever
    // touching the fabric.
    let raw = match rendezvous
        .resolve(pending.destination, conduit.address_format())
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            debug!(
                destination = %pending.destination,
                error = %e,
                "destination address resolution failed"
            );
            complete_without_submission(pending, record, SendStatus::AddresseeUnknown);
            return;
        }
    };

    let Some(table) = conduit.address_table_mut() else {
        warn!(conduit_id = pending.conduit_id, "conduit has no address table");
        complete_without_submission(pending, record, SendStatus::TransportFailure);
        return;
    };
    let fabric_addr = match table.insert(&raw) {
        Ok(addr) => addr,
        Err(e) => {
            warn!(
                destination = %pending.destination,
                error = %e,
                "address table insert failed"
            );
            complete_without_submission(pending, record, SendStatus::AddresseeUnknown);
            return;
        }
    };

    let header = MessageHeader {
        origin,
        destination: pending.destination,
        tag: pending.tag,
        seq,
    };
    let blob = frame::build_message(&header, &pending.payload);

    let Some(endpoint) = conduit.endpoint_mut() else {
        warn!(conduit_id = pending.conduit_id, "conduit has no endpoint");
        complete_without_submission(pending, record, SendStatus::TransportFailure);
        return;
    };

    let token = inflight.allocate_token();
    match submit_with_retry(endpoint, &blob, fabric_addr, token, retry_limit).await {
        Ok(()) => {
            trace!(
                destination = %pending.destination,
                tag = %pending.tag,
                seq,
                %token,
                len = blob.len(),
                "send submitted"
            );
            inflight.insert(
                token,
                InFlightSend {
                    record,
                    blob,
                    completions_remaining: 1,
                    completion: pending.completion,
                },
            );
        }
        Err(e) => {
            warn!(
                destination = %pending.destination,
                error = %e,
                "send submission failed"
            );
            complete_without_submission(pending, record, SendStatus::TransportFailure);
        }
    }
}

/// Submit `blob`, retrying while the provider reports transient local
/// exhaustion. Bounded: after `retry_limit` busy responses the submission
/// is treated as terminal. Any other error is terminal immediately.
pub(crate) async fn submit_with_retry(
    endpoint: &mut dyn Endpoint,
    blob: &[u8],
    destination: FabricAddr,
    context: CorrelationToken,
    retry_limit: u32,
) -> Result<(), SubmitError> {
    let mut retries = 0;
    loop {
        match endpoint.submit_send(blob, destination, context) {
            Ok(()) => return Ok(()),
            Err(SubmitError::Busy) => {
                retries += 1;
                if retries > retry_limit {
                    return Err(SubmitError::Terminal(format!(
                        "local resource exhaustion persisted past {retry_limit} retries"
                    )));
                }
                trace!(retries, "submission busy; retrying");
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_out_of_range_conduit() {
        let err = validate(1, 1, ProcessName::new(1, 1), Tag(5)).unwrap_err();
        assert!(matches!(err, CourierError::BadParameter(_)));
        assert!(validate(1, 0, ProcessName::new(1, 1), Tag(5)).is_ok());
    }

    #[test]
    fn test_validate_rejects_sentinels() {
        assert!(matches!(
            validate(1, 0, ProcessName::new(1, 1), Tag::INVALID),
            Err(CourierError::BadParameter(_))
        ));
        assert!(matches!(
            validate(1, 0, ProcessName::INVALID, Tag(5)),
            Err(CourierError::BadParameter(_))
        ));
    }

    #[test]
    fn test_inflight_table_tokens_are_unique() {
        let mut table = InFlightTable::default();
        let a = table.allocate_token();
        let b = table.allocate_token();
        assert_ne!(a, b);
        assert_eq!(table.outstanding(), 0);
    }

    #[test]
    fn test_inflight_finish_delivers_exactly_once() {
        let mut table = InFlightTable::default();
        let (tx, mut rx) = oneshot::channel();
        let record = SendRecord {
            origin: ProcessName::new(1, 0),
            destination: ProcessName::new(1, 1),
            tag: Tag(7),
            seq: 3,
        };
        let token = table.allocate_token();
        table.insert(
            token,
            InFlightSend {
                record,
                blob: vec![0; 4],
                completions_remaining: 1,
                completion: tx,
            },
        );

        let entry = table.remove(token).expect("entry present");
        entry.finish(SendStatus::Success);
        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.record, record);
        assert_eq!(outcome.status, SendStatus::Success);

        // Removed on completion: a second removal finds nothing.
        assert!(table.remove(token).is_none());
    }

    struct BusyEndpoint {
        busy_times: u32,
        calls: u32,
    }

    impl Endpoint for BusyEndpoint {
        fn bind_completion_queue(
            &mut self,
            _cq: &dyn crate::fabric::CompletionQueue,
        ) -> Result<(), crate::fabric::FabricError> {
            Ok(())
        }
        fn bind_address_table(
            &mut self,
            _table: &dyn crate::fabric::AddressTable,
        ) -> Result<(), crate::fabric::FabricError> {
            Ok(())
        }
        fn enable(&mut self) -> Result<(), crate::fabric::FabricError> {
            Ok(())
        }
        fn local_address(&self) -> Result<crate::fabric::RawAddress, crate::fabric::FabricError> {
            Err(crate::fabric::FabricError::NotReady("test endpoint"))
        }
        fn set_min_multi_recv(&mut self, _bytes: usize) -> Result<(), crate::fabric::FabricError> {
            Ok(())
        }
        fn post_receive(
            &mut self,
            _region: &dyn crate::fabric::ReceiveRegion,
        ) -> Result<(), crate::fabric::FabricError> {
            Ok(())
        }
        fn submit_send(
            &mut self,
            _blob: &[u8],
            _destination: FabricAddr,
            _context: CorrelationToken,
        ) -> Result<(), SubmitError> {
            self.calls += 1;
            if self.calls <= self.busy_times {
                Err(SubmitError::Busy)
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_submit_with_retry_recovers_from_transient_busy() {
        let mut endpoint = BusyEndpoint {
            busy_times: 3,
            calls: 0,
        };
        let result =
            submit_with_retry(&mut endpoint, b"x", FabricAddr(0), CorrelationToken(1), 8).await;
        assert!(result.is_ok());
        assert_eq!(endpoint.calls, 4);
    }

    #[tokio::test]
    async fn test_submit_with_retry_is_bounded() {
        let mut endpoint = BusyEndpoint {
            busy_times: u32::MAX,
            calls: 0,
        };
        let result =
            submit_with_retry(&mut endpoint, b"x", FabricAddr(0), CorrelationToken(1), 4).await;
        assert!(matches!(result, Err(SubmitError::Terminal(_))));
        assert_eq!(endpoint.calls, 5);
    }
}
