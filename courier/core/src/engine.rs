//! Progress Engine
//!
//! One task owns every conduit, the in-flight send table, and the
//! sequence counter. It is the single progress/dispatch context: deferred
//! sends arrive on the command channel, completion-queue readiness
//! arrives on the wakeup channel, and nothing else ever touches conduit
//! resources. No locks guard that state; serialization through this task
//! is the whole concurrency design.
//!
//! # Completion classification
//!
//! On each wakeup the engine drains the conduit's completion queue one
//! entry at a time: transmit completions finish the correlated send,
//! receive completions are dispatched upward (with the region reposted in
//! the same step when the entry also signals exhaustion), bare exhaustion
//! notices only repost, and unrecognized flag combinations are logged and
//! ignored. Error completions are read in detail and finish the
//! correlated send with a transport failure.
//!
//! # Fail-fast
//!
//! An unreadable error record or a completion whose correlation context
//! is missing from the in-flight table means the completion accounting
//! can no longer be trusted. The process terminates immediately rather
//! than continue in a possibly-corrupted state; this is deliberate and
//! distinct from ordinary transport errors, which are always scoped to
//! one send or one conduit.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::conduit::ConduitManager;
use crate::config::CourierConfig;
use crate::fabric::{flags, CqPoll, Endpoint, ReceiveRegion};
use crate::message::{InboundMessage, ProcessName, SendOutcome, SendRecord, SendStatus};
use crate::receive;
use crate::rendezvous::Rendezvous;
use crate::send::{self, InFlightTable, PendingSend};

/// Commands deferred onto the engine.
pub(crate) enum Command {
    /// A validated send to submit from the progress context.
    Send(PendingSend),
    /// Close every conduit and stop. Outstanding sends are abandoned.
    Shutdown,
}

/// The event-loop state machine.
pub(crate) struct Engine {
    pub(crate) manager: ConduitManager,
    pub(crate) rendezvous: Arc<dyn Rendezvous>,
    pub(crate) config: CourierConfig,
    pub(crate) local_name: ProcessName,
    pub(crate) inflight: InFlightTable,
    pub(crate) next_seq: u32,
    pub(crate) inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    pub(crate) cmd_rx: mpsc::UnboundedReceiver<Command>,
    pub(crate) wake_rx: mpsc::UnboundedReceiver<usize>,
}

impl Engine {
    /// Run until shutdown, then close every conduit.
    pub(crate) async fn run(mut self) {
        debug!(local = %self.local_name, "progress engine running");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(pending)) => self.handle_send(pending).await,
                    Some(Command::Shutdown) | None => break,
                },
                Some(conduit_id) = self.wake_rx.recv() => {
                    let drained = self.progress(conduit_id);
                    trace!(conduit_id, drained, "progress cycle complete");
                }
            }
        }
        if self.inflight.outstanding() > 0 {
            debug!(
                abandoned = self.inflight.outstanding(),
                "shutting down with outstanding sends"
            );
        }
        self.manager.close_all();
        debug!("progress engine stopped");
    }

    async fn handle_send(&mut self, pending: PendingSend) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let Self {
            manager,
            rendezvous,
            config,
            local_name,
            inflight,
            ..
        } = self;
        match manager.conduit_mut(pending.conduit_id) {
            Some(conduit) => {
                send::run_submission(
                    conduit,
                    rendezvous,
                    *local_name,
                    seq,
                    config.submit_retry_limit,
                    inflight,
                    pending,
                )
                .await;
            }
            None => {
                // Validation happens against the opened-conduit snapshot,
                // so this only fires if the two ever disagree.
                error!(
                    conduit_id = pending.conduit_id,
                    "deferred send names an unknown conduit"
                );
                let record = SendRecord {
                    origin: *local_name,
                    destination: pending.destination,
                    tag: pending.tag,
                    seq,
                };
                let _ = pending.completion.send(SendOutcome {
                    record,
                    status: SendStatus::TransportFailure,
                });
            }
        }
    }

    /// Drain one conduit's completion queue. Returns the number of
    /// entries processed in this wake cycle.
    fn progress(&mut self, conduit_id: usize) -> usize {
        let Self {
            manager,
            inflight,
            inbound_tx,
            ..
        } = self;
        let Some(conduit) = manager.conduit_mut(conduit_id) else {
            warn!(conduit_id, "wakeup for unknown conduit; ignoring");
            return 0;
        };
        let Some((cq, endpoint, region)) = conduit.progress_parts() else {
            warn!(conduit_id, "wakeup for torn-down conduit; ignoring");
            return 0;
        };

        let mut drained = 0;
        loop {
            match cq.poll() {
                CqPoll::Entry(completion) => {
                    drained += 1;
                    let entry_flags = completion.flags;
                    trace!(conduit_id, flags = entry_flags, "completion entry");
                    if entry_flags & flags::SEND != 0
                        && entry_flags & flags::TRANSMIT_COMPLETE != 0
                    {
                        finish_correlated(inflight, completion.context, SendStatus::Success);
                    } else if entry_flags & flags::RECV != 0
                        && entry_flags & flags::MULTI_RECV != 0
                    {
                        // The buffer was consumed together with this
                        // delivery: dispatch first, then restore receive
                        // capacity.
                        receive::dispatch(region, &completion, inbound_tx);
                        repost(conduit_id, endpoint, region);
                    } else if entry_flags & flags::RECV != 0 {
                        receive::dispatch(region, &completion, inbound_tx);
                    } else if entry_flags & flags::MULTI_RECV != 0 {
                        repost(conduit_id, endpoint, region);
                    } else {
                        warn!(
                            conduit_id,
                            flags = entry_flags,
                            "unhandled completion flag combination; ignoring"
                        );
                    }
                }
                CqPoll::ErrorAvailable => {
                    drained += 1;
                    match cq.read_error() {
                        Ok(err) => {
                            warn!(conduit_id, error = %err.message, "error completion");
                            finish_correlated(inflight, err.context, SendStatus::TransportFailure);
                        }
                        Err(e) => {
                            fatal(&format!("completion error record unreadable: {e}"));
                        }
                    }
                }
                CqPoll::Empty => break,
            }
        }
        drained
    }
}

/// Finish the send a completion correlates to. A missing context or an
/// unknown token is an accounting failure; see the module docs.
fn finish_correlated(
    inflight: &mut InFlightTable,
    context: Option<crate::fabric::CorrelationToken>,
    status: SendStatus,
) {
    let Some(token) = context else {
        fatal("completion carries no correlation context");
    };
    let Some(entry) = inflight.remove(token) else {
        fatal(&format!("completion for unknown correlation token {token}"));
    };
    entry.finish(status);
}

fn repost(conduit_id: usize, endpoint: &mut dyn Endpoint, region: &dyn ReceiveRegion) {
    trace!(conduit_id, "reposting receive region");
    if let Err(e) = endpoint.post_receive(region) {
        warn!(conduit_id, error = %e, "failed to repost receive region");
    }
}

/// Completion accounting can no longer be trusted; terminate immediately.
fn fatal(message: &str) -> ! {
    error!("unrecoverable completion accounting failure: {message}");
    std::process::abort();
}
