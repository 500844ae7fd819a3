//! Receive Dispatch
//!
//! Copies one completed message out of a conduit's shared receive region
//! (the region is about to be reused) and forwards it upward. The shared
//! region is never exposed past this point.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::fabric::{Completion, ReceiveRegion};
use crate::frame::{MessageHeader, HEADER_LEN};
use crate::message::InboundMessage;

/// Extract header and payload from a receive completion and forward the
/// message on the upward delivery channel.
pub(crate) fn dispatch(
    region: &dyn ReceiveRegion,
    completion: &Completion,
    inbound_tx: &mpsc::UnboundedSender<InboundMessage>,
) {
    let mut bytes = region.copy_out(completion.buf_offset, completion.len);
    let header = match MessageHeader::decode(&bytes) {
        Ok(header) => header,
        Err(e) => {
            warn!(len = completion.len, error = %e, "dropping undecodable message");
            return;
        }
    };
    let payload = bytes.split_off(HEADER_LEN);
    debug!(
        origin = %header.origin,
        tag = %header.tag,
        seq = header.seq,
        len = payload.len(),
        "inbound message"
    );
    let message = InboundMessage {
        origin: header.origin,
        tag: header.tag,
        seq: header.seq,
        payload,
    };
    if inbound_tx.send(message).is_err() {
        debug!("inbound receiver dropped; discarding message");
    }
}
