use async_trait::async_trait;
use error_stack::ResultExt;
use ethers::types::Log;

use crate::dispatch::{Action, DispatchRequest};
use crate::events::{self, DestinationEvent};
use crate::handlers::errors::Error;
use crate::log_processor::LogHandler;
use crate::message_id;
use crate::types::EVMAddress;

type Result<T> = error_stack::Result<T, Error>;

/// The executor role: consumes verification events from the destination
/// endpoint and triggers final execution of the message. The endpoint's own
/// id stands in for the destination chain id when deriving the identifier,
/// which is how this role agrees on identity with a verifier that saw the
/// dstEid on the send side.
pub struct Handler {
    endpoint: EVMAddress,
    own_eid: u32,
}

impl Handler {
    pub fn new(endpoint: EVMAddress, own_eid: u32) -> Self {
        Self { endpoint, own_eid }
    }
}

#[async_trait]
impl LogHandler for Handler {
    type Err = Error;

    async fn handle(&self, log: &Log) -> Result<Vec<DispatchRequest>> {
        if log.address != self.endpoint {
            return Ok(vec![]);
        }

        let event = match events::decode_destination_event(log) {
            Err(report) if matches!(report.current_context(), events::Error::UnknownEvent) => {
                return Ok(vec![])
            }
            event => event.change_context(Error::DeserializeEvent)?,
        };

        let message_id = match event {
            DestinationEvent::Verified(verified) => {
                message_id::derive(&verified.origin, self.own_eid, verified.receiver)
            }
            // the status revision carries the identifier verbatim
            DestinationEvent::Attested(status) => status.message_id,
        };

        Ok(vec![DispatchRequest {
            message_id,
            action: Action::Execute,
        }])
    }
}
