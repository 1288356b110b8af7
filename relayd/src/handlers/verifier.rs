use async_trait::async_trait;
use error_stack::ResultExt;
use ethers::types::Log;
use serde::{Deserialize, Serialize};

use crate::dispatch::{Action, DispatchRequest};
use crate::events;
use crate::handlers::errors::Error;
use crate::log_processor::LogHandler;
use crate::message_id;
use crate::types::EVMAddress;

type Result<T> = error_stack::Result<T, Error>;

/// Which destination call the verifier emits. Older deployments expose a
/// bare attestation entry point, newer ones take the full origin tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Attest,
    #[default]
    Verify,
}

/// The verifier role: consumes send-side events from the source endpoint
/// and asks the destination verifier contract to attest or verify the
/// message it derives the identifier for.
pub struct Handler {
    endpoint: EVMAddress,
    mode: Mode,
}

impl Handler {
    pub fn new(endpoint: EVMAddress, mode: Mode) -> Self {
        Self { endpoint, mode }
    }
}

#[async_trait]
impl LogHandler for Handler {
    type Err = Error;

    async fn handle(&self, log: &Log) -> Result<Vec<DispatchRequest>> {
        if log.address != self.endpoint {
            return Ok(vec![]);
        }

        let event = match events::decode_send_event(log) {
            Err(report) if matches!(report.current_context(), events::Error::UnknownEvent) => {
                return Ok(vec![])
            }
            event => event.change_context(Error::DeserializeEvent)?,
        };

        let message_id = message_id::derive(&event.origin, event.dst_eid, event.receiver);
        let action = match self.mode {
            Mode::Attest => Action::Attest,
            Mode::Verify => Action::Verify {
                origin: event.origin,
                receiver: event.receiver,
                payload_hash: event.payload_hash,
            },
        };

        Ok(vec![DispatchRequest { message_id, action }])
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::{Bytes, H256};

    use super::{Handler, Mode};
    use crate::dispatch::Action;
    use crate::events::tests::{message_queued_log, message_sent_log, receiver, sender};
    use crate::log_processor::LogHandler;
    use crate::message_id;
    use crate::types::{EVMAddress, Origin};

    fn endpoint() -> EVMAddress {
        "0xcccccccccccccccccccccccccccccccccccccc03".parse().unwrap()
    }

    fn at_endpoint(mut log: ethers::types::Log) -> ethers::types::Log {
        log.address = endpoint();
        log
    }

    #[tokio::test]
    async fn produces_one_verification_call_with_the_event_fields() {
        let payload = b"cross-chain payload";
        let handler = Handler::new(endpoint(), Mode::Verify);

        let requests = handler
            .handle(&at_endpoint(message_sent_log(payload)))
            .await
            .unwrap();

        let origin = Origin { src_eid: 1, sender: sender(), nonce: 1 };
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].action,
            Action::Verify {
                origin,
                receiver: receiver(),
                payload_hash: message_id::payload_hash(payload),
            }
        );
        assert_eq!(
            requests[0].message_id,
            message_id::derive(&origin, 2, receiver())
        );
    }

    #[tokio::test]
    async fn attest_mode_produces_an_attestation_call() {
        let handler = Handler::new(endpoint(), Mode::Attest);

        let requests = handler
            .handle(&at_endpoint(message_queued_log(H256::repeat_byte(5))))
            .await
            .unwrap();

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].action, Action::Attest);
    }

    #[tokio::test]
    async fn both_send_revisions_derive_the_same_identifier() {
        let payload = b"cross-chain payload";
        let handler = Handler::new(endpoint(), Mode::Verify);

        let from_sent = handler
            .handle(&at_endpoint(message_sent_log(payload)))
            .await
            .unwrap();
        let from_queued = handler
            .handle(&at_endpoint(message_queued_log(message_id::payload_hash(
                payload,
            ))))
            .await
            .unwrap();

        assert_eq!(from_sent[0].message_id, from_queued[0].message_id);
    }

    #[tokio::test]
    async fn ignores_logs_from_other_contracts() {
        let handler = Handler::new(endpoint(), Mode::Verify);

        let requests = handler.handle(&message_sent_log(b"x")).await.unwrap();

        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn ignores_unknown_events_from_the_endpoint() {
        let handler = Handler::new(endpoint(), Mode::Verify);
        let log = at_endpoint(ethers::types::Log {
            topics: vec![H256::repeat_byte(0xaa)],
            ..Default::default()
        });

        let requests = handler.handle(&log).await.unwrap();

        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn malformed_known_event_is_an_error() {
        let handler = Handler::new(endpoint(), Mode::Verify);
        let mut log = at_endpoint(message_sent_log(b"x"));
        log.data = Bytes::from(vec![1, 2, 3]);

        assert!(handler.handle(&log).await.is_err());
    }
}
