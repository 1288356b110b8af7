use std::collections::HashSet;

use async_trait::async_trait;
use mockall::automock;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::{EVMAddress, Hash, MessageId, Origin};

type Result<T> = error_stack::Result<T, Error>;

/// Revert reasons that mean someone else already performed the action. Such
/// a failure is success for dedup purposes.
const BENIGN_REVERT_PATTERNS: [&str; 4] = [
    "already attested",
    "already verified",
    "already executed",
    "already delivered",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Attest,
    Verify {
        origin: Origin,
        receiver: EVMAddress,
        payload_hash: Hash,
    },
    Execute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub message_id: MessageId,
    pub action: Action,
}

/// A ledger-state-mutating call on the destination contract, awaited to
/// durable confirmation by the implementation.
#[automock]
#[async_trait]
pub trait DestinationClient {
    async fn submit(
        &self,
        request: &DispatchRequest,
    ) -> error_stack::Result<Hash, DestinationError>;
}

#[derive(Error, Debug)]
pub enum DestinationError {
    #[error("destination call reverted: {reason}")]
    Reverted { reason: String },
    #[error("destination call could not be submitted")]
    Submission,
    #[error("destination call was not confirmed")]
    Confirmation,
    #[error("action is not supported by this destination contract")]
    UnsupportedAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The destination call confirmed; the identifier is now marked seen.
    Dispatched(Hash),
    /// The identifier was dispatched (or is being dispatched) earlier in
    /// this process lifetime.
    AlreadySeen,
    /// The destination reported the action as already performed by someone
    /// else; marked seen without a call of our own succeeding.
    AlreadyDone,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("destination call for message {message_id} failed")]
    CallFailed { message_id: MessageId },
}

/// The seam the consumer loop dispatches through, mockable for tests.
#[automock]
#[async_trait]
pub trait Dispatch {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome>;
}

/// The single choke point enforcing at-most-one-dispatch-per-identifier.
///
/// Identifiers are only marked seen once the destination call confirms (or
/// reverts benignly), so a failed call stays eligible for redelivery when a
/// later scan covers the same log again. The in-flight set makes the
/// check-then-act atomic per identifier: the same log delivered concurrently
/// by the backfill and live-tail paths results in one call.
pub struct DispatchGate<C> {
    destination: C,
    state: Mutex<DedupState>,
}

#[derive(Default)]
struct DedupState {
    seen: HashSet<MessageId>,
    in_flight: HashSet<MessageId>,
}

impl<C> DispatchGate<C>
where
    C: DestinationClient + Send + Sync,
{
    pub fn new(destination: C) -> Self {
        Self {
            destination,
            state: Mutex::new(DedupState::default()),
        }
    }
}

#[async_trait]
impl<C> Dispatch for DispatchGate<C>
where
    C: DestinationClient + Send + Sync,
{
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome> {
        let id = request.message_id;

        {
            let mut state = self.state.lock().await;
            if state.seen.contains(&id) || !state.in_flight.insert(id) {
                return Ok(DispatchOutcome::AlreadySeen);
            }
        }

        // the lock is not held across the call; only the in-flight marker
        // protects the identifier while the ledger confirms
        let result = self.destination.submit(request).await;

        let mut state = self.state.lock().await;
        state.in_flight.remove(&id);
        match result {
            Ok(tx_hash) => {
                state.seen.insert(id);
                Ok(DispatchOutcome::Dispatched(tx_hash))
            }
            Err(report) => match report.current_context() {
                DestinationError::Reverted { reason } if is_benign_duplicate(reason) => {
                    state.seen.insert(id);
                    Ok(DispatchOutcome::AlreadyDone)
                }
                _ => Err(report.change_context(Error::CallFailed { message_id: id })),
            },
        }
    }
}

fn is_benign_duplicate(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    BENIGN_REVERT_PATTERNS
        .iter()
        .any(|pattern| reason.contains(pattern))
}
