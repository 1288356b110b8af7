use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use ethers::contract::{ContractCall, ContractError};
use ethers::providers::Middleware;
use tokio::time::timeout;

use crate::dispatch::{Action, DestinationClient, DestinationError, DispatchRequest};
use crate::evm::contracts::{MessageExecutor, MessageVerifier};
use crate::types::{EVMAddress, Hash};

type Result<T> = error_stack::Result<T, DestinationError>;

/// Verifier-role destination: the attestation/verification contract on the
/// destination chain.
pub struct VerifierContract<M> {
    contract: MessageVerifier<M>,
    confirmation_timeout: Duration,
}

impl<M> VerifierContract<M>
where
    M: Middleware + 'static,
{
    pub fn new(address: EVMAddress, client: Arc<M>, confirmation_timeout: Duration) -> Self {
        Self {
            contract: MessageVerifier::new(address, client),
            confirmation_timeout,
        }
    }
}

#[async_trait]
impl<M> DestinationClient for VerifierContract<M>
where
    M: Middleware + 'static,
{
    async fn submit(&self, request: &DispatchRequest) -> Result<Hash> {
        let call = match &request.action {
            Action::Attest => self.contract.submit_attestation(*request.message_id.as_bytes()),
            Action::Verify {
                origin,
                receiver,
                payload_hash,
            } => self.contract.verify_message(
                origin.src_eid,
                origin.sender.to_fixed_bytes(),
                origin.nonce,
                *receiver,
                payload_hash.to_fixed_bytes(),
            ),
            Action::Execute => return Err(Report::new(DestinationError::UnsupportedAction)),
        };

        send_and_confirm(call, self.confirmation_timeout).await
    }
}

/// Executor-role destination: the execution contract wired to the endpoint.
pub struct ExecutorContract<M> {
    contract: MessageExecutor<M>,
    confirmation_timeout: Duration,
}

impl<M> ExecutorContract<M>
where
    M: Middleware + 'static,
{
    pub fn new(address: EVMAddress, client: Arc<M>, confirmation_timeout: Duration) -> Self {
        Self {
            contract: MessageExecutor::new(address, client),
            confirmation_timeout,
        }
    }
}

#[async_trait]
impl<M> DestinationClient for ExecutorContract<M>
where
    M: Middleware + 'static,
{
    async fn submit(&self, request: &DispatchRequest) -> Result<Hash> {
        match request.action {
            Action::Execute => {
                let call = self.contract.execute(*request.message_id.as_bytes());
                send_and_confirm(call, self.confirmation_timeout).await
            }
            _ => Err(Report::new(DestinationError::UnsupportedAction)),
        }
    }
}

/// Sends a state-mutating call and waits for its receipt, bounded by the
/// confirmation timeout. A receipt with a failure status, a dropped
/// transaction, and a timeout are all surfaced so the gate can leave the
/// identifier retryable; reverts keep their decoded reason for the benign
/// duplicate classification.
async fn send_and_confirm<M>(call: ContractCall<M, ()>, confirmation: Duration) -> Result<Hash>
where
    M: Middleware + 'static,
{
    let pending = call.send().await.map_err(revert_or_submission_error)?;

    let receipt = timeout(confirmation, pending)
        .await
        .map_err(|_| Report::new(DestinationError::Confirmation))
        .attach_printable("timed out waiting for the transaction receipt")?
        .change_context(DestinationError::Confirmation)?;

    match receipt {
        Some(receipt) if receipt.status == Some(1u64.into()) => Ok(receipt.transaction_hash),
        Some(receipt) => Err(Report::new(DestinationError::Reverted {
            reason: "transaction reverted on-chain without a reason".to_string(),
        }))
        .attach_printable(format!("tx {:#x}", receipt.transaction_hash)),
        None => Err(Report::new(DestinationError::Confirmation))
            .attach_printable("transaction was dropped from the mempool"),
    }
}

fn revert_or_submission_error<M>(err: ContractError<M>) -> Report<DestinationError>
where
    M: Middleware,
{
    match err.decode_revert::<String>() {
        Some(reason) => Report::new(DestinationError::Reverted { reason }),
        None => Report::new(DestinationError::Submission).attach_printable(err.to_string()),
    }
}
