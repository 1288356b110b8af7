use async_trait::async_trait;
use error_stack::Report;
use ethers::providers::{JsonRpcClient, ProviderError, PubsubClient};
use ethers::types::{Bytes, Filter, Log, TransactionRequest, U256, U64};
use ethers::utils::{keccak256, serialize};
use futures::stream::BoxStream;
use futures::StreamExt;
use mockall::automock;
use tracing::warn;

use crate::json_rpc::Client;
use crate::types::EVMAddress;

type Result<T> = error_stack::Result<T, ProviderError>;

/// The relay's view of a source ledger: the chain head, ranged log queries,
/// and the endpoint id used in identifier derivation.
#[automock]
#[async_trait]
pub trait EthereumClient {
    async fn block_number(&self) -> Result<U64>;
    async fn logs(&self, filter: Filter) -> Result<Vec<Log>>;
    async fn endpoint_id(&self, endpoint: EVMAddress) -> Result<u32>;
}

/// Push-capable transports additionally support standing log subscriptions.
/// The returned stream is unbounded and not restartable; once it ends, the
/// only way to resume coverage is a fresh subscription plus a re-scan.
#[async_trait]
pub trait LogSubscriptionClient: EthereumClient {
    async fn subscribe_logs(&self, filter: Filter) -> Result<BoxStream<'static, Log>>;
}

#[async_trait]
impl<P> EthereumClient for Client<P>
where
    P: JsonRpcClient + Send + Sync + 'static,
{
    async fn block_number(&self) -> Result<U64> {
        self.request("eth_blockNumber", ()).await
    }

    async fn logs(&self, filter: Filter) -> Result<Vec<Log>> {
        self.request("eth_getLogs", [serialize(&filter)]).await
    }

    async fn endpoint_id(&self, endpoint: EVMAddress) -> Result<u32> {
        let selector = &keccak256(b"eid()")[..4];
        let call = TransactionRequest::new()
            .to(endpoint)
            .data(selector.to_vec());
        let raw: Bytes = self
            .request("eth_call", [serialize(&call), serialize(&"latest")])
            .await?;

        if raw.len() > 32 {
            return Err(Report::new(ProviderError::CustomError(format!(
                "eid() returned an oversized word: 0x{}",
                hex::encode(&raw)
            ))));
        }
        let value = U256::from_big_endian(&raw);
        if value > U256::from(u32::MAX) {
            return Err(Report::new(ProviderError::CustomError(format!(
                "eid() returned an out-of-range value: {value}"
            ))));
        }
        Ok(value.low_u32())
    }
}

#[async_trait]
impl<P> LogSubscriptionClient for Client<P>
where
    P: PubsubClient + Send + Sync + 'static,
{
    async fn subscribe_logs(&self, filter: Filter) -> Result<BoxStream<'static, Log>> {
        let id: U256 = self
            .request("eth_subscribe", [serialize(&"logs"), serialize(&filter)])
            .await?;
        let notifications = self
            .provider()
            .subscribe(id)
            .map_err(Into::into)
            .map_err(Report::from)?;

        Ok(notifications
            .filter_map(|raw| async move {
                match serde_json::from_str::<Log>(raw.get()) {
                    Ok(log) => Some(log),
                    Err(err) => {
                        warn!(%err, "dropping undecodable log notification");
                        None
                    }
                }
            })
            .boxed())
    }
}
