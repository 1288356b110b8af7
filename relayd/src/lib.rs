pub mod asyncutil;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod evm;
pub mod handlers;
pub mod json_rpc;
pub mod log_processor;
pub mod log_sub;
pub mod message_id;
pub mod types;
pub mod url;

use std::sync::Arc;
use std::time::Duration;

use error_stack::{FutureExt, Report, Result, ResultExt};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Filter, ValueOrArray, H256};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::asyncutil::future::RetryPolicy;
use crate::asyncutil::task::{CancellableTask, TaskError, TaskManager};
use crate::config::Config;
use crate::dispatch::{Dispatch, DispatchGate};
use crate::evm::destination::{ExecutorContract, VerifierContract};
use crate::evm::rpc::{EthereumClient, LogSubscriptionClient};
use crate::handlers::{executor, verifier};
use crate::json_rpc::Client;
use crate::log_processor::{consume_logs, LogHandler};
use crate::log_sub::{LogPublisher, LogSub, ScanParams, StartBlock};
use crate::types::{EVMAddress, SigningKey};
use crate::url::Url;

#[derive(Error, Debug)]
pub enum Error {
    #[error("log publisher failed")]
    LogPublisher,
    #[error("log processor failed")]
    LogProcessor,
    #[error("connection failed")]
    Connection,
    #[error("invalid input")]
    InvalidInput,
    #[error("task execution failed")]
    Task(#[from] TaskError),
    #[error("app failed")]
    AppFailure,
    #[error("failed to load config")]
    LoadConfig,
}

type RelayTask = CancellableTask<Result<(), Error>>;
type DestinationMiddleware = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Shared knobs every relay role inherits from the top-level config.
#[derive(Clone, Copy)]
struct RelayParams {
    event_buffer_cap: usize,
    event_stream_timeout: Duration,
    poll_interval: Duration,
    confirmation_timeout: Duration,
    retry_policy: RetryPolicy,
}

pub async fn run(cfg: Config) -> Result<(), Error> {
    let Config {
        event_buffer_cap,
        event_stream_timeout,
        poll_interval,
        confirmation_timeout,
        rpc_retry_delay,
        rpc_retry_max_attempts,
        handlers,
    } = cfg;

    if handlers.is_empty() {
        return Err(Report::new(Error::InvalidInput))
            .attach_printable("at least one relay handler must be configured");
    }

    let params = RelayParams {
        event_buffer_cap,
        event_stream_timeout,
        poll_interval,
        confirmation_timeout,
        retry_policy: RetryPolicy::repeat_constant(rpc_retry_delay, rpc_retry_max_attempts),
    };

    let mut task_manager = TaskManager::new();
    for handler_config in handlers {
        let (publisher_task, processor_task) = configure_handler(handler_config, params).await?;
        task_manager = task_manager.add_task(publisher_task).add_task(processor_task);
    }

    let main_token = CancellationToken::new();
    let exit_token = main_token.clone();
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to capture SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to capture SIGTERM");

        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }

        info!("signal received, waiting for the relay to exit gracefully");

        exit_token.cancel();
    });

    task_manager
        .run(main_token)
        .await
        .change_context(Error::AppFailure)
}

async fn configure_handler(
    handler_config: handlers::config::Config,
    params: RelayParams,
) -> Result<(RelayTask, RelayTask), Error> {
    match handler_config {
        handlers::config::Config::Verifier {
            rpc_url,
            ws_url,
            endpoint,
            destination_rpc_url,
            verifier_contract,
            signing_key,
            start_block,
            lookback_window,
            max_scan_range,
            mode,
        } => {
            let middleware =
                destination_middleware(&destination_rpc_url, &signing_key).await?;
            let gate = DispatchGate::new(VerifierContract::new(
                verifier_contract,
                middleware,
                params.confirmation_timeout,
            ));
            let handler = verifier::Handler::new(endpoint, mode);
            let label = format!("verifier:{endpoint:#x}");
            let filter = endpoint_filter(endpoint, events::send_event_topics());
            let scan = scan_params(start_block, lookback_window, max_scan_range, params);

            match push_source(&rpc_url, ws_url.as_ref())? {
                Some(push_url) => {
                    let client = Client::connect_ws(&push_url)
                        .await
                        .change_context(Error::Connection)
                        .attach_printable(push_url.clone())?;
                    let (publisher, subscriber) =
                        LogPublisher::new(client, filter, scan, params.retry_policy);
                    Ok(subscribing_tasks(
                        label, publisher, subscriber, handler, gate, params,
                    ))
                }
                None => {
                    let client = Client::new_http(&rpc_url)
                        .change_context(Error::Connection)
                        .attach_printable(rpc_url.clone())?;
                    let (publisher, subscriber) =
                        LogPublisher::new(client, filter, scan, params.retry_policy);
                    Ok(polling_tasks(
                        label, publisher, subscriber, handler, gate, params,
                    ))
                }
            }
        }
        handlers::config::Config::Executor {
            rpc_url,
            ws_url,
            endpoint,
            executor_contract,
            signing_key,
            start_block,
            lookback_window,
            max_scan_range,
        } => {
            let middleware = destination_middleware(&rpc_url, &signing_key).await?;
            let gate = DispatchGate::new(ExecutorContract::new(
                executor_contract,
                middleware,
                params.confirmation_timeout,
            ));
            let label = format!("executor:{endpoint:#x}");
            let filter = endpoint_filter(endpoint, events::verified_event_topics());
            let scan = scan_params(start_block, lookback_window, max_scan_range, params);

            match push_source(&rpc_url, ws_url.as_ref())? {
                Some(push_url) => {
                    let client = Client::connect_ws(&push_url)
                        .await
                        .change_context(Error::Connection)
                        .attach_printable(push_url.clone())?;
                    let own_eid = client
                        .endpoint_id(endpoint)
                        .await
                        .change_context(Error::Connection)?;
                    let handler = executor::Handler::new(endpoint, own_eid);
                    let (publisher, subscriber) =
                        LogPublisher::new(client, filter, scan, params.retry_policy);
                    Ok(subscribing_tasks(
                        label, publisher, subscriber, handler, gate, params,
                    ))
                }
                None => {
                    let client = Client::new_http(&rpc_url)
                        .change_context(Error::Connection)
                        .attach_printable(rpc_url.clone())?;
                    let own_eid = client
                        .endpoint_id(endpoint)
                        .await
                        .change_context(Error::Connection)?;
                    let handler = executor::Handler::new(endpoint, own_eid);
                    let (publisher, subscriber) =
                        LogPublisher::new(client, filter, scan, params.retry_policy);
                    Ok(polling_tasks(
                        label, publisher, subscriber, handler, gate, params,
                    ))
                }
            }
        }
    }
}

/// URL-scheme heuristic for transport selection: a dedicated push URL wins,
/// otherwise the main RPC URL is used for push delivery when its scheme
/// supports it.
fn push_source(rpc_url: &Url, ws_url: Option<&Url>) -> Result<Option<Url>, Error> {
    if let Some(ws_url) = ws_url {
        if !ws_url.is_push_capable() {
            return Err(Report::new(Error::InvalidInput))
                .attach_printable(format!("ws_url must have a ws/wss scheme, got {ws_url}"));
        }
        return Ok(Some(ws_url.clone()));
    }

    Ok(rpc_url.is_push_capable().then(|| rpc_url.clone()))
}

fn endpoint_filter(endpoint: EVMAddress, topics: Vec<H256>) -> Filter {
    Filter::new()
        .address(endpoint)
        .topic0(ValueOrArray::Array(topics.into_iter().map(Some).collect()))
}

fn scan_params(
    start_block: Option<u64>,
    lookback_window: u64,
    max_scan_range: u64,
    params: RelayParams,
) -> ScanParams {
    ScanParams {
        start: start_block
            .map(|block| StartBlock::Explicit(block.into()))
            .unwrap_or(StartBlock::Lookback(lookback_window)),
        max_scan_range,
        poll_interval: params.poll_interval,
        buffer_capacity: params.event_buffer_cap,
    }
}

async fn destination_middleware(
    url: &Url,
    signing_key: &SigningKey,
) -> Result<Arc<DestinationMiddleware>, Error> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Report::new(Error::InvalidInput)).attach_printable(format!(
            "destination calls need an http(s) endpoint, got {url}"
        ));
    }

    let provider = Provider::<Http>::try_from(url.as_str()).change_context(Error::Connection)?;
    let chain_id = provider
        .get_chainid()
        .await
        .change_context(Error::Connection)
        .attach_printable(url.clone())?;
    let wallet: LocalWallet = signing_key
        .expose()
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .change_context(Error::InvalidInput)
        .attach_printable("signing key does not parse as a secp256k1 private key")?;

    Ok(Arc::new(SignerMiddleware::new(
        provider,
        wallet.with_chain_id(chain_id.as_u64()),
    )))
}

fn polling_tasks<C, H, D>(
    label: String,
    publisher: LogPublisher<C>,
    subscriber: impl LogSub,
    handler: H,
    dispatcher: D,
    params: RelayParams,
) -> (RelayTask, RelayTask)
where
    C: EthereumClient + Send + Sync + 'static,
    H: LogHandler + Send + Sync + 'static,
    D: Dispatch + Send + Sync + 'static,
{
    let stream = subscriber.subscribe();
    (
        CancellableTask::create(move |token| {
            publisher
                .run_polling(token)
                .change_context(Error::LogPublisher)
        }),
        CancellableTask::create(move |token| {
            consume_logs(
                label,
                handler,
                dispatcher,
                stream,
                params.event_stream_timeout,
                token,
            )
            .change_context(Error::LogProcessor)
        }),
    )
}

fn subscribing_tasks<C, H, D>(
    label: String,
    publisher: LogPublisher<C>,
    subscriber: impl LogSub,
    handler: H,
    dispatcher: D,
    params: RelayParams,
) -> (RelayTask, RelayTask)
where
    C: LogSubscriptionClient + Send + Sync + 'static,
    H: LogHandler + Send + Sync + 'static,
    D: Dispatch + Send + Sync + 'static,
{
    let stream = subscriber.subscribe();
    (
        CancellableTask::create(move |token| {
            publisher
                .run_subscribing(token)
                .change_context(Error::LogPublisher)
        }),
        CancellableTask::create(move |token| {
            consume_logs(
                label,
                handler,
                dispatcher,
                stream,
                params.event_stream_timeout,
                token,
            )
            .change_context(Error::LogProcessor)
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_source_prefers_the_dedicated_ws_url() {
        let rpc = Url::new_non_sensitive("http://localhost:8545").unwrap();
        let ws = Url::new_non_sensitive("ws://localhost:8546").unwrap();

        let push = push_source(&rpc, Some(&ws)).unwrap();
        assert_eq!(push.as_ref().map(|url| url.as_str()), Some("ws://localhost:8546/"));
    }

    #[test]
    fn push_source_falls_back_to_the_rpc_url_scheme() {
        let ws_rpc = Url::new_non_sensitive("wss://node.example.com").unwrap();
        assert!(push_source(&ws_rpc, None).unwrap().is_some());

        let http_rpc = Url::new_non_sensitive("http://localhost:8545").unwrap();
        assert!(push_source(&http_rpc, None).unwrap().is_none());
    }

    #[test]
    fn push_source_rejects_a_pull_only_ws_url() {
        let rpc = Url::new_non_sensitive("http://localhost:8545").unwrap();
        let not_ws = Url::new_non_sensitive("http://localhost:8546").unwrap();

        assert!(push_source(&rpc, Some(&not_ws)).is_err());
    }

    #[tokio::test]
    async fn run_rejects_an_empty_handler_list() {
        let err = run(Config::default()).await.unwrap_err();

        assert!(matches!(err.current_context(), Error::InvalidInput));
    }
}
