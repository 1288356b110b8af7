use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Context, Result, ResultExt};
use ethers::types::Log;
use futures::StreamExt;
use thiserror::Error;
use tokio::time::timeout;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatch, DispatchOutcome, DispatchRequest};
use crate::log_sub::ScanEvent;

#[async_trait]
pub trait LogHandler {
    type Err: Context;

    /// Decodes one log into the dispatch requests it implies. An empty
    /// vector means the log is not this handler's concern.
    async fn handle(&self, log: &Log) -> Result<Vec<DispatchRequest>, Self::Err>;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not consume scan events from stream")]
    EventStream,
}

/// Lets the `handler` consume scan events from the `event_stream`, pushing
/// every produced request through the dispatch gate. The token is honored at
/// batch boundaries and stream timeouts; a closed stream ends the task.
///
/// Per-log isolation: a log that fails to decode, and a dispatch that fails
/// at the destination, are logged and skipped — neither stops the loop nor
/// affects the other logs of the batch. Failed dispatches stay unseen and
/// are naturally retried when a later scan redelivers the log.
pub async fn consume_logs<H, D, S, E>(
    handler_label: String,
    handler: H,
    dispatcher: D,
    event_stream: S,
    stream_timeout: Duration,
    token: CancellationToken,
) -> Result<(), Error>
where
    H: LogHandler,
    D: Dispatch,
    S: Stream<Item = Result<ScanEvent, E>>,
    E: Context,
{
    let mut event_stream = Box::pin(event_stream);
    loop {
        let stream_status = retrieve_next_event(&mut event_stream, stream_timeout)
            .await
            .change_context(Error::EventStream)?;

        match &stream_status {
            StreamStatus::Active(ScanEvent::Log(log)) => {
                handle_log(&handler, &dispatcher, &handler_label, log).await;
            }
            StreamStatus::Active(ScanEvent::Synced(block)) => {
                debug!(
                    handler = handler_label,
                    block = block.as_u64(),
                    "scan coverage reached block"
                );
            }
            _ => {}
        }

        if should_task_stop(stream_status, &token) {
            return Ok(());
        }
    }
}

async fn handle_log<H, D>(handler: &H, dispatcher: &D, label: &str, log: &Log)
where
    H: LogHandler,
    D: Dispatch,
{
    // one undecodable log must not block the rest of the batch
    let requests = match handler.handle(log).await {
        Ok(requests) => requests,
        Err(err) => {
            warn!(handler = label, err = ?err, "failed handling log, skipping it");
            return;
        }
    };

    for request in requests {
        match dispatcher.dispatch(&request).await {
            Ok(DispatchOutcome::Dispatched(tx_hash)) => {
                info!(
                    handler = label,
                    message_id = %request.message_id,
                    tx_hash = %tx_hash,
                    "destination call confirmed"
                );
            }
            Ok(DispatchOutcome::AlreadySeen) => {
                debug!(
                    handler = label,
                    message_id = %request.message_id,
                    "message already dispatched, skipping"
                );
            }
            Ok(DispatchOutcome::AlreadyDone) => {
                info!(
                    handler = label,
                    message_id = %request.message_id,
                    "destination already processed this message"
                );
            }
            Err(err) => {
                error!(
                    handler = label,
                    message_id = %request.message_id,
                    err = ?err,
                    "destination call failed, message stays eligible for re-dispatch"
                );
            }
        }
    }
}

async fn retrieve_next_event<S, E>(
    event_stream: &mut Pin<Box<S>>,
    stream_timeout: Duration,
) -> Result<StreamStatus, E>
where
    S: Stream<Item = Result<ScanEvent, E>>,
    E: Context,
{
    let status = match timeout(stream_timeout, event_stream.next()).await {
        Err(_) => StreamStatus::TimedOut,
        Ok(None) => StreamStatus::Closed,
        Ok(Some(event)) => StreamStatus::Active(event?),
    };
    Ok(status)
}

fn should_task_stop(stream_status: StreamStatus, token: &CancellationToken) -> bool {
    match stream_status {
        StreamStatus::Active(ScanEvent::Synced(_)) | StreamStatus::TimedOut
            if token.is_cancelled() =>
        {
            true
        }
        StreamStatus::Closed => true,
        _ => false,
    }
}

enum StreamStatus {
    Active(ScanEvent),
    Closed,
    TimedOut,
}
