use std::time::Duration;

use error_stack::{Report, Result, ResultExt};
use ethers::types::{Filter, Log, U64};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::broadcast::{self, Sender};
use tokio::{select, time};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::asyncutil::future::{with_retry, RetryPolicy};
use crate::evm::rpc::{EthereumClient, LogSubscriptionClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Log(Log),
    /// Coverage has reached this block; emitted at batch boundaries.
    Synced(U64),
}

pub trait LogSub {
    fn subscribe(
        &self,
    ) -> impl Stream<Item = Result<ScanEvent, BroadcastStreamRecvError>> + Send + 'static;
}

pub struct LogSubscriber {
    tx: Sender<ScanEvent>,
}

impl LogSub for LogSubscriber {
    fn subscribe(
        &self,
    ) -> impl Stream<Item = Result<ScanEvent, BroadcastStreamRecvError>> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).map(|event| event.map_err(Report::from))
    }
}

/// Where scanning begins on a fresh start. With no explicit block, coverage
/// reaches back a bounded window from the current head; anything older is
/// outside the relay's recovery horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBlock {
    Explicit(U64),
    Lookback(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct ScanParams {
    pub start: StartBlock,
    /// Upper bound on blocks per log query, the source node's range limit.
    pub max_scan_range: u64,
    /// Pull-transport cadence for new-head checks.
    pub poll_interval: Duration,
    pub buffer_capacity: usize,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed querying the chain head")]
    Head,
    #[error("querying logs in range [{from}, {to}] failed")]
    LogQuery { from: U64, to: U64 },
    #[error("failed installing the log subscription")]
    Subscribe,
    #[error("log subscription ended unexpectedly")]
    SubscriptionClosed,
}

/// Walks a contract's event log from the start block to the live head and
/// keeps following it, publishing every matching log exactly as the ledger
/// orders them. Backfill converges on a moving head: the target is re-read
/// every chunk, so blocks mined during a long catch-up are still covered.
pub struct LogPublisher<C> {
    client: C,
    filter: Filter,
    params: ScanParams,
    retry_policy: RetryPolicy,
    tx: Sender<ScanEvent>,
}

impl<C> LogPublisher<C>
where
    C: EthereumClient + Send + Sync,
{
    pub fn new(
        client: C,
        filter: Filter,
        params: ScanParams,
        retry_policy: RetryPolicy,
    ) -> (Self, LogSubscriber) {
        let (tx, _) = broadcast::channel::<ScanEvent>(params.buffer_capacity);
        let publisher = LogPublisher {
            client,
            filter,
            params,
            retry_policy,
            tx: tx.clone(),
        };

        (publisher, LogSubscriber { tx })
    }

    /// Pull transport: backfill, then synthesize a live tail by polling the
    /// head and querying every not-yet-scanned range.
    pub async fn run_polling(self, token: CancellationToken) -> Result<(), Error> {
        let mut cursor = self.initial_cursor().await?;
        cursor = self.backfill(cursor, &token).await;

        let mut interval = time::interval(self.params.poll_interval);
        loop {
            select! {
                _ = interval.tick() => {
                    cursor = self.poll_once(cursor).await;
                },
                _ = token.cancelled() => {
                    info!("log publisher exiting");

                    return Ok(())
                },
            }
        }
    }

    /// Push transport: the subscription is installed before backfill so the
    /// handoff has no gap. Logs the backfill already covered are dropped
    /// from the stream; the bounded overlap that remains is absorbed by
    /// identifier dedup downstream.
    pub async fn run_subscribing(self, token: CancellationToken) -> Result<(), Error>
    where
        C: LogSubscriptionClient,
    {
        let cursor = self.initial_cursor().await?;
        let mut subscription = self
            .client
            .subscribe_logs(self.filter.clone())
            .await
            .change_context(Error::Subscribe)?;
        let cursor = self.backfill(cursor, &token).await;

        loop {
            select! {
                delivery = subscription.next() => match delivery {
                    Some(log) => self.publish_subscribed(log, cursor),
                    None => return Err(Report::new(Error::SubscriptionClosed)),
                },
                _ = token.cancelled() => {
                    info!("log publisher exiting");

                    return Ok(())
                },
            }
        }
    }

    async fn initial_cursor(&self) -> Result<U64, Error> {
        match self.params.start {
            StartBlock::Explicit(block) => Ok(block),
            StartBlock::Lookback(window) => {
                let head = self.block_number().await.change_context(Error::Head)?;
                Ok(head.saturating_sub(window.into()))
            }
        }
    }

    /// Covers `[cursor, head]` in bounded chunks, re-reading the head after
    /// every chunk, until the cursor passes it. Returns the next unscanned
    /// block. Transport failures never kill the scan; the failed range is
    /// retried after a poll interval.
    async fn backfill(&self, mut cursor: U64, token: &CancellationToken) -> U64 {
        let mut head = match self.block_number().await {
            Ok(head) => head,
            Err(err) => {
                warn!(err = ?err, "failed reading the chain head, backfill deferred to the live tail");
                return cursor;
            }
        };

        while cursor <= head && !token.is_cancelled() {
            let to = cursor
                .saturating_add(self.params.max_scan_range.saturating_sub(1).into())
                .min(head);

            match self.scan_range(cursor, to).await {
                Ok(()) => {
                    cursor = to.saturating_add(U64::one());
                    match self.block_number().await {
                        Ok(new_head) => head = new_head,
                        Err(err) => {
                            warn!(err = ?err, "failed re-reading the chain head during backfill");
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(err = ?err, "log query failed during backfill, retrying the range");
                    select! {
                        _ = time::sleep(self.params.poll_interval) => {},
                        _ = token.cancelled() => break,
                    }
                }
            }
        }

        cursor
    }

    /// One pull-tail cycle: query `[cursor, head]` if anything is new. A
    /// stale or repeated head never moves the cursor backwards and never
    /// re-scans a covered range.
    async fn poll_once(&self, cursor: U64) -> U64 {
        let head = match self.block_number().await {
            Ok(head) => head,
            Err(err) => {
                warn!(err = ?err, "failed reading the chain head, will poll again");
                return cursor;
            }
        };
        if cursor > head {
            return cursor;
        }

        match self.scan_range(cursor, head).await {
            Ok(()) => head.saturating_add(U64::one()),
            Err(err) => {
                warn!(err = ?err, "log query failed, range stays unscanned until the next poll");
                cursor
            }
        }
    }

    async fn scan_range(&self, from: U64, to: U64) -> Result<(), Error> {
        let filter = self.filter.clone().from_block(from).to_block(to);
        let mut logs = with_retry(|| self.client.logs(filter.clone()), self.retry_policy)
            .await
            .change_context(Error::LogQuery { from, to })?;

        // ledger-native ordering within the batch
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        for log in logs {
            self.publish(ScanEvent::Log(log));
        }
        self.publish(ScanEvent::Synced(to));

        Ok(())
    }

    fn publish_subscribed(&self, log: Log, cursor: U64) {
        // blocks below the cursor were already covered by backfill
        if log.block_number.is_some_and(|block| block < cursor) {
            return;
        }

        let synced = log.block_number;
        self.publish(ScanEvent::Log(log));
        if let Some(block) = synced {
            self.publish(ScanEvent::Synced(block));
        }
    }

    fn publish(&self, event: ScanEvent) {
        // ignore the error when no subscriber is attached yet
        let _ = self.tx.send(event);
    }

    async fn block_number(&self) -> Result<U64, Error> {
        with_retry(|| self.client.block_number(), self.retry_policy)
            .await
            .change_context(Error::Head)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use ethers::providers::ProviderError;
    use ethers::types::{Filter, FilterBlockOption, Log, H256, U64};
    use futures::stream;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use mockall::mock;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::evm::rpc::MockEthereumClient;
    use crate::types::EVMAddress;

    mock! {
        SubscribingClient {}

        #[async_trait]
        impl EthereumClient for SubscribingClient {
            async fn block_number(&self) -> error_stack::Result<U64, ProviderError>;
            async fn logs(&self, filter: Filter) -> error_stack::Result<Vec<Log>, ProviderError>;
            async fn endpoint_id(&self, endpoint: EVMAddress) -> error_stack::Result<u32, ProviderError>;
        }

        #[async_trait]
        impl LogSubscriptionClient for SubscribingClient {
            async fn subscribe_logs(&self, filter: Filter) -> error_stack::Result<BoxStream<'static, Log>, ProviderError>;
        }
    }

    fn params(start: StartBlock, max_scan_range: u64) -> ScanParams {
        ScanParams {
            start,
            max_scan_range,
            poll_interval: Duration::from_millis(10),
            buffer_capacity: 1000,
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy::repeat_constant(Duration::from_millis(1), 2)
    }

    fn range_of(filter: &Filter) -> (u64, u64) {
        match filter.block_option {
            FilterBlockOption::Range {
                from_block: Some(from),
                to_block: Some(to),
            } => (
                from.as_number().unwrap().as_u64(),
                to.as_number().unwrap().as_u64(),
            ),
            _ => panic!("filter has no block range"),
        }
    }

    fn log_at(block: u64) -> Log {
        Log {
            block_number: Some(U64::from(block)),
            topics: vec![H256::repeat_byte(1)],
            ..Default::default()
        }
    }

    fn record_ranges(
        client: &mut MockEthereumClient,
        ranges: &Arc<Mutex<Vec<(u64, u64)>>>,
    ) {
        let ranges = ranges.clone();
        client.expect_logs().returning(move |filter| {
            ranges.lock().unwrap().push(range_of(&filter));
            Ok(vec![])
        });
    }

    async fn wait_for_sync<S>(stream: &mut S, block: u64)
    where
        S: Stream<Item = Result<ScanEvent, BroadcastStreamRecvError>> + Unpin,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                match stream.next().await {
                    Some(Ok(ScanEvent::Synced(synced))) if synced == U64::from(block) => break,
                    Some(_) => continue,
                    None => panic!("scan stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for sync marker");
    }

    #[tokio::test]
    async fn backfill_covers_history_in_bounded_chunks() {
        let ranges = Arc::new(Mutex::new(vec![]));
        let mut client = MockEthereumClient::new();
        client.expect_block_number().returning(|| Ok(U64::from(4999)));
        record_ranges(&mut client, &ranges);

        let (publisher, subscriber) = LogPublisher::new(
            client,
            Filter::new(),
            params(StartBlock::Explicit(U64::zero()), 2000),
            retry(),
        );
        let mut stream = Box::pin(subscriber.subscribe());

        let token = CancellationToken::new();
        let handle = tokio::spawn(publisher.run_polling(token.child_token()));

        wait_for_sync(&mut stream, 4999).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(
            *ranges.lock().unwrap(),
            vec![(0, 1999), (2000, 3999), (4000, 4999)]
        );
    }

    #[tokio::test]
    async fn backfill_converges_on_a_moving_head() {
        let ranges = Arc::new(Mutex::new(vec![]));
        let mut client = MockEthereumClient::new();
        let mut heads = vec![100u64, 150, 150, 150].into_iter();
        client
            .expect_block_number()
            .returning(move || Ok(U64::from(heads.next().unwrap_or(150))));
        record_ranges(&mut client, &ranges);

        let (publisher, subscriber) = LogPublisher::new(
            client,
            Filter::new(),
            params(StartBlock::Explicit(U64::zero()), 100),
            retry(),
        );
        let mut stream = Box::pin(subscriber.subscribe());

        let token = CancellationToken::new();
        let handle = tokio::spawn(publisher.run_polling(token.child_token()));

        // the head moved from 100 to 150 while the first chunk was scanned;
        // the scan must still reach it
        wait_for_sync(&mut stream, 150).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(*ranges.lock().unwrap(), vec![(0, 99), (100, 150)]);
    }

    #[tokio::test]
    async fn lookback_window_bounds_the_initial_cursor() {
        let ranges = Arc::new(Mutex::new(vec![]));
        let mut client = MockEthereumClient::new();
        client
            .expect_block_number()
            .returning(|| Ok(U64::from(12000)));
        record_ranges(&mut client, &ranges);

        let (publisher, subscriber) = LogPublisher::new(
            client,
            Filter::new(),
            params(StartBlock::Lookback(5000), 10000),
            retry(),
        );
        let mut stream = Box::pin(subscriber.subscribe());

        let token = CancellationToken::new();
        let handle = tokio::spawn(publisher.run_polling(token.child_token()));

        wait_for_sync(&mut stream, 12000).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(*ranges.lock().unwrap(), vec![(7000, 12000)]);
    }

    #[tokio::test]
    async fn live_tail_continues_where_backfill_stopped() {
        let ranges = Arc::new(Mutex::new(vec![]));
        let mut client = MockEthereumClient::new();
        let mut heads = vec![100u64, 100, 103].into_iter();
        client
            .expect_block_number()
            .returning(move || Ok(U64::from(heads.next().unwrap_or(103))));
        record_ranges(&mut client, &ranges);

        let (publisher, subscriber) = LogPublisher::new(
            client,
            Filter::new(),
            params(StartBlock::Explicit(U64::zero()), 2000),
            retry(),
        );
        let mut stream = Box::pin(subscriber.subscribe());

        let token = CancellationToken::new();
        let handle = tokio::spawn(publisher.run_polling(token.child_token()));

        wait_for_sync(&mut stream, 103).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        // handoff is gap-free and overlap-free, and an unchanged head is
        // never queried again
        let ranges = ranges.lock().unwrap().clone();
        assert_eq!(ranges.first(), Some(&(0, 100)));
        assert!(ranges.iter().all(|range| range != &(101, 100)));
        assert!(ranges.contains(&(101, 103)));
        assert_eq!(ranges.len(), 2);
    }

    #[tokio::test]
    async fn transient_query_failure_does_not_kill_the_scan() {
        let ranges = Arc::new(Mutex::new(vec![]));
        let mut client = MockEthereumClient::new();
        client.expect_block_number().returning(|| Ok(U64::from(50)));
        let recorded = ranges.clone();
        let mut calls = 0;
        client.expect_logs().returning(move |filter| {
            calls += 1;
            // exhaust the retry budget first, then recover
            if calls <= 2 {
                Err(error_stack::report!(ProviderError::CustomError(
                    "rate limited".to_string()
                )))
            } else {
                recorded.lock().unwrap().push(range_of(&filter));
                Ok(vec![])
            }
        });

        let (publisher, subscriber) = LogPublisher::new(
            client,
            Filter::new(),
            params(StartBlock::Explicit(U64::zero()), 2000),
            retry(),
        );
        let mut stream = Box::pin(subscriber.subscribe());

        let token = CancellationToken::new();
        let handle = tokio::spawn(publisher.run_polling(token.child_token()));

        wait_for_sync(&mut stream, 50).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(*ranges.lock().unwrap(), vec![(0, 50)]);
    }

    #[tokio::test]
    async fn batch_logs_are_published_in_ledger_order() {
        let mut client = MockEthereumClient::new();
        client.expect_block_number().returning(|| Ok(U64::from(10)));
        client
            .expect_logs()
            .returning(|_| Ok(vec![log_at(9), log_at(3), log_at(7)]));

        let (publisher, subscriber) = LogPublisher::new(
            client,
            Filter::new(),
            params(StartBlock::Explicit(U64::zero()), 2000),
            retry(),
        );
        let mut stream = Box::pin(subscriber.subscribe());

        let token = CancellationToken::new();
        let handle = tokio::spawn(publisher.run_polling(token.child_token()));

        let mut blocks = vec![];
        while blocks.len() < 3 {
            match timeout(Duration::from_secs(5), stream.next()).await.unwrap() {
                Some(Ok(ScanEvent::Log(log))) => blocks.push(log.block_number.unwrap().as_u64()),
                Some(_) => continue,
                None => panic!("scan stream closed"),
            }
        }
        token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(blocks, vec![3, 7, 9]);
    }

    #[tokio::test]
    async fn push_tail_drops_logs_backfill_already_covered() {
        let mut client = MockSubscribingClient::new();
        client.expect_block_number().returning(|| Ok(U64::from(100)));
        client.expect_logs().returning(|_| Ok(vec![log_at(95)]));
        client.expect_subscribe_logs().once().returning(|_| {
            // block 95 arrives again over the subscription during backfill,
            // block 150 is genuinely new
            Ok(stream::iter(vec![log_at(95), log_at(150)]).boxed())
        });

        let (publisher, subscriber) = LogPublisher::new(
            client,
            Filter::new(),
            params(StartBlock::Explicit(U64::from(90)), 2000),
            retry(),
        );
        let mut stream = Box::pin(subscriber.subscribe());

        let token = CancellationToken::new();
        let handle = tokio::spawn(publisher.run_subscribing(token.child_token()));

        let mut blocks = vec![];
        while blocks.len() < 2 {
            match timeout(Duration::from_secs(5), stream.next()).await.unwrap() {
                Some(Ok(ScanEvent::Log(log))) => blocks.push(log.block_number.unwrap().as_u64()),
                Some(_) => continue,
                None => panic!("scan stream closed"),
            }
        }

        // backfilled 95 once, subscription redelivery dropped, 150 kept
        assert_eq!(blocks, vec![95, 150]);

        // a closed subscription is fatal for the publisher
        let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(
            result.unwrap_err().current_context(),
            Error::SubscriptionClosed
        ));
        token.cancel();
    }
}
