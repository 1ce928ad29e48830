//! Batching of the panel queries.
//!
//! All the queries issued in a burst (typically, one per panel when a dashboard is refreshed)
//! are grouped by backend and by time window. Each group resolves its time window once, then
//! sends all its target requests with as few calls to `api/data/batch` as possible.
//!
//! ```text
//! fetch ─► queue[backend][batch id] ─(first awaiting caller)─► time window ─► api/data/batch × N ─► callers
//! ```
//!
//! The queue is flushed by the future of one of the queued calls, once it has been polled
//! and has yielded (or waited for the debounce delay). Since a task polls nothing while it
//! runs synchronous code, the queries that a task fetches in one go always end up in the
//! same flush, whatever the runtime flavor.

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    api::{
        ApiRequest, Backend, Transport,
        model::{BatchRequest, BatchResponse, DataResponse},
    },
    config::BatchConfig,
    error::DatasourceError,
    query::{DataRequest, Query, UserTime},
    reshape::{QueryResult, parse_responses},
    time_window::TimeService,
};

/// Schedules the data queries. Cloning the scheduler is cheap, and all the clones share the same queue.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    transport: Arc<dyn Transport>,
    time: TimeService,
    config: BatchConfig,
    queue: Mutex<FetchQueue>,
}

#[derive(Default)]
struct FetchQueue {
    batches: FxHashMap<Backend, IndexMap<String, Batch>>,
    /// Incremented by each flush. A call only flushes the generation it was queued in.
    generation: u64,
    /// When the current generation can be flushed.
    flush_at: Option<Instant>,
}

/// Queries that share the same backend and time window.
struct Batch {
    backend: Backend,
    user_time: UserTime,
    requests: Vec<PendingQuery>,
}

struct PendingQuery {
    query: Query,
    reply: oneshot::Sender<Result<QueryResult, DatasourceError>>,
}

/// Identifies the queries that can share a time window.
pub fn batch_id(user_time: &UserTime) -> String {
    let sampling = user_time.sampling.map(|s| s.to_string()).unwrap_or_default();
    format!("{} - {} - {}", user_time.from, user_time.to, sampling)
}

/// Splits `items` in chunks of at most `max` items, keeping their order.
pub fn chunk_requests<T>(items: Vec<T>, max: usize) -> Vec<Vec<T>> {
    let max = max.max(1);
    let mut chunks: Vec<Vec<T>> = Vec::with_capacity(items.len().div_ceil(max));
    for item in items {
        match chunks.last_mut() {
            Some(chunk) if chunk.len() < max => chunk.push(item),
            _ => {
                let mut chunk = Vec::with_capacity(max);
                chunk.push(item);
                chunks.push(chunk);
            }
        }
    }
    chunks
}

impl BatchScheduler {
    pub fn new(transport: Arc<dyn Transport>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                time: TimeService::new(transport.clone()),
                transport,
                config,
                queue: Mutex::new(FetchQueue::default()),
            }),
        }
    }

    /// Enqueues a query and returns its future result.
    ///
    /// The query is enqueued immediately, before the returned future is polled, so that all
    /// the queries fetched in one go end up in the same batch. The batch is sent when one of
    /// the returned futures of its generation is polled: after it yields once, or after the
    /// configured debounce delay counted from the first query of the generation.
    ///
    /// The returned future must be awaited within a tokio runtime.
    pub fn fetch(
        &self,
        backend: &Backend,
        query: Query,
        user_time: UserTime,
    ) -> impl Future<Output = Result<QueryResult, DatasourceError>> + Send + 'static + use<> {
        let (reply, result) = oneshot::channel();
        let (generation, flush_at) = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue
                .batches
                .entry(backend.clone())
                .or_default()
                .entry(batch_id(&user_time))
                .or_insert_with(|| Batch {
                    backend: backend.clone(),
                    user_time,
                    requests: Vec::new(),
                })
                .requests
                .push(PendingQuery { query, reply });
            let debounce = self.inner.config.debounce;
            let flush_at = *queue.flush_at.get_or_insert_with(|| Instant::now() + debounce);
            (queue.generation, flush_at)
        };

        let inner = self.inner.clone();
        async move {
            inner.flush(generation, flush_at).await;
            match result.await {
                Ok(result) => result,
                Err(_) => Err(DatasourceError::SchedulerClosed),
            }
        }
    }
}

impl SchedulerInner {
    /// Flushes the queue if it still holds `generation`.
    ///
    /// The batches are processed on their own task, so that they are answered even if
    /// the caller that flushed them is dropped.
    async fn flush(self: &Arc<Self>, generation: u64, flush_at: Instant) {
        if self.config.debounce.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep_until(flush_at).await;
        }

        // Take the whole queue: the queries that arrive from now on go to a new batch.
        let batches = {
            let mut queue = self.queue.lock().unwrap();
            if queue.generation != generation {
                // already flushed by another call
                return;
            }
            queue.generation += 1;
            queue.flush_at = None;
            std::mem::take(&mut queue.batches)
        };

        let batches: Vec<Batch> = batches.into_values().flat_map(IndexMap::into_values).collect();
        log::debug!("flushing {} batch(es)", batches.len());
        let inner = self.clone();
        tokio::spawn(async move {
            futures::future::join_all(batches.into_iter().map(|batch| inner.process_batch(batch))).await;
        });
    }

    async fn process_batch(&self, batch: Batch) {
        let Batch {
            backend,
            user_time,
            requests,
        } = batch;

        let responses = match self.fetch_responses(&backend, &user_time, &requests).await {
            Ok(responses) => responses,
            Err(e) => {
                log::debug!("batch {} failed: {e}", batch_id(&user_time));
                for pending in requests {
                    reply(pending.reply, Err(e.clone()));
                }
                return;
            }
        };

        // The responses are in the order of the flattened targets.
        let mut responses = responses.into_iter();
        for PendingQuery { query, reply: sender } in requests {
            let own: Vec<DataResponse> = responses.by_ref().take(query.targets.len()).collect();
            reply(sender, parse_responses(&query, own));
        }
    }

    /// Returns one response per target of `requests`, in order.
    async fn fetch_responses(
        &self,
        backend: &Backend,
        user_time: &UserTime,
        requests: &[PendingQuery],
    ) -> Result<Vec<DataResponse>, DatasourceError> {
        let targets = requests.iter().flat_map(|pending| &pending.query.targets);

        let Some(request_time) = self.time.request_time(backend, user_time).await? else {
            // no data in this window: answer as if the backend had returned empty data sets
            return Ok(targets.map(|_| DataResponse::empty()).collect());
        };

        let data_requests: Vec<DataRequest> = targets
            .filter_map(|target| DataRequest::build(target, Some(&request_time)))
            .collect();
        let chunks = chunk_requests(data_requests, self.config.max_requests_per_batch);
        log::debug!(
            "sending {} request(s) for {} in {} call(s)",
            chunks.iter().map(Vec::len).sum::<usize>(),
            backend.url,
            chunks.len()
        );

        let mut calls = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let body = serde_json::to_value(BatchRequest { requests: chunk })
                .map_err(|e| DatasourceError::InvalidQuery(e.to_string()))?;
            calls.push(self.transport.send(backend, ApiRequest::post("api/data/batch", body)));
        }
        let answers = futures::future::try_join_all(calls).await?;

        let mut responses = Vec::new();
        for (chunk, answer) in chunks.iter().zip(answers) {
            let answer: BatchResponse = answer.decode()?;
            if answer.responses.len() != chunk.len() {
                return Err(DatasourceError::InvalidResponse(format!(
                    "sent {} requests, got {} responses",
                    chunk.len(),
                    answer.responses.len()
                )));
            }
            responses.extend(answer.responses);
        }
        Ok(responses)
    }
}

fn reply(
    sender: oneshot::Sender<Result<QueryResult, DatasourceError>>,
    result: Result<QueryResult, DatasourceError>,
) {
    if sender.send(result).is_err() {
        log::error!("query result dropped: the caller stopped waiting");
    }
}
