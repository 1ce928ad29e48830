//! Negotiation of the time window with the backend.
//!
//! The backend only serves windows that match one of its alignments, and only where
//! at least one agent timeline has data. All the computations are done in microseconds
//! and truncated back to seconds.

use std::sync::Arc;

use crate::{
    api::{
        ApiRequest, Backend, Transport,
        model::{Alignment, Timeline, Timelines},
    },
    error::DatasourceError,
    query::{RequestTime, UserTime},
};

const MICROS: i64 = 1_000_000;

/// Computes the aligned window to request for `user_time`.
///
/// Returns `None` if no alignment allows the requested span, or if no timeline has data
/// in the requested window. `alignments` must be sorted by ascending resolution.
pub fn resolve_request_time(
    timelines: &Timelines,
    alignments: &[Alignment],
    user_time: &UserTime,
) -> Option<RequestTime> {
    let from_us = user_time.from * MICROS;
    let to_us = user_time.to * MICROS;
    let span = to_us - from_us;

    let alignment = alignments.iter().find(|a| span <= a.max * MICROS)?;
    let min_sampling = alignment.sampling * MICROS;

    let timeline = timelines.agents.iter().find_map(|t| match *t {
        Timeline {
            from: Some(t_from),
            to: Some(t_to),
            sampling,
        } if sampling <= min_sampling && overlaps(from_us, to_us, t_from, t_to) => Some((t_from, t_to)),
        _ => None,
    })?;

    let align_to = alignment.align_to * MICROS;
    let (aligned_from, aligned_to) = if align_to > 0 {
        ((from_us / align_to) * align_to / MICROS, (to_us / align_to) * align_to / MICROS)
    } else {
        (user_time.from, user_time.to)
    };

    let (t_from, t_to) = timeline;
    Some(RequestTime {
        from: aligned_from.max(t_from / MICROS),
        to: aligned_to.min(t_to / MICROS),
        sampling: user_time.sampling.map(|_| min_sampling / MICROS),
    })
}

/// True if the requested window starts in, ends in, or contains the timeline.
fn overlaps(from: i64, to: i64, timeline_from: i64, timeline_to: i64) -> bool {
    (from <= timeline_from && to >= timeline_from)
        || (from >= timeline_from && to <= timeline_to)
        || (from <= timeline_to && to >= timeline_to)
}

/// Fetches the timelines and alignments of a backend and resolves time windows against them.
#[derive(Clone)]
pub struct TimeService {
    transport: Arc<dyn Transport>,
}

impl TimeService {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Fetches the timelines and the alignments concurrently.
    pub async fn query_timelines(&self, backend: &Backend) -> Result<(Timelines, Vec<Alignment>), DatasourceError> {
        let timelines = self.transport.send(backend, ApiRequest::get("api/history/timelines"));
        let alignments = self
            .transport
            .send(backend, ApiRequest::get("api/v2/history/timelines/alignments"));
        let (timelines, alignments) = futures::try_join!(timelines, alignments)?;
        Ok((timelines.decode()?, alignments.decode()?))
    }

    /// Resolves the window, `Ok(None)` meaning that the backend has no data for it.
    pub async fn request_time(
        &self,
        backend: &Backend,
        user_time: &UserTime,
    ) -> Result<Option<RequestTime>, DatasourceError> {
        let (timelines, alignments) = self.query_timelines(backend).await?;
        let request_time = resolve_request_time(&timelines, &alignments, user_time);
        if request_time.is_none() {
            log::warn!(
                "time window {}..{} is not available on {}",
                user_time.from,
                user_time.to,
                backend.url
            );
        }
        Ok(request_time)
    }

    /// Like [`request_time`](Self::request_time), but an unavailable window is an error.
    pub async fn validate_time_window(
        &self,
        backend: &Backend,
        user_time: &UserTime,
    ) -> Result<RequestTime, DatasourceError> {
        self.request_time(backend, user_time)
            .await?
            .ok_or(DatasourceError::TimeWindowUnavailable)
    }
}
