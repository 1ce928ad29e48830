//! In-memory backend for the tests: records every request and answers with a handler.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use sysdig_datasource::api::{ApiRequest, ApiResponse, Backend, BoxFuture, Method, Transport, TransportError};

type Handler = dyn Fn(&Backend, &ApiRequest) -> Result<Value, TransportError> + Send + Sync;

pub struct ScriptedTransport {
    calls: Mutex<Vec<(Backend, ApiRequest)>>,
    handler: Box<Handler>,
}

/// Seconds of data available on the fake backend.
pub const AVAILABLE_UNTIL: i64 = 10_000_000;

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&Backend, &ApiRequest) -> Result<Value, TransportError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    /// A backend that has data from 0 to [`AVAILABLE_UNTIL`] and answers every data request.
    pub fn healthy() -> Arc<Self> {
        Self::new(|_, request| default_answer(request))
    }

    pub fn calls(&self) -> Vec<(Backend, ApiRequest)> {
        self.calls.lock().unwrap().clone()
    }

    /// The calls to `api/data/batch`, in order.
    pub fn batch_calls(&self) -> Vec<(Backend, ApiRequest)> {
        self.calls()
            .into_iter()
            .filter(|(_, r)| r.path == "api/data/batch")
            .collect()
    }

    /// Number of data requests of each call to `api/data/batch`.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_calls()
            .iter()
            .map(|(_, r)| r.body.as_ref().unwrap()["requests"].as_array().unwrap().len())
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls().iter().filter(|(_, r)| r.path == path).count()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, backend: &Backend, request: ApiRequest) -> BoxFuture<'static, Result<ApiResponse, TransportError>> {
        let result = (self.handler)(backend, &request);
        self.calls.lock().unwrap().push((backend.clone(), request));
        Box::pin(async move {
            // answer later, like a real network
            tokio::task::yield_now().await;
            result.map(|data| ApiResponse { status: 200, data })
        })
    }
}

pub fn timelines() -> Value {
    json!({"agents": [{"from": 0, "to": AVAILABLE_UNTIL * 1_000_000, "sampling": 10_000_000}]})
}

pub fn alignments() -> Value {
    json!([
        {"max": 3_600, "sampling": 10, "alignTo": 10},
        {"max": 30 * 86_400, "sampling": 60, "alignTo": 60}
    ])
}

/// Answers the time window endpoints and `api/data/batch`.
///
/// Every data request gets one row per segment value `a` and `b` (or one row if not segmented),
/// except for the metrics named `missing.*` that get an error.
pub fn default_answer(request: &ApiRequest) -> Result<Value, TransportError> {
    match (request.method, request.path.as_str()) {
        (Method::Get, "api/history/timelines") => Ok(timelines()),
        (Method::Get, "api/v2/history/timelines/alignments") => Ok(alignments()),
        (Method::Post, "api/data/batch") => {
            let body = request.body.as_ref().expect("batch requests have a body");
            let responses: Vec<Value> = body["requests"]
                .as_array()
                .expect("requests should be an array")
                .iter()
                .map(data_answer)
                .collect();
            Ok(json!({ "responses": responses }))
        }
        (_, path) => Err(TransportError::Status {
            status: 404,
            body: format!("no route for {path}"),
        }),
    }
}

fn data_answer(request: &Value) -> Value {
    let metric = request["metrics"]["v0"].as_str().unwrap_or_default();
    if metric.starts_with("missing.") {
        return json!({"errors": [{
            "reason": "Metric not found",
            "message": format!("'{metric}' is not a Sysdig Cloud metric"),
            "field": "metrics"
        }]});
    }

    let from = request["time"]["from"].as_i64().unwrap_or_default();
    let is_series = request["metrics"]["k0"] == json!("timestamp");
    let segment_key = if is_series { "k1" } else { "k0" };
    let segmented = request["metrics"].get(segment_key).is_some();

    let segments: &[&str] = if segmented { &["a", "b"] } else { &[""] };
    let rows: Vec<Value> = segments
        .iter()
        .enumerate()
        .map(|(i, segment)| {
            let mut row = serde_json::Map::new();
            row.insert(String::from("v0"), json!(i as f64 + 1.0));
            if is_series {
                row.insert(String::from("k0"), json!(from));
            }
            if segmented {
                row.insert(segment_key.to_owned(), json!(segment));
            }
            Value::Object(row)
        })
        .collect();
    json!({"data": rows, "time": request["time"].clone()})
}
