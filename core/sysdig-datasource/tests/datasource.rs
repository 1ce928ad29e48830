pub mod scripted;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use sysdig_datasource::{
    Datasource, DatasourceConfig, DatasourceError,
    api::{Method, TransportError},
    batch::BatchScheduler,
    config::BatchConfig,
    datasource::{FindValue, LabelValuesSort, PanelTarget, QueryOptions, Range},
    metrics::{LabelsQuery, MetricsQuery, MetricsService},
};

use scripted::{ScriptedTransport, default_answer};

fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

fn config(url: &str) -> DatasourceConfig {
    DatasourceConfig {
        url: url.to_owned(),
        api_token: String::from("42"),
        ..Default::default()
    }
}

fn range() -> Option<Range> {
    Some(Range {
        from: 1_000_000,
        to: 1_600_000,
    })
}

fn panel(metric: &str) -> PanelTarget {
    PanelTarget {
        target: Some(metric.to_owned()),
        ..Default::default()
    }
}

#[tokio::test]
async fn query_skips_hidden_and_placeholder_targets() {
    init_logger();
    let transport = ScriptedTransport::healthy();
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport.clone());

    let result = datasource
        .query(QueryOptions {
            range: range(),
            interval_ms: Some(60_000),
            targets: vec![
                PanelTarget {
                    hide: true,
                    ..panel("memory.used.percent")
                },
                panel("select metric"),
                panel("cpu.used.percent"),
                PanelTarget::default(),
            ],
        })
        .await
        .unwrap();

    let names: Vec<&str> = result.series().map(|s| s.target.as_str()).collect();
    assert_eq!(names, vec!["cpu.used.percent", "net.bytes.total"]);
    assert_eq!(transport.batch_sizes(), vec![2]);

    let (_, request) = &transport.batch_calls()[0];
    let body = request.body.as_ref().unwrap();
    assert_eq!(body["requests"][1]["group"]["aggregations"], json!({"v0": "timeAvg"}));
    assert_eq!(body["requests"][1]["paging"], json!({"from": 0, "to": 9}));
}

#[tokio::test]
async fn query_without_targets_does_not_call_backend() {
    init_logger();
    let transport = ScriptedTransport::healthy();
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport.clone());

    let result = datasource
        .query(QueryOptions {
            range: range(),
            interval_ms: None,
            targets: vec![panel("select metric")],
        })
        .await
        .unwrap();
    assert!(result.data.is_empty());
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn panels_of_a_dashboard_share_one_batch() {
    init_logger();
    let transport = ScriptedTransport::healthy();
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport.clone());

    let options = |metric: &str| QueryOptions {
        range: range(),
        interval_ms: Some(10_000),
        targets: vec![panel(metric)],
    };
    let (a, b, c) = tokio::join!(
        datasource.query(options("cpu.used.percent")),
        datasource.query(options("memory.used.percent")),
        datasource.query(options("net.bytes.total")),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(transport.batch_sizes(), vec![3]);
}

#[tokio::test]
async fn datasources_can_share_a_scheduler() {
    init_logger();
    let transport = ScriptedTransport::healthy();
    let scheduler = BatchScheduler::new(transport.clone(), BatchConfig::default());
    let first = Datasource::with_scheduler(&config("dummy://localhost"), transport.clone(), scheduler.clone());
    let second = Datasource::with_scheduler(&config("dummy://localhost-2"), transport.clone(), scheduler);

    let options = QueryOptions {
        range: range(),
        interval_ms: Some(10_000),
        targets: vec![panel("cpu.used.percent")],
    };
    let (a, b) = tokio::join!(first.query(options.clone()), second.query(options));
    a.unwrap();
    b.unwrap();
    assert_eq!(transport.batch_sizes(), vec![1, 1]);
}

#[tokio::test]
async fn test_datasource_success() {
    init_logger();
    let transport = ScriptedTransport::new(|_, request| match request.path.as_str() {
        "api/login" => Ok(json!({"user": {"username": "me"}})),
        _ => default_answer(request),
    });
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport.clone());

    let result = datasource.test_datasource().await.unwrap();
    assert_eq!(result.status, "success");
    assert_eq!(result.message, "Data source is working");
    assert_eq!(result.title, "Success");
}

#[tokio::test]
async fn test_datasource_failure() {
    init_logger();
    let transport = ScriptedTransport::new(|_, _| {
        Err(TransportError::Status {
            status: 401,
            body: String::from("unauthorized"),
        })
    });
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport);

    let err = datasource.test_datasource().await.unwrap_err();
    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn label_values_variable() {
    init_logger();
    let transport = ScriptedTransport::new(|_, request| match (request.method, request.path.as_str()) {
        (Method::Post, "api/data/entity/metadata") => Ok(json!({"data": [
            {"host.hostName": "web-2"},
            {"host.hostName": null},
            {"host.hostName": "web-1"}
        ]})),
        _ => default_answer(request),
    });
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport.clone());

    let values = datasource
        .metric_find_query("label_values(host.hostName)", range(), LabelValuesSort::AlphabeticalAsc)
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![
            FindValue {
                text: String::from("web-1")
            },
            FindValue {
                text: String::from("web-2")
            },
        ]
    );

    let calls = transport.calls();
    let (_, metadata) = calls.iter().find(|(_, r)| r.path == "api/data/entity/metadata").unwrap();
    assert_eq!(
        metadata.body,
        Some(json!({
            "time": {"from": 1_000_000_000i64, "to": 1_600_000_000i64},
            "metrics": ["host.hostName"],
            "filter": null,
            "paging": {"from": 0, "to": 99}
        }))
    );
}

#[tokio::test]
async fn label_values_outside_available_data() {
    init_logger();
    let transport = ScriptedTransport::healthy();
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport.clone());

    let far_future = Some(Range {
        from: 100_000_000_000_000,
        to: 100_000_000_600_000,
    });
    let err = datasource
        .metric_find_query("label_values(host.hostName)", far_future, LabelValuesSort::Disabled)
        .await
        .unwrap_err();
    assert!(matches!(err, DatasourceError::TimeWindowUnavailable));
    assert_eq!(transport.count("api/data/entity/metadata"), 0);
}

#[tokio::test]
async fn unsupported_variable_query() {
    init_logger();
    let transport = ScriptedTransport::healthy();
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport.clone());

    let values = datasource
        .metric_find_query("metrics(cpu)", range(), LabelValuesSort::Disabled)
        .await
        .unwrap();
    assert!(values.is_empty());
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn empty_variable_query_lists_metrics() {
    init_logger();
    let transport = ScriptedTransport::new(|_, request| match request.path.as_str() {
        "api/v2/metrics/descriptors" => Ok(json!({"metricDescriptors": [
            {"id": "cpu.used.percent", "metricType": "gauge", "type": "%", "timeAggregations": ["timeAvg"], "groupAggregations": ["avg"]},
            {"id": "net.bytes.total", "metricType": "counter", "type": "byte"}
        ]})),
        _ => default_answer(request),
    });
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport);

    let values = datasource.metric_find_query("", None, LabelValuesSort::Disabled).await.unwrap();
    let texts: Vec<&str> = values.iter().map(|v| v.text.as_str()).collect();
    assert_eq!(texts, vec!["cpu.used.percent", "net.bytes.total"]);
}

fn descriptors_backend() -> Arc<ScriptedTransport> {
    ScriptedTransport::new(|_, request| match request.path.as_str() {
        "api/v2/metrics/descriptors" => Ok(json!({"metricDescriptors": []})),
        "api/v2/labels/descriptors" => Ok(json!({"labelDescriptors": [{"id": "host.hostName"}]})),
        _ => default_answer(request),
    })
}

#[tokio::test]
async fn metric_lookup_default_parameters() {
    init_logger();
    let transport = descriptors_backend();
    let service = MetricsService::new(transport.clone(), &Default::default());
    let backend = config("dummy://localhost").backend();

    let metrics = service.find_metrics(&backend, &MetricsQuery::default()).await.unwrap();
    assert!(metrics.is_empty());

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    let request = &calls[0].1;
    assert_eq!(request.query_param("filter"), Some(""));
    assert_eq!(request.query_param("offset"), Some("0"));
    assert_eq!(request.query_param("limit"), Some("100"));
    assert_eq!(request.query_param("metricTypes"), Some("counter,gauge,histogram"));
    assert_eq!(request.query_param("types"), Some("%,byte,date,int,number,relativeTime"));
}

#[tokio::test]
async fn metric_lookup_is_cached() {
    init_logger();
    let transport = descriptors_backend();
    let service = MetricsService::new(transport.clone(), &Default::default());
    let backend = config("dummy://localhost").backend();

    service.find_metrics(&backend, &MetricsQuery::default()).await.unwrap();
    service.find_metrics(&backend, &MetricsQuery::default()).await.unwrap();
    assert_eq!(transport.calls().len(), 1);

    // concurrent lookups share the same request
    let query = MetricsQuery::matching("test");
    let (a, b) = tokio::join!(service.find_metrics(&backend, &query), service.find_metrics(&backend, &query));
    a.unwrap();
    b.unwrap();
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1.query_param("filter"), Some("test"));
}

#[tokio::test]
async fn metric_lookup_per_backend() {
    init_logger();
    let transport = descriptors_backend();
    let service = MetricsService::new(transport.clone(), &Default::default());
    let first = config("dummy://localhost").backend();
    let second = config("dummy://localhost-2").backend();

    let query = MetricsQuery::matching("test");
    let (a, b) = tokio::join!(service.find_metrics(&first, &query), service.find_metrics(&second, &query));
    a.unwrap();
    b.unwrap();

    let urls: Vec<String> = transport.calls().into_iter().map(|(backend, _)| backend.url).collect();
    assert_eq!(urls, vec!["dummy://localhost", "dummy://localhost-2"]);
}

#[tokio::test]
async fn failed_lookup_is_retried() {
    init_logger();
    let transport = ScriptedTransport::new(|_, _| {
        Err(TransportError::Request(String::from("connection refused")))
    });
    let service = MetricsService::new(transport.clone(), &Default::default());
    let backend = config("dummy://localhost").backend();

    assert!(service.find_metrics(&backend, &MetricsQuery::default()).await.is_err());
    assert!(service.find_metrics(&backend, &MetricsQuery::default()).await.is_err());
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test]
async fn legacy_metric_listing() {
    init_logger();
    let transport = ScriptedTransport::new(|_, request| match request.path.as_str() {
        "api/v2/metrics/descriptors" => Err(TransportError::Status {
            status: 500,
            body: String::new(),
        }),
        "api/data/metrics" => Ok(json!({
            "cpu.used.percent": {"id": "cpu.used.percent", "metricType": "gauge", "type": "%", "aggregations": ["timeAvg", "max"]},
            "host.hostName": {"id": "host.hostName", "metricType": "tag", "type": "string"}
        })),
        _ => default_answer(request),
    });
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport.clone());

    let metrics = datasource.find_metrics(&MetricsQuery::default()).await.unwrap();
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].time_aggregations, vec!["timeAvg", "max"]);
    assert_eq!(metrics[0].group_aggregations, vec!["avg", "sum", "min", "max"]);
    assert!(metrics[1].group_aggregations.is_empty());

    let legacy = &transport.calls()[1].1;
    assert_eq!(legacy.query_param("light"), Some("true"));
}

#[tokio::test]
async fn segment_by_lookup() {
    init_logger();
    let transport = descriptors_backend();
    let datasource = Datasource::with_transport(&config("dummy://localhost"), transport.clone());

    let labels = datasource.find_segment_by(Some("cpu.used.percent")).await.unwrap();
    assert_eq!(labels[0].id, "host.hostName");
    datasource.find_segment_by(Some("select metric")).await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls[0].1.query_param("pids"), Some("cpu.used.percent"));
    assert_eq!(calls[1].1.query_param("pids"), Some(""));
}

#[tokio::test]
async fn legacy_segmentation_listing() {
    init_logger();
    let transport = ScriptedTransport::new(|_, request| match request.path.as_str() {
        "api/data/metrics/cpu.used.percent/segmentationMetrics" => {
            Ok(json!({"segmentationMetrics": ["proc.name", "host.hostName"]}))
        }
        // also answers 404 for api/v2/labels/descriptors
        _ => default_answer(request),
    });
    let service = MetricsService::new(transport.clone(), &Default::default());
    let backend = config("dummy://localhost").backend();

    let labels = service
        .find_labels(&backend, &LabelsQuery::for_metric("cpu.used.percent"))
        .await
        .unwrap();
    let ids: Vec<&str> = labels.iter().map(|l| l.id.as_str()).collect();
    assert_eq!(ids, vec!["host.hostName", "proc.name"]);

    let none = service.find_labels(&backend, &LabelsQuery::default()).await.unwrap();
    assert!(none.is_empty());
}
