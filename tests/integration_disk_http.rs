mod common;

use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use common::{serve, test_client, test_config};
use reqwest::Url;
use s3_copy_proxy::{
    ProxyState,
    services::{
        disk_gateway::DiskGateway, http_source::HttpSource, metrics::MemoryMetricsSink,
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::net::TcpListener;

/// A stand-in for the remote bucket: serves fixed objects under `/bucket/`.
#[derive(Clone)]
struct RemoteBucket {
    objects: Arc<HashMap<String, (&'static str, &'static [u8])>>,
    gets: Arc<AtomicUsize>,
}

async fn remote_object(
    State(bucket): State<RemoteBucket>,
    Path(key): Path<String>,
) -> Response {
    bucket.gets.fetch_add(1, Ordering::SeqCst);
    match bucket.objects.get(&key) {
        Some((content_type, body)) => {
            ([(header::CONTENT_TYPE, *content_type)], body.to_vec()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_remote(objects: HashMap<String, (&'static str, &'static [u8])>) -> (Url, RemoteBucket) {
    let bucket = RemoteBucket {
        objects: Arc::new(objects),
        gets: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/bucket/{*key}", get(remote_object))
        .with_state(bucket.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (Url::parse(&format!("http://{addr}/bucket")).unwrap(), bucket)
}

async fn disk_target(dir: &std::path::Path) -> Arc<DiskGateway> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let disk = DiskGateway::new(Arc::new(pool), dir);
    disk.migrate().await.unwrap();
    Arc::new(disk)
}

#[tokio::test]
async fn copies_from_http_source_into_disk_target() {
    let (source_url, remote) = start_remote(HashMap::from([(
        "prod/app.tar.gz".to_string(),
        ("application/gzip", &b"0123456789"[..]),
    )]))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let target = disk_target(dir.path()).await;
    let source = Arc::new(HttpSource::with_client(test_client(), source_url.clone()));

    let mut config = test_config("");
    config.source = source_url;
    let metrics = Arc::new(MemoryMetricsSink::new());
    let state = ProxyState::new(config, source, target.clone(), metrics);
    let (addr, _server) = serve(state).await;
    let client = test_client();

    let first = client
        .get(format!("http://{addr}/prod/app.tar.gz"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-cache"], "miss");
    assert_eq!(first.headers()[header::CONTENT_TYPE], "application/gzip");
    assert_eq!(first.bytes().await.unwrap(), "0123456789");

    let second = client
        .get(format!("http://{addr}/prod/app.tar.gz"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["x-cache"], "hit");
    assert_eq!(second.headers()[header::CONTENT_TYPE], "application/gzip");
    assert!(second.headers().contains_key(header::ETAG));
    assert_eq!(second.bytes().await.unwrap(), "0123456789");

    assert_eq!(remote.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_remote_objects_are_404_and_not_stored() {
    let (source_url, remote) = start_remote(HashMap::new()).await;
    let dir = tempfile::tempdir().unwrap();
    let target = disk_target(dir.path()).await;
    let source = Arc::new(HttpSource::with_client(test_client(), source_url));

    let metrics = Arc::new(MemoryMetricsSink::new());
    let state = ProxyState::new(test_config(""), source, target.clone(), metrics);
    let (addr, _server) = serve(state).await;

    let response = test_client()
        .get(format!("http://{addr}/nope.txt"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(remote.gets.load(Ordering::SeqCst), 1);
    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects")
        .fetch_one(&*target.db)
        .await
        .unwrap();
    assert_eq!(stored, 0);
}

#[tokio::test]
async fn unreachable_source_is_502() {
    // Bind then drop a listener to get a port nothing is serving on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let target = disk_target(dir.path()).await;
    let source = Arc::new(HttpSource::with_client(
        test_client(),
        Url::parse(&format!("http://{dead}/bucket")).unwrap(),
    ));
    let metrics = Arc::new(MemoryMetricsSink::new());
    let state = ProxyState::new(test_config(""), source, target, metrics);
    let (addr, _server) = serve(state).await;

    let response = test_client()
        .get(format!("http://{addr}/k.bin"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers()["x-proxy-error-class"], "upstream.transient");
}
