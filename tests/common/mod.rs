#![allow(dead_code)]

use reqwest::Url;
use s3_copy_proxy::{
    ProxyConfig, ProxyState,
    services::{memory_gateway::MemoryGateway, metrics::MemoryMetricsSink},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};

/// A proxy served on an ephemeral local port, backed by in-memory buckets.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub source: Arc<MemoryGateway>,
    pub target: Arc<MemoryGateway>,
    pub metrics: Arc<MemoryMetricsSink>,
    pub client: reqwest::Client,
    server: JoinHandle<()>,
}

impl TestProxy {
    pub async fn start(prefix: &str) -> Self {
        let source = Arc::new(MemoryGateway::read_only("source"));
        let target = Arc::new(MemoryGateway::new("target"));
        let metrics = Arc::new(MemoryMetricsSink::new());
        let state = ProxyState::new(
            test_config(prefix),
            source.clone(),
            target.clone(),
            metrics.clone(),
        );
        let (addr, server) = serve(state).await;

        Self {
            addr,
            source,
            target,
            metrics,
            client: test_client(),
            server,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    pub async fn head(&self, path: &str) -> reqwest::Response {
        self.client.head(self.url(path)).send().await.unwrap()
    }
}

pub fn test_config(prefix: &str) -> ProxyConfig {
    ProxyConfig {
        source: Url::parse("https://source.example.com/bucket").unwrap(),
        bucket: "replica".into(),
        prefix: prefix.into(),
        source_timeout: Some(Duration::from_secs(10)),
        target_timeout: Some(Duration::from_secs(10)),
        max_object_bytes: Some(1024 * 1024),
    }
}

/// Serve `state` on an ephemeral local port.
pub async fn serve(state: ProxyState) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = s3_copy_proxy::app(state);
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, server)
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// A client that ignores any proxy settings in the environment.
pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
