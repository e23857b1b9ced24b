//! Shared harness for the integration tests: an in-memory service, a sink that records
//! events, and a layer that fakes the peer address axum normally gets from the listener.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::{Layer, ServiceExt};

use tether::app::{self, Tether};
use tether::config::Config;
use tether::events::EventSink;
use tether::models::{AttributionEvent, ShortUrl};
use tether::redirect::ContentSource;
use tether::storage::{AttributionStore, MemoryStore};

pub const IPHONE_SAFARI: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 16_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.5 Mobile/15E148 Safari/604.1";
pub const PIXEL_CHROME: &str = "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Mobile Safari/537.36";

/// Keeps every published event for assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AttributionEvent>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &AttributionEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

impl RecordingSink {
    pub fn events(&self) -> Vec<AttributionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(AttributionEvent::kind).collect()
    }

    /// Wait until at least `count` events arrived; events are delivered by a background task.
    pub async fn wait_for(&self, count: usize) -> Vec<AttributionEvent> {
        for _ in 0..200 {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} events, got {:?}",
            self.kinds()
        );
    }
}

/// Inserts the `ConnectInfo` that `into_make_service_with_connect_info` would provide.
#[derive(Clone)]
pub struct TestConnectInfoLayer(pub SocketAddr);

impl<S> Layer<S> for TestConnectInfoLayer {
    type Service = TestConnectInfoMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TestConnectInfoMiddleware {
            inner,
            addr: self.0,
        }
    }
}

#[derive(Clone)]
pub struct TestConnectInfoMiddleware<S> {
    inner: S,
    addr: SocketAddr,
}

impl<S, B> tower::Service<Request<B>> for TestConnectInfoMiddleware<S>
where
    S: tower::Service<Request<B>> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut()
            .insert(axum::extract::connect_info::ConnectInfo(self.addr));
        self.inner.call(req)
    }
}

pub fn peer(ip: [u8; 4]) -> SocketAddr {
    SocketAddr::from((ip, 40_000))
}

pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let vars: HashMap<String, String> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

pub struct TestApp {
    pub tether: Tether,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<dyn AttributionStore>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config(&[])).await
    }

    pub async fn with_config(config: Config) -> Self {
        let content = app::default_content_source(&config).unwrap();
        Self::build(config, content).await
    }

    pub async fn build(config: Config, content: Arc<dyn ContentSource>) -> Self {
        let store: Arc<dyn AttributionStore> = Arc::new(MemoryStore::new());
        store.init().await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let tether = app::build(&config, Arc::clone(&store), sink.clone(), content).unwrap();
        Self {
            tether,
            sink,
            store,
        }
    }

    pub async fn save(&self, url: ShortUrl) {
        self.store.save_short_url(&url).await.unwrap();
    }

    pub fn redirect_from(&self, addr: SocketAddr) -> Router {
        self.tether
            .redirect_router
            .clone()
            .layer(TestConnectInfoLayer(addr))
    }

    pub fn api_from(&self, addr: SocketAddr) -> Router {
        self.tether.api_router.clone().layer(TestConnectInfoLayer(addr))
    }

    pub async fn visit(&self, addr: SocketAddr, request: Request<Body>) -> Response<Body> {
        self.redirect_from(addr).oneshot(request).await.unwrap()
    }

    pub async fn call_api(&self, addr: SocketAddr, request: Request<Body>) -> Response<Body> {
        self.api_from(addr).oneshot(request).await.unwrap()
    }

    /// Wait for the background visit bookkeeping to land in the store.
    pub async fn wait_for_visits(&self, count: usize) {
        for _ in 0..200 {
            let visits = self
                .store
                .recent_fingerprinted_visits(0, 100)
                .await
                .unwrap();
            if visits.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} fingerprinted visits");
    }
}

pub fn get(uri: &str, user_agent: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .header("host", "sho.rt")
        .header("user-agent", user_agent);
    if let Some(cookie) = cookie {
        builder = builder.header("cookie", cookie);
    }
    builder.body(Body::empty()).unwrap()
}

pub fn post(uri: &str, user_agent: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("user-agent", user_agent)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn location(response: &Response<Body>) -> String {
    response.headers()["location"].to_str().unwrap().to_string()
}

/// `name=value` pairs of every `Set-Cookie` header.
pub fn set_cookies(response: &Response<Body>) -> HashMap<String, String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
