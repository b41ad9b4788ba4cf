//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - In-process regions served by axum on `127.0.0.1:0`
//! - A fault-injection layer that makes a region unreachable or hung
//! - Scaled-down loop intervals (the 60s island grace becomes 1s)
//! - Polling helpers

#![allow(dead_code)]

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use region_sync::config::{OutboundConfig, ProbeConfig, QueryConfig};
use region_sync::record::{ChangeEntry, Operation};
use region_sync::{http, MemoryStore, PeerConfig, Record, RecordQuery, RegionStore, SyncConfig, SyncEngine, SyncSettings};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Island grace used by the scaled-down settings.
pub const GRACE: Duration = Duration::from_secs(1);

/// Loop cadences scaled down for tests.
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        outbound: OutboundConfig {
            interval: "100ms".to_string(),
            batch_size: 100,
            request_timeout: "1s".to_string(),
        },
        probe: ProbeConfig {
            interval: "100ms".to_string(),
            timeout: "200ms".to_string(),
            isolation_grace: "1s".to_string(),
        },
        query: QueryConfig {
            fanout_timeout: "500ms".to_string(),
        },
    }
}

/// Fault injected in front of a region's endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Fault {
    None = 0,
    /// Every request gets 503.
    Unavailable = 1,
    /// Every request stalls far past any client timeout.
    Hang = 2,
}

impl Fault {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Fault::Unavailable,
            2 => Fault::Hang,
            _ => Fault::None,
        }
    }
}

async fn inject_fault(fault: Arc<AtomicU8>, request: Request, next: Next) -> Response {
    match Fault::from_u8(fault.load(Ordering::Acquire)) {
        Fault::None => next.run(request).await,
        Fault::Unavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Fault::Hang => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

/// A listener bound before its region exists, so peers can learn its URL.
pub struct Slot {
    pub name: String,
    pub listener: TcpListener,
    pub url: String,
}

pub async fn bind(name: &str) -> Slot {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    Slot {
        name: name.to_string(),
        listener,
        url,
    }
}

/// Config for `name` replicating with `peers` (region id, base URL).
pub fn config_for(name: &str, peers: &[(&str, &str)]) -> SyncConfig {
    let mut config = SyncConfig::for_testing(name);
    config.settings = fast_settings();
    config.peers = peers
        .iter()
        .map(|(id, url)| PeerConfig::for_testing(id, url))
        .collect();
    config
}

/// One served region.
pub struct TestRegion<S: RegionStore = MemoryStore> {
    pub name: String,
    pub url: String,
    pub engine: Arc<SyncEngine<S>>,
    fault: Arc<AtomicU8>,
    server: JoinHandle<()>,
}

impl<S: RegionStore> TestRegion<S> {
    /// Serve `engine` on the slot's listener. Does not start the engine.
    pub fn serve(slot: Slot, engine: Arc<SyncEngine<S>>) -> Self {
        let fault = Arc::new(AtomicU8::new(Fault::None as u8));
        let layer_fault = Arc::clone(&fault);
        let app = http::router(Arc::clone(&engine)).layer(middleware::from_fn(move |req: Request, next: Next| {
            inject_fault(Arc::clone(&layer_fault), req, next)
        }));

        let server = tokio::spawn(async move {
            let _ = axum::serve(slot.listener, app).await;
        });

        Self {
            name: slot.name,
            url: slot.url,
            engine,
            fault,
            server,
        }
    }

    pub fn set_fault(&self, fault: Fault) {
        self.fault.store(fault as u8, Ordering::Release);
    }

    pub async fn get(&self, record_id: &str) -> Option<Record> {
        self.engine.store().get(record_id).await.unwrap()
    }

    /// Every stored record including tombstones, ordered by id.
    pub async fn snapshot(&self) -> Vec<Record> {
        let mut records = self
            .engine
            .store()
            .query(&RecordQuery {
                limit: usize::MAX,
                since: None,
                include_deleted: true,
            })
            .await
            .unwrap();
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        records
    }

    /// Shut the engine down and stop serving.
    pub async fn stop(self) {
        self.engine.shutdown().await;
        self.server.abort();
    }
}

/// Fully connected mesh of started regions on in-memory stores.
pub async fn mesh(names: &[&str]) -> Vec<TestRegion> {
    let mut slots = Vec::new();
    for name in names {
        slots.push(bind(name).await);
    }
    let addresses: Vec<(String, String)> = slots.iter().map(|s| (s.name.clone(), s.url.clone())).collect();

    let mut regions = Vec::new();
    for slot in slots {
        let peers: Vec<(&str, &str)> = addresses
            .iter()
            .filter(|(name, _)| *name != slot.name)
            .map(|(name, url)| (name.as_str(), url.as_str()))
            .collect();
        let config = config_for(&slot.name, &peers);
        let store = Arc::new(MemoryStore::new(config.peer_ids()));
        let engine = Arc::new(SyncEngine::new(config, store).unwrap());
        regions.push(TestRegion::serve(slot, engine));
    }
    for region in &regions {
        region.engine.start().await.unwrap();
    }
    regions
}

/// Poll `check` every 20ms until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A well-formed change log entry as a peer would send it.
pub fn entry(sequence: u64, record_id: &str, timestamp: i64, origin: &str, operation: Operation) -> ChangeEntry {
    ChangeEntry {
        sequence,
        operation,
        record_id: record_id.to_string(),
        payload: serde_json::json!({ "origin": origin, "ts": timestamp }),
        timestamp,
        region_origin: origin.to_string(),
        record_origin: origin.to_string(),
        synced_to: BTreeSet::new(),
    }
}
