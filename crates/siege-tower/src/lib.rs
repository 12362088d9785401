//! The tower: an HTTP service that counts hits per `X-Agent-ID`.
//!
//! Runs inside the target sandbox. The orchestrator reads `/stats` to derive
//! the tower's health; agents have to find `/hello` on their own.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::debug;

use siege_core::TowerStats;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_PERSIST_PATH: &str = "/tmp/request-counts.json";
pub const PERSIST_INTERVAL: Duration = Duration::from_millis(100);

const AGENT_HEADER: &str = "x-agent-id";
const UNKNOWN_AGENT: &str = "unknown";
const HINT: &str = "Call /hello endpoint with X-Agent-ID header to defeat the tower";

/// Hit counters plus a change counter for the persister.
#[derive(Debug)]
pub struct Tower {
    stats: Mutex<TowerStats>,
    version: AtomicU64,
    started: Instant,
}

impl Default for Tower {
    fn default() -> Self {
        Self::new()
    }
}

impl Tower {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(TowerStats::default()),
            version: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TowerStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count one hit. Returns `(hits for agent, total)`.
    pub fn hit(&self, agent_id: &str) -> (u64, u64) {
        let mut stats = self.lock();
        let count = stats.agents.entry(agent_id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        stats.total_requests += 1;
        self.version.fetch_add(1, Ordering::SeqCst);
        (count, stats.total_requests)
    }

    pub fn stats(&self) -> TowerStats {
        self.lock().clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

pub fn app_router(tower: Arc<Tower>) -> Router {
    Router::new()
        .route("/", get(|| async { HINT }))
        .route("/hello", get(hello))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(tower)
}

async fn hello(State(tower): State<Arc<Tower>>, headers: HeaderMap) -> impl IntoResponse {
    let agent_id = headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_AGENT);
    let (count, total) = tower.hit(agent_id);
    Json(json!({
        "message": "Hello from Tower!",
        "agentId": agent_id,
        "requestNumber": count,
        "totalRequests": total,
    }))
}

async fn health(State(tower): State<Arc<Tower>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "uptimeSecs": tower.uptime().as_secs_f64() }))
}

async fn stats(State(tower): State<Arc<Tower>>) -> impl IntoResponse {
    Json(tower.stats())
}

/// Write the per-agent counters to `path` whenever they changed, every
/// `interval`. Write errors are ignored.
pub async fn persist_loop(tower: Arc<Tower>, path: PathBuf, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut written = None;
    loop {
        ticker.tick().await;
        let version = tower.version();
        if written == Some(version) {
            continue;
        }
        let body = match serde_json::to_vec(&tower.stats().agents) {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "failed to encode counters");
                continue;
            }
        };
        match tokio::fs::write(&path, body).await {
            Ok(()) => written = Some(version),
            Err(e) => debug!(path = %path.display(), error = %e, "failed to persist counters"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    async fn call(tower: &Arc<Tower>, uri: &str, agent: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut req = Request::builder().method("GET").uri(uri);
        if let Some(agent) = agent {
            req = req.header("X-Agent-ID", agent);
        }
        let resp = app_router(tower.clone())
            .oneshot(req.body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        (status, body.to_vec())
    }

    async fn call_json(tower: &Arc<Tower>, uri: &str, agent: Option<&str>) -> Value {
        let (status, body) = call(tower, uri, agent).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).expect("json")
    }

    #[tokio::test]
    async fn root_returns_the_hint() {
        let tower = Arc::new(Tower::new());
        let (status, body) = call(&tower, "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("/hello"));
        assert_eq!(tower.stats().total_requests, 0);
    }

    #[tokio::test]
    async fn hello_counts_per_agent() {
        let tower = Arc::new(Tower::new());
        call_json(&tower, "/hello", Some("agent-1")).await;
        call_json(&tower, "/hello", Some("agent-2")).await;
        let reply = call_json(&tower, "/hello", Some("agent-1")).await;

        assert_eq!(reply["message"], "Hello from Tower!");
        assert_eq!(reply["agentId"], "agent-1");
        assert_eq!(reply["requestNumber"], 2);
        assert_eq!(reply["totalRequests"], 3);
    }

    #[tokio::test]
    async fn missing_header_counts_as_unknown() {
        let tower = Arc::new(Tower::new());
        let reply = call_json(&tower, "/hello", None).await;
        assert_eq!(reply["agentId"], "unknown");
        assert_eq!(tower.stats().agents["unknown"], 1);
    }

    #[tokio::test]
    async fn stats_match_the_orchestrator_shape() {
        let tower = Arc::new(Tower::new());
        for _ in 0..3 {
            call_json(&tower, "/hello", Some("agent-4")).await;
        }
        call_json(&tower, "/hello", Some("agent-2")).await;

        let raw = call_json(&tower, "/stats", None).await;
        assert_eq!(raw["totalRequests"], 4);
        let stats: TowerStats = serde_json::from_value(raw).unwrap();
        assert_eq!(stats.damage_for("agent-4"), 3);
        assert_eq!(stats.damage_for("agent-2"), 1);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let tower = Arc::new(Tower::new());
        let reply = call_json(&tower, "/health", None).await;
        assert_eq!(reply["status"], "ok");
        assert!(reply["uptimeSecs"].as_f64().unwrap() >= 0.0);
        assert_eq!(tower.stats().total_requests, 0);
    }

    #[tokio::test]
    async fn counters_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.json");
        let tower = Arc::new(Tower::new());
        tower.hit("agent-1");
        tower.hit("agent-1");
        tower.hit("agent-3");

        let task = tokio::spawn(persist_loop(
            tower.clone(),
            path.clone(),
            Duration::from_millis(10),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        let written: BTreeMap<String, u64> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["agent-1"], 2);
        assert_eq!(written["agent-3"], 1);
    }

    #[tokio::test]
    async fn persist_errors_are_ignored() {
        let tower = Arc::new(Tower::new());
        tower.hit("agent-1");
        let task = tokio::spawn(persist_loop(
            tower,
            PathBuf::from("/nonexistent-dir/counts.json"),
            Duration::from_millis(10),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        task.abort();
    }
}
