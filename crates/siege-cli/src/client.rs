//! HTTP client for `sieged`, including the resumable event watch.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use siege_core::RunSnapshot;
use siege_state::{AgentProfile, BattleEvent, RunId, RunRecord};

use crate::sse::SseParser;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RECONNECTS: u32 = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    run_id: RunId,
}

#[derive(Debug, Deserialize)]
struct StopResponse {
    accepted: bool,
}

/// High-water mark of a watch: the largest sequence number delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub last_seq: u64,
}

impl Cursor {
    pub fn new(after: u64) -> Self {
        Self { last_seq: after }
    }

    /// Advance past `event`; `false` for a duplicate or replay.
    pub fn accept(&mut self, event: &BattleEvent) -> bool {
        if event.seq <= self.last_seq {
            return false;
        }
        self.last_seq = event.seq;
        true
    }
}

/// How one stream connection ended.
enum StreamEnd {
    BattleEnded,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SiegeClient {
    http: reqwest::Client,
    base_url: String,
    reconnect_delay: Duration,
    max_reconnects: u32,
}

async fn error_for(resp: reqwest::Response) -> anyhow::Error {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    match body.get("error").and_then(|e| e.as_str()) {
        Some(message) => anyhow::anyhow!("server returned {status}: {message}"),
        None => anyhow::anyhow!("server returned {status}"),
    }
}

impl SiegeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
        }
    }

    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnects = max_attempts;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn start(&self, agents: Option<Vec<AgentProfile>>) -> Result<RunId> {
        let body = match agents {
            Some(agents) => json!({ "agents": agents }),
            None => json!({}),
        };
        let resp = self
            .http
            .post(self.url("/battles"))
            .json(&body)
            .send()
            .await
            .context("Failed to reach the battle server")?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        let started: StartResponse = resp.json().await.context("Invalid start response")?;
        Ok(started.run_id)
    }

    pub async fn stop(&self, run_id: &RunId) -> Result<bool> {
        let resp = self
            .http
            .post(self.url(&format!("/battles/{run_id}/stop")))
            .send()
            .await
            .context("Failed to reach the battle server")?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        let stopped: StopResponse = resp.json().await.context("Invalid stop response")?;
        Ok(stopped.accepted)
    }

    pub async fn get(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let resp = self
            .http
            .get(self.url(&format!("/battles/{run_id}")))
            .send()
            .await
            .context("Failed to reach the battle server")?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        resp.json().await.context("Invalid run snapshot")
    }

    pub async fn list(&self) -> Result<Vec<RunRecord>> {
        let resp = self
            .http
            .get(self.url("/battles"))
            .send()
            .await
            .context("Failed to reach the battle server")?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        resp.json().await.context("Invalid run list")
    }

    /// Stream a run's events from `after`, calling `on_event` once per event
    /// in sequence order. Reconnects from the high-water mark when the
    /// connection drops. Returns the final cursor once `battle:end` arrives
    /// or the run is over.
    pub async fn watch<F>(&self, run_id: &RunId, after: u64, mut on_event: F) -> Result<Cursor>
    where
        F: FnMut(&BattleEvent),
    {
        self.get(run_id).await?;
        let mut cursor = Cursor::new(after);
        let mut failures = 0u32;

        loop {
            let before = cursor;
            match self.stream_once(run_id, &mut cursor, &mut on_event).await {
                Ok(StreamEnd::BattleEnded) => return Ok(cursor),
                Ok(StreamEnd::Closed) => {
                    let run = self.get(run_id).await?.run;
                    if run.status.is_terminal() {
                        debug!(run_id = %run_id, "stream closed after run ended");
                        return Ok(cursor);
                    }
                }
                Err(e) => warn!(run_id = %run_id, error = %e, "event stream interrupted"),
            }

            if cursor != before {
                failures = 0;
            } else {
                failures += 1;
                if failures > self.max_reconnects {
                    bail!(
                        "gave up on the event stream after {} reconnects (last seq {})",
                        self.max_reconnects,
                        cursor.last_seq
                    );
                }
            }
            tokio::time::sleep(self.reconnect_delay).await;
            debug!(run_id = %run_id, after = cursor.last_seq, "reconnecting event stream");
        }
    }

    async fn stream_once<F>(
        &self,
        run_id: &RunId,
        cursor: &mut Cursor,
        on_event: &mut F,
    ) -> Result<StreamEnd>
    where
        F: FnMut(&BattleEvent),
    {
        let resp = self
            .http
            .get(self.url(&format!("/battles/{run_id}/events")))
            .query(&[("after", cursor.last_seq)])
            .header("accept", "text/event-stream")
            .send()
            .await
            .context("Failed to open the event stream")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            bail!("run not found: {run_id}");
        }
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }

        let mut parser = SseParser::new();
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("Event stream read failed")?;
            for block in parser.feed(&chunk) {
                let event: BattleEvent = match serde_json::from_str(&block.data) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "skipping undecodable event block");
                        continue;
                    }
                };
                if !cursor.accept(&event) {
                    continue;
                }
                on_event(&event);
                if event.kind.is_terminal() {
                    return Ok(StreamEnd::BattleEnded);
                }
            }
        }
        Ok(StreamEnd::Closed)
    }
}
