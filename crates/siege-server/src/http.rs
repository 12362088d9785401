use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;

use siege_core::{default_agents, AgentProfile, BattleEvent, RunId, SiegeError, VERSION};

use crate::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

/// A [`SiegeError`] rendered as `{ "error": ... }` with a matching status.
#[derive(Debug)]
struct ApiError(SiegeError);

impl From<SiegeError> for ApiError {
    fn from(err: SiegeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SiegeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            SiegeError::RunNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    agents: Option<Vec<AgentProfile>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    run_id: RunId,
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    after: Option<u64>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .route("/battles", post(start_battle).get(list_battles))
        .route("/battles/{id}", get(get_battle))
        .route("/battles/{id}/stop", post(stop_battle))
        .route("/battles/{id}/events", get(battle_events))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": VERSION }))
}

async fn list_agents() -> impl IntoResponse {
    Json(default_agents())
}

// An empty body means "use the stock roster".
async fn start_battle(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        serde_json::from_slice::<StartRequest>(&body)
            .map_err(|e| SiegeError::InvalidInput(format!("malformed start request: {e}")))?
    };
    let run_id = state.controller.start_run(request.agents).await?;
    Ok((StatusCode::ACCEPTED, Json(StartResponse { run_id })).into_response())
}

async fn stop_battle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = state.controller.stop_run(&RunId::from(id.as_str())).await?;
    Ok(Json(json!({ "accepted": accepted })))
}

async fn get_battle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.controller.get_run(&RunId::from(id.as_str())).await?;
    Ok(Json(snapshot))
}

async fn list_battles(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.list_runs().await?))
}

/// `?after=` wins over `Last-Event-ID`; neither means the whole history.
fn resume_point(query: &EventsQuery, headers: &HeaderMap) -> u64 {
    query
        .after
        .or_else(|| {
            headers
                .get(LAST_EVENT_ID)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
        .unwrap_or(0)
}

fn sse_event(event: &BattleEvent) -> Event {
    let payload = serde_json::to_string(event).unwrap_or_default();
    Event::default()
        .id(event.seq.to_string())
        .event(event.kind.as_str())
        .data(payload)
}

async fn battle_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let after = resume_point(&query, &headers);
    let events = state.gateway.tail(RunId::from(id.as_str()), after).await?;
    let stream = events.map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use siege_core::fakes::{text_step, FakeProvisioner, ScriptedProvider};
    use siege_core::{BattleConfig, DirectOverlay, ProviderKind, ProviderRegistry, RunStatus};
    use siege_state::fakes::MemoryLedger;

    use super::*;

    fn test_state(provisioner: Arc<FakeProvisioner>) -> AppState {
        let idle = Arc::new(ScriptedProvider::repeating(text_step("...")));
        let providers = ProviderRegistry::empty()
            .with_provider(ProviderKind::Openai, idle.clone())
            .with_provider(ProviderKind::Anthropic, idle.clone())
            .with_provider(ProviderKind::Google, idle.clone())
            .with_provider(ProviderKind::Xai, idle);
        AppState::assemble(
            Arc::new(MemoryLedger::new()),
            provisioner,
            Arc::new(DirectOverlay),
            providers,
            BattleConfig::default(),
        )
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.expect("response");
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, payload)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    /// Start a battle whose tower is already beaten, and wait for it to end.
    async fn finished_battle(state: &AppState, provisioner: &FakeProvisioner) -> String {
        provisioner.counters().add("agent-1", 1000);
        let (status, payload) = send(app_router(state.clone()), post_json("/battles", "")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = payload["runId"].as_str().expect("runId").to_string();
        state.controller.wait(&RunId::from(run_id.as_str())).await;
        run_id
    }

    #[tokio::test]
    async fn health_route_reports_ok() {
        let state = test_state(Arc::new(FakeProvisioner::new()));
        let (status, payload) = send(app_router(state), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["version"], VERSION);
    }

    #[tokio::test]
    async fn agents_route_lists_the_stock_roster() {
        let state = test_state(Arc::new(FakeProvisioner::new()));
        let (status, payload) = send(app_router(state), get("/agents")).await;
        assert_eq!(status, StatusCode::OK);
        let agents = payload.as_array().expect("agents array");
        assert_eq!(agents.len(), 4);
        assert_eq!(agents[1]["provider"], "anthropic");
    }

    #[tokio::test]
    async fn empty_roster_is_rejected() {
        let state = test_state(Arc::new(FakeProvisioner::new()));
        let (status, payload) =
            send(app_router(state.clone()), post_json("/battles", r#"{"agents":[]}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(payload["error"].as_str().unwrap().contains("agents must not be empty"));
        assert!(state.controller.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_start_body_is_rejected() {
        let state = test_state(Arc::new(FakeProvisioner::new()));
        let (status, _) = send(app_router(state), post_json("/battles", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_get_returns_the_snapshot() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let state = test_state(provisioner.clone());
        let run_id = finished_battle(&state, &provisioner).await;

        let (status, payload) =
            send(app_router(state.clone()), get(&format!("/battles/{run_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["run"]["runId"], run_id.as_str());
        assert_eq!(payload["run"]["status"], "finished");
        let events = payload["events"].as_array().expect("events");
        assert_eq!(events[0]["kind"], "battle:start");
        assert_eq!(events.last().unwrap()["kind"], "battle:end");
        assert_eq!(payload["results"].as_array().unwrap().len(), 4);

        let (status, payload) = send(app_router(state), get("/battles")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_battle_is_not_found() {
        let state = test_state(Arc::new(FakeProvisioner::new()));
        let (status, _) = send(app_router(state.clone()), get("/battles/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(app_router(state.clone()), post_json("/battles/missing/stop", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(app_router(state), get("/battles/missing/events")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_a_finished_battle_is_not_accepted() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let state = test_state(provisioner.clone());
        let run_id = finished_battle(&state, &provisioner).await;

        let (status, payload) = send(
            app_router(state),
            post_json(&format!("/battles/{run_id}/stop"), ""),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["accepted"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_a_running_battle_cancels_it() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let state = test_state(provisioner.clone());
        let (_, payload) = send(app_router(state.clone()), post_json("/battles", "")).await;
        let run_id = payload["runId"].as_str().unwrap().to_string();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let (status, payload) = send(
            app_router(state.clone()),
            post_json(&format!("/battles/{run_id}/stop"), ""),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["accepted"], true);

        let run_id = RunId::from(run_id.as_str());
        state.controller.wait(&run_id).await;
        let snapshot = state.controller.get_run(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Cancelled);
        assert_eq!(provisioner.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn event_stream_replays_history_as_sse() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let state = test_state(provisioner.clone());
        let run_id = finished_battle(&state, &provisioner).await;
        let stored = state
            .controller
            .get_run(&RunId::from(run_id.as_str()))
            .await
            .unwrap()
            .events;

        let resp = app_router(state)
            .oneshot(get(&format!("/battles/{run_id}/events")))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).unwrap();

        let blocks: Vec<&str> = text.split("\n\n").filter(|b| !b.trim().is_empty()).collect();
        assert_eq!(blocks.len(), stored.len());
        assert!(blocks[0].contains("event: battle:start"));
        assert!(blocks[0].contains("id: 1"));
        assert!(blocks.last().unwrap().contains("event: battle:end"));
        let data = blocks[0]
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .expect("data line");
        let first: BattleEvent = serde_json::from_str(data).unwrap();
        assert_eq!(first, stored[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn event_stream_resumes_after_last_event_id() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let state = test_state(provisioner.clone());
        let run_id = finished_battle(&state, &provisioner).await;
        let total = state
            .controller
            .get_run(&RunId::from(run_id.as_str()))
            .await
            .unwrap()
            .events
            .len();

        let req = Request::builder()
            .method("GET")
            .uri(format!("/battles/{run_id}/events"))
            .header("Last-Event-ID", "3")
            .body(Body::empty())
            .expect("request");
        let resp = app_router(state.clone()).oneshot(req).await.expect("response");
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).unwrap();
        let ids: Vec<u64> = text
            .lines()
            .filter_map(|l| l.strip_prefix("id: "))
            .map(|id| id.parse().unwrap())
            .collect();
        assert_eq!(ids, (4..=total as u64).collect::<Vec<u64>>());

        // The query parameter takes precedence over the header.
        let req = Request::builder()
            .method("GET")
            .uri(format!("/battles/{run_id}/events?after={}", total - 1))
            .header("Last-Event-ID", "1")
            .body(Body::empty())
            .expect("request");
        let resp = app_router(state).oneshot(req).await.expect("response");
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(text.matches("id: ").count(), 1);
        assert!(text.contains("event: battle:end"));
    }

    #[test]
    fn resume_point_defaults_to_zero() {
        let headers = HeaderMap::new();
        assert_eq!(resume_point(&EventsQuery::default(), &headers), 0);
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, "not-a-number".parse().unwrap());
        assert_eq!(resume_point(&EventsQuery::default(), &headers), 0);
    }
}
