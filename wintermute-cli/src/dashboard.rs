//! HTTP metrics dashboard: `/health`, `/metrics`, `/runs`, `/routing`.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use wintermute_orchestrator::store::DecisionStore;
use wintermute_orchestrator::telemetry::MetricsCollector;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<MetricsCollector>,
    pub store: Option<Arc<dyn DecisionStore>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/runs", get(runs))
        .route("/routing", get(routing))
        .with_state(state)
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "dashboard listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(state.metrics.snapshot())
}

async fn runs(State(state): State<AppState>) -> Json<Value> {
    let Some(store) = &state.store else {
        return Json(json!({"error": "no store configured", "runs": []}));
    };
    match store.fetch_runs().await {
        Ok(runs) => Json(json!({ "runs": runs })),
        Err(e) => Json(json!({"error": e.to_string(), "runs": []})),
    }
}

async fn routing(State(state): State<AppState>) -> Json<Value> {
    let Some(store) = &state.store else {
        return Json(json!({"error": "no store configured", "decisions": []}));
    };
    match store.fetch_decisions(None).await {
        Ok(decisions) => Json(json!({ "decisions": decisions })),
        Err(e) => Json(json!({"error": e.to_string(), "decisions": []})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wintermute_orchestrator::store::{DecisionStore, MemoryStore, RunRecord};

    fn app_state() -> AppState {
        AppState {
            metrics: Arc::new(MetricsCollector::new()),
            store: Some(Arc::new(MemoryStore::new())),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_snapshot_serves() {
        let state = app_state();
        state.metrics.record_model_call(true);
        let Json(body) = metrics(State(state)).await;
        assert_eq!(body["frontier_calls"], 1);
    }

    #[tokio::test]
    async fn runs_endpoint_lists_recorded_runs() {
        let state = app_state();
        state
            .store
            .as_ref()
            .unwrap()
            .upsert_run(&RunRecord {
                run_id: "run-1".into(),
                graph_id: "dossier".into(),
                scope_type: "topic".into(),
                scope_id: "rust".into(),
                status: "completed".into(),
                started_at: "2026-08-01T00:00:00Z".into(),
                finished_at: None,
            })
            .await
            .unwrap();

        let Json(body) = runs(State(state)).await;
        assert_eq!(body["runs"].as_array().unwrap().len(), 1);
        assert_eq!(body["runs"][0]["status"], "completed");
    }

    #[tokio::test]
    async fn routing_endpoint_without_store_degrades() {
        let state = AppState {
            metrics: Arc::new(MetricsCollector::new()),
            store: None,
        };
        let Json(body) = routing(State(state)).await;
        assert!(body["error"].as_str().is_some());
    }
}
