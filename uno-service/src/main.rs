// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod bot;
mod matchmaking;
mod monitor;
mod notify;
mod session;
mod settings;
mod store;
mod table;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uno_common::{
    ActionResponse, DEFAULT_LEADERBOARD_LIMIT, JoinRequest, JoinResponse, QueueStatus,
    RejectReason, StatsResponse, SubmitActionRequest, TableSummary, TableView,
};

use crate::{
    matchmaking::run_matchmaking_loop,
    notify::Courier,
    session::SessionRegistry,
    settings::Settings,
    store::{InMemoryQueueStore, InMemoryStatsStore, QueueStore, StatsStore},
};

#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    queue: Arc<dyn QueueStore>,
    stats: Arc<dyn StatsStore>,
    courier: Courier,
    registry: Arc<SessionRegistry>,
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "uno_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState {
        settings: Arc::new(Settings::load()),
        queue: Arc::new(InMemoryQueueStore::default()),
        stats: Arc::new(InMemoryStatsStore::default()),
        courier: Courier::from_env(),
        registry: Arc::new(SessionRegistry::default()),
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let matchmaking = tokio::spawn(run_matchmaking_loop(state.clone(), stop_rx));

    let app = build_router(state.clone());
    let bind_addr = parse_bind_addr("UNO_SERVICE_BIND", "0.0.0.0:8085")?;
    info!(%bind_addr, "uno-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind uno-service listener")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("uno-service shutting down");
    stop_tx.send_replace(true);
    if let Err(error) = matchmaking.await {
        warn!(error = %error, "matchmaking loop did not stop cleanly");
    }
    session::shutdown(&state).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/queue",
            get(queue_status_handler).post(join_queue_handler),
        )
        .route("/v1/tables", get(list_tables_handler))
        .route(
            "/v1/tables/{table_id}/view/{participant_id}",
            get(get_view_handler),
        )
        .route("/v1/tables/{table_id}/actions", post(submit_action_handler))
        .route("/v1/stats/{participant_id}", get(get_stats_handler))
        .route("/v1/leaderboard", get(leaderboard_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "uno-service"}))
}

async fn join_queue_handler(
    State(state): State<AppState>,
    Json(request): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let participant_id = request.participant_id.trim().to_string();
    if participant_id.is_empty() {
        return Err(ApiError::bad_request("participant_id must not be empty"));
    }
    let wants_bot_fill = request.wants_bot_fill.unwrap_or(true);

    // Participants we cannot reach would never hear about their table.
    state.courier.check_reachable(&participant_id).await.map_err(|error| {
        ApiError::unprocessable(format!(
            "participant {participant_id} cannot receive notifications: {error:#}"
        ))
    })?;

    let outcome = state
        .queue
        .toggle(&participant_id, wants_bot_fill, Utc::now())
        .await
        .map_err(|error| ApiError::service_unavailable(format!("queue unavailable: {error:#}")))?;
    info!(
        participant_id = %participant_id,
        wants_bot_fill,
        outcome = ?outcome,
        "queue toggled"
    );

    Ok(Json(JoinResponse {
        participant_id,
        outcome,
    }))
}

async fn queue_status_handler(
    State(state): State<AppState>,
) -> Result<Json<QueueStatus>, ApiError> {
    let waiting = state
        .queue
        .entries()
        .await
        .map_err(|error| ApiError::service_unavailable(format!("queue unavailable: {error:#}")))?
        .len();
    Ok(Json(QueueStatus::for_waiting(waiting)))
}

async fn list_tables_handler(State(state): State<AppState>) -> Json<Vec<TableSummary>> {
    Json(state.registry.summaries().await)
}

async fn get_view_handler(
    State(state): State<AppState>,
    Path((table_id, participant_id)): Path<(String, String)>,
) -> Result<Json<TableView>, ApiError> {
    session::render(&state, &table_id, &participant_id)
        .await
        .map(Json)
        .map_err(|reason| match reason {
            RejectReason::TableNotFound => {
                ApiError::not_found(format!("table {table_id} not found"))
            }
            _ => ApiError::not_found(format!(
                "participant {participant_id} is not seated at table {table_id}"
            )),
        })
}

async fn submit_action_handler(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    Json(request): Json<SubmitActionRequest>,
) -> Json<ActionResponse> {
    Json(
        session::submit_action(&state, &table_id, &request.participant_id, request.action).await,
    )
}

async fn get_stats_handler(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state
        .stats
        .get(&participant_id)
        .await
        .map_err(|error| ApiError::service_unavailable(format!("stats unavailable: {error:#}")))?;
    Ok(Json(stats.into()))
}

async fn leaderboard_handler(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Vec<StatsResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LEADERBOARD_LIMIT).max(1);
    let board = state
        .stats
        .leaderboard(limit)
        .await
        .map_err(|error| ApiError::service_unavailable(format!("stats unavailable: {error:#}")))?;
    Ok(Json(board.into_iter().map(StatsResponse::from).collect()))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }

    fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
impl AppState {
    fn for_tests(settings: Settings) -> (Self, Arc<notify::testing::RecordingNotifier>) {
        let recorder = Arc::new(notify::testing::RecordingNotifier::default());
        let state = Self {
            settings: Arc::new(settings),
            queue: Arc::new(InMemoryQueueStore::default()),
            stats: Arc::new(InMemoryStatsStore::default()),
            courier: Courier::new(recorder.clone()),
            registry: Arc::new(SessionRegistry::default()),
        };
        (state, recorder)
    }
}
