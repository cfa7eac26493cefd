// =============================================================================
// REST API endpoints — Axum 0.7
// =============================================================================
//
// Every endpoint returns a JSON body with a `success` boolean and either
// data or `error`/`details`. Validation failures are 400s with structured
// details; the health endpoint flips to 503 when provider availability is
// critical. CORS is permissive for dashboard development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::config::AutoTraderConfig;
use crate::market_data::availability::AvailabilityState;
use crate::signal::GenerateOpts;
use crate::types::{now_ms, Pair, Timeframe};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/api/healthz", get(healthz))
        .route("/api/health/providers", get(health_providers))
        .route("/api/health/runtime", get(health_runtime))
        // ── Metrics ─────────────────────────────────────────────────
        .route("/metrics", get(metrics_text))
        .route("/api/metrics", get(metrics_text))
        // ── Signals ─────────────────────────────────────────────────
        .route("/api/signal/generate", post(signal_generate))
        // ── Auto-trader ─────────────────────────────────────────────
        .route("/api/auto-trader/enable", post(auto_trader_enable))
        .route("/api/auto-trader/disable", post(auto_trader_disable))
        .route("/api/auto-trader/close-all", post(auto_trader_close_all))
        .route("/api/auto-trader/config", put(auto_trader_config))
        // ── Risk controls ───────────────────────────────────────────
        .route("/api/risk", get(risk_snapshot))
        .route("/api/risk/kill-switch/engage", post(kill_switch_engage))
        .route("/api/risk/kill-switch/release", post(kill_switch_release))
        // ── Scorer thresholds (installed from offline optimisation) ─
        .route(
            "/api/scorer/thresholds/:pair",
            get(get_thresholds).put(set_thresholds),
        )
        // ── Feature store reads ─────────────────────────────────────
        .route("/api/features/stats", get(feature_stats))
        .route("/api/features/:pair", get(feature_snapshot))
        // ── News ────────────────────────────────────────────────────
        .route("/api/news/recent", get(recent_news))
        // ── Broker bridge reads ─────────────────────────────────────
        .route(
            "/api/broker/bridge/:broker/market/quotes",
            get(bridge_quotes),
        )
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws/trading", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let availability = state.availability.current_state();
    let persistence_state = match &state.persistence {
        Some(p) if !p.is_disabled() => "up",
        Some(_) => "disabled",
        None => "absent",
    };

    let pair_breakers: Vec<serde_json::Value> = state
        .quality
        .active_breakers()
        .into_iter()
        .map(|(pair, record)| serde_json::json!({"pair": pair, "breaker": record}))
        .collect();

    let modules = serde_json::json!([
        {"id": "market_data", "state": availability.to_string()},
        {"id": "persistence", "state": persistence_state},
        {"id": "broker_router", "state": if state.risk.kill_switch_engaged() { "kill_switch" } else { "ready" }},
        {"id": "auto_trader", "state": if state.auto_trader.read().enabled { "running" } else { "stopped" }},
        {"id": "scorer", "state": if state.scorer.model_loaded() { "ensemble" } else { "rule_only" }},
        {"id": "pair_breakers", "state": if pair_breakers.is_empty() { "clear" } else { "active" }, "breakers": pair_breakers},
    ]);

    let ok = availability != AvailabilityState::Critical;
    let body = serde_json::json!({
        "ok": ok,
        "status": availability.to_string(),
        "requireRealTime": state.config.require_realtime_data,
        "uptimeSecs": state.uptime_secs(),
        "modules": modules,
    });

    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[derive(Deserialize)]
struct ProvidersQuery {
    timeframes: Option<String>,
}

async fn health_providers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProvidersQuery>,
) -> impl IntoResponse {
    let timeframes: Vec<String> = query
        .timeframes
        .as_deref()
        .map(|csv| {
            csv.split(',')
                .filter_map(|s| Timeframe::parse(s).ok())
                .map(|tf| tf.to_string())
                .collect()
        })
        .unwrap_or_else(|| {
            state
                .quality
                .timeframes()
                .iter()
                .map(|tf| tf.to_string())
                .collect()
        });

    let providers = state.provider_metrics.snapshot_all(now_ms());
    let history = state.availability.history(50);
    let summary = state.availability.summary();

    // Persisted views are best-effort supplements to the in-memory rings.
    let persisted_history = state
        .persistence
        .as_ref()
        .map(|p| p.get_provider_availability_history(50))
        .unwrap_or_default();
    let persisted_metrics = state
        .persistence
        .as_ref()
        .map(|p| p.get_latest_provider_metrics())
        .unwrap_or_default();

    Json(serde_json::json!({
        "success": true,
        "providers": providers,
        "timeframes": timeframes,
        "classification": summary,
        "history": history,
        "historyLimit": 1000,
        "persistedHistory": persisted_history,
        "persistedMetrics": persisted_metrics,
    }))
}

async fn health_runtime(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "success": true,
        "runtime": {
            "environment": state.config.environment.to_string(),
            "server": {"port": state.config.port},
            "tradingScope": {"mode": state.config.trading_scope.to_string()},
            "eaOnlyMode": state.config.ea_only_mode,
            "liveBacktest": state.backtest.config(),
            "uptimeSecs": state.uptime_secs(),
        }
    }))
}

// =============================================================================
// Metrics (Prometheus text exposition)
// =============================================================================

async fn metrics_text(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut out = String::new();

    out.push_str("# TYPE meridian_provider_quality gauge\n");
    for m in state.provider_metrics.snapshot_all(now_ms()) {
        out.push_str(&format!(
            "meridian_provider_quality{{provider=\"{}\"}} {:.3}\n",
            m.provider, m.quality_score
        ));
        out.push_str(&format!(
            "meridian_provider_success_total{{provider=\"{}\"}} {}\n",
            m.provider, m.success
        ));
        out.push_str(&format!(
            "meridian_provider_failed_total{{provider=\"{}\"}} {}\n",
            m.provider, m.failed
        ));
        out.push_str(&format!(
            "meridian_provider_rate_limited_total{{provider=\"{}\"}} {}\n",
            m.provider, m.rate_limited
        ));
        out.push_str(&format!(
            "meridian_provider_latency_ms{{provider=\"{}\"}} {:.1}\n",
            m.provider, m.avg_latency_ms
        ));
    }

    let summary = state.availability.summary();
    out.push_str("# TYPE meridian_availability_uptime_ratio gauge\n");
    out.push_str(&format!(
        "meridian_availability_uptime_ratio {:.4}\n",
        summary.uptime_ratio_pct / 100.0
    ));

    let (published, dropped) = state.bus.counters();
    out.push_str(&format!("meridian_alerts_published_total {published}\n"));
    out.push_str(&format!("meridian_alerts_dropped_total {dropped}\n"));

    let risk = state.risk.snapshot();
    out.push_str(&format!(
        "meridian_risk_daily_used_pct {:.3}\n",
        risk.daily_risk_used_pct
    ));
    out.push_str(&format!(
        "meridian_kill_switch_engaged {}\n",
        if risk.kill_switch_engaged { 1 } else { 0 }
    ));
    out.push_str(&format!(
        "meridian_open_trades {}\n",
        state.router.open_trades().len()
    ));
    out.push_str(&format!(
        "meridian_ws_subscribers {}\n",
        state.events.subscriber_count()
    ));

    ([("content-type", "text/plain; version=0.0.4")], out)
}

// =============================================================================
// Signal generation
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    pair: Option<String>,
    broker: Option<String>,
    #[serde(default)]
    ea_only: bool,
    #[allow(dead_code)]
    broadcast: Option<bool>,
    #[allow(dead_code)]
    analysis_mode: Option<String>,
}

async fn signal_generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> impl IntoResponse {
    let raw_pair = request.pair.unwrap_or_default();
    let pair = match Pair::parse(&raw_pair) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "success": false,
                    "error": "Invalid pair",
                    "details": [e.to_string()],
                })),
            );
        }
    };

    let auto_execute = request.broker.is_some() && !request.ea_only;
    let opts = GenerateOpts {
        auto_execute,
        preferred_broker: request.broker,
    };

    info!(pair = %pair, auto_execute, "signal generation requested");
    let result = state.coordinator.generate_signal(&pair, &opts).await;

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "signal": result.signal,
            "execution": result.execution,
            "timestamp": now_ms(),
        })),
    )
}

// =============================================================================
// Auto-trader controls
// =============================================================================

async fn auto_trader_enable(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.auto_trader.write().enabled = true;
    info!("auto-trader enabled via API");
    Json(serde_json::json!({"success": true, "enabled": true}))
}

async fn auto_trader_disable(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.auto_trader.write().enabled = false;
    info!("auto-trader disabled via API");
    Json(serde_json::json!({"success": true, "enabled": false}))
}

async fn auto_trader_close_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let outcomes = state.router.close_all("api_close_all").await;
    let closed = outcomes.iter().filter(|o| o.success).count();
    let failed = outcomes.len() - closed;
    if failed > 0 {
        warn!(closed, failed, "close-all finished with failures");
    }
    Json(serde_json::json!({
        "success": failed == 0,
        "closed": closed,
        "failed": failed,
        "outcomes": outcomes,
    }))
}

async fn auto_trader_config(
    State(state): State<Arc<AppState>>,
    Json(new_config): Json<AutoTraderConfig>,
) -> impl IntoResponse {
    if new_config.interval_secs == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": "Invalid config",
                "details": ["intervalSecs must be positive"],
            })),
        );
    }
    if new_config.parsed_pairs().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": "Invalid config",
                "details": ["pairs must contain at least one valid symbol"],
            })),
        );
    }

    *state.auto_trader.write() = new_config.clone();
    info!(pairs = ?new_config.pairs, interval = new_config.interval_secs, "auto-trader config updated");
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "config": new_config})),
    )
}

// =============================================================================
// Risk controls
// =============================================================================

async fn risk_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({"success": true, "risk": state.risk.snapshot()}))
}

#[derive(Deserialize)]
struct KillSwitchRequest {
    reason: Option<String>,
}

async fn kill_switch_engage(
    State(state): State<Arc<AppState>>,
    Json(request): Json<KillSwitchRequest>,
) -> impl IntoResponse {
    let reason = request.reason.unwrap_or_else(|| "operator".to_string());
    state.risk.engage_kill_switch(&reason);
    Json(serde_json::json!({"success": true, "engaged": true, "reason": reason}))
}

async fn kill_switch_release(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.risk.release_kill_switch();
    Json(serde_json::json!({"success": true, "engaged": false}))
}

// =============================================================================
// Scorer thresholds
// =============================================================================

async fn get_thresholds(
    State(state): State<Arc<AppState>>,
    Path(raw_pair): Path<String>,
) -> impl IntoResponse {
    let pair = match Pair::parse(&raw_pair) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "success": false,
                    "error": "Invalid pair",
                    "details": [e.to_string()],
                })),
            );
        }
    };
    let thresholds = state.scorer.thresholds_for(&pair);
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "pair": pair, "thresholds": thresholds})),
    )
}

async fn set_thresholds(
    State(state): State<Arc<AppState>>,
    Path(raw_pair): Path<String>,
    Json(thresholds): Json<crate::analysis::PairThresholds>,
) -> impl IntoResponse {
    let pair = match Pair::parse(&raw_pair) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "success": false,
                    "error": "Invalid pair",
                    "details": [e.to_string()],
                })),
            );
        }
    };
    state.scorer.set_thresholds(&pair, thresholds);
    let installed = state.scorer.thresholds_for(&pair);
    info!(pair = %pair, buy = installed.buy, sell = installed.sell, "scorer thresholds installed");
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "pair": pair, "thresholds": installed})),
    )
}

// =============================================================================
// Feature store & news reads
// =============================================================================

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn feature_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50);
    Json(serde_json::json!({
        "success": true,
        "summary": state.features.snapshot_summary(),
        "stats": state.features.get_stats(limit),
    }))
}

async fn feature_snapshot(
    State(state): State<Arc<AppState>>,
    Path(raw_pair): Path<String>,
) -> impl IntoResponse {
    let pair = match Pair::parse(&raw_pair) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "success": false,
                    "error": "Invalid pair",
                    "details": [e.to_string()],
                })),
            );
        }
    };
    let snapshot: std::collections::HashMap<String, _> = state
        .features
        .get_snapshot(&pair)
        .into_iter()
        .map(|(tf, vector)| (tf.to_string(), vector))
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "pair": pair, "snapshot": snapshot})),
    )
}

async fn recent_news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(25);
    let news = state
        .persistence
        .as_ref()
        .map(|p| p.get_recent_news(limit))
        .unwrap_or_default();
    Json(serde_json::json!({"success": true, "news": news}))
}

// =============================================================================
// Broker bridge reads
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotesQuery {
    max_age_ms: Option<i64>,
}

async fn bridge_quotes(
    State(state): State<Arc<AppState>>,
    Path(broker): Path<String>,
    Query(query): Query<QuotesQuery>,
) -> impl IntoResponse {
    let max_age_ms = query.max_age_ms.unwrap_or(state.config.quote_max_age_ms);
    let quotes = state.fetcher.cached_quotes(max_age_ms);
    Json(serde_json::json!({
        "success": true,
        "broker": broker,
        "maxAgeMs": max_age_ms,
        "quotes": quotes,
    }))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_deserialises_aliases() {
        let body = serde_json::json!({
            "pair": "EURUSD",
            "broker": "mt5",
            "broadcast": true,
            "eaOnly": false,
            "analysisMode": "full"
        });
        let request: GenerateRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.pair.as_deref(), Some("EURUSD"));
        assert_eq!(request.broker.as_deref(), Some("mt5"));
        assert!(!request.ea_only);
    }

    #[test]
    fn quotes_query_defaults() {
        let q: QuotesQuery = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(q.max_age_ms.is_none());
        let q: QuotesQuery =
            serde_json::from_value(serde_json::json!({"maxAgeMs": 5000})).unwrap();
        assert_eq!(q.max_age_ms, Some(5000));
    }
}
