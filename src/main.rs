// =============================================================================
// Meridian FX Engine — Main Entry Point
// =============================================================================
//
// Configuration comes from the environment (dotenv loaded first). The
// engine starts with order routing disabled unless TRADING_SCOPE=execution
// is set explicitly; dev defaults keep it self-contained on synthetic data.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod analysis;
mod api;
mod app_state;
mod broker;
mod config;
mod events;
mod features;
mod indicators;
mod market_data;
mod persistence;
mod providers;
mod reports;
mod risk;
mod signal;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::events::EventType;
use crate::market_data::fetcher::FetchOpts;
use crate::signal::GenerateOpts;
use crate::types::{Timeframe, TradingScope};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian FX Engine starting up");

    let config = AppConfig::from_env();
    let port = config.port;

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = AppState::build(config);

    // ── 3. Availability classifier loop (5s tick) ────────────────────────
    {
        let tick_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            let mut last_state = tick_state.availability.current_state();
            loop {
                interval.tick().await;
                let blocked = tick_state.quality.blocked_timeframes();
                let sample = tick_state
                    .availability
                    .tick(blocked, Timeframe::all().len());
                if sample.state != last_state {
                    last_state = sample.state;
                    tick_state.events.publish(
                        EventType::ProviderAvailability,
                        serde_json::to_value(&sample).unwrap_or(serde_json::Value::Null),
                    );
                }
            }
        });
    }

    // ── 4. Auto-trader loop ──────────────────────────────────────────────
    {
        let trader_state = state.clone();
        tokio::spawn(async move {
            // Give the market-data layer a moment before the first cycle.
            tokio::time::sleep(std::time::Duration::from_secs(15)).await;
            info!("auto-trader loop starting");

            loop {
                let (enabled, pairs, interval_secs, preferred_broker) = {
                    let cfg = trader_state.auto_trader.read();
                    (
                        cfg.enabled,
                        cfg.parsed_pairs(),
                        cfg.interval_secs.max(5),
                        cfg.preferred_broker.clone(),
                    )
                };

                if enabled {
                    let auto_execute =
                        trader_state.config.trading_scope == TradingScope::Execution
                            && !trader_state.config.ea_only_mode;
                    for pair in &pairs {
                        let opts = GenerateOpts {
                            auto_execute,
                            preferred_broker: preferred_broker.clone(),
                        };
                        let result = trader_state.coordinator.generate_signal(pair, &opts).await;
                        if let Some(execution) = &result.execution {
                            info!(
                                pair = %pair,
                                success = execution.success,
                                error = execution.error.as_deref().unwrap_or(""),
                                "auto-trader execution attempt"
                            );
                        }
                    }
                }

                tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
            }
        });
    }

    // ── 5. Broker reconciliation loop (60s) ──────────────────────────────
    {
        let recon_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let drifts = recon_state.router.reconcile().await;
                if !drifts.is_empty() {
                    warn!(count = drifts.len(), "reconciliation found drift");
                }
                // Refresh the risk engine's view of the account balance.
                if let Ok(info) = recon_state.router.get_account_info(None).await {
                    recon_state.risk.set_balance(info.balance);
                }
            }
        });
    }

    // ── 6. Prefetch scheduler (optional) ─────────────────────────────────
    if state.config.enable_prefetch_scheduler {
        let prefetch_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                interval.tick().await;
                let pairs = prefetch_state.auto_trader.read().parsed_pairs();
                let opts = FetchOpts::with_purpose("prefetch");
                for pair in &pairs {
                    for timeframe in [Timeframe::M15, Timeframe::H1, Timeframe::H4] {
                        if let Err(e) = prefetch_state
                            .fetcher
                            .fetch_bars(pair, timeframe, 200, &opts)
                            .await
                        {
                            warn!(pair = %pair, timeframe = %timeframe, error = %e, "prefetch failed");
                        }
                    }
                    let _ = prefetch_state.fetcher.fetch_quote(pair, &opts).await;
                }
                info!(pairs = pairs.len(), "prefetch cycle complete");
            }
        });
        info!("prefetch scheduler enabled");
    }

    // ── 7. Scheduled reports ─────────────────────────────────────────────
    {
        let report_ctx = Arc::new(reports::ReportContext {
            risk: state.risk.clone(),
            router: state.router.clone(),
            availability: state.availability.clone(),
            provider_metrics: state.provider_metrics.clone(),
            features: state.features.clone(),
            bus: state.bus.clone(),
        });

        if state.config.enable_risk_reports {
            reports::spawn_daily_job(
                "daily-risk-report",
                state.config.risk_report_hour_utc,
                report_ctx.clone(),
                reports::run_daily_risk_report,
            );
        }
        if state.config.enable_performance_digests {
            reports::spawn_daily_job(
                "performance-digest",
                state.config.digest_hour_utc,
                report_ctx,
                reports::run_performance_digest_job,
            );
        }
    }

    // ── 8. HTTP server ───────────────────────────────────────────────────
    {
        let api_state = state.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let addr = format!("0.0.0.0:{port}");
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!(addr = %addr, "API server listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "API server failed");
                    }
                }
                Err(e) => error!(addr = %addr, error = %e, "failed to bind API server"),
            }
        });
    }

    info!("all subsystems running — Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    if state.risk.kill_switch_engaged() {
        warn!(
            reason = state.risk.kill_switch_reason().as_deref().unwrap_or(""),
            "shutting down with kill switch engaged"
        );
    }

    info!("Meridian FX Engine shut down complete");
    Ok(())
}
