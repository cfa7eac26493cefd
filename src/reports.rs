// =============================================================================
// Scheduled digests — daily risk report and performance digest
// =============================================================================
//
// Both jobs run at a configurable UTC hour: each loop computes the next UTC
// boundary, sleeps to it, runs once, and keeps its schedule regardless of
// individual failures. Results fan out through the alert bus; the
// performance digest additionally writes HTML and text artifacts under
// `reports/digests/` and publishes their paths.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{error, info};

use crate::alerts::{Alert, AlertBus, Channel, Severity};
use crate::broker::BrokerRouter;
use crate::features::FeatureStore;
use crate::market_data::availability::AvailabilityClassifier;
use crate::market_data::metrics::ProviderMetricsRegistry;
use crate::risk::RiskEngine;
use crate::types::now_ms;

/// Artifact directory for digest output.
const DIGEST_DIR: &str = "reports/digests";

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Time until the next occurrence of `hour:00` UTC.
pub fn delay_until_utc_hour(now: DateTime<Utc>, hour: u32) -> std::time::Duration {
    let hour = hour % 24;
    let today_boundary = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("hour is bounded")
        .and_utc();
    let next = if today_boundary > now {
        today_boundary
    } else {
        today_boundary + ChronoDuration::days(1)
    };
    (next - now).to_std().unwrap_or(std::time::Duration::ZERO)
}

// ---------------------------------------------------------------------------
// Daily risk report
// ---------------------------------------------------------------------------

pub struct ReportContext {
    pub risk: Arc<RiskEngine>,
    pub router: Arc<BrokerRouter>,
    pub availability: Arc<AvailabilityClassifier>,
    pub provider_metrics: Arc<ProviderMetricsRegistry>,
    pub features: Arc<FeatureStore>,
    pub bus: Arc<AlertBus>,
}

/// Build and publish the daily risk report.
pub fn run_daily_risk_report(ctx: &ReportContext) -> Result<()> {
    let risk = ctx.risk.snapshot();
    let availability = ctx.availability.summary();
    let open_trades = ctx.router.open_trades();
    let broker_metrics = ctx.router.metrics_snapshot(100);
    let providers = ctx.provider_metrics.snapshot_all(now_ms());

    let provider_alerts: Vec<String> = providers
        .iter()
        .filter(|m| m.backoff_seconds > 0 || m.quality_score < 70.0)
        .map(|m| {
            format!(
                "{}: quality {:.1}, backoff {}s, breaker {}",
                m.provider, m.quality_score, m.backoff_seconds, m.circuit_breaker_state
            )
        })
        .collect();

    let mut top_trades: Vec<String> = open_trades
        .iter()
        .map(|t| {
            format!(
                "{} {} {:.2} lots @ {:.5} ({})",
                t.pair,
                t.direction,
                t.position_size,
                t.entry_price,
                t.broker.as_deref().unwrap_or("-")
            )
        })
        .collect();
    top_trades.truncate(10);

    let exposures: Vec<String> = risk
        .currency_exposure
        .iter()
        .map(|(currency, lots)| format!("{currency}: {lots:.2} lots"))
        .collect();

    let body = format!(
        "Daily risk report\n\
         =================\n\
         balance: {:.2}\n\
         daily P&L: {:.2}\n\
         daily risk used: {:.2}%\n\
         VaR(95): {:.2}%\n\
         kill switch: {}\n\
         open positions: {}\n\
         exposures: {}\n\
         availability: {} (uptime {:.2}%, SLO {:?})\n\
         provider alerts: {}\n\
         broker calls (last 100): {}\n\
         top trades:\n  {}\n",
        risk.account_balance,
        risk.daily_realized_pnl,
        risk.daily_risk_used_pct,
        risk.var_pct,
        if risk.kill_switch_engaged {
            risk.kill_switch_reason.as_deref().unwrap_or("engaged")
        } else {
            "off"
        },
        risk.open_positions,
        if exposures.is_empty() {
            "none".to_string()
        } else {
            exposures.join(", ")
        },
        availability.state,
        availability.uptime_ratio_pct,
        availability.slo_badge,
        if provider_alerts.is_empty() {
            "none".to_string()
        } else {
            provider_alerts.join("; ")
        },
        broker_metrics.len(),
        if top_trades.is_empty() {
            "none".to_string()
        } else {
            top_trades.join("\n  ")
        },
    );

    ctx.bus.publish(
        Alert::new("risk.daily_report", Severity::Info, "daily risk report")
            .with_body("Daily Risk Report", body)
            .with_channels(vec![Channel::Log, Channel::Email])
            .with_context(serde_json::json!({
                "risk": risk,
                "availability": availability,
            })),
    );

    info!("daily risk report published");
    Ok(())
}

// ---------------------------------------------------------------------------
// Performance digest
// ---------------------------------------------------------------------------

/// Build the digest artifacts and publish their paths.
pub fn run_performance_digest(ctx: &ReportContext) -> Result<(PathBuf, PathBuf)> {
    let date = Utc::now().format("%Y-%m-%d").to_string();
    let risk = ctx.risk.snapshot();
    let availability = ctx.availability.summary();
    let providers = ctx.provider_metrics.snapshot_all(now_ms());
    let feature_summary = ctx.features.snapshot_summary();

    let provider_rows: String = providers
        .iter()
        .map(|m| {
            format!(
                "<tr><td>{}</td><td>{:.1}</td><td>{:.1}%</td><td>{:.0}ms</td><td>{}</td></tr>",
                m.provider,
                m.quality_score,
                m.success_rate_pct,
                m.avg_latency_ms,
                m.circuit_breaker_state
            )
        })
        .collect();

    let html = format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>Performance Digest {date}</title></head>\
         <body><h1>Performance Digest — {date}</h1>\
         <h2>Account</h2>\
         <p>Balance {:.2} | Daily P&amp;L {:.2} | VaR(95) {:.2}%</p>\
         <h2>Availability</h2>\
         <p>State {} | uptime {:.2}% | avg quality {:.1}</p>\
         <h2>Providers</h2>\
         <table border=\"1\"><tr><th>Provider</th><th>Quality</th><th>Success</th><th>Latency</th><th>Breaker</th></tr>{}</table>\
         <h2>Feature store</h2>\
         <p>{} keys, {} vectors</p>\
         </body></html>",
        risk.account_balance,
        risk.daily_realized_pnl,
        risk.var_pct,
        availability.state,
        availability.uptime_ratio_pct,
        availability.average_aggregate_quality,
        provider_rows,
        feature_summary.keys,
        feature_summary.total_vectors,
    );

    let text = format!(
        "Performance Digest {date}\n\
         balance={:.2} dailyPnl={:.2} var95={:.2}%\n\
         availability={} uptime={:.2}% avgQuality={:.1}\n\
         providers={}\n\
         featureKeys={} featureVectors={}\n",
        risk.account_balance,
        risk.daily_realized_pnl,
        risk.var_pct,
        availability.state,
        availability.uptime_ratio_pct,
        availability.average_aggregate_quality,
        providers.len(),
        feature_summary.keys,
        feature_summary.total_vectors,
    );

    let dir = PathBuf::from(DIGEST_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create digest directory {}", dir.display()))?;

    let html_path = dir.join(format!("{date}.html"));
    let text_path = dir.join(format!("{date}.txt"));
    std::fs::write(&html_path, html)
        .with_context(|| format!("failed to write {}", html_path.display()))?;
    std::fs::write(&text_path, text)
        .with_context(|| format!("failed to write {}", text_path.display()))?;

    ctx.bus.publish(
        Alert::new(
            "performance.digest",
            Severity::Info,
            format!("performance digest for {date} ready"),
        )
        .with_channels(vec![Channel::Log, Channel::Webhook])
        .with_context(serde_json::json!({
            "htmlPath": html_path.to_string_lossy(),
            "textPath": text_path.to_string_lossy(),
        })),
    );

    info!(html = %html_path.display(), text = %text_path.display(), "performance digest written");
    Ok((html_path, text_path))
}

// ---------------------------------------------------------------------------
// Schedulers
// ---------------------------------------------------------------------------

/// Run `job` daily at `hour` UTC; failures are logged and the schedule
/// continues unperturbed.
pub fn spawn_daily_job(
    name: &'static str,
    hour: u32,
    ctx: Arc<ReportContext>,
    job: fn(&ReportContext) -> Result<()>,
) {
    tokio::spawn(async move {
        loop {
            let delay = delay_until_utc_hour(Utc::now(), hour);
            info!(job = name, delay_secs = delay.as_secs(), "scheduled next run");
            tokio::time::sleep(delay).await;

            if let Err(e) = job(&ctx) {
                error!(job = name, error = %e, "scheduled job failed — schedule continues");
            }
        }
    });
}

/// Adapter so the digest fits the shared scheduler signature.
pub fn run_performance_digest_job(ctx: &ReportContext) -> Result<()> {
    run_performance_digest(ctx).map(|_| ())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBroadcaster;
    use crate::risk::RiskConfig;
    use chrono::TimeZone;

    fn context() -> Arc<ReportContext> {
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let risk = Arc::new(RiskEngine::new(RiskConfig::default()));
        let bus = AlertBus::new();
        let router = Arc::new(BrokerRouter::new(
            vec![],
            risk.clone(),
            EventBroadcaster::new(),
            bus.clone(),
        ));
        let availability = Arc::new(AvailabilityClassifier::new(
            metrics.clone(),
            vec![("finnhub".to_string(), true)],
            bus.clone(),
            None,
        ));
        Arc::new(ReportContext {
            risk,
            router,
            availability,
            provider_metrics: metrics,
            features: Arc::new(FeatureStore::new(None)),
            bus,
        })
    }

    #[test]
    fn next_boundary_same_day() {
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 10, 30, 0).unwrap();
        let delay = delay_until_utc_hour(now, 21);
        assert_eq!(delay.as_secs(), (21 - 10) * 3600 - 30 * 60);
    }

    #[test]
    fn next_boundary_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 22, 0, 0).unwrap();
        let delay = delay_until_utc_hour(now, 21);
        assert_eq!(delay.as_secs(), 23 * 3600);
    }

    #[test]
    fn boundary_exactly_now_rolls_forward() {
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 21, 0, 0).unwrap();
        let delay = delay_until_utc_hour(now, 21);
        assert_eq!(delay.as_secs(), 24 * 3600);
    }

    #[tokio::test]
    async fn risk_report_publishes_to_bus() {
        let ctx = context();
        let mut rx = ctx.bus.subscribe("test", "risk.");
        run_daily_risk_report(&ctx).unwrap();

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.topic, "risk.daily_report");
        assert!(alert.body.as_ref().unwrap().contains("Daily risk report"));
        assert!(alert.channels.contains(&Channel::Email));
    }

    #[tokio::test]
    async fn digest_writes_artifacts() {
        let ctx = context();
        let tmp = tempfile::tempdir().unwrap();
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(tmp.path()).unwrap();

        let mut rx = ctx.bus.subscribe("test", "performance.");
        let (html_path, text_path) = run_performance_digest(&ctx).unwrap();
        assert!(html_path.exists());
        assert!(text_path.exists());
        let html = std::fs::read_to_string(&html_path).unwrap();
        assert!(html.contains("Performance Digest"));

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.topic, "performance.digest");
        let context_json = alert.context.unwrap();
        assert!(context_json["htmlPath"].as_str().unwrap().ends_with(".html"));

        std::env::set_current_dir(original).unwrap();
    }
}
