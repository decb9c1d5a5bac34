//! Cost alerting.
//!
//! Every charged request is evaluated against five kinds of rules: an
//! absolute high-cost threshold, the per-request limit, daily utilization
//! levels, spikes over the trailing average, and per-model anomalies.
//!
//! Each alert type has its own cooldown per `type:tenant:workspace` key.
//! Expired cooldown entries are swept periodically so the map stays bounded
//! by the number of keys active within one cooldown interval.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::duration_format;

/// Samples needed before spike detection is armed.
pub const MIN_SPIKE_SAMPLES: usize = 3;

/// Samples per model needed before anomaly detection is armed.
pub const MIN_MODEL_SAMPLES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    /// Absolute USD cost above which a single request is flagged.
    pub high_cost_request: f64,
    pub warning_pct: f64,
    pub critical_pct: f64,
    pub emergency_pct: f64,
    pub spike_multiplier: f64,
    pub anomaly_multiplier: f64,
    /// Trailing samples used for spike detection.
    pub spike_window: usize,
    /// Trailing samples kept per model.
    pub model_window: usize,
    #[serde(with = "duration_format")]
    pub cooldown: Duration,
    #[serde(with = "duration_format")]
    pub sweep_interval: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_cost_request: 0.5,
            warning_pct: 75.0,
            critical_pct: 90.0,
            emergency_pct: 100.0,
            spike_multiplier: 3.0,
            anomaly_multiplier: 2.5,
            spike_window: 20,
            model_window: 50,
            cooldown: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighCostRequest,
    PerRequestLimit,
    DailyWarning,
    DailyCritical,
    DailyEmergency,
    CostSpike,
    ModelAnomaly,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighCostRequest => "high_cost_request",
            AlertType::PerRequestLimit => "per_request_limit",
            AlertType::DailyWarning => "daily_warning",
            AlertType::DailyCritical => "daily_critical",
            AlertType::DailyEmergency => "daily_emergency",
            AlertType::CostSpike => "cost_spike",
            AlertType::ModelAnomaly => "model_anomaly",
        }
    }

    pub fn severity(&self) -> AlertSeverity {
        match self {
            AlertType::DailyEmergency | AlertType::PerRequestLimit => AlertSeverity::Critical,
            AlertType::DailyCritical | AlertType::CostSpike => AlertSeverity::High,
            _ => AlertSeverity::Warning,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    High,
    Critical,
}

/// A charged request, as seen by the alert manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeEvent {
    pub tenant: Option<String>,
    pub workspace: Option<String>,
    pub model: String,
    pub cost: f64,
    /// Spend for the day including this request.
    pub spent_today: f64,
    pub daily_budget: f64,
    pub max_per_request: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAlert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub tenant: Option<String>,
    pub workspace: Option<String>,
    pub model: String,
    pub cost: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// Destination for emitted alerts.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &CostAlert);
}

/// Logs alerts through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: &CostAlert) {
        match alert.severity {
            AlertSeverity::Critical => error!(
                alert = %alert.alert_type,
                tenant = alert.tenant.as_deref().unwrap_or("-"),
                model = %alert.model,
                cost = alert.cost,
                threshold = alert.threshold,
                "{}", alert.message
            ),
            _ => warn!(
                alert = %alert.alert_type,
                tenant = alert.tenant.as_deref().unwrap_or("-"),
                model = %alert.model,
                cost = alert.cost,
                threshold = alert.threshold,
                "{}", alert.message
            ),
        }
    }
}

#[derive(Debug)]
struct AlertState {
    recent: VecDeque<f64>,
    per_model: HashMap<String, VecDeque<f64>>,
    cooldowns: BTreeMap<String, DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
}

pub struct CostAlertManager {
    config: AlertConfig,
    state: Mutex<AlertState>,
    sink: Arc<dyn AlertSink>,
}

impl fmt::Debug for CostAlertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CostAlertManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CostAlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingAlertSink))
    }

    pub fn with_sink(config: AlertConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            state: Mutex::new(AlertState {
                recent: VecDeque::new(),
                per_model: HashMap::new(),
                cooldowns: BTreeMap::new(),
                last_sweep: None,
            }),
            sink,
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn evaluate(&self, event: &ChargeEvent) -> Vec<CostAlert> {
        self.evaluate_at(event, Utc::now())
    }

    /// Evaluate `event` as of `now`; emitted alerts also go to the sink.
    pub fn evaluate_at(&self, event: &ChargeEvent, now: DateTime<Utc>) -> Vec<CostAlert> {
        if !self.config.enabled {
            return Vec::new();
        }
        let cfg = &self.config;
        let mut candidates: Vec<(AlertType, f64, String)> = Vec::new();

        if event.cost > cfg.high_cost_request {
            candidates.push((
                AlertType::HighCostRequest,
                cfg.high_cost_request,
                format!("Request cost ${:.4} above ${:.4}", event.cost, cfg.high_cost_request),
            ));
        }
        if event.cost > event.max_per_request {
            candidates.push((
                AlertType::PerRequestLimit,
                event.max_per_request,
                format!("Request cost ${:.4} exceeds per-request limit ${:.4}", event.cost, event.max_per_request),
            ));
        }
        if event.daily_budget > 0.0 {
            let pct = event.spent_today / event.daily_budget * 100.0;
            let level = [
                (cfg.emergency_pct, AlertType::DailyEmergency),
                (cfg.critical_pct, AlertType::DailyCritical),
                (cfg.warning_pct, AlertType::DailyWarning),
            ]
            .into_iter()
            .find(|(threshold, _)| pct >= *threshold);
            if let Some((threshold, alert_type)) = level {
                candidates.push((
                    alert_type,
                    threshold,
                    format!("Daily budget {:.1}% used (${:.4} of ${:.2})", pct, event.spent_today, event.daily_budget),
                ));
            }
        }

        let mut state = self.state.lock();

        let window = cfg.spike_window.max(1);
        if state.recent.len() >= MIN_SPIKE_SAMPLES {
            let avg = mean(&state.recent);
            if avg > 0.0 && event.cost > cfg.spike_multiplier * avg {
                candidates.push((
                    AlertType::CostSpike,
                    cfg.spike_multiplier * avg,
                    format!("Cost spike: ${:.4} vs trailing average ${:.4}", event.cost, avg),
                ));
            }
        }
        push_bounded(&mut state.recent, event.cost, window);

        let model_window = cfg.model_window.max(MIN_MODEL_SAMPLES);
        let model_samples = state.per_model.entry(event.model.clone()).or_default();
        if model_samples.len() >= MIN_MODEL_SAMPLES {
            let avg = mean(model_samples);
            if avg > 0.0 && event.cost > cfg.anomaly_multiplier * avg {
                candidates.push((
                    AlertType::ModelAnomaly,
                    cfg.anomaly_multiplier * avg,
                    format!("Model {} cost ${:.4} vs its average ${:.4}", event.model, event.cost, avg),
                ));
            }
        }
        push_bounded(model_samples, event.cost, model_window);

        self.sweep(&mut state, now);

        let mut emitted = Vec::new();
        for (alert_type, threshold, message) in candidates {
            let key = format!(
                "{}:{}:{}",
                alert_type.as_str(),
                event.tenant.as_deref().unwrap_or(""),
                event.workspace.as_deref().unwrap_or("")
            );
            if let Some(last) = state.cooldowns.get(&key) {
                if within(*last, now, cfg.cooldown) {
                    debug!(key = %key, "alert suppressed by cooldown");
                    continue;
                }
            }
            state.cooldowns.insert(key, now);
            emitted.push(CostAlert {
                alert_type,
                severity: alert_type.severity(),
                message,
                tenant: event.tenant.clone(),
                workspace: event.workspace.clone(),
                model: event.model.clone(),
                cost: event.cost,
                threshold,
                timestamp: now,
            });
        }
        drop(state);

        for alert in &emitted {
            self.sink.emit(alert);
        }
        emitted
    }

    /// Number of live cooldown entries.
    pub fn cooldown_entries(&self) -> usize {
        self.state.lock().cooldowns.len()
    }

    fn sweep(&self, state: &mut AlertState, now: DateTime<Utc>) {
        let due = match state.last_sweep {
            Some(last) => !within(last, now, self.config.sweep_interval),
            None => true,
        };
        if !due {
            return;
        }
        let cooldown = self.config.cooldown;
        state.cooldowns.retain(|_, last| within(*last, now, cooldown));
        state.last_sweep = Some(now);
    }
}

/// Whether `now` is less than `interval` after `since`.
fn within(since: DateTime<Utc>, now: DateTime<Utc>, interval: Duration) -> bool {
    match (now - since).to_std() {
        Ok(elapsed) => elapsed < interval,
        // clock went backwards
        Err(_) => true,
    }
}

fn mean(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

fn push_bounded(samples: &mut VecDeque<f64>, value: f64, cap: usize) {
    if samples.len() >= cap {
        samples.pop_front();
    }
    samples.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(cost: f64, spent: f64) -> ChargeEvent {
        ChargeEvent {
            tenant: Some("acme".into()),
            workspace: Some("ws".into()),
            model: "m".into(),
            cost,
            spent_today: spent,
            daily_budget: 100.0,
            max_per_request: 1.0,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn types(alerts: &[CostAlert]) -> Vec<AlertType> {
        alerts.iter().map(|a| a.alert_type).collect()
    }

    #[derive(Default)]
    struct Collect(parking_lot::Mutex<Vec<AlertType>>);

    impl AlertSink for Collect {
        fn emit(&self, alert: &CostAlert) {
            self.0.lock().push(alert.alert_type);
        }
    }

    #[test]
    fn test_high_cost_and_per_request() {
        let manager = CostAlertManager::new(AlertConfig::default());
        let alerts = manager.evaluate_at(&event(1.5, 1.5), t(0));
        assert_eq!(
            types(&alerts),
            vec![AlertType::HighCostRequest, AlertType::PerRequestLimit]
        );
    }

    #[test]
    fn test_daily_levels_pick_highest() {
        let manager = CostAlertManager::new(AlertConfig::default());
        assert_eq!(types(&manager.evaluate_at(&event(0.01, 80.0), t(0))), vec![AlertType::DailyWarning]);
        assert_eq!(types(&manager.evaluate_at(&event(0.01, 95.0), t(1))), vec![AlertType::DailyCritical]);
        assert_eq!(types(&manager.evaluate_at(&event(0.01, 100.0), t(2))), vec![AlertType::DailyEmergency]);
    }

    #[test]
    fn test_spike_needs_three_samples() {
        let manager = CostAlertManager::new(AlertConfig {
            anomaly_multiplier: 1000.0,
            ..Default::default()
        });
        manager.evaluate_at(&event(0.01, 0.0), t(0));
        manager.evaluate_at(&event(0.01, 0.0), t(1));
        // only two samples so far
        assert!(manager.evaluate_at(&event(0.1, 0.0), t(2)).is_empty());
        let alerts = manager.evaluate_at(&event(0.5, 0.0), t(3));
        assert!(types(&alerts).contains(&AlertType::CostSpike));
    }

    #[test]
    fn test_model_anomaly_needs_five_samples() {
        let manager = CostAlertManager::new(AlertConfig {
            spike_multiplier: 1000.0,
            ..Default::default()
        });
        for i in 0..4 {
            manager.evaluate_at(&event(0.01, 0.0), t(i));
        }
        assert!(manager.evaluate_at(&event(0.2, 0.0), t(4)).is_empty());
        let alerts = manager.evaluate_at(&event(0.3, 0.0), t(5));
        assert_eq!(types(&alerts), vec![AlertType::ModelAnomaly]);
    }

    #[test]
    fn test_cooldown_suppresses_repeats_per_key() {
        let manager = CostAlertManager::new(AlertConfig {
            cooldown: Duration::from_secs(60),
            ..Default::default()
        });
        assert_eq!(manager.evaluate_at(&event(0.01, 80.0), t(0)).len(), 1);
        assert!(manager.evaluate_at(&event(0.01, 80.0), t(30)).is_empty());

        let mut other = event(0.01, 80.0);
        other.tenant = Some("globex".into());
        assert_eq!(manager.evaluate_at(&other, t(31)).len(), 1);

        assert_eq!(manager.evaluate_at(&event(0.01, 80.0), t(61)).len(), 1);
    }

    #[test]
    fn test_sweep_drops_expired_cooldowns() {
        let manager = CostAlertManager::new(AlertConfig {
            cooldown: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(20),
            ..Default::default()
        });
        for i in 0..5 {
            let mut e = event(0.01, 80.0);
            e.tenant = Some(format!("tenant-{i}"));
            manager.evaluate_at(&e, t(0));
        }
        assert_eq!(manager.cooldown_entries(), 5);
        manager.evaluate_at(&event(0.0, 0.0), t(100));
        assert_eq!(manager.cooldown_entries(), 0);
    }

    #[test]
    fn test_sink_receives_alerts() {
        let sink = Arc::new(Collect::default());
        let manager = CostAlertManager::with_sink(AlertConfig::default(), sink.clone());
        manager.evaluate_at(&event(0.01, 99.0), t(0));
        assert_eq!(*sink.0.lock(), vec![AlertType::DailyCritical]);
    }

    #[test]
    fn test_disabled_emits_nothing() {
        let manager = CostAlertManager::new(AlertConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(manager.evaluate_at(&event(10.0, 100.0), t(0)).is_empty());
    }
}
