//! The alert-to-execution dispatcher: decodes webhook batches, routes each
//! alert to the firing or resolved handler, supervises Runner invocations
//! under per-fingerprint admission control and maintains the persisted
//! fingerprint bindings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{CommandDetails, Server};
use crate::command::{Command, ResultKind};
use crate::driver;
use crate::metrics::{
    ERR_STAGE_START, SIG_RESULT_FAIL, SIG_RESULT_OK,
};
use crate::runner;
use crate::store::{PersistedBinding, StateStore};
use crate::{Error, Result};

/// One alert inside an alertmanager webhook batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default, rename = "startsAt")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "endsAt")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
}

impl Alert {
    /// The `alertname` label, falling back to the fingerprint when absent.
    /// Used as the remote-KV binding key.
    pub fn name(&self) -> String {
        self.labels
            .get("alertname")
            .cloned()
            .unwrap_or_else(|| self.fingerprint.clone())
    }
}

/// The alertmanager webhook envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertBatch {
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "externalURL")]
    pub external_url: String,
    #[serde(default, rename = "commonLabels")]
    pub common_labels: HashMap<String, String>,
    #[serde(default, rename = "commonAnnotations")]
    pub common_annotations: HashMap<String, String>,
    #[serde(default, rename = "groupLabels")]
    pub group_labels: HashMap<String, String>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// Why a command could or couldn't run for an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanRunReason {
    NoLabelMatch,
    NoMax,
    NoFinger,
    FingerUnder,
    FingerOver,
}

impl CanRunReason {
    /// The prometheus-compatible label for this reason.
    pub fn label(&self) -> &'static str {
        match self {
            CanRunReason::NoLabelMatch => "nomatch",
            CanRunReason::NoMax => "nomax",
            CanRunReason::NoFinger => "nofinger",
            CanRunReason::FingerUnder => "fingerunder",
            CanRunReason::FingerOver => "fingerover",
        }
    }
}

impl fmt::Display for CanRunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            CanRunReason::NoLabelMatch => "No match for alert labels",
            CanRunReason::NoMax => "No maximum simultaneous command limit defined",
            CanRunReason::NoFinger => "No fingerprint found for command",
            CanRunReason::FingerUnder => "Command count for fingerprint is under limit",
            CanRunReason::FingerOver => "Command count for fingerprint is over limit",
        };
        write!(f, "{}", desc)
    }
}

impl Server {
    /// Process a decoded webhook batch: one worker per alert, all joined
    /// before responding. Returns the accumulated error messages.
    pub async fn handle_batch(self: Arc<Self>, batch: AlertBatch) -> Vec<String> {
        let mut workers = JoinSet::new();
        for alert in batch.alerts {
            let server = self.clone();
            workers.spawn(async move {
                match alert.status.as_str() {
                    "firing" => server.handle_firing(alert).await,
                    "resolved" => {
                        server.handle_resolved(alert).await;
                        Vec::new()
                    }
                    other => vec![format!("unknown alert status: {}", other)],
                }
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(errs) => errors.extend(errs),
                Err(e) => errors.push(format!("alert worker failed: {}", e)),
            }
        }
        errors
    }

    /// Returns whether the command is allowed to run for the alert, based on
    /// label matching and its fingerprint count. Read-only; the final
    /// admission happens atomically in the registry.
    pub fn can_run(&self, cmd: &Command, alert: &Alert) -> (bool, CanRunReason) {
        if !cmd.matches(alert) {
            return (false, CanRunReason::NoLabelMatch);
        }

        if cmd.max <= 0 {
            return (true, CanRunReason::NoMax);
        }

        let (fingerprint, ok) = cmd.fingerprint(alert);
        if !ok || fingerprint.is_empty() {
            return (true, CanRunReason::NoFinger);
        }

        let (count, present) = self.registry.get(&fingerprint);
        if !present || count < cmd.max {
            return (true, CanRunReason::FingerUnder);
        }

        (false, CanRunReason::FingerOver)
    }

    /// Handle a firing alert: dispatch every matching, admitted command and
    /// wait for all of them to complete.
    async fn handle_firing(self: Arc<Self>, alert: Alert) -> Vec<String> {
        let env = alert_env(&alert);
        let alert_name = alert.name();

        let mut runs = JoinSet::new();
        for cmd in &self.config.commands {
            let (allow, reason) = self.can_run(cmd, &alert);
            if !allow {
                if self.config.verbose {
                    info!("Skipping command due to '{}': {}", reason, cmd);
                }
                self.metrics.skipped.with_label_values(&[reason.label()]).inc();
                continue;
            }

            let (fingerprint, _) = cmd.fingerprint(&alert);
            if fingerprint.is_empty() {
                if self.config.verbose {
                    info!(
                        "Command has no fingerprint, so it won't quit early if alert is resolved first: {}",
                        cmd
                    );
                }
            } else {
                // The comparison against max and the increment are one
                // atomic step, so parallel workers cannot overshoot.
                if !self.registry.admit(&fingerprint, cmd.max) {
                    self.metrics
                        .skipped
                        .with_label_values(&[CanRunReason::FingerOver.label()])
                        .inc();
                    continue;
                }
                // Recorded before the Runner starts; the post-completion
                // lookup depends on it.
                self.command_details.write().await.insert(
                    fingerprint.clone(),
                    CommandDetails {
                        cmd: cmd.cmd.clone(),
                        args: cmd.args.clone(),
                        scheduling: cmd.scheduling,
                    },
                );
            }

            if self.config.verbose {
                info!("Executing: {}", cmd);
            }

            let server = self.clone();
            let cmd = cmd.clone();
            let env = env.clone();
            let alert_name = alert_name.clone();
            runs.spawn(async move { server.instrument(fingerprint, cmd, env, alert_name).await });
        }

        let mut errors = Vec::new();
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(errs) => errors.extend(errs),
                Err(e) => errors.push(format!("command task failed: {}", e)),
            }
        }
        errors
    }

    /// Supervise one Runner invocation: wire up cancellation, consume its
    /// result stream into metrics, then persist the fingerprint binding and
    /// release the admission slot.
    async fn instrument(
        self: Arc<Self>,
        fingerprint: String,
        cmd: Command,
        env: Vec<(String, String)>,
        alert_name: String,
    ) -> Vec<String> {
        self.metrics.processes_current.inc();

        let cancel = if fingerprint.is_empty() {
            // Never closed; the run simply cannot be signalled early.
            CancellationToken::new()
        } else {
            self.registry.add(&fingerprint)
        };

        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (done_tx, done_rx) = oneshot::channel();
        let start = Instant::now();
        tokio::spawn(runner::run(cmd.clone(), env, cancel, out_tx, done_tx));

        let mut errors = Vec::new();
        let mut state = ResultKind::default();
        while let Some(result) = out_rx.recv().await {
            state |= result.kind;
            if result.kind.has(ResultKind::FAIL) {
                if let Some(err) = result.err.as_ref() {
                    if cmd.should_notify() {
                        self.metrics
                            .errors
                            .with_label_values(&[ERR_STAGE_START])
                            .inc();
                        errors.push(err.to_string());
                    } else {
                        error!("Command failed: {}", err);
                    }
                }
            }
            if result.kind.has(ResultKind::SIG_OK) {
                self.metrics
                    .signalled
                    .with_label_values(&[SIG_RESULT_OK])
                    .inc();
            }
            if result.kind.has(ResultKind::SIG_FAIL) {
                self.metrics
                    .signalled
                    .with_label_values(&[SIG_RESULT_FAIL])
                    .inc();
                if let Some(err) = result.err.as_ref() {
                    if cmd.should_notify() {
                        errors.push(err.to_string());
                    } else {
                        error!("{}", err);
                    }
                }
            }
        }
        let _ = done_rx.await;
        self.metrics
            .process_duration
            .observe(start.elapsed().as_secs_f64());

        if self.config.verbose {
            info!("Command: {}, result: {}", cmd, state);
        }

        if !fingerprint.is_empty() {
            if let Err(e) = self.persist_binding(&fingerprint, &alert_name).await {
                error!("Failed to persist fingerprint binding: {}", e);
            }
            self.registry.dec(&fingerprint);
        }
        self.metrics.processes_current.dec();

        errors
    }

    /// Write the fingerprint → module binding once the Runner completed.
    async fn persist_binding(&self, fingerprint: &str, alert_name: &str) -> Result<()> {
        let details = self
            .command_details
            .read()
            .await
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| {
                Error::Execution(format!(
                    "command details not found for fingerprint: {}",
                    fingerprint
                ))
            })?;

        let module = driver::module_path(&details.args).ok_or_else(|| {
            Error::Execution(format!(
                "no module path in arguments for fingerprint: {}",
                fingerprint
            ))
        })?;
        let module = std::path::absolute(module)?;

        let binding = PersistedBinding {
            fingerprint: fingerprint.to_string(),
            module: module.to_string_lossy().into_owned(),
            terraform_scheduling: details.scheduling.as_str().to_string(),
        };

        let key = self.store.binding_key(fingerprint, alert_name);
        self.store.put(&key, &binding.to_bytes()?).await
    }

    /// Handle a resolved alert: take the compensating action recorded in the
    /// persisted binding for every matching command, then broadcast
    /// cancellation to any still-running Runner.
    async fn handle_resolved(&self, alert: Alert) {
        let alert_name = alert.name();

        for cmd in &self.config.commands {
            let (fingerprint, ok) = cmd.fingerprint(&alert);
            if !ok || fingerprint.is_empty() {
                continue;
            }

            let key = self.store.binding_key(&fingerprint, &alert_name);
            let data = match self.store.get(&key).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    warn!("Fingerprint binding not found for key: {}", key);
                    continue;
                }
                Err(e) => {
                    error!("Failed to get fingerprint binding for key {}: {}", key, e);
                    continue;
                }
            };

            let binding = match PersistedBinding::from_bytes(&data) {
                Ok(binding) => binding,
                Err(e) => {
                    error!("Failed to unmarshal fingerprint binding: {}", e);
                    continue;
                }
            };

            // Sawtooth runs keep their resources; everything else may be
            // destroyed, subject to the command's own policy.
            if !binding.is_sawtooth() {
                if binding.module.is_empty() {
                    error!("Module path is empty in fingerprint binding for key: {}", key);
                    continue;
                }
                if cmd.should_destroy() {
                    let driver_bin = self.config.server.driver.clone();
                    let module = binding.module.clone();
                    tokio::spawn(async move {
                        if let Err(e) = driver::run(&driver_bin, &module, "destroy").await {
                            error!("Failed to destroy module {}: {}", module, e);
                        }
                    });
                }
            }

            if let Err(e) = self.store.delete(&key).await {
                error!("Failed to delete fingerprint binding for key {}: {}", key, e);
                continue;
            }

            // Destroy is already underway; now wake any Runner still
            // attached to this fingerprint.
            self.registry.close(&fingerprint);
            self.command_details.write().await.remove(&fingerprint);
        }
    }
}

/// Derive the child-process environment from an alert. All variables carry
/// the `TF_VAR_` prefix so the driver picks them up as input variables.
pub fn alert_env(alert: &Alert) -> Vec<(String, String)> {
    let mut env = vec![
        (
            "TF_VAR_ITERATOR_ALERT_STATUS".to_string(),
            alert.status.clone(),
        ),
        (
            "TF_VAR_ITERATOR_ALERT_START".to_string(),
            time_to_str(alert.starts_at),
        ),
        (
            "TF_VAR_ITERATOR_ALERT_END".to_string(),
            time_to_str(alert.ends_at),
        ),
        (
            "TF_VAR_ITERATOR_ALERT_URL".to_string(),
            alert.generator_url.clone(),
        ),
        (
            "TF_VAR_ITERATOR_ALERT_FINGERPRINT".to_string(),
            alert.fingerprint.clone(),
        ),
    ];

    for (k, v) in &alert.labels {
        env.push((format!("TF_VAR_ITERATOR_ALERT_LABEL_{}", k), v.clone()));
    }
    for (k, v) in &alert.annotations {
        env.push((format!("TF_VAR_ITERATOR_ALERT_ANNOTATION_{}", k), v.clone()));
    }

    env
}

/// Unix epoch seconds as a decimal string; zero-valued timestamps render
/// as `0`.
fn time_to_str(t: Option<DateTime<Utc>>) -> String {
    match t {
        Some(t) if t.timestamp() > 0 => t.timestamp().to_string(),
        _ => "0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_env_contains_alert_scope_variables() {
        let mut alert = Alert::default();
        alert.fingerprint = "abc".to_string();
        alert.status = "firing".to_string();
        alert.generator_url = "http://prom/graph".to_string();
        alert.starts_at = Some(DateTime::from_timestamp(1700000000, 0).unwrap());
        alert
            .labels
            .insert("alertname".to_string(), "HighLoad".to_string());
        alert
            .annotations
            .insert("summary".to_string(), "load is high".to_string());

        let env = alert_env(&alert);
        let lookup = |k: &str| {
            env.iter()
                .find(|(name, _)| name.as_str() == k)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(lookup("TF_VAR_ITERATOR_ALERT_STATUS"), Some("firing"));
        assert_eq!(lookup("TF_VAR_ITERATOR_ALERT_START"), Some("1700000000"));
        assert_eq!(lookup("TF_VAR_ITERATOR_ALERT_END"), Some("0"));
        assert_eq!(
            lookup("TF_VAR_ITERATOR_ALERT_URL"),
            Some("http://prom/graph")
        );
        assert_eq!(lookup("TF_VAR_ITERATOR_ALERT_FINGERPRINT"), Some("abc"));
        assert_eq!(
            lookup("TF_VAR_ITERATOR_ALERT_LABEL_alertname"),
            Some("HighLoad")
        );
        assert_eq!(
            lookup("TF_VAR_ITERATOR_ALERT_ANNOTATION_summary"),
            Some("load is high")
        );
    }

    #[test]
    fn zero_timestamps_render_as_zero() {
        assert_eq!(time_to_str(None), "0");
        // The alertmanager zero value for endsAt.
        let zero = "0001-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(time_to_str(Some(zero)), "0");
        let real = DateTime::from_timestamp(1700000000, 0).unwrap();
        assert_eq!(time_to_str(Some(real)), "1700000000");
    }

    #[test]
    fn alert_name_falls_back_to_fingerprint() {
        let mut alert = Alert::default();
        alert.fingerprint = "abc".to_string();
        assert_eq!(alert.name(), "abc");
        alert
            .labels
            .insert("alertname".to_string(), "HighLoad".to_string());
        assert_eq!(alert.name(), "HighLoad");
    }

    #[test]
    fn batch_decodes_alertmanager_payload() {
        let payload = serde_json::json!({
            "receiver": "iterator",
            "status": "firing",
            "externalURL": "http://am:9093",
            "commonLabels": {"env": "prod"},
            "commonAnnotations": {},
            "groupLabels": {"alertname": "HighLoad"},
            "alerts": [{
                "fingerprint": "abc",
                "status": "firing",
                "labels": {"alertname": "HighLoad", "env": "prod"},
                "annotations": {"summary": "load is high"},
                "startsAt": "2023-11-14T22:13:20Z",
                "endsAt": "0001-01-01T00:00:00Z",
                "generatorURL": "http://prom/graph"
            }]
        });
        let batch: AlertBatch = serde_json::from_value(payload).unwrap();
        assert_eq!(batch.alerts.len(), 1);
        let alert = &batch.alerts[0];
        assert_eq!(alert.fingerprint, "abc");
        assert_eq!(alert.status, "firing");
        assert_eq!(alert.starts_at.unwrap().timestamp(), 1700000000);
    }
}
