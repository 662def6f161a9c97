//! Check Engine: orchestrates audits across the Rule Catalogue, the SSH
//! Layer and the Store, reporting progress through a caller-supplied
//! callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crypto::{self, SymmetricKey};
use crate::error::{Error, Result};
use crate::rules::RuleCatalogue;
use crate::ssh::{AuthMethod, ConnectInfo, SshLayer};
use crate::store::{CheckResult, CheckStatus, Device, SecurityRule, Severity, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Queued,
    Running,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub device_id: String,
    pub device_name: String,
    pub status: ProgressStatus,
    pub progress: usize,
    pub total: usize,
    pub current_rule: String,
    pub error: Option<String>,
    pub updated_at: chrono::DateTime<Utc>,
}

/// The engine's only other extension point besides host-key policy:
/// an explicit capability parameter rather than a trait callers must
/// implement an object for.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

fn emit(cb: &Option<ProgressCallback>, event: ProgressEvent) {
    if let Some(cb) = cb {
        cb(event);
    }
}

/// Per-`run_checks` output. A vendor with no applicable rules still
/// yields an (empty) result list *and* a `NoRulesForVendor` error; the
/// two signals are deliberately not collapsed into one, per the
/// design note this crate preserves.
pub struct CheckRunOutcome {
    pub results: Vec<CheckResult>,
    pub error: Option<Error>,
}

pub struct BulkOutcome {
    pub results: HashMap<String, Vec<CheckResult>>,
    pub errors: HashMap<String, Error>,
}

pub struct CheckEngine {
    store: Arc<Store>,
    rules: Arc<RuleCatalogue>,
    ssh: Arc<SshLayer>,
    key: SymmetricKey,
    worker_count: Mutex<usize>,
    timeout: Mutex<Duration>,
    custom_rules: Mutex<Vec<SecurityRule>>,
}

impl CheckEngine {
    pub fn new(store: Arc<Store>, rules: Arc<RuleCatalogue>, ssh: Arc<SshLayer>, key: SymmetricKey) -> Self {
        CheckEngine {
            store,
            rules,
            ssh,
            key,
            worker_count: Mutex::new(5),
            timeout: Mutex::new(Duration::from_secs(30)),
            custom_rules: Mutex::new(Vec::new()),
        }
    }

    pub fn set_worker_count(&self, n: usize) {
        if n > 0 {
            *self.worker_count.lock().expect("worker count mutex poisoned") = n;
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().expect("timeout mutex poisoned") = timeout;
    }

    fn worker_count(&self) -> usize {
        *self.worker_count.lock().expect("worker count mutex poisoned")
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock().expect("timeout mutex poisoned")
    }

    /// Delegates to the Rule Catalogue and keeps only enabled rules;
    /// also includes any custom rules loaded via `load_custom_rules`
    /// whose vendor matches.
    pub fn get_security_rules(&self, vendor: &str) -> Result<Vec<SecurityRule>> {
        let mut rules: Vec<SecurityRule> = self
            .rules
            .get_by_vendor(vendor)?
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        let custom = self.custom_rules.lock().expect("custom rules mutex poisoned");
        rules.extend(
            custom
                .iter()
                .filter(|r| r.enabled && (r.vendor == vendor || r.vendor == "generic"))
                .cloned(),
        );
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rules)
    }

    pub fn load_custom_rules(&self, rules: Vec<SecurityRule>) {
        *self.custom_rules.lock().expect("custom rules mutex poisoned") = rules;
    }

    /// Runs every applicable rule against `device`, writing each
    /// resulting `CheckResult` to the store as it completes.
    pub async fn run_checks(
        &self,
        device: &Device,
        cb: Option<ProgressCallback>,
    ) -> CheckRunOutcome {
        self.run_checks_with_cancellation(device, cb, &CancellationToken::new()).await
    }

    async fn run_checks_with_cancellation(
        &self,
        device: &Device,
        cb: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> CheckRunOutcome {
        let rules = match self.get_security_rules(&device.vendor) {
            Ok(rules) => rules,
            Err(e) => {
                emit(&cb, terminal_event(device, 0, Some(e.to_string())));
                return CheckRunOutcome { results: Vec::new(), error: Some(e) };
            }
        };

        if rules.is_empty() {
            emit(&cb, terminal_event(device, 0, None));
            return CheckRunOutcome {
                results: Vec::new(),
                error: Some(Error::NoRulesForVendor(device.vendor.clone())),
            };
        }

        let total = rules.len();
        let mut results = Vec::with_capacity(total);

        for (i, rule) in rules.iter().enumerate() {
            if cancel.is_cancelled() {
                emit(
                    &cb,
                    ProgressEvent {
                        device_id: device.id.clone(),
                        device_name: device.name.clone(),
                        status: ProgressStatus::Cancelled,
                        progress: i,
                        total,
                        current_rule: rule.name.clone(),
                        error: Some("cancelled".into()),
                        updated_at: Utc::now(),
                    },
                );
                break;
            }

            emit(
                &cb,
                ProgressEvent {
                    device_id: device.id.clone(),
                    device_name: device.name.clone(),
                    status: ProgressStatus::Running,
                    progress: i,
                    total,
                    current_rule: rule.name.clone(),
                    error: None,
                    updated_at: Utc::now(),
                },
            );

            let result = self.run_one_rule(device, rule, cancel).await;
            if let Err(e) = self.store.insert_check_result(&result) {
                tracing::warn!(device_id = %device.id, rule = %rule.name, error = %e, "failed to persist check result");
            }
            results.push(result);
        }

        emit(&cb, terminal_event(device, total, None));
        CheckRunOutcome { results, error: None }
    }

    async fn run_one_rule(
        &self,
        device: &Device,
        rule: &SecurityRule,
        cancel: &CancellationToken,
    ) -> CheckResult {
        let timeout = self.timeout();
        let per_rule_cancel = cancel.child_token();

        let outcome = tokio::select! {
            result = self.execute_rule(device, rule) => result,
            _ = per_rule_cancel.cancelled() => Err(Error::Cancelled),
        };

        let (status, message, evidence) = match outcome {
            Ok(evidence) => evaluate(&evidence, &rule.expected_pattern),
            Err(e) => (CheckStatus::Error, e.to_string(), String::new()),
        };

        CheckResult {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device.id.clone(),
            check_name: rule.name.clone(),
            check_type: "regex".into(),
            severity: rule.severity,
            status,
            message,
            evidence,
            checked_at: Utc::now(),
        }
    }

    /// Connects, runs the rule's command, disconnects. Connectivity or
    /// command failures surface here as `Err` and are turned into an
    /// `ERROR` result one level up, never propagated as an exception to
    /// the caller.
    async fn execute_rule(&self, device: &Device, rule: &SecurityRule) -> Result<String> {
        let plaintext = crypto::decrypt(&self.key, &device.password_encrypted)
            .map_err(|e| Error::Connectivity(format!("credential decryption failed: {e}")))?;
        let password = String::from_utf8(plaintext)
            .map_err(|e| Error::Connectivity(format!("stored credential is not utf-8: {e}")))?;

        let info = ConnectInfo {
            host: device.ip_address.clone(),
            port: device.ssh_port,
            username: device.username.clone(),
            auth: AuthMethod::Password(password),
        };

        let conn = self
            .ssh
            .connect(&info)
            .await
            .map_err(|e| Error::Connectivity(format!("connection to {} failed: {e}", device.ip_address)))?;

        let result = self.ssh.execute_command(&conn, &rule.command).await;
        self.ssh.disconnect(conn).await;

        if let Some(err) = result.error {
            return Err(Error::CommandExecution(err));
        }
        let mut evidence = result.stdout;
        if !result.stderr.is_empty() {
            evidence.push('\n');
            evidence.push_str(&result.stderr);
        }
        Ok(evidence)
    }

    /// Processes `devices` through a bounded worker pool of
    /// `worker_count` workers. Cancellation of the shared context is
    /// not an error to the caller — it is reflected per-device as a
    /// `cancelled` progress event and an entry in `errors`.
    pub async fn run_bulk_checks(
        self: &Arc<Self>,
        devices: Vec<Device>,
        cb: Option<ProgressCallback>,
    ) -> BulkOutcome {
        let worker_count = self.worker_count().max(1);
        let per_device_timeout = self.timeout();
        let shared_timeout = per_device_timeout.saturating_mul(devices.len().max(1) as u32);
        let shared_cancel = CancellationToken::new();

        let results: Arc<Mutex<HashMap<String, Vec<CheckResult>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let errors: Arc<Mutex<HashMap<String, Error>>> = Arc::new(Mutex::new(HashMap::new()));

        let (tx, rx) = mpsc::channel::<Device>(devices.len().max(1));
        for device in &devices {
            emit(
                &cb,
                ProgressEvent {
                    device_id: device.id.clone(),
                    device_name: device.name.clone(),
                    status: ProgressStatus::Queued,
                    progress: 0,
                    total: 0,
                    current_rule: String::new(),
                    error: None,
                    updated_at: Utc::now(),
                },
            );
            let _ = tx.send(device.clone()).await;
        }
        drop(tx);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = Vec::with_capacity(worker_count);

        for _ in 0..worker_count {
            let rx = rx.clone();
            let results = results.clone();
            let errors = errors.clone();
            let cb = cb.clone();
            let cancel = shared_cancel.clone();
            let engine_self = self.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let device = match next {
                        Some(d) => d,
                        None => break,
                    };
                    if cancel.is_cancelled() {
                        break;
                    }

                    let outcome = engine_self
                        .run_checks_with_cancellation(&device, cb.clone(), &cancel)
                        .await;

                    let mut results_guard = results.lock().expect("results mutex poisoned");
                    results_guard.insert(device.id.clone(), outcome.results);
                    drop(results_guard);

                    if let Some(err) = outcome.error {
                        if !matches!(err, Error::NoRulesForVendor(_)) {
                            errors.lock().expect("errors mutex poisoned").insert(device.id.clone(), err);
                        }
                    }
                }
            }));
        }

        let cancel_for_timeout = shared_cancel.clone();
        let timeout_guard = tokio::spawn(async move {
            tokio::time::sleep(shared_timeout).await;
            cancel_for_timeout.cancel();
        });

        for worker in workers {
            let _ = worker.await;
        }
        timeout_guard.abort();

        let results = Arc::try_unwrap(results)
            .map(|m| m.into_inner().expect("results mutex poisoned"))
            .unwrap_or_default();
        let errors = Arc::try_unwrap(errors)
            .map(|m| m.into_inner().expect("errors mutex poisoned"))
            .unwrap_or_default();

        BulkOutcome { results, errors }
    }
}

fn terminal_event(device: &Device, total: usize, error: Option<String>) -> ProgressEvent {
    ProgressEvent {
        device_id: device.id.clone(),
        device_name: device.name.clone(),
        status: if error.is_some() { ProgressStatus::Error } else { ProgressStatus::Completed },
        progress: total,
        total,
        current_rule: String::new(),
        error,
        updated_at: Utc::now(),
    }
}

/// Evaluates captured evidence against a rule's expected pattern.
fn evaluate(evidence: &str, pattern: &str) -> (CheckStatus, String, String) {
    if pattern.is_empty() {
        return (
            CheckStatus::Warning,
            "No expected pattern defined for rule".to_string(),
            evidence.to_string(),
        );
    }
    match Regex::new(pattern) {
        Err(e) => (CheckStatus::Error, format!("invalid pattern: {e}"), evidence.to_string()),
        Ok(re) => {
            if re.is_match(evidence) {
                (CheckStatus::Pass, "evidence matches expected pattern".to_string(), evidence.to_string())
            } else {
                (
                    CheckStatus::Fail,
                    format!("evidence did not match expected pattern '{pattern}'"),
                    evidence.to_string(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_is_warning() {
        let (status, message, _) = evaluate("anything", "");
        assert_eq!(status, CheckStatus::Warning);
        assert_eq!(message, "No expected pattern defined for rule");
    }

    #[test]
    fn uncompilable_pattern_is_error() {
        let (status, _, _) = evaluate("anything", "[invalid");
        assert_eq!(status, CheckStatus::Error);
    }

    #[test]
    fn matching_pattern_is_pass() {
        let (status, _, _) = evaluate("SSH Enabled - version 2.0", r"SSH Enabled - version [12]\..*");
        assert_eq!(status, CheckStatus::Pass);
    }

    #[test]
    fn non_matching_pattern_is_fail() {
        let (status, message, _) = evaluate("SSH Disabled", r"SSH Enabled - version [12]\..*");
        assert_eq!(status, CheckStatus::Fail);
        assert!(message.contains("SSH Enabled - version"));
    }

    fn test_device(vendor: &str, key: &SymmetricKey) -> Device {
        let now = Utc::now();
        Device {
            id: uuid::Uuid::new_v4().to_string(),
            name: format!("device-{vendor}"),
            ip_address: "192.0.2.1".into(),
            device_type: "router".into(),
            vendor: vendor.into(),
            username: "admin".into(),
            password_encrypted: crypto::encrypt(key, b"s3cret").unwrap(),
            ssh_port: 22,
            snmp_community: None,
            tags: vec![],
            status: crate::store::DeviceStatus::Unknown,
            last_checked: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_engine() -> (Arc<CheckEngine>, SymmetricKey) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let catalogue = Arc::new(RuleCatalogue::new(store.clone()));
        catalogue
            .create(crate::store::SecurityRule {
                id: String::new(),
                name: "cisco-only-rule".into(),
                description: "d".into(),
                vendor: "cisco".into(),
                command: "show version".into(),
                expected_pattern: String::new(),
                severity: Severity::Low,
                enabled: true,
                created_at: Utc::now(),
            })
            .unwrap();
        let ssh = Arc::new(crate::ssh::SshLayer::new(crate::ssh::SshLayerConfig {
            host_key_verification: crate::ssh::HostKeyVerification::Insecure,
            max_retries: 0,
            connect_timeout_secs: 1,
            ..Default::default()
        }));
        let key = crypto::generate_key();
        let engine = Arc::new(CheckEngine::new(store, catalogue, ssh, key.clone()));
        (engine, key)
    }

    /// S4: a vendor with no applicable rules yields an empty result
    /// list *and* a `NoRulesForVendor` error, alongside exactly one
    /// terminal progress event with `total == 0`.
    #[tokio::test]
    async fn unknown_vendor_yields_no_rules_error_and_one_terminal_event() {
        let (engine, key) = test_engine();
        let device = test_device("nonexistent", &key);

        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let cb: ProgressCallback = Arc::new(move |e| events_clone.lock().unwrap().push(e));

        let outcome = engine.run_checks(&device, Some(cb)).await;
        assert!(outcome.results.is_empty());
        match outcome.error {
            Some(Error::NoRulesForVendor(v)) => assert_eq!(v, "nonexistent"),
            other => panic!("expected NoRulesForVendor, got {other:?}"),
        }

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, ProgressStatus::Completed);
        assert_eq!(events[0].total, 0);
    }

    /// Invariant 7: bulk execution emits, for every input device, at
    /// least one queued/running event and at least one terminal event.
    #[tokio::test]
    async fn bulk_emits_queued_and_terminal_events_per_device() {
        let (engine, key) = test_engine();
        let devices: Vec<Device> = (0..3).map(|_| test_device("nonexistent", &key)).collect();
        let device_ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();

        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let cb: ProgressCallback = Arc::new(move |e| events_clone.lock().unwrap().push(e));

        engine.set_worker_count(2);
        let outcome = engine.run_bulk_checks(devices, Some(cb)).await;

        for id in &device_ids {
            assert!(outcome.results.contains_key(id));
            assert!(outcome.results[id].is_empty());
        }
        assert!(outcome.errors.is_empty(), "NoRulesForVendor is not surfaced as a bulk error");

        let events = events.lock().unwrap();
        for id in &device_ids {
            let initial = events
                .iter()
                .any(|e| &e.device_id == id && matches!(e.status, ProgressStatus::Queued | ProgressStatus::Running));
            let terminal = events.iter().any(|e| {
                &e.device_id == id
                    && matches!(
                        e.status,
                        ProgressStatus::Completed | ProgressStatus::Error | ProgressStatus::Cancelled
                    )
            });
            assert!(initial, "missing initial progress event for {id}");
            assert!(terminal, "missing terminal progress event for {id}");
        }
    }
}
