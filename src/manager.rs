//! Fleet manager: priority-ordered dispatch plus the active health loop.
//!
//! The manager owns the registered clients (sorted by priority), the
//! caller→client affinity map and the per-group concurrency limits. One
//! background task probes idle clients on a status-dependent cadence.
//!
//! Lock discipline: the manager mutex guards only its own maps. Anything
//! that can block (health-check chats in particular) collects its targets
//! under the lock, then runs with the lock released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::BackendClient;
use crate::types::{now_ts, ClientStatus};

/// Health-loop configuration. Stable clients are probed rarely, erroring
/// ones with exponential backoff, unknown ones immediately.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub base_check_interval_sec: u64,
    pub first_check_delay_sec: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_check_interval_sec: 60,
            first_check_delay_sec: 10,
        }
    }
}

/// Selection filters for [`ClientManager::get_available_client`].
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Exclude the caller's current holding, enabling a swap even inside a
    /// saturated group (the holding is not counted against the limit).
    pub request_change: bool,
    pub target_group_id: Option<String>,
    pub target_client_name: Option<String>,
}

struct Allocation {
    client: Arc<BackendClient>,
    last_used: f64,
}

#[derive(Default)]
struct ManagerState {
    /// Sorted ascending by priority; stable for equal priorities, so
    /// registration order breaks ties.
    clients: Vec<Arc<BackendClient>>,
    user_client_map: HashMap<String, Allocation>,
    group_limits: HashMap<String, usize>,
}

pub struct ClientManager {
    config: ManagerConfig,
    state: Mutex<ManagerState>,
    monitor_running: AtomicBool,
    monitor_stop: Notify,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ManagerState::default()),
            monitor_running: AtomicBool::new(false),
            monitor_stop: Notify::new(),
            monitor_task: Mutex::new(None),
        }
    }

    pub fn register_client(&self, client: Arc<BackendClient>) {
        let mut state = self.lock_state();
        info!(client = %client.name(), priority = client.priority(), group = %client.group_id(), "registered client");
        state.clients.push(client);
        // Stable sort keeps registration order among equal priorities.
        state.clients.sort_by_key(|c| c.priority());
    }

    /// Cap the number of concurrently leased clients in a group. A limit of
    /// zero forbids any acquisition in that group.
    pub fn set_group_limit(&self, group_id: impl Into<String>, max_concurrent: usize) {
        self.lock_state()
            .group_limits
            .insert(group_id.into(), max_concurrent);
    }

    pub fn get_client_by_name(&self, name: &str) -> Option<Arc<BackendClient>> {
        self.lock_state()
            .clients
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Snapshot of all clients in priority order.
    pub fn clients(&self) -> Vec<Arc<BackendClient>> {
        self.lock_state().clients.clone()
    }

    /// Select a client for `caller_id`, honoring affinity, priority order,
    /// status filters and group limits.
    pub fn get_available_client(
        &self,
        caller_id: &str,
        options: &SelectOptions,
    ) -> Option<Arc<BackendClient>> {
        if caller_id.is_empty() {
            error!("caller_id is required to get a client");
            return None;
        }

        let mut state = self.lock_state();

        // 1. Validate the caller's current holding. A dead or degraded
        // holding is released and forgotten up front.
        let mut current = state
            .user_client_map
            .get(caller_id)
            .map(|a| Arc::clone(&a.client));
        if let Some(held) = &current {
            let in_fleet = state.clients.iter().any(|c| Arc::ptr_eq(c, held));
            let status = held.status();
            if !in_fleet
                || status == ClientStatus::Error
                || status == ClientStatus::Unavailable
            {
                release_caller(&mut state, caller_id);
                current = None;
            }
        }

        // 2. Group usage counts leased clients. With request_change the
        // caller's own holding is excluded so a swap inside a saturated
        // group stays possible.
        let mut group_usage: HashMap<String, usize> = HashMap::new();
        for client in &state.clients {
            if !client.is_acquired() {
                continue;
            }
            if options.request_change
                && current
                    .as_ref()
                    .map(|held| Arc::ptr_eq(client, held))
                    .unwrap_or(false)
            {
                continue;
            }
            *group_usage.entry(client.group_id().to_string()).or_default() += 1;
        }

        // 3. Walk clients in priority order; the first survivor wins.
        let candidates: Vec<Arc<BackendClient>> = state.clients.clone();
        for client in candidates {
            if let Some(target) = &options.target_client_name {
                if client.name() != target {
                    continue;
                }
            }
            if let Some(group) = &options.target_group_id {
                if client.group_id() != group {
                    continue;
                }
            }

            let is_current = current
                .as_ref()
                .map(|held| Arc::ptr_eq(&client, held))
                .unwrap_or(false);
            if options.request_change && is_current {
                continue;
            }

            let snapshot = client.snapshot();
            if snapshot.status == ClientStatus::Unavailable {
                continue;
            }
            if snapshot.status == ClientStatus::Error && snapshot.error_count > 1 {
                continue;
            }
            if client.calculate_health() <= 0.0 {
                continue;
            }
            if let Some(&limit) = state.group_limits.get(client.group_id()) {
                let usage = group_usage.get(client.group_id()).copied().unwrap_or(0);
                // The caller's own holding never blocks itself.
                if !is_current && usage >= limit {
                    continue;
                }
            }

            // Reaching the current holding means nothing better was free:
            // keep it, refresh the affinity timestamp, no re-acquire.
            if is_current {
                if let Some(allocation) = state.user_client_map.get_mut(caller_id) {
                    allocation.last_used = now_ts();
                }
                debug!(caller = caller_id, client = %client.name(), "caller keeps client");
                return Some(client);
            }

            if !client.is_busy() && client.acquire() {
                if let Some(old) = current.take() {
                    old.release();
                    info!(
                        caller = caller_id,
                        from = %old.name(),
                        to = %client.name(),
                        "caller switching clients"
                    );
                }
                state.user_client_map.insert(
                    caller_id.to_string(),
                    Allocation {
                        client: Arc::clone(&client),
                        last_used: now_ts(),
                    },
                );
                info!(caller = caller_id, client = %client.name(), "caller acquired client");
                return Some(client);
            }
        }

        None
    }

    /// Release by caller id, or release every caller holding the named
    /// client.
    pub fn release_client(&self, caller_or_client: &str) {
        let mut state = self.lock_state();
        if state.user_client_map.contains_key(caller_or_client) {
            release_caller(&mut state, caller_or_client);
            return;
        }
        let callers: Vec<String> = state
            .user_client_map
            .iter()
            .filter(|(_, a)| a.client.name() == caller_or_client)
            .map(|(caller, _)| caller.clone())
            .collect();
        for caller in callers {
            release_caller(&mut state, &caller);
        }
    }

    /// Force a status transition from the admin surface. `Available` also
    /// clears the error streak.
    pub fn set_client_status(&self, client_name: &str, status: ClientStatus) -> bool {
        let Some(client) = self.get_client_by_name(client_name) else {
            return false;
        };
        client.update_status(status);
        if status == ClientStatus::Available {
            client.reset_error_count();
        }
        true
    }

    /// Fire an asynchronous health check for one client. Returns false when
    /// the client does not exist; the check itself runs in the background.
    pub fn trigger_manual_check(self: &Arc<Self>, client_name: &str) -> bool {
        let Some(client) = self.get_client_by_name(client_name) else {
            return false;
        };
        info!(client = %client_name, "manual check triggered");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_check(client).await;
        });
        true
    }

    /// Comprehensive stats payload for the admin overview.
    pub fn get_client_stats(&self) -> serde_json::Value {
        let state = self.lock_state();
        let now = now_ts();

        let mut held_by: HashMap<String, (String, f64)> = HashMap::new();
        for (caller, allocation) in &state.user_client_map {
            held_by.insert(
                allocation.client.name().to_string(),
                (caller.clone(), allocation.last_used),
            );
        }

        let mut available = 0usize;
        let mut busy = 0usize;
        let mut with_errors = 0usize;
        let mut details = Vec::with_capacity(state.clients.len());

        for client in &state.clients {
            let snapshot = client.snapshot();
            if snapshot.status == ClientStatus::Available {
                available += 1;
            }
            if snapshot.in_use {
                busy += 1;
            }
            if snapshot.error_count > 0 {
                with_errors += 1;
            }

            let allocation = held_by.get(client.name());
            let duration = if snapshot.acquired && snapshot.last_acquired > 0.0 {
                now - snapshot.last_acquired
            } else if snapshot.last_released > 0.0 {
                now - snapshot.last_released
            } else {
                0.0
            };
            let error_rate = if snapshot.acquire_count > 0 {
                snapshot.error_sum as f64 / snapshot.acquire_count as f64 * 100.0
            } else {
                0.0
            };

            details.push(json!({
                "meta": {
                    "name": client.name(),
                    "group_id": client.group_id(),
                    "priority": client.priority(),
                    "current_model": client.current_model(),
                    "api_base_url": client.api_base_url(),
                },
                "state": {
                    "status": snapshot.status,
                    "is_busy": snapshot.in_use,
                    "health_score": client.calculate_health(),
                    "last_active_ts": snapshot.status_last_updated,
                },
                "allocation": {
                    "held_by": allocation.map(|(caller, _)| caller.clone()),
                    "held_since": allocation.map(|(_, since)| *since),
                    "duration_seconds": if allocation.is_some() { duration } else { 0.0 },
                },
                "runtime_stats": {
                    "acquire_count": snapshot.acquire_count,
                    "chat_count": snapshot.chat_count,
                    "error_count": snapshot.error_count,
                    "error_sum": snapshot.error_sum,
                    "error_rate_percent": (error_rate * 10.0).round() / 10.0,
                    "last_chat_ts": snapshot.last_chat,
                },
                "metrics": client.standardized_metrics(),
            }));
        }

        // Priority ascending, busy before idle, healthier first.
        details.sort_by(|a, b| {
            let priority = a["meta"]["priority"]
                .as_i64()
                .cmp(&b["meta"]["priority"].as_i64());
            let busy = b["state"]["is_busy"]
                .as_bool()
                .cmp(&a["state"]["is_busy"].as_bool());
            let health = b["state"]["health_score"]
                .as_f64()
                .partial_cmp(&a["state"]["health_score"].as_f64())
                .unwrap_or(std::cmp::Ordering::Equal);
            priority.then(busy).then(health)
        });

        let total = state.clients.len();
        let system_load = if total > 0 {
            format!("{:.1}%", busy as f64 / total as f64 * 100.0)
        } else {
            "0%".to_string()
        };

        json!({
            "summary": {
                "timestamp": now,
                "total_clients": total,
                "group_limits": state.group_limits,
                "available": available,
                "busy": busy,
                "clients_with_errors": with_errors,
                "active_users": state.user_client_map.len(),
                "system_load": system_load,
            },
            "clients": details,
        })
    }

    /// Start the background health loop: first tick after
    /// `first_check_delay_sec`, then one tick per `base_check_interval_sec`.
    pub fn start_monitoring(self: &Arc<Self>) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut delay = Duration::from_secs(manager.config.first_check_delay_sec);
            loop {
                tokio::select! {
                    _ = manager.monitor_stop.notified() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if !manager.monitor_running.load(Ordering::SeqCst) {
                    break;
                }
                manager.check_client_health().await;
                delay = Duration::from_secs(manager.config.base_check_interval_sec);
            }
            debug!("monitor loop exited");
        });

        *self
            .monitor_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!("started fleet health monitoring");
    }

    /// Stop the health loop, waiting up to 10s for an in-flight tick.
    pub async fn stop_monitoring(&self) {
        self.monitor_running.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a task that has not reached its
        // select yet still wakes immediately.
        self.monitor_stop.notify_one();

        let handle = self
            .monitor_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                warn!("monitor did not stop in time; aborting");
                abort.abort();
            }
        }
        info!("stopped fleet health monitoring");
    }

    /// One monitor tick: pick due clients under the lock, probe them with
    /// the lock released.
    pub(crate) async fn check_client_health(&self) {
        let now = now_ts();
        let base = self.config.base_check_interval_sec as f64;

        let mut to_reset: Vec<Arc<BackendClient>> = Vec::new();
        let mut to_check: Vec<Arc<BackendClient>> = Vec::new();
        {
            let state = self.lock_state();
            for client in &state.clients {
                let snapshot = client.snapshot();
                if snapshot.acquired {
                    continue;
                }
                let timeout = check_timeout(base, snapshot.status, snapshot.error_count);
                let last_activity = snapshot.last_chat.max(snapshot.last_test);
                if now - last_activity > timeout {
                    if snapshot.status == ClientStatus::Unavailable {
                        to_reset.push(Arc::clone(client));
                    } else {
                        to_check.push(Arc::clone(client));
                    }
                }
            }
        }

        // A fatal client past the reset window gets one more chance: back to
        // Unknown, then probed like any other unknown client.
        for client in to_reset {
            info!(client = %client.name(), "resetting fatal client for re-probe");
            client.update_status(ClientStatus::Unknown);
            to_check.push(client);
        }

        for client in to_check {
            debug!(client = %client.name(), "probing connectivity");
            self.run_check(client).await;
        }
    }

    /// Lease the client, surface the probe in the user map as a synthetic
    /// caller, run the self-test, clean up.
    async fn run_check(&self, client: Arc<BackendClient>) {
        if !client.acquire() {
            debug!(client = %client.name(), "cannot acquire for health check");
            return;
        }

        let synthetic_caller = format!("[System Check] {}", client.name());
        {
            let mut state = self.lock_state();
            state.user_client_map.insert(
                synthetic_caller.clone(),
                Allocation {
                    client: Arc::clone(&client),
                    last_used: now_ts(),
                },
            );
        }

        let passed = client.test_and_update_status().await;
        if !passed {
            warn!(client = %client.name(), "health check failed");
        }

        {
            let mut state = self.lock_state();
            state.user_client_map.remove(&synthetic_caller);
        }
        client.release();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn release_caller(state: &mut ManagerState, caller_id: &str) {
    if let Some(allocation) = state.user_client_map.remove(caller_id) {
        allocation.client.release();
        debug!(caller = caller_id, client = %allocation.client.name(), "released client");
    }
}

/// Status-dependent probe timeout: stable clients wait 15× base, fatal ones
/// 30× base before the reset-to-unknown, erroring ones back off
/// exponentially (capped at 16× base), unknown ones are probed immediately.
pub(crate) fn check_timeout(base: f64, status: ClientStatus, error_count: u32) -> f64 {
    match status {
        ClientStatus::Available => base * 15.0,
        ClientStatus::Unavailable => base * 30.0,
        ClientStatus::Unknown => 0.0,
        ClientStatus::Error => base * f64::from(1u32 << error_count.min(4)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BackendClientConfig, ScriptedAdapter, UsageProbe};
    use crate::types::{ApiFailure, ChatMessage, ChatParams, ErrorKind};

    fn make_client(name: &str, priority: i32, group: &str) -> Arc<BackendClient> {
        Arc::new(BackendClient::new(
            BackendClientConfig {
                name: name.into(),
                priority,
                group_id: group.into(),
                default_available: true,
            },
            ScriptedAdapter::new(vec![]),
        ))
    }

    fn manager_with(clients: &[Arc<BackendClient>]) -> Arc<ClientManager> {
        let manager = Arc::new(ClientManager::new(ManagerConfig::default()));
        for client in clients {
            manager.register_client(Arc::clone(client));
        }
        manager
    }

    #[test]
    fn test_priority_order_and_stable_ties() {
        let a = make_client("a", 50, "default");
        let b = make_client("b", 50, "default");
        let c = make_client("c", 0, "default");
        let manager = manager_with(&[a, b, c]);

        // Lowest priority number first; ties resolve by registration order.
        let first = manager
            .get_available_client("u1", &SelectOptions::default())
            .unwrap();
        assert_eq!(first.name(), "c");
        let second = manager
            .get_available_client("u2", &SelectOptions::default())
            .unwrap();
        assert_eq!(second.name(), "a");
        let third = manager
            .get_available_client("u3", &SelectOptions::default())
            .unwrap();
        assert_eq!(third.name(), "b");
    }

    #[test]
    fn test_empty_caller_rejected() {
        let manager = manager_with(&[make_client("a", 0, "default")]);
        assert!(manager
            .get_available_client("", &SelectOptions::default())
            .is_none());
    }

    #[test]
    fn test_caller_keeps_holding_when_nothing_better() {
        let a = make_client("a", 0, "default");
        let b = make_client("b", 50, "default");
        let manager = manager_with(&[Arc::clone(&a), Arc::clone(&b)]);

        let held = manager
            .get_available_client("u1", &SelectOptions::default())
            .unwrap();
        assert_eq!(held.name(), "a");
        let again = manager
            .get_available_client("u1", &SelectOptions::default())
            .unwrap();
        assert_eq!(again.name(), "a");
        // Keeping the holding does not take a second lease.
        assert_eq!(a.snapshot().acquire_count, 1);
    }

    #[tokio::test]
    async fn test_single_failure_keeps_client_selectable() {
        // S1: one transient failure leaves the client in rotation; the
        // second failure filters it out.
        let a = make_client("a", 0, "default");
        let b = make_client("b", 50, "default");
        let manager = manager_with(&[Arc::clone(&a), Arc::clone(&b)]);

        let held = manager
            .get_available_client("u1", &SelectOptions::default())
            .unwrap();
        assert_eq!(held.name(), "a");

        a.complain_error("HTTP_503 from upstream");
        assert_eq!(a.status(), ClientStatus::Error);

        // error_count == 1: the holding is dropped (status Error) but `a`
        // still outranks `b` and passes the error filter.
        let retry = manager
            .get_available_client("u1", &SelectOptions::default())
            .unwrap();
        assert_eq!(retry.name(), "a");

        a.complain_error("HTTP_503 again");
        let after_second = manager
            .get_available_client("u1", &SelectOptions::default())
            .unwrap();
        assert_eq!(after_second.name(), "b");
    }

    #[test]
    fn test_group_saturation_and_swap() {
        // S3: limit 2 on group G; U3 is refused, U1 swaps within the group.
        let x = make_client("x", 0, "G");
        let y = make_client("y", 1, "G");
        let z = make_client("z", 2, "G");
        let manager = manager_with(&[Arc::clone(&x), Arc::clone(&y), Arc::clone(&z)]);
        manager.set_group_limit("G", 2);

        assert_eq!(
            manager
                .get_available_client("u1", &SelectOptions::default())
                .unwrap()
                .name(),
            "x"
        );
        assert_eq!(
            manager
                .get_available_client("u2", &SelectOptions::default())
                .unwrap()
                .name(),
            "y"
        );
        assert!(manager
            .get_available_client("u3", &SelectOptions::default())
            .is_none());

        let swapped = manager
            .get_available_client(
                "u1",
                &SelectOptions {
                    request_change: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(swapped.name(), "z");
        assert!(!x.is_acquired(), "old holding must be released");
        assert!(z.is_acquired());
        assert!(y.is_acquired());
    }

    #[test]
    fn test_group_limit_zero_blocks_acquisition() {
        let a = make_client("a", 0, "frozen");
        let manager = manager_with(&[a]);
        manager.set_group_limit("frozen", 0);
        assert!(manager
            .get_available_client("u1", &SelectOptions::default())
            .is_none());
    }

    #[test]
    fn test_request_change_cannot_overflow_other_group() {
        // The caller's holding lives in group H; swapping into a full group
        // G gets no exclusion credit.
        let h = make_client("h", 0, "H");
        let g1 = make_client("g1", 1, "G");
        let g2 = make_client("g2", 2, "G");
        let manager = manager_with(&[Arc::clone(&h), Arc::clone(&g1), Arc::clone(&g2)]);
        manager.set_group_limit("G", 1);

        manager.get_available_client("u1", &SelectOptions::default());
        manager
            .get_available_client(
                "u2",
                &SelectOptions {
                    target_group_id: Some("G".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let result = manager.get_available_client(
            "u1",
            &SelectOptions {
                request_change: true,
                target_group_id: Some("G".into()),
                ..Default::default()
            },
        );
        assert!(result.is_none(), "G is full; H holding gives no credit");
    }

    #[test]
    fn test_target_filters() {
        let a = make_client("a", 0, "one");
        let b = make_client("b", 50, "two");
        let manager = manager_with(&[a, b]);

        let by_name = manager
            .get_available_client(
                "u1",
                &SelectOptions {
                    target_client_name: Some("b".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_name.name(), "b");

        let by_group = manager
            .get_available_client(
                "u2",
                &SelectOptions {
                    target_group_id: Some("one".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_group.name(), "a");

        assert!(manager
            .get_available_client(
                "u3",
                &SelectOptions {
                    target_client_name: Some("missing".into()),
                    ..Default::default()
                },
            )
            .is_none());
    }

    #[test]
    fn test_busy_client_is_skipped() {
        let a = make_client("a", 0, "default");
        let b = make_client("b", 50, "default");
        a.force_in_use(true);
        let manager = manager_with(&[a, Arc::clone(&b)]);

        let picked = manager
            .get_available_client("u1", &SelectOptions::default())
            .unwrap();
        assert_eq!(picked.name(), "b");
    }

    #[test]
    fn test_zero_health_is_skipped() {
        struct Exhausted;
        impl UsageProbe for Exhausted {
            fn calculate_health(&self) -> f64 {
                0.0
            }
        }

        let drained = Arc::new(
            BackendClient::new(
                BackendClientConfig {
                    name: "drained".into(),
                    priority: 0,
                    group_id: "default".into(),
                    default_available: true,
                },
                ScriptedAdapter::new(vec![]),
            )
            .with_probe(Box::new(Exhausted)),
        );
        let healthy = make_client("healthy", 50, "default");
        let manager = manager_with(&[drained, Arc::clone(&healthy)]);

        let picked = manager
            .get_available_client("u1", &SelectOptions::default())
            .unwrap();
        assert_eq!(picked.name(), "healthy");
    }

    #[test]
    fn test_release_by_caller_and_by_client_name() {
        let a = make_client("a", 0, "default");
        let manager = manager_with(&[Arc::clone(&a)]);

        manager.get_available_client("u1", &SelectOptions::default());
        assert!(a.is_acquired());
        manager.release_client("u1");
        assert!(!a.is_acquired());

        manager.get_available_client("u2", &SelectOptions::default());
        assert!(a.is_acquired());
        manager.release_client("a");
        assert!(!a.is_acquired());
    }

    #[test]
    fn test_set_client_status_clears_errors_on_available() {
        let a = make_client("a", 0, "default");
        let manager = manager_with(&[Arc::clone(&a)]);

        a.complain_error("flaky");
        assert_eq!(a.snapshot().error_count, 1);

        assert!(manager.set_client_status("a", ClientStatus::Available));
        assert_eq!(a.status(), ClientStatus::Available);
        assert_eq!(a.snapshot().error_count, 0);

        assert!(!manager.set_client_status("ghost", ClientStatus::Error));
    }

    #[test]
    fn test_check_timeout_schedule() {
        // S6: error backoff doubles per failure and caps at 16x base.
        let base = 60.0;
        assert_eq!(check_timeout(base, ClientStatus::Unknown, 0), 0.0);
        assert_eq!(check_timeout(base, ClientStatus::Available, 0), 900.0);
        assert_eq!(check_timeout(base, ClientStatus::Unavailable, 0), 1800.0);
        assert_eq!(check_timeout(base, ClientStatus::Error, 0), 60.0);
        assert_eq!(check_timeout(base, ClientStatus::Error, 3), 480.0);
        assert_eq!(check_timeout(base, ClientStatus::Error, 4), 960.0);
        assert_eq!(check_timeout(base, ClientStatus::Error, 5), 960.0);
    }

    #[tokio::test]
    async fn test_health_tick_probes_unknown_client() {
        let fresh = Arc::new(BackendClient::new(
            BackendClientConfig {
                name: "fresh".into(),
                priority: 0,
                group_id: "default".into(),
                default_available: false,
            },
            ScriptedAdapter::new(vec![]),
        ));
        let manager = manager_with(&[Arc::clone(&fresh)]);
        assert_eq!(fresh.status(), ClientStatus::Unknown);

        manager.check_client_health().await;

        // Scripted adapter answers "OK": the probe promotes the client and
        // cleans up its synthetic lease.
        assert_eq!(fresh.status(), ClientStatus::Available);
        assert!(!fresh.is_acquired());
        assert!(fresh.snapshot().last_test > 0.0);
        let stats = manager.get_client_stats();
        assert_eq!(stats["summary"]["active_users"], 0);
    }

    #[tokio::test]
    async fn test_health_tick_resets_fatal_client() {
        let broken = make_client("broken", 0, "default");
        broken.update_status(ClientStatus::Unavailable);
        let manager = manager_with(&[Arc::clone(&broken)]);

        // No activity ever recorded, so the reset-fatal window has elapsed;
        // the tick resets to Unknown and immediately re-probes.
        manager.check_client_health().await;
        assert_eq!(broken.status(), ClientStatus::Available);
    }

    #[tokio::test]
    async fn test_health_tick_skips_leased_clients() {
        let held = make_client("held", 0, "default");
        let manager = manager_with(&[Arc::clone(&held)]);
        manager.get_available_client("u1", &SelectOptions::default());

        let before = held.snapshot().last_test;
        manager.check_client_health().await;
        assert_eq!(held.snapshot().last_test, before, "leased client untouched");
    }

    #[tokio::test]
    async fn test_manual_check_runs_in_background() {
        let fresh = Arc::new(BackendClient::new(
            BackendClientConfig {
                name: "fresh".into(),
                priority: 0,
                group_id: "default".into(),
                default_available: false,
            },
            ScriptedAdapter::new(vec![]),
        ));
        let manager = manager_with(&[Arc::clone(&fresh)]);

        assert!(manager.trigger_manual_check("fresh"));
        assert!(!manager.trigger_manual_check("ghost"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fresh.status(), ClientStatus::Available);
    }

    #[tokio::test]
    async fn test_degraded_chat_flow_swaps_clients() {
        // End-to-end S1 with real chat calls through scripted adapters.
        let a = Arc::new(BackendClient::new(
            BackendClientConfig {
                name: "a".into(),
                priority: 0,
                group_id: "default".into(),
                default_available: true,
            },
            ScriptedAdapter::new(vec![
                Err(ApiFailure::new(
                    ErrorKind::TransientServer,
                    "HTTP_503",
                    "overloaded",
                )),
                Err(ApiFailure::new(
                    ErrorKind::TransientServer,
                    "HTTP_503",
                    "still overloaded",
                )),
            ]),
        ));
        let b = make_client("b", 50, "default");
        let manager = manager_with(&[Arc::clone(&a), Arc::clone(&b)]);

        let held = manager
            .get_available_client("u", &SelectOptions::default())
            .unwrap();
        let err = held
            .chat(&[ChatMessage::user("hi")], ChatParams::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.api_error_code.as_deref(), Some("HTTP_503"));
        assert_eq!(a.snapshot().error_count, 1);

        // First failure: A is still preferred.
        let again = manager
            .get_available_client("u", &SelectOptions::default())
            .unwrap();
        assert_eq!(again.name(), "a");
        let _ = again
            .chat(&[ChatMessage::user("hi")], ChatParams::default(), false)
            .await;
        assert_eq!(a.snapshot().error_count, 2);

        // Second failure crosses the threshold: B takes over.
        let fallback = manager
            .get_available_client("u", &SelectOptions::default())
            .unwrap();
        assert_eq!(fallback.name(), "b");
    }

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let manager = manager_with(&[make_client("a", 0, "default")]);
        manager.start_monitoring();
        // Double start is a no-op.
        manager.start_monitoring();
        manager.stop_monitoring().await;
    }

    #[test]
    fn test_stats_summary_shape() {
        let a = make_client("a", 0, "G");
        let manager = manager_with(&[Arc::clone(&a)]);
        manager.set_group_limit("G", 3);
        manager.get_available_client("u1", &SelectOptions::default());

        let stats = manager.get_client_stats();
        assert_eq!(stats["summary"]["total_clients"], 1);
        assert_eq!(stats["summary"]["available"], 1);
        assert_eq!(stats["summary"]["busy"], 0);
        assert_eq!(stats["summary"]["active_users"], 1);
        assert_eq!(stats["summary"]["group_limits"]["G"], 3);

        let client = &stats["clients"][0];
        assert_eq!(client["meta"]["name"], "a");
        assert_eq!(client["allocation"]["held_by"], "u1");
        assert_eq!(client["runtime_stats"]["acquire_count"], 1);
    }
}
