//! The running pipeline: evaluation loops, the grouping consumer, the flush
//! timer and the dispatcher, all reading one active [`ConfigSnapshot`].

use crate::config::EngineConfig;
use crate::snapshot::ConfigSnapshot;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use metrics::gauge;
use oxwatch_alert::evaluator::{RuleEvaluator, RuleHealth};
use oxwatch_alert::state::{AlertStateMachine, Transition};
use oxwatch_alert::MetricsSource;
use oxwatch_common::types::{Alert, AlertState};
use oxwatch_notify::dispatch::{DispatchConfig, Dispatcher, NotificationRecord, ReceiverHealth};
use oxwatch_notify::grouping::{GroupSnapshot, GroupingEngine};
use oxwatch_notify::silence::{SilenceSource, Suppression, Suppressor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// An alert as exported over the API, with its current suppression state.
#[derive(Debug, Clone, Serialize)]
pub struct AlertView {
    #[serde(flatten)]
    pub alert: Alert,
    pub suppressed: Option<Suppression>,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub config_version: u64,
    pub config_loaded_at: DateTime<Utc>,
    pub rules: usize,
    pub alerts: usize,
    pub groups: usize,
    pub notifications_in_flight: usize,
    pub invariant_violations: u64,
    pub rule_health: Vec<RuleHealth>,
    pub receivers: Vec<ReceiverHealth>,
    /// Some rule is degraded or some receiver is stuck.
    pub degraded: bool,
}

pub struct Engine {
    snapshot: ArcSwap<ConfigSnapshot>,
    settings: EngineConfig,
    evaluator: RuleEvaluator,
    states: AlertStateMachine,
    grouping: Mutex<GroupingEngine>,
    dispatcher: Dispatcher,
    silences: Arc<dyn SilenceSource>,
    /// Held shared while evaluation results are applied, exclusively while a
    /// reload retires rules or resolved alerts are purged.
    apply_gate: RwLock<()>,
    transitions: mpsc::Sender<Transition>,
    inbox: Mutex<Option<mpsc::Receiver<Transition>>>,
    started: AtomicBool,
    loops: Mutex<HashMap<u64, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Builds the engine around an initial snapshot. Must be called from
    /// within a Tokio runtime; nothing runs until [`Engine::start`].
    pub fn new(
        snapshot: ConfigSnapshot,
        source: Arc<dyn MetricsSource>,
        silences: Arc<dyn SilenceSource>,
        settings: EngineConfig,
        dispatch: DispatchConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(settings.transition_queue_capacity.max(1));
        let evaluator =
            RuleEvaluator::new(source, settings.evaluation_timeout()).with_degraded_after(settings.degraded_after);
        let dispatcher = Dispatcher::new(dispatch, snapshot.channels.clone());
        let states = AlertStateMachine::new(settings.resolve_retention());

        tracing::info!(
            version = snapshot.version,
            rules = snapshot.rules.len(),
            receivers = snapshot.channels.len(),
            "Engine initialized"
        );

        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            settings,
            evaluator,
            states,
            grouping: Mutex::new(GroupingEngine::new()),
            dispatcher,
            silences,
            apply_gate: RwLock::new(()),
            transitions: tx,
            inbox: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
            loops: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Evaluates every rule of one interval concurrently at `now` and feeds
    /// the results into the state machine.
    pub async fn evaluate_interval(self: &Arc<Self>, interval_secs: u64, now: DateTime<Utc>) {
        let snapshot = self.snapshot.load_full();
        let mut set = JoinSet::new();
        for rule in snapshot.rules.with_interval(interval_secs) {
            let engine = self.clone();
            let rule = rule.clone();
            set.spawn(async move {
                let evaluation = engine.evaluator.evaluate(&rule, now).await;
                (rule, evaluation)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (rule, evaluation) = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(interval_secs, error = %e, "Evaluation task failed");
                    continue;
                }
            };

            let _gate = self.apply_gate.read().await;
            let still_scheduled = self
                .snapshot
                .load()
                .rules
                .get(&rule.id)
                .is_some_and(|current| current.interval_secs == interval_secs);
            if !still_scheduled {
                tracing::debug!(rule_id = %rule.id, "Rule changed during evaluation, result dropped");
                continue;
            }
            let transitions = self.states.apply(&rule, &evaluation);
            self.publish(transitions).await;
        }
    }

    /// Applies transitions to the grouping engine in order.
    pub fn ingest(&self, transitions: &[Transition]) {
        if transitions.is_empty() {
            return;
        }
        let snapshot = self.snapshot.load();
        let mut grouping = self.lock_grouping();
        for transition in transitions {
            grouping.handle(transition, &snapshot.router);
        }
        gauge!("oxwatch_groups").set(grouping.len() as f64);
    }

    /// Sends transitions to the grouping consumer once started; before that
    /// they are applied inline.
    async fn publish(&self, transitions: Vec<Transition>) {
        if transitions.is_empty() {
            return;
        }
        if !self.started.load(Ordering::Acquire) {
            self.ingest(&transitions);
            return;
        }
        for transition in transitions {
            if self.transitions.send(transition).await.is_err() {
                tracing::warn!("Transition queue closed, dropping transitions");
                return;
            }
        }
    }

    /// Drops resolved alerts past the retention window.
    ///
    /// Runs with the apply gate held exclusively, so a purge and an
    /// evaluation of the same fingerprint publish in the order they mutate
    /// the state machine.
    pub async fn purge(&self, now: DateTime<Utc>) {
        let _gate = self.apply_gate.write().await;
        let transitions = self.states.purge(now);
        self.publish(transitions).await;
    }

    /// Flushes every group due at `now` and hands the plans to the
    /// dispatcher. Returns the number of deliveries queued.
    ///
    /// If the silence source fails the flush is postponed: due timers stay
    /// queued and fire on the next call.
    pub async fn flush(&self, now: DateTime<Utc>) -> usize {
        let silences = match self.silences.list_active(now).await {
            Ok(silences) => silences,
            Err(e) => {
                tracing::warn!(error = %e, "Silence source unavailable, flush postponed");
                return 0;
            }
        };
        let snapshot = self.snapshot.load_full();
        let firing = self.states.firing();

        let plans = {
            let suppressor = Suppressor::new(&silences, &snapshot.inhibit_rules, &firing, now);
            let mut grouping = self.lock_grouping();
            grouping.flush_due(now, |fp| self.states.get(fp), &suppressor)
        };

        let mut queued = 0;
        for plan in &plans {
            queued += self.dispatcher.submit(plan, now);
        }
        queued
    }

    /// One full synchronous cycle at `now`: every interval is evaluated,
    /// resolved alerts are purged and due groups flushed. Used where time is
    /// driven externally.
    pub async fn step(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let intervals = self.snapshot.load().rules.intervals();
        for secs in intervals {
            self.evaluate_interval(secs, now).await;
        }
        self.purge(now).await;
        self.flush(now).await
    }

    /// Spawns the grouping consumer, the flush timer and one evaluation loop
    /// per interval. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(mut rx) = self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            tracing::warn!("Engine already started");
            return;
        };
        self.started.store(true, Ordering::Release);

        let consumer = {
            let engine = self.clone();
            tokio::spawn(async move {
                while let Some(first) = rx.recv().await {
                    let mut batch = vec![first];
                    while let Ok(next) = rx.try_recv() {
                        batch.push(next);
                    }
                    engine.ingest(&batch);
                }
            })
        };

        let timer = {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(engine.settings.flush_tick());
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    let now = Utc::now();
                    engine.purge(now).await;
                    engine.flush(now).await;
                    engine.record_gauges();
                }
            })
        };

        self.lock_tasks().extend([consumer, timer]);
        self.sync_loops();
        tracing::info!(flush_tick_ms = self.settings.flush_tick_millis, "Engine started");
    }

    /// Spawns evaluation loops for intervals that have none. Loops for
    /// intervals that lost all their rules stop themselves on their next
    /// tick.
    fn sync_loops(self: &Arc<Self>) {
        let intervals = self.snapshot.load().rules.intervals();
        let mut loops = self.lock_loops();
        loops.retain(|_, handle| !handle.is_finished());
        for secs in intervals {
            if loops.contains_key(&secs) {
                continue;
            }
            let engine = self.clone();
            loops.insert(secs, tokio::spawn(async move { engine.run_interval(secs).await }));
            tracing::info!(interval_secs = secs, "Evaluation loop started");
        }
    }

    async fn run_interval(self: Arc<Self>, secs: u64) {
        let mut tick = interval(Duration::from_secs(secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            {
                let mut loops = self.lock_loops();
                if !self.snapshot.load().rules.intervals().contains(&secs) {
                    loops.remove(&secs);
                    tracing::info!(interval_secs = secs, "Evaluation loop stopped, no rules left");
                    return;
                }
            }
            self.evaluate_interval(secs, Utc::now()).await;
        }
    }

    /// Makes `snapshot` the active configuration.
    ///
    /// Alerts of removed rules resolve, groups are re-placed on the new route
    /// tree (groups that no longer exist are dropped along with their
    /// delivery records) and evaluation loops follow the new intervals.
    pub async fn reload(self: &Arc<Self>, snapshot: ConfigSnapshot, now: DateTime<Utc>) {
        let version = snapshot.version;
        let rules = snapshot.rules.len();
        {
            let _gate = self.apply_gate.write().await;
            self.dispatcher.set_channels(snapshot.channels.clone());
            self.snapshot.store(Arc::new(snapshot));
            let current = self.snapshot.load_full();

            let active = current.rules.ids();
            self.evaluator.retain_rules(&active);
            // Placement uses the alerts firing before retirement so retired
            // alerts still leave their groups with a resolve notification.
            let firing = self.states.firing();
            let retired = self.states.retire_rules(&active, now);

            let dropped = self.lock_grouping().reroute(&current.router, &firing, now);
            for group_id in &dropped {
                self.dispatcher.forget_group(group_id);
            }
            self.publish(retired).await;
        }

        if self.started.load(Ordering::Acquire) {
            self.sync_loops();
        }
        tracing::info!(version, rules, "Configuration reloaded");
    }

    /// Every tracked alert with its suppression state at `now`.
    pub async fn alerts(&self, now: DateTime<Utc>) -> Vec<AlertView> {
        let silences = match self.silences.list_active(now).await {
            Ok(silences) => silences,
            Err(e) => {
                tracing::warn!(error = %e, "Silence source unavailable, reporting without silences");
                Vec::new()
            }
        };
        let snapshot = self.snapshot.load_full();
        let firing = self.states.firing();
        let suppressor = Suppressor::new(&silences, &snapshot.inhibit_rules, &firing, now);
        let grouping = self.lock_grouping();

        self.states
            .snapshot()
            .into_iter()
            .map(|alert| AlertView {
                suppressed: suppressor.check(&alert),
                groups: grouping.groups_of(&alert.fingerprint),
                alert,
            })
            .collect()
    }

    pub fn groups(&self) -> Vec<GroupSnapshot> {
        self.lock_grouping().groups()
    }

    pub fn notification_records(&self) -> Vec<NotificationRecord> {
        self.dispatcher.records()
    }

    pub fn health(&self) -> EngineHealth {
        let snapshot = self.snapshot.load();
        let rule_health = self.evaluator.health_snapshot();
        let receivers = self.dispatcher.receiver_health();
        let degraded = rule_health.iter().any(|h| h.degraded) || receivers.iter().any(|r| r.stuck);
        EngineHealth {
            config_version: snapshot.version,
            config_loaded_at: snapshot.loaded_at,
            rules: snapshot.rules.len(),
            alerts: self.states.len(),
            groups: self.lock_grouping().len(),
            notifications_in_flight: self.dispatcher.in_flight(),
            invariant_violations: self.states.violations(),
            rule_health,
            receivers,
            degraded,
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    pub fn states(&self) -> &AlertStateMachine {
        &self.states
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Aborts every background task. Deliveries already handed to receiver
    /// workers are not waited for.
    pub fn stop(&self) {
        for handle in self.lock_tasks().drain(..) {
            handle.abort();
        }
        for (_, handle) in self.lock_loops().drain() {
            handle.abort();
        }
        tracing::info!("Engine stopped");
    }

    fn record_gauges(&self) {
        let mut counts: HashMap<AlertState, usize> = HashMap::new();
        for alert in self.states.snapshot() {
            *counts.entry(alert.state).or_default() += 1;
        }
        for state in [AlertState::Pending, AlertState::Firing, AlertState::Resolved] {
            gauge!("oxwatch_alerts", "state" => state.to_string())
                .set(counts.get(&state).copied().unwrap_or(0) as f64);
        }
        gauge!("oxwatch_config_version").set(self.snapshot.load().version as f64);
    }

    fn lock_grouping(&self) -> MutexGuard<'_, GroupingEngine> {
        self.grouping.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_loops(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
