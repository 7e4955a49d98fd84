//! At-least-once delivery of group flushes to receivers.
//!
//! Every receiver has one worker task fed by a bounded queue, so deliveries
//! to the same receiver are serialized while different receivers proceed
//! concurrently. Delivery state lives in one [`NotificationRecord`] per
//! (group, receiver); a retry loop stops as soon as its record is superseded
//! by a newer payload or removed together with its group. All-clear
//! deliveries are the exception: their group is already gone, so they run
//! to completion even if a group with the same id reappears meanwhile.
//!
//! Enqueueing never waits. A receiver whose queue is full gets its record
//! marked failed without an attempt, and the next flush of the group
//! offers the payload again.

use crate::grouping::FlushPlan;
use crate::plugin::ChannelMap;
use crate::{DeliveryError, Notification, NotificationStatus};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub send_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl DispatchConfig {
    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub group_id: String,
    pub receiver: String,
    pub batch_id: String,
    pub last_sent_at: DateTime<Utc>,
    pub last_delivered_at: Option<DateTime<Utc>>,
    pub last_hash: String,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Bumped on every new payload; a retry loop holding an older value
    /// has been superseded.
    pub sequence: u64,
    pub all_clear: bool,
}

/// Per-receiver delivery summary. A receiver is stuck while any of its
/// records is in the failed state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverHealth {
    pub receiver: String,
    pub pending: usize,
    pub delivered: usize,
    pub failed: usize,
    pub stuck: bool,
    pub last_error: Option<String>,
}

type RecordKey = (String, String);

struct DeliveryJob {
    key: RecordKey,
    sequence: u64,
    notification: Arc<Notification>,
    all_clear: bool,
}

struct Inner {
    config: DispatchConfig,
    channels: ArcSwap<ChannelMap>,
    records: DashMap<RecordKey, NotificationRecord>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Inner {
    fn finish_job(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Runs `f` on the record if it still belongs to `sequence`.
    fn update_current(&self, key: &RecordKey, sequence: u64, f: impl FnOnce(&mut NotificationRecord)) -> bool {
        match self.records.get_mut(key) {
            Some(mut record) if record.sequence == sequence => {
                f(&mut record);
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, key: &RecordKey, sequence: u64) -> bool {
        self.records
            .get(key)
            .is_some_and(|record| record.sequence == sequence)
    }
}

/// Hands flush plans to per-receiver workers and tracks delivery records.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    workers: Arc<Mutex<HashMap<String, mpsc::Sender<DeliveryJob>>>>,
}

impl Dispatcher {
    /// Creates the dispatcher and spawns a worker per channel. Must be called
    /// from within a Tokio runtime.
    pub fn new(config: DispatchConfig, channels: ChannelMap) -> Self {
        let dispatcher = Self {
            inner: Arc::new(Inner {
                config,
                channels: ArcSwap::from_pointee(ChannelMap::new()),
                records: DashMap::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            workers: Arc::new(Mutex::new(HashMap::new())),
        };
        dispatcher.set_channels(channels);
        dispatcher
    }

    /// Replaces the channel set. New receivers get a worker; workers of
    /// removed receivers exit once their queue drains, and their queued
    /// jobs fail permanently.
    pub fn set_channels(&self, channels: ChannelMap) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.retain(|name, _| channels.contains_key(name));
        for name in channels.keys() {
            if workers.contains_key(name) {
                continue;
            }
            let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity);
            tokio::spawn(run_worker(self.inner.clone(), name.clone(), rx));
            workers.insert(name.clone(), tx);
        }
        self.inner.channels.store(Arc::new(channels));
    }

    /// Decides per receiver whether the plan is owed a delivery and queues
    /// it. Returns the number of deliveries queued.
    ///
    /// A delivery is owed when the receiver has never been notified for the
    /// group, the firing content changed, resolved alerts are included, or
    /// `repeat_interval` has elapsed since the last send. An all-clear plan
    /// only goes to receivers that were notified before.
    pub fn submit(&self, plan: &FlushPlan, now: DateTime<Utc>) -> usize {
        let mut queued = 0;
        for receiver in &plan.receivers {
            let key = (plan.group_id.clone(), receiver.clone());
            let Some(sequence) = self.claim(&key, plan, now) else {
                continue;
            };

            let batch_id = oxwatch_common::id::next_prefixed("batch");
            self.inner.update_current(&key, sequence, |r| r.batch_id = batch_id.clone());

            let notification = Arc::new(Notification {
                batch_id,
                receiver: receiver.clone(),
                group_id: plan.group_id.clone(),
                group_key: plan.group_key.clone(),
                status: if plan.alerts.iter().any(|a| a.status == NotificationStatus::Firing) {
                    NotificationStatus::Firing
                } else {
                    NotificationStatus::Resolved
                },
                alerts: plan.alerts.clone(),
                created_at: now,
            });

            let sender = {
                let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
                workers.get(receiver).cloned()
            };
            let job = DeliveryJob {
                key: key.clone(),
                sequence,
                notification,
                all_clear: plan.all_clear,
            };

            self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
            let rejected = match sender {
                Some(tx) => match tx.try_send(job) {
                    Ok(()) => None,
                    Err(TrySendError::Full(_)) => Some(format!("receiver '{receiver}' queue is full")),
                    Err(TrySendError::Closed(_)) => Some(format!("receiver '{receiver}' is not configured")),
                },
                None => Some(format!("receiver '{receiver}' is not configured")),
            };
            if let Some(reason) = rejected {
                self.inner.finish_job();
                self.inner.update_current(&key, sequence, |r| {
                    r.status = DeliveryStatus::Failed;
                    r.last_error = Some(reason.clone());
                });
                counter!("oxwatch_notifications_rejected_total", "receiver" => receiver.clone()).increment(1);
                tracing::error!(group_id = %plan.group_id, receiver = %receiver, reason = %reason, "Notification not queued");
                continue;
            }
            queued += 1;
        }
        queued
    }

    /// Applies the send decision and, when a delivery is owed, installs the
    /// new record generation and returns its sequence.
    fn claim(&self, key: &RecordKey, plan: &FlushPlan, now: DateTime<Utc>) -> Option<u64> {
        if plan.all_clear {
            let mut record = self.inner.records.get_mut(key)?;
            record.sequence += 1;
            reset_for_send(&mut record, plan, now);
            return Some(record.sequence);
        }

        if plan.alerts.is_empty() {
            // Everything suppressed this cycle.
            return None;
        }

        match self.inner.records.get_mut(key) {
            Some(mut record) => {
                // A record left by an all-clear belongs to a previous group
                // with this id; one rejected before any attempt still owes
                // its payload.
                let stale = record.all_clear;
                let never_attempted = record.status == DeliveryStatus::Failed && record.attempts == 0;
                let changed = record.last_hash != plan.firing_hash;
                let repeat_due = now - record.last_sent_at >= plan.policy.repeat_interval();
                if !(stale || never_attempted || changed || plan.has_resolved || repeat_due) {
                    tracing::debug!(group_id = %key.0, receiver = %key.1, "Unchanged within repeat interval, skipped");
                    return None;
                }
                record.sequence += 1;
                reset_for_send(&mut record, plan, now);
                Some(record.sequence)
            }
            None => {
                let mut record = NotificationRecord {
                    group_id: key.0.clone(),
                    receiver: key.1.clone(),
                    batch_id: String::new(),
                    last_sent_at: now,
                    last_delivered_at: None,
                    last_hash: String::new(),
                    attempts: 0,
                    next_retry_at: None,
                    status: DeliveryStatus::Pending,
                    consecutive_failures: 0,
                    last_error: None,
                    sequence: 1,
                    all_clear: false,
                };
                reset_for_send(&mut record, plan, now);
                self.inner.records.insert(key.clone(), record);
                Some(1)
            }
        }
    }

    /// Drops every record of a group, aborting its in-flight retries.
    pub fn forget_group(&self, group_id: &str) {
        self.inner.records.retain(|(gid, _), _| gid != group_id);
    }

    /// Resolves once no delivery is queued or in progress.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn record(&self, group_id: &str, receiver: &str) -> Option<NotificationRecord> {
        self.inner
            .records
            .get(&(group_id.to_string(), receiver.to_string()))
            .map(|r| r.clone())
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        let mut out: Vec<NotificationRecord> = self.inner.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| a.group_id.cmp(&b.group_id).then_with(|| a.receiver.cmp(&b.receiver)));
        out
    }

    pub fn receiver_health(&self) -> Vec<ReceiverHealth> {
        let mut health: BTreeMap<String, ReceiverHealth> = self
            .inner
            .channels
            .load()
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    ReceiverHealth {
                        receiver: name.clone(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        for record in self.inner.records.iter() {
            let entry = health.entry(record.receiver.clone()).or_insert_with(|| ReceiverHealth {
                receiver: record.receiver.clone(),
                ..Default::default()
            });
            match record.status {
                DeliveryStatus::Pending => entry.pending += 1,
                DeliveryStatus::Delivered => entry.delivered += 1,
                DeliveryStatus::Failed => {
                    entry.failed += 1;
                    entry.stuck = true;
                }
            }
            if record.last_error.is_some() {
                entry.last_error = record.last_error.clone();
            }
        }
        health.into_values().collect()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

fn reset_for_send(record: &mut NotificationRecord, plan: &FlushPlan, now: DateTime<Utc>) {
    record.last_sent_at = now;
    record.last_hash = plan.firing_hash.clone();
    record.attempts = 0;
    record.next_retry_at = None;
    record.status = DeliveryStatus::Pending;
    record.all_clear = plan.all_clear;
}

async fn run_worker(inner: Arc<Inner>, receiver: String, mut rx: mpsc::Receiver<DeliveryJob>) {
    tracing::debug!(receiver = %receiver, "Delivery worker started");
    while let Some(job) = rx.recv().await {
        deliver(&inner, &job).await;
        if job.all_clear {
            // The group is gone; its record only lived for this delivery.
            inner.records.remove_if(&job.key, |_, r| r.sequence == job.sequence);
        }
        inner.finish_job();
    }
    tracing::debug!(receiver = %receiver, "Delivery worker stopped");
}

async fn deliver(inner: &Inner, job: &DeliveryJob) {
    let (group_id, receiver) = (&job.key.0, &job.key.1);
    let config = &inner.config;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if !job.all_clear && !inner.is_current(&job.key, job.sequence) {
            tracing::debug!(group_id = %group_id, receiver = %receiver, "Delivery superseded, abandoning");
            counter!("oxwatch_notifications_superseded_total").increment(1);
            return;
        }

        let channel = inner.channels.load().get(receiver).cloned();
        let channel_type = channel.as_ref().map_or("unknown", |c| c.channel_type()).to_string();
        let result = match channel {
            Some(channel) => match tokio::time::timeout(config.send_timeout, channel.send(&job.notification)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Retryable(format!(
                    "send timed out after {}ms",
                    config.send_timeout.as_millis()
                ))),
            },
            None => Err(DeliveryError::Permanent(format!("receiver '{receiver}' is not configured"))),
        };

        match result {
            Ok(()) => {
                inner.update_current(&job.key, job.sequence, |r| {
                    r.attempts = attempt;
                    r.status = DeliveryStatus::Delivered;
                    r.last_delivered_at = Some(Utc::now());
                    r.next_retry_at = None;
                    r.consecutive_failures = 0;
                    r.last_error = None;
                });
                counter!("oxwatch_notifications_sent_total", "receiver" => receiver.clone()).increment(1);
                tracing::info!(
                    group_id = %group_id,
                    receiver = %receiver,
                    channel_type = %channel_type,
                    batch_id = %job.notification.batch_id,
                    alerts = job.notification.alerts.len(),
                    attempt,
                    "Notification delivered"
                );
                update_stuck_gauge(inner, receiver);
                return;
            }
            Err(err) => {
                let give_up = !err.is_retryable() || attempt >= config.max_attempts;
                let backoff = config.backoff(attempt);
                inner.update_current(&job.key, job.sequence, |r| {
                    r.attempts = attempt;
                    r.consecutive_failures += 1;
                    r.last_error = Some(err.to_string());
                    if give_up {
                        r.status = DeliveryStatus::Failed;
                        r.next_retry_at = None;
                    } else {
                        r.next_retry_at = chrono::Duration::from_std(backoff).ok().map(|d| Utc::now() + d);
                    }
                });

                if give_up {
                    counter!("oxwatch_notifications_failed_total", "receiver" => receiver.clone()).increment(1);
                    tracing::error!(
                        group_id = %group_id,
                        receiver = %receiver,
                        channel_type = %channel_type,
                        batch_id = %job.notification.batch_id,
                        attempt,
                        error = %err,
                        "Notification delivery failed permanently"
                    );
                    update_stuck_gauge(inner, receiver);
                    return;
                }

                counter!("oxwatch_notification_retries_total", "receiver" => receiver.clone()).increment(1);
                tracing::warn!(
                    group_id = %group_id,
                    receiver = %receiver,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Notification delivery failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn update_stuck_gauge(inner: &Inner, receiver: &str) {
    let stuck = inner
        .records
        .iter()
        .filter(|r| r.receiver == receiver && r.status == DeliveryStatus::Failed)
        .count();
    gauge!("oxwatch_notifications_stuck", "receiver" => receiver.to_string()).set(stuck as f64);
}
