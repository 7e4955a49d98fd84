//! Alert groups and their flush timers.
//!
//! A group is identified by the route that handles its alerts and the
//! projection of their labels onto that route's `group_by`. Groups only
//! change on state transitions: repeated evaluations of a firing alert never
//! reach this module.

use crate::routing::{Route, RoutePolicy, Router};
use crate::silence::Suppressor;
use crate::timer::TimerQueue;
use crate::NotifiedAlert;
use chrono::{DateTime, Utc};
use oxwatch_alert::state::{Transition, TransitionKind};
use oxwatch_common::types::{Alert, Fingerprint, LabelSet};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub struct Group {
    pub id: String,
    pub route_id: String,
    pub key: LabelSet,
    pub receivers: Vec<String>,
    pub policy: RoutePolicy,
    /// Fingerprints of the firing alerts currently in the group.
    pub members: BTreeSet<Fingerprint>,
    /// Alerts that left the group since the last flush.
    resolved: BTreeMap<Fingerprint, Alert>,
    pub created_at: DateTime<Utc>,
    pub next_flush_at: DateTime<Utc>,
    /// Whether the group has flushed at least once (`group_wait` is over).
    pub flushed: bool,
    version: u64,
}

impl Group {
    fn new(route: &Route, key: LabelSet, now: DateTime<Utc>) -> Self {
        Self {
            id: group_id(&route.id, &key),
            route_id: route.id.clone(),
            key,
            receivers: route.receivers.clone(),
            policy: route.policy.clone(),
            members: BTreeSet::new(),
            resolved: BTreeMap::new(),
            created_at: now,
            next_flush_at: now + route.policy.group_wait(),
            flushed: false,
            version: 0,
        }
    }

    /// Emptied by resolution with a resolve or all-clear still to send.
    fn owes_final_flush(&self) -> bool {
        self.members.is_empty() && (self.flushed || !self.resolved.is_empty())
    }

    fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            id: self.id.clone(),
            route_id: self.route_id.clone(),
            key: self.key.clone(),
            receivers: self.receivers.clone(),
            members: self.members.iter().copied().collect(),
            pending_resolved: self.resolved.keys().copied().collect(),
            created_at: self.created_at,
            next_flush_at: self.next_flush_at,
            flushed: self.flushed,
        }
    }
}

/// Read-only view of a group for the export API.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub id: String,
    pub route_id: String,
    pub key: LabelSet,
    pub receivers: Vec<String>,
    pub members: Vec<Fingerprint>,
    pub pending_resolved: Vec<Fingerprint>,
    pub created_at: DateTime<Utc>,
    pub next_flush_at: DateTime<Utc>,
    pub flushed: bool,
}

/// What a group flush hands to the dispatcher.
#[derive(Debug, Clone)]
pub struct FlushPlan {
    pub group_id: String,
    pub group_key: LabelSet,
    pub route_id: String,
    pub receivers: Vec<String>,
    pub policy: RoutePolicy,
    /// Unsuppressed firing alerts followed by alerts resolved since the
    /// previous flush.
    pub alerts: Vec<NotifiedAlert>,
    /// Hash of the firing fingerprints in `alerts`.
    pub firing_hash: String,
    pub has_resolved: bool,
    /// The group has no members left and is destroyed by this flush.
    pub all_clear: bool,
}

/// Stable group id: `<route id>:<fingerprint of the grouping key>`.
pub fn group_id(route_id: &str, key: &LabelSet) -> String {
    format!("{route_id}:{}", Fingerprint::from_labels(key))
}

/// Order-independent hash over a set of fingerprints.
pub fn content_hash<'a>(fingerprints: impl IntoIterator<Item = &'a Fingerprint>) -> String {
    let sorted: BTreeSet<&Fingerprint> = fingerprints.into_iter().collect();
    let mut hasher = Sha256::new();
    for fp in sorted {
        hasher.update(fp.as_u64().to_be_bytes());
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Group table plus the timer queue that drives flushes. Owned by the single
/// grouping consumer, so it needs no internal locking.
#[derive(Debug, Default)]
pub struct GroupingEngine {
    groups: HashMap<String, Group>,
    by_fingerprint: HashMap<Fingerprint, BTreeSet<String>>,
    timers: TimerQueue,
}

impl GroupingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one state transition. Pending and discarded transitions are
    /// ignored since no notification is owed for them.
    pub fn handle(&mut self, transition: &Transition, router: &Router) {
        match transition.kind {
            TransitionKind::Firing => self.join(&transition.alert, router, transition.at),
            TransitionKind::Resolved => self.leave(&transition.alert, true),
            TransitionKind::Purged => self.leave(&transition.alert, false),
            TransitionKind::Pending | TransitionKind::Discarded => {}
        }
    }

    fn join(&mut self, alert: &Alert, router: &Router, now: DateTime<Utc>) {
        for route in router.match_routes(&alert.labels) {
            let key = route.policy.group_by.key(&alert.labels);
            self.join_route(alert.fingerprint, route, key, now);
        }
    }

    fn join_route(&mut self, fp: Fingerprint, route: &Route, key: LabelSet, now: DateTime<Utc>) {
        let id = group_id(&route.id, &key);
        let mut created = false;
        let group = self.groups.entry(id.clone()).or_insert_with(|| {
            created = true;
            Group::new(route, key, now)
        });

        group.resolved.remove(&fp);
        let joined = group.members.insert(fp);
        if created {
            tracing::debug!(group_id = %group.id, route_id = %group.route_id, "Group created");
            self.timers.schedule(group.next_flush_at, &group.id, group.version);
        } else if joined && !group.flushed {
            // Still waiting for the first notification: restart group_wait.
            group.version += 1;
            group.next_flush_at = now + group.policy.group_wait();
            self.timers.schedule(group.next_flush_at, &group.id, group.version);
        }
        self.by_fingerprint.entry(fp).or_default().insert(id);
    }

    fn leave(&mut self, alert: &Alert, notify_resolved: bool) {
        let Some(group_ids) = self.by_fingerprint.remove(&alert.fingerprint) else {
            return;
        };
        for id in group_ids {
            if let Some(group) = self.groups.get_mut(&id) {
                group.members.remove(&alert.fingerprint);
                if notify_resolved {
                    group.resolved.insert(alert.fingerprint, alert.clone());
                }
            }
        }
    }

    /// Flushes every group whose timer is due at `now`.
    ///
    /// `lookup` returns the current record for a member fingerprint. Groups
    /// left without members produce an all-clear plan and are removed;
    /// others are rescheduled after `group_interval`.
    pub fn flush_due<F>(&mut self, now: DateTime<Utc>, lookup: F, suppressor: &Suppressor<'_>) -> Vec<FlushPlan>
    where
        F: Fn(&Fingerprint) -> Option<Alert>,
    {
        let mut plans = Vec::new();
        for entry in self.timers.pop_due(now) {
            let Some(group) = self.groups.get_mut(&entry.group_id) else {
                continue;
            };
            if group.version != entry.version {
                continue;
            }

            let firing: Vec<NotifiedAlert> = group
                .members
                .iter()
                .filter_map(&lookup)
                .filter(|alert| alert.is_firing() && !suppressor.is_suppressed(alert))
                .map(|alert| NotifiedAlert::from_alert(&alert))
                .collect();
            let resolved: Vec<NotifiedAlert> = if group.policy.send_resolved {
                group
                    .resolved
                    .values()
                    .filter(|alert| !suppressor.is_suppressed(alert))
                    .map(NotifiedAlert::from_alert)
                    .collect()
            } else {
                Vec::new()
            };

            let firing_hash = content_hash(firing.iter().map(|a| &a.fingerprint));
            let has_resolved = !resolved.is_empty();
            let all_clear = group.members.is_empty();
            let mut alerts = firing;
            alerts.extend(resolved);

            group.resolved.clear();
            group.flushed = true;

            plans.push(FlushPlan {
                group_id: group.id.clone(),
                group_key: group.key.clone(),
                route_id: group.route_id.clone(),
                receivers: group.receivers.clone(),
                policy: group.policy.clone(),
                alerts,
                firing_hash,
                has_resolved,
                all_clear,
            });

            if all_clear {
                tracing::debug!(group_id = %entry.group_id, "Group emptied, removing");
                self.groups.remove(&entry.group_id);
            } else {
                group.next_flush_at = now + group.policy.group_interval();
                self.timers.schedule(group.next_flush_at, &group.id, group.version);
            }
        }
        plans
    }

    /// Re-evaluates group placement against a new route tree.
    ///
    /// Groups whose id still exists take the new route's receivers and
    /// timing. Groups whose route or key no longer exists are dropped and
    /// their ids returned, except groups already emptied by resolution:
    /// those keep their timer and still flush their resolved alerts or
    /// all-clear. Firing alerts that map to a new group join it with a fresh
    /// `group_wait`.
    pub fn reroute(&mut self, router: &Router, firing: &[Alert], now: DateTime<Utc>) -> Vec<String> {
        let mut placement: HashMap<String, (&Route, LabelSet, Vec<Fingerprint>)> = HashMap::new();
        for alert in firing.iter().filter(|a| a.is_firing()) {
            for route in router.match_routes(&alert.labels) {
                let key = route.policy.group_by.key(&alert.labels);
                let id = group_id(&route.id, &key);
                placement
                    .entry(id)
                    .or_insert_with(|| (route, key, Vec::new()))
                    .2
                    .push(alert.fingerprint);
            }
        }

        let dropped: Vec<String> = self
            .groups
            .values()
            .filter(|group| !placement.contains_key(&group.id) && !group.owes_final_flush())
            .map(|group| group.id.clone())
            .collect();
        for id in &dropped {
            self.groups.remove(id);
        }

        self.by_fingerprint.clear();
        for (id, (route, key, fps)) in placement {
            match self.groups.get_mut(&id) {
                Some(group) => {
                    group.receivers = route.receivers.clone();
                    group.policy = route.policy.clone();
                    group.members = fps.iter().copied().collect();
                    for fp in &fps {
                        self.by_fingerprint.entry(*fp).or_default().insert(id.clone());
                    }
                }
                None => {
                    for fp in fps {
                        self.join_route(fp, route, key.clone(), now);
                    }
                }
            }
        }

        if !dropped.is_empty() {
            tracing::info!(dropped = dropped.len(), "Groups dropped after route change");
        }
        dropped
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    pub fn get(&self, id: &str) -> Option<GroupSnapshot> {
        self.groups.get(id).map(Group::snapshot)
    }

    pub fn groups(&self) -> Vec<GroupSnapshot> {
        let mut out: Vec<GroupSnapshot> = self.groups.values().map(Group::snapshot).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Ids of the groups a fingerprint currently belongs to.
    pub fn groups_of(&self, fp: &Fingerprint) -> Vec<String> {
        self.by_fingerprint
            .get(fp)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
