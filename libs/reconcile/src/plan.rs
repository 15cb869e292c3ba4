//! Desired-vs-actual diffing with hysteresis.
//!
//! Per tick the reconciler:
//! 1. builds the desired set from pinned rules plus non-ignored, remapped
//!    discovered sockets, resolving host-endpoint collisions by configuration
//!    order
//! 2. diffs it against the [`ForwardTable`], counting missing ticks for
//!    discovered forwards and only removing them once the grace period is
//!    exceeded
//! 3. emits removals first, then adds, skipping adds whose host endpoint is
//!    still held by another forward

use std::collections::{BTreeMap, HashMap};

use crate::store::DesiredStateStore;
use crate::table::{ForwardPhase, ForwardState, ForwardTable};
use crate::types::{ForwardKey, ForwardRule, GuestSocketSnapshot, HostEndpoint, PortSpec};
use crate::DEFAULT_GRACE_TICKS;

/// A mutation to issue against the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Add(ForwardRule),
    /// `spec` is the applied definition, needed to build the cancel request.
    Remove { key: ForwardKey, spec: PortSpec },
}

impl Action {
    pub fn key(&self) -> ForwardKey {
        match self {
            Self::Add(rule) => rule.key(),
            Self::Remove { key, .. } => key.clone(),
        }
    }
}

/// Why a desired rule was not applied this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// A higher-ranked desired rule targets the same host endpoint.
    DuplicateHostEndpoint { winner: ForwardKey },
    /// Another forward still holds the host endpoint.
    HostEndpointOccupied { holder: ForwardKey },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub rejected: ForwardRule,
    pub kind: ConflictKind,
}

/// Desired rules keyed by identity, plus the rules that lost a collision.
#[derive(Debug, Clone, Default)]
pub struct DesiredSet {
    pub rules: BTreeMap<ForwardKey, ForwardRule>,
    pub conflicts: Vec<Conflict>,
}

/// Output of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Removals first, then adds in configuration order.
    pub actions: Vec<Action>,
    pub conflicts: Vec<Conflict>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn adds(&self) -> impl Iterator<Item = &ForwardRule> {
        self.actions.iter().filter_map(|a| match a {
            Action::Add(rule) => Some(rule),
            Action::Remove { .. } => None,
        })
    }

    pub fn removes(&self) -> impl Iterator<Item = &ForwardKey> {
        self.actions.iter().filter_map(|a| match a {
            Action::Remove { key, .. } => Some(key),
            Action::Add(_) => None,
        })
    }
}

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Consecutive fresh ticks a discovered forward may be missing before it
    /// is removed.
    pub grace_ticks: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            grace_ticks: DEFAULT_GRACE_TICKS,
        }
    }
}

/// Computes forward actions from snapshots.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    pub fn grace_ticks(&self) -> u32 {
        self.config.grace_ticks
    }

    /// Build the desired set for a snapshot.
    pub fn desired(&self, snapshot: &GuestSocketSnapshot, store: &DesiredStateStore) -> DesiredSet {
        let mut candidates: Vec<ForwardRule> = store.pinned().to_vec();
        for socket in snapshot.sockets() {
            if let Some((spec, order)) = store.resolve(&socket.default_spec()) {
                candidates.push(ForwardRule::discovered(spec, order));
            }
        }
        // never by snapshot position: the guest may list sockets in any order
        sort_by_rank(&mut candidates);

        let mut set = DesiredSet::default();
        let mut owners: HashMap<HostEndpoint, ForwardKey> = HashMap::new();

        for rule in candidates {
            let key = rule.key();
            // a static rule shadows the discovered socket it names
            if set.rules.contains_key(&key) {
                continue;
            }

            let endpoint = rule.spec.host_endpoint();
            if let Some(winner) = owners.get(&endpoint) {
                set.conflicts.push(Conflict {
                    rejected: rule,
                    kind: ConflictKind::DuplicateHostEndpoint {
                        winner: winner.clone(),
                    },
                });
                continue;
            }

            owners.insert(endpoint, key.clone());
            set.rules.insert(key, rule);
        }

        set
    }

    /// Diff the desired set against `table`.
    ///
    /// Updates missing-tick counters and moves removed forwards to
    /// `PendingRemoval`. Adds are not recorded here; the caller records them
    /// when it dispatches them.
    pub fn plan(
        &self,
        snapshot: &GuestSocketSnapshot,
        store: &DesiredStateStore,
        table: &mut ForwardTable,
    ) -> ReconcilePlan {
        let DesiredSet {
            rules: desired,
            mut conflicts,
        } = self.desired(snapshot, store);

        let mut removes = Vec::new();
        let mut candidates: Vec<ForwardRule> = Vec::new();

        for key in table.keys() {
            let Some(state) = table.get_mut(&key) else {
                continue;
            };

            match desired.get(&key) {
                Some(rule) => {
                    state.missing_ticks = 0;
                    match state.phase {
                        ForwardPhase::Active | ForwardPhase::PendingRemoval
                            if state.rule.spec == rule.spec =>
                        {
                            // removal not confirmed: the forward is still up
                            state.phase = ForwardPhase::Active;
                            state.rule = rule.clone();
                        }
                        ForwardPhase::Active | ForwardPhase::PendingRemoval => {
                            removes.push(start_removal(&key, state));
                            candidates.push(rule.clone());
                        }
                        ForwardPhase::AddFailedFatal if state.rule.spec == rule.spec => {}
                        ForwardPhase::Pending
                        | ForwardPhase::AddFailedTransient
                        | ForwardPhase::AddFailedFatal => candidates.push(rule.clone()),
                    }
                }
                None => match state.phase {
                    ForwardPhase::PendingRemoval => removes.push(start_removal(&key, state)),
                    _ if state.rule.pinned => removes.push(start_removal(&key, state)),
                    _ if snapshot.is_stale() => {}
                    _ => {
                        state.missing_ticks += 1;
                        if state.missing_ticks > self.config.grace_ticks {
                            state.missing_ticks = 0;
                            removes.push(start_removal(&key, state));
                        }
                    }
                },
            }
        }

        for (key, rule) in &desired {
            if !table.contains(key) {
                candidates.push(rule.clone());
            }
        }
        sort_by_rank(&mut candidates);

        let mut adds = Vec::new();
        for rule in candidates {
            let key = rule.key();
            if let Some(holder) = table.holder_of(&rule.spec.host_endpoint()) {
                if *holder != key {
                    let holder = holder.clone();
                    conflicts.push(Conflict {
                        rejected: rule,
                        kind: ConflictKind::HostEndpointOccupied { holder },
                    });
                    continue;
                }
            }
            adds.push(Action::Add(rule));
        }

        removes.extend(adds);
        ReconcilePlan {
            actions: removes,
            conflicts,
        }
    }
}

/// Configuration order, then identity for rules of equal order.
fn sort_by_rank(rules: &mut [ForwardRule]) {
    rules.sort_by_cached_key(|r| (r.order, r.key()));
}

fn start_removal(key: &ForwardKey, state: &mut ForwardState) -> Action {
    state.phase = ForwardPhase::PendingRemoval;
    Action::Remove {
        key: key.clone(),
        spec: state.rule.spec.clone(),
    }
}
