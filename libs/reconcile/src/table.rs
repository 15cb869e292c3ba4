//! Recorded forward states.
//!
//! ## State Machine
//!
//! ```text
//! Absent -> Pending -> Active -> PendingRemoval -> Absent
//!              |  ^
//!              |  +-- AddFailedTransient (retried next tick)
//!              +----> AddFailedFatal (parked until the rule changes)
//! ```

use std::collections::BTreeMap;

use crate::types::{ForwardKey, ForwardRule, HostEndpoint};

/// Lifecycle phase of one forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardPhase {
    /// Needs to be (re-)added on the live connection.
    Pending,
    /// Confirmed on the live connection.
    Active,
    /// Cancel requested, not yet confirmed.
    PendingRemoval,
    /// Add failed after exhausting retries; retried on the next tick.
    AddFailedTransient,
    /// Add rejected; not retried until the rule changes.
    AddFailedFatal,
}

impl ForwardPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::PendingRemoval => "pending_removal",
            Self::AddFailedTransient => "add_failed_transient",
            Self::AddFailedFatal => "add_failed_fatal",
        }
    }

    /// Whether a host socket may currently be bound for this forward.
    pub fn holds_host_endpoint(&self) -> bool {
        matches!(self, Self::Active | Self::PendingRemoval)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::AddFailedTransient | Self::AddFailedFatal)
    }
}

/// Recorded state of one forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardState {
    /// The rule as last requested. For `Active` entries this is the applied
    /// definition.
    pub rule: ForwardRule,
    pub phase: ForwardPhase,
    /// Consecutive fresh snapshots in which the rule was not desired.
    pub missing_ticks: u32,
    pub last_error: Option<String>,
}

/// Per-key forward states of one instance.
#[derive(Debug, Clone, Default)]
pub struct ForwardTable {
    states: BTreeMap<ForwardKey, ForwardState>,
}

impl ForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, key: &ForwardKey) -> Option<&ForwardState> {
        self.states.get(key)
    }

    pub fn phase(&self, key: &ForwardKey) -> Option<ForwardPhase> {
        self.states.get(key).map(|s| s.phase)
    }

    pub fn contains(&self, key: &ForwardKey) -> bool {
        self.states.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ForwardKey, &ForwardState)> {
        self.states.iter()
    }

    pub(crate) fn get_mut(&mut self, key: &ForwardKey) -> Option<&mut ForwardState> {
        self.states.get_mut(key)
    }

    pub(crate) fn keys(&self) -> Vec<ForwardKey> {
        self.states.keys().cloned().collect()
    }

    /// Key whose forward may be bound on `endpoint`.
    pub fn holder_of(&self, endpoint: &HostEndpoint) -> Option<&ForwardKey> {
        self.states
            .iter()
            .find(|(_, s)| s.phase.holds_host_endpoint() && s.rule.spec.host_endpoint() == *endpoint)
            .map(|(k, _)| k)
    }

    /// Record that an add is about to be issued.
    pub fn begin_add(&mut self, rule: ForwardRule) {
        let key = rule.key();
        let missing_ticks = self.states.get(&key).map(|s| s.missing_ticks).unwrap_or(0);
        self.states.insert(
            key,
            ForwardState {
                rule,
                phase: ForwardPhase::Pending,
                missing_ticks,
                last_error: None,
            },
        );
    }

    /// Pending -> Active. Returns false when the key is not pending.
    pub fn confirm_add(&mut self, key: &ForwardKey) -> bool {
        match self.states.get_mut(key) {
            Some(state) if state.phase == ForwardPhase::Pending => {
                state.phase = ForwardPhase::Active;
                state.last_error = None;
                true
            }
            _ => false,
        }
    }

    pub fn fail_add(&mut self, key: &ForwardKey, fatal: bool, error: impl Into<String>) {
        if let Some(state) = self.states.get_mut(key) {
            state.phase = if fatal {
                ForwardPhase::AddFailedFatal
            } else {
                ForwardPhase::AddFailedTransient
            };
            state.last_error = Some(error.into());
        }
    }

    pub fn begin_remove(&mut self, key: &ForwardKey) {
        if let Some(state) = self.states.get_mut(key) {
            state.phase = ForwardPhase::PendingRemoval;
        }
    }

    /// Destroy the entry once its cancel is confirmed (or known absent).
    pub fn confirm_remove(&mut self, key: &ForwardKey) -> Option<ForwardState> {
        self.states.remove(key)
    }

    /// After the control connection was re-established, nothing is assumed to
    /// survive on the remote side: active forwards go back to `Pending` and
    /// pending removals are complete. Returns how many forwards need re-adding.
    pub fn mark_all_pending(&mut self) -> usize {
        self.states
            .retain(|_, s| s.phase != ForwardPhase::PendingRemoval);

        let mut count = 0;
        for state in self.states.values_mut() {
            if state.phase == ForwardPhase::Active {
                state.phase = ForwardPhase::Pending;
                count += 1;
            }
        }
        count
    }

    /// Rules parked in a failed add state.
    pub fn failed_rule_count(&self) -> usize {
        self.states.values().filter(|s| s.phase.is_failed()).count()
    }

    pub fn count_in(&self, phase: ForwardPhase) -> usize {
        self.states.values().filter(|s| s.phase == phase).count()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::types::PortSpec;

    fn rule(port: u16) -> ForwardRule {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        ForwardRule::discovered(PortSpec::tcp(any, port, local, port), 0)
    }

    #[test]
    fn test_add_lifecycle() {
        let mut table = ForwardTable::new();
        let r = rule(8080);
        let key = r.key();

        table.begin_add(r);
        assert_eq!(table.phase(&key), Some(ForwardPhase::Pending));
        assert!(table.confirm_add(&key));
        assert_eq!(table.phase(&key), Some(ForwardPhase::Active));
        // already active
        assert!(!table.confirm_add(&key));

        table.begin_remove(&key);
        assert_eq!(table.phase(&key), Some(ForwardPhase::PendingRemoval));
        assert!(table.confirm_remove(&key).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_fail_add() {
        let mut table = ForwardTable::new();
        let r = rule(8080);
        let key = r.key();
        table.begin_add(r);
        table.fail_add(&key, true, "address in use");

        let state = table.get(&key).unwrap();
        assert_eq!(state.phase, ForwardPhase::AddFailedFatal);
        assert_eq!(state.last_error.as_deref(), Some("address in use"));
        assert_eq!(table.failed_rule_count(), 1);
    }

    #[test]
    fn test_mark_all_pending() {
        let mut table = ForwardTable::new();
        for port in [80, 443, 8080] {
            let r = rule(port);
            let key = r.key();
            table.begin_add(r);
            table.confirm_add(&key);
        }
        let removing = rule(8080).key();
        table.begin_remove(&removing);

        assert_eq!(table.mark_all_pending(), 2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.count_in(ForwardPhase::Pending), 2);
        assert!(!table.contains(&removing));
    }

    #[test]
    fn test_holder_of() {
        let mut table = ForwardTable::new();
        let r = rule(8080);
        let key = r.key();
        let endpoint = r.spec.host_endpoint();

        table.begin_add(r);
        assert!(table.holder_of(&endpoint).is_none());
        table.confirm_add(&key);
        assert_eq!(table.holder_of(&endpoint), Some(&key));
    }
}
