use crate::AuditError;
use fixedbitset::FixedBitSet;
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;

/// Control-plane phases of a cluster, declared in rank order.
///
/// Ranks only move forward except for the explicit regressions around hibernation
/// (`hibernating -> resuming -> ready`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Unknown,
    Pending,
    Waiting,
    Validating,
    Installing,
    Ready,
    Resuming,
    PoweringDown,
    Hibernating,
    Error,
    Uninstalling,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 11] = [
        LifecycleState::Unknown,
        LifecycleState::Pending,
        LifecycleState::Waiting,
        LifecycleState::Validating,
        LifecycleState::Installing,
        LifecycleState::Ready,
        LifecycleState::Resuming,
        LifecycleState::PoweringDown,
        LifecycleState::Hibernating,
        LifecycleState::Error,
        LifecycleState::Uninstalling,
    ];

    pub const fn rank(self) -> usize {
        match self {
            LifecycleState::Unknown => 0,
            LifecycleState::Pending => 1,
            LifecycleState::Waiting => 2,
            LifecycleState::Validating => 3,
            LifecycleState::Installing => 4,
            LifecycleState::Ready => 5,
            LifecycleState::Resuming => 6,
            LifecycleState::PoweringDown => 7,
            LifecycleState::Hibernating => 8,
            LifecycleState::Error => 9,
            LifecycleState::Uninstalling => 10,
        }
    }

    pub fn from_rank(rank: usize) -> Option<Self> {
        Self::ALL.get(rank).copied()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Unknown => "unknown",
            LifecycleState::Pending => "pending",
            LifecycleState::Waiting => "waiting",
            LifecycleState::Validating => "validating",
            LifecycleState::Installing => "installing",
            LifecycleState::Ready => "ready",
            LifecycleState::Resuming => "resuming",
            LifecycleState::PoweringDown => "powering_down",
            LifecycleState::Hibernating => "hibernating",
            LifecycleState::Error => "error",
            LifecycleState::Uninstalling => "uninstalling",
        }
    }
}

impl PartialOrd for LifecycleState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LifecycleState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| AuditError::malformed(format!("unrecognized lifecycle state {:?}", s)))
    }
}

/// Status of a control-plane validation check. Independent of [`LifecycleState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CheckState {
    Pending,
    Running,
    Passed,
    Failed,
}

impl FromStr for CheckState {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(CheckState::Pending),
            "running" => Ok(CheckState::Running),
            "passed" => Ok(CheckState::Passed),
            "failed" => Ok(CheckState::Failed),
            _ => Err(AuditError::malformed(format!("unrecognized in-flight check state {:?}", s))),
        }
    }
}

pub type CheckStates = SmallVec<[CheckState; 4]>;

/// Parses a JSON array of check-state strings, e.g. `["failed","passed"]`.
pub fn parse_check_states(json: &str) -> Result<CheckStates, AuditError> {
    let raw: Vec<String> = serde_json::from_str(json)
        .map_err(|e| AuditError::malformed(format!("unparseable in-flight states {:?}: {}", json, e)))?;
    raw.iter().map(|s| s.parse()).collect()
}

/// Every lifecycle state ever observed for one cluster. Only grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSet {
    bits: FixedBitSet,
}

impl Default for StateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSet {
    pub fn new() -> Self {
        StateSet { bits: FixedBitSet::with_capacity(LifecycleState::ALL.len()) }
    }

    pub fn observe(&mut self, state: LifecycleState) {
        self.bits.insert(state.rank());
    }

    pub fn union_with(&mut self, other: &StateSet) {
        self.bits.union_with(&other.bits);
    }

    pub fn contains(&self, state: LifecycleState) -> bool {
        self.bits.contains(state.rank())
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones(..)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = LifecycleState> + '_ {
        self.bits.ones().filter_map(LifecycleState::from_rank)
    }
}

impl FromIterator<LifecycleState> for StateSet {
    fn from_iter<I: IntoIterator<Item = LifecycleState>>(iter: I) -> Self {
        let mut set = StateSet::new();
        for state in iter {
            set.observe(state);
        }
        set
    }
}
