//! # Phase state machine
//!
//! A session moves through an ordered sequence of named phases and ends in
//! an absorbing terminal state. The current [`Phase`] is never stored: it is
//! recomputed from the session's counters on every query, so it can never go
//! stale. A phase advances when its counter reaches the configured turn
//! threshold; the counter increments by exactly one per completed turn
//! attributed to that phase.
//!
//! ```rust
//! use ensemble::phase::PhaseSchedule;
//! use std::collections::BTreeMap;
//!
//! let schedule = PhaseSchedule::new()
//!     .phase("spanish", 2)
//!     .phase("english", 2);
//!
//! let mut counters = BTreeMap::new();
//! assert_eq!(schedule.phase_of(&counters).name(), Some("spanish"));
//!
//! counters.insert("spanish".to_string(), 2);
//! assert_eq!(schedule.phase_of(&counters).name(), Some("english"));
//!
//! counters.insert("english".to_string(), 2);
//! assert!(schedule.phase_of(&counters).is_terminal());
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};

/// One named phase and the number of completed turns that exhaust it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub turns: u64,
}

/// Ordered list of phases ending in the implicit terminal state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseSchedule {
    phases: Vec<PhaseSpec>,
}

impl PhaseSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a phase with the given turn threshold.
    pub fn phase(mut self, name: impl Into<String>, turns: u64) -> Self {
        self.phases.push(PhaseSpec {
            name: name.into(),
            turns,
        });
        self
    }

    pub fn specs(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn contains(&self, name: &str) -> bool {
        self.phases.iter().any(|p| p.name == name)
    }

    /// Checks the schedule is well formed: unique names, nonzero thresholds.
    pub fn validate(&self) -> Result<()> {
        for (i, spec) in self.phases.iter().enumerate() {
            if spec.turns == 0 {
                return Err(EnsembleError::config(format!(
                    "phase '{}' has a zero turn threshold",
                    spec.name
                )));
            }
            if self.phases[..i].iter().any(|p| p.name == spec.name) {
                return Err(EnsembleError::config(format!(
                    "duplicate phase name '{}'",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// Derives the current phase from counters alone.
    ///
    /// The first phase whose counter is below its threshold is current; when
    /// every phase is exhausted (or the schedule is empty) the machine is
    /// terminal.
    pub fn phase_of(&self, counters: &BTreeMap<String, u64>) -> Phase {
        for (index, spec) in self.phases.iter().enumerate() {
            let done = counters.get(&spec.name).copied().unwrap_or(0);
            if done < spec.turns {
                return Phase::Active {
                    name: spec.name.clone(),
                    index,
                };
            }
        }
        Phase::Terminal
    }
}

/// Derived session phase. `Terminal` is absorbing: once every phase is
/// exhausted no further turns are issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Active { name: String, index: usize },
    Terminal,
}

impl Phase {
    pub fn name(&self) -> Option<&str> {
        match self {
            Phase::Active { name, .. } => Some(name),
            Phase::Terminal => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn counters(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_phase_progression() {
        let schedule = PhaseSchedule::new()
            .phase("diagnostic", 2)
            .phase("teaching", 3);

        assert_eq!(schedule.phase_of(&counters(&[])).name(), Some("diagnostic"));
        assert_eq!(
            schedule.phase_of(&counters(&[("diagnostic", 1)])).name(),
            Some("diagnostic")
        );
        assert_eq!(
            schedule.phase_of(&counters(&[("diagnostic", 2)])).name(),
            Some("teaching")
        );
        assert!(schedule
            .phase_of(&counters(&[("diagnostic", 2), ("teaching", 3)]))
            .is_terminal());
    }

    #[test]
    fn test_phase_is_pure_function_of_counters() {
        let schedule = PhaseSchedule::new().phase("spanish", 2).phase("english", 2);
        let c = counters(&[("spanish", 2), ("english", 1)]);

        // Same counters always yield the same phase, any number of times.
        let first = schedule.phase_of(&c);
        for _ in 0..10 {
            assert_eq!(schedule.phase_of(&c), first);
        }
        assert_eq!(first.name(), Some("english"));
    }

    #[test]
    fn test_unrelated_counters_are_ignored() {
        let schedule = PhaseSchedule::new().phase("spanish", 2);
        let c = counters(&[("bogus", 99)]);
        assert_eq!(schedule.phase_of(&c).name(), Some("spanish"));
    }

    #[test]
    fn test_empty_schedule_is_terminal() {
        let schedule = PhaseSchedule::new();
        assert!(schedule.phase_of(&counters(&[])).is_terminal());
    }

    #[test]
    fn test_terminal_is_absorbing() {
        let schedule = PhaseSchedule::new().phase("only", 1);
        // Overshooting the threshold stays terminal.
        assert!(schedule.phase_of(&counters(&[("only", 1)])).is_terminal());
        assert!(schedule.phase_of(&counters(&[("only", 50)])).is_terminal());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero() {
        let dup = PhaseSchedule::new().phase("a", 1).phase("a", 2);
        assert!(dup.validate().is_err());

        let zero = PhaseSchedule::new().phase("a", 0);
        assert!(zero.validate().is_err());

        let ok = PhaseSchedule::new().phase("a", 1).phase("b", 2);
        assert!(ok.validate().is_ok());
    }
}
