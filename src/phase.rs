//! The fixed five-phase pipeline.

use serde::{Deserialize, Serialize};

/// One stage of the pipeline. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Research,
    Plan,
    Implement,
    Validate,
    Integrate,
}

pub const ALL_PHASES: [PhaseKind; 5] = [
    PhaseKind::Research,
    PhaseKind::Plan,
    PhaseKind::Implement,
    PhaseKind::Validate,
    PhaseKind::Integrate,
];

impl PhaseKind {
    pub fn first() -> Self {
        PhaseKind::Research
    }

    /// Position in the pipeline, starting at 0.
    pub fn index(self) -> usize {
        ALL_PHASES
            .iter()
            .position(|p| *p == self)
            .unwrap_or_default()
    }

    /// The phase after this one, or `None` after INTEGRATE.
    pub fn next(self) -> Option<Self> {
        ALL_PHASES.get(self.index() + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Research => "research",
            PhaseKind::Plan => "plan",
            PhaseKind::Implement => "implement",
            PhaseKind::Validate => "validate",
            PhaseKind::Integrate => "integrate",
        }
    }

    /// Tracker label, e.g. `phase:plan`.
    pub fn label(self) -> String {
        format!("phase:{}", self.as_str())
    }

    /// Phases that run inside the run's workspace.
    pub fn uses_workspace(self) -> bool {
        matches!(
            self,
            PhaseKind::Implement | PhaseKind::Validate | PhaseKind::Integrate
        )
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "research" => Ok(PhaseKind::Research),
            "plan" => Ok(PhaseKind::Plan),
            "implement" => Ok(PhaseKind::Implement),
            "validate" => Ok(PhaseKind::Validate),
            "integrate" => Ok(PhaseKind::Integrate),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: research, plan, implement, validate, integrate",
                s
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_fixed() {
        let mut seen = vec![PhaseKind::first()];
        while let Some(next) = seen.last().and_then(|p| p.next()) {
            seen.push(next);
        }
        assert_eq!(seen, ALL_PHASES.to_vec());
        assert_eq!(PhaseKind::Integrate.next(), None);
    }

    #[test]
    fn test_ordering_matches_index() {
        for window in ALL_PHASES.windows(2) {
            assert!(window[0] < window[1]);
            assert_eq!(window[0].index() + 1, window[1].index());
        }
    }

    #[test]
    fn test_parse_and_display() {
        for phase in ALL_PHASES {
            let parsed: PhaseKind = phase.to_string().parse().unwrap();
            assert_eq!(parsed, phase);
        }
        assert_eq!("PLAN".parse::<PhaseKind>().unwrap(), PhaseKind::Plan);
        assert!("deploy".parse::<PhaseKind>().is_err());
    }

    #[test]
    fn test_labels() {
        assert_eq!(PhaseKind::Validate.label(), "phase:validate");
    }

    #[test]
    fn test_workspace_phases() {
        assert!(!PhaseKind::Research.uses_workspace());
        assert!(!PhaseKind::Plan.uses_workspace());
        assert!(PhaseKind::Implement.uses_workspace());
        assert!(PhaseKind::Integrate.uses_workspace());
    }
}
