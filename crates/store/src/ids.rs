use serde::{Deserialize, Serialize};

/// Monotonic per-project identifier counters.
///
/// Counters live inside the committed project state and are read and bumped
/// under the same per-project lock as commits, so assigned ids are unique and
/// never reused even after deletions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdCounters {
    pub evidence: u32,
    pub proposition: u32,
    pub interview: u32,
    pub script: u32,
}

impl IdCounters {
    pub fn next_evidence(&mut self) -> String {
        self.evidence += 1;
        format!("E{:03}", self.evidence)
    }

    pub fn next_proposition(&mut self) -> String {
        self.proposition += 1;
        format!("P{:03}", self.proposition)
    }

    pub fn next_interview(&mut self) -> String {
        self.interview += 1;
        format!("INT_{:03}", self.interview)
    }

    pub fn next_script_version(&mut self) -> u32 {
        self.script += 1;
        self.script
    }
}

#[cfg(test)]
mod tests {
    use super::IdCounters;

    #[test]
    fn ids_are_zero_padded_and_monotonic() {
        let mut counters = IdCounters::default();
        assert_eq!(counters.next_evidence(), "E001");
        assert_eq!(counters.next_evidence(), "E002");
        assert_eq!(counters.next_proposition(), "P001");
        assert_eq!(counters.next_interview(), "INT_001");
        assert_eq!(counters.next_script_version(), 1);
        assert_eq!(counters.next_script_version(), 2);
    }

    #[test]
    fn wide_counters_keep_growing_past_three_digits() {
        let mut counters = IdCounters {
            evidence: 999,
            ..IdCounters::default()
        };
        assert_eq!(counters.next_evidence(), "E1000");
    }
}
