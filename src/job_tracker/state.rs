//! Analysis job state machine
//!
//! pending -> processing -> completed, never backwards. `completed` is
//! terminal and carries the verdict.

use crate::models::AnalysisJob;

/// Decision for an incoming job row against the one already held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Status moves forward
    Advance,
    /// Same non-terminal status; ordinary revision rules apply
    Same,
    /// Status would move backwards
    Regression,
    /// Current row is completed; nothing further is accepted
    Terminal,
}

/// Admission rule applied by the Reconciler to every confirmed job write
pub fn admit(current: &AnalysisJob, incoming: &AnalysisJob) -> Admission {
    if current.status.is_terminal() {
        return Admission::Terminal;
    }
    match incoming.status.cmp(&current.status) {
        std::cmp::Ordering::Greater => Admission::Advance,
        std::cmp::Ordering::Equal => Admission::Same,
        std::cmp::Ordering::Less => Admission::Regression,
    }
}
