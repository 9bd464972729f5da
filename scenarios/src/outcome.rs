use serde::{Deserialize, Serialize};

use crate::judge::Judgment;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Fail,
    Error,
}

/// `None` means the cycle itself errored before producing an exit code.
/// Engine exit codes are judged by the case's own checks.
pub fn classify_outcome(exit_code: Option<i32>, judgment: &Judgment) -> Outcome {
    match exit_code {
        None => Outcome::Error,
        Some(_) if judgment.all_passed() => Outcome::Success,
        Some(_) => Outcome::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::{CheckOutcome, Judgment};

    fn judgment(pass: bool) -> Judgment {
        Judgment {
            checks: vec![CheckOutcome::Verified { passed: pass }],
        }
    }

    #[test]
    fn success_when_checks_pass() {
        assert_eq!(classify_outcome(Some(0), &judgment(true)), Outcome::Success);
    }

    /// A blocked exit is fine when the case expects it.
    #[test]
    fn nonzero_exit_defers_to_checks() {
        assert_eq!(classify_outcome(Some(2), &judgment(true)), Outcome::Success);
        assert_eq!(classify_outcome(Some(0), &judgment(false)), Outcome::Fail);
    }

    #[test]
    fn error_when_cycle_errored() {
        assert_eq!(classify_outcome(None, &judgment(true)), Outcome::Error);
    }
}
