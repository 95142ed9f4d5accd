//! QA verdict extraction from phase output.
//!
//! Recognises a `Verdict:` marker (any case), optionally inside a markdown
//! heading or bold label and with emphasis around the token:
//!
//! - `Verdict: READY_FOR_MERGE`
//! - `### Verdict: AC_NOT_MET`
//! - `**Verdict:** **READY_FOR_MERGE**`
//!
//! A bare token without the marker is ignored.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static VERDICT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bverdict[*_]*\s*:[\s*_`]*([a-z][a-z_]*)").expect("verdict regex is valid")
});

/// Fixed set of verdict tokens a QA phase may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaVerdict {
    ReadyForMerge,
    AcMetButNotAPlus,
    AcNotMet,
    NeedsVerification,
}

impl QaVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            QaVerdict::ReadyForMerge => "READY_FOR_MERGE",
            QaVerdict::AcMetButNotAPlus => "AC_MET_BUT_NOT_A_PLUS",
            QaVerdict::AcNotMet => "AC_NOT_MET",
            QaVerdict::NeedsVerification => "NEEDS_VERIFICATION",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.trim_matches('_').to_uppercase().as_str() {
            "READY_FOR_MERGE" => Some(QaVerdict::ReadyForMerge),
            "AC_MET_BUT_NOT_A_PLUS" => Some(QaVerdict::AcMetButNotAPlus),
            "AC_NOT_MET" => Some(QaVerdict::AcNotMet),
            "NEEDS_VERIFICATION" => Some(QaVerdict::NeedsVerification),
            _ => None,
        }
    }

    /// Whether this verdict means the acceptance criteria were not satisfied.
    pub fn is_failing(&self) -> bool {
        matches!(self, QaVerdict::AcNotMet)
    }
}

impl std::fmt::Display for QaVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Return the first recognised verdict following a `Verdict:` marker.
///
/// Markers followed by an unknown token are skipped; if no marker carries a
/// known token the result is `None`.
pub fn parse_qa_verdict(text: &str) -> Option<QaVerdict> {
    VERDICT_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .find_map(|m| QaVerdict::from_token(m.as_str()))
}
