//! Per-issue phase selection.

use crate::github::Issue;
use crate::phase::{ExecutionConfig, Phase, default_phases};
use regex::Regex;
use std::sync::LazyLock;

const BUG_LABELS: &[&str] = &["bug", "fix", "hotfix", "patch"];
const DOCS_LABELS: &[&str] = &["docs", "documentation"];
const UI_LABELS: &[&str] = &["ui", "frontend", "admin", "web", "browser"];
const SECURITY_LABELS: &[&str] = &["security", "auth", "authentication", "permissions"];
const COMPLEX_LABELS: &[&str] = &["complex", "refactor", "breaking", "major"];

static PHASES_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[^a-z\n]*phases[*_`\s]*:[*_`\s]*(.+)$").expect("phases regex is valid")
});

static QUALITY_LOOP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)quality[\s_-]*loop[*_`\s]*:[*_`\s]*([a-z]+)")
        .expect("quality loop regex is valid")
});

static PHASE_SEPARATOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(?:→|->|,)\s*").expect("separator regex is valid"));

/// Where a phase plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Configured,
    Labels,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    pub phases: Vec<Phase>,
    pub quality_loop: bool,
    pub source: PlanSource,
}

/// Phase sequence for `issue`.
///
/// Explicitly configured phases win. Otherwise labels adjust the default
/// `spec → exec → qa` sequence.
pub fn determine_phases_for_issue(issue: &Issue, config: &ExecutionConfig) -> PhasePlan {
    if let Some(phases) = &config.phases {
        return PhasePlan {
            phases: phases.clone(),
            quality_loop: config.quality_loop,
            source: PlanSource::Configured,
        };
    }

    let mut phases = if issue.has_label(DOCS_LABELS) {
        vec![Phase::Exec, Phase::Qa]
    } else {
        default_phases()
    };

    if issue.has_label(BUG_LABELS) {
        phases.retain(|p| *p != Phase::Spec);
    }

    if issue.has_label(UI_LABELS)
        && !phases.contains(&Phase::Test)
        && let Some(qa) = phases.iter().position(|p| *p == Phase::Qa)
    {
        phases.insert(qa, Phase::Test);
    }

    // Security review only makes sense on top of a plan.
    if issue.has_label(SECURITY_LABELS)
        && !phases.contains(&Phase::SecurityReview)
        && let Some(spec) = phases.iter().position(|p| *p == Phase::Spec)
    {
        phases.insert(spec + 1, Phase::SecurityReview);
    }

    PhasePlan {
        phases,
        quality_loop: config.quality_loop || issue.has_label(COMPLEX_LABELS),
        source: PlanSource::Labels,
    }
}

/// Workflow recommendation found in planning output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recommendation {
    pub phases: Vec<Phase>,
    pub quality_loop: Option<bool>,
}

/// Parse a `Phases: spec → exec → qa` line and an optional
/// `Quality Loop: enabled` flag. Unknown phase tokens are dropped.
pub fn parse_recommendation(output: &str) -> Option<Recommendation> {
    let phases: Vec<Phase> = PHASES_LINE_REGEX
        .captures_iter(output)
        .filter_map(|c| c.get(1))
        .map(|m| {
            PHASE_SEPARATOR_REGEX
                .split(m.as_str().trim())
                .filter_map(Phase::parse_token)
                .collect::<Vec<_>>()
        })
        .find(|p| !p.is_empty())?;

    let quality_loop = QUALITY_LOOP_REGEX
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| match m.as_str().to_lowercase().as_str() {
            "enabled" | "true" | "yes" | "on" => Some(true),
            "disabled" | "false" | "no" | "off" => Some(false),
            _ => None,
        });

    Some(Recommendation {
        phases,
        quality_loop,
    })
}
