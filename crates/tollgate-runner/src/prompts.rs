//! Request bodies sent to each worker role.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever the wording changes so a
//! worker response can be traced back to the prompt that produced it.

use std::fmt::Write;

use tollgate::contract::{CycleFindings, ReviewSource, TaskContract};

/// Prompt version. Bump on any content change.
pub const PROMPT_VERSION: &str = "1.0.0";

const IMPLEMENTER_PREAMBLE: &str = "\
You are the implementer. You may not write workspace files directly. For every \
file you change, stage the complete new content as a draft in the sandbox and \
report the submission records in `drafts`. A draft that deletes most of a file, \
touches credentials or embeds machine-specific paths will be refused.";

const LOCAL_REVIEWER_PREAMBLE: &str = "\
You are the local reviewer. Read the diff against the requirements and answer \
pass, minor_issues or critical_flaw. Mark each finding blocking, major, minor \
or style; minor and style findings never block a merge.";

const JUDGE_PREAMBLE: &str = "\
You are the judge. Decide pass or fail for the diff below. Fail only for \
findings you would mark blocking or major, and say which file each concerns.";

const REBUTTER_PREAMBLE: &str = "\
You are the implementer answering the judge. Either rebut the findings with a \
concrete argument, or concede and the task returns to implementation.";

fn header(out: &mut String, preamble: &str, contract: &TaskContract) {
    let spec = &contract.specification;
    let _ = writeln!(out, "{preamble}\n");
    let _ = writeln!(out, "Prompt version: {PROMPT_VERSION}");
    let _ = writeln!(out, "Task: {} (attempt {})", contract.task_id, contract.attempt);
    let _ = writeln!(out, "Target: {}", spec.target_path);
    if !spec.source_artifacts.is_empty() {
        let _ = writeln!(out, "Sources:");
        for source in &spec.source_artifacts {
            let _ = writeln!(out, "- {} ({})", source.path, source.content_hash);
        }
    }
    if !spec.requirements.is_empty() {
        let _ = writeln!(out, "\nRequirements:");
        for r in &spec.requirements {
            let _ = writeln!(out, "- {r}");
        }
    }
    if !spec.acceptance_criteria.is_empty() {
        let _ = writeln!(out, "\nAcceptance criteria:");
        for c in &spec.acceptance_criteria {
            let _ = writeln!(out, "- {c}");
        }
    }
}

fn findings(out: &mut String, title: &str, cycles: &[&CycleFindings]) {
    if cycles.iter().all(|c| c.findings.is_empty()) {
        return;
    }
    let _ = writeln!(out, "\n{title}:");
    for cycle in cycles {
        for f in &cycle.findings {
            let file = f.file.as_deref().map(|p| format!(" [{p}]")).unwrap_or_default();
            let _ = writeln!(
                out,
                "- cycle {} {:?} {:?}{file}: {}",
                cycle.cycle, cycle.source, f.severity, f.message
            );
        }
    }
}

pub fn implementation(contract: &TaskContract) -> String {
    let mut out = String::new();
    header(&mut out, IMPLEMENTER_PREAMBLE, contract);
    let previous: Vec<&CycleFindings> = contract.handoff_data.review_findings.iter().collect();
    findings(&mut out, "Findings from earlier reviews", &previous);
    if let Some(reason) = contract.status_reason.strip_prefix("drafts rejected by the gate: ") {
        let _ = writeln!(out, "\nYour last drafts were refused: {reason}");
    }
    out
}

pub fn local_review(contract: &TaskContract, diff: &str) -> String {
    let mut out = String::new();
    header(&mut out, LOCAL_REVIEWER_PREAMBLE, contract);
    let _ = writeln!(out, "\nDiff:\n{diff}");
    out
}

pub fn judge_review(contract: &TaskContract, diff: &str) -> String {
    let mut out = String::new();
    header(&mut out, JUDGE_PREAMBLE, contract);
    let local: Vec<&CycleFindings> = contract
        .handoff_data
        .review_findings
        .iter()
        .filter(|c| c.source == ReviewSource::Local)
        .collect();
    findings(&mut out, "Local review findings", &local);
    if let Some(text) = &contract.handoff_data.rebuttal_text {
        let _ = writeln!(out, "\nImplementer rebuttal:\n{text}");
    }
    let _ = writeln!(out, "\nDiff:\n{diff}");
    out
}

pub fn rebuttal(contract: &TaskContract) -> String {
    let mut out = String::new();
    header(&mut out, REBUTTER_PREAMBLE, contract);
    let judge: Vec<&CycleFindings> = contract
        .handoff_data
        .review_findings
        .iter()
        .filter(|c| c.source == ReviewSource::Judge)
        .collect();
    if let Some(last) = judge.last() {
        findings(&mut out, "Judge findings", &[*last]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tollgate::contract::{Complexity, Finding, FindingSeverity, Specification};

    fn contract() -> TaskContract {
        TaskContract::new(
            "t1",
            Complexity::Standard,
            Specification {
                target_path: "src/lib.rs".into(),
                requirements: vec!["add a checked divide".into()],
                ..Specification::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_implementation_prompt_carries_requirements() {
        let prompt = implementation(&contract());
        assert!(prompt.contains("Target: src/lib.rs"));
        assert!(prompt.contains("- add a checked divide"));
        assert!(prompt.contains(PROMPT_VERSION));
    }

    #[test]
    fn test_rebuttal_prompt_shows_latest_judge_findings() {
        let mut c = contract();
        for (cycle, msg) in [(1, "old finding"), (2, "divides by zero")] {
            c.handoff_data.review_findings.push(CycleFindings {
                cycle,
                source: ReviewSource::Judge,
                findings: vec![Finding::new(FindingSeverity::Blocking, msg)],
            });
        }
        let prompt = rebuttal(&c);
        assert!(prompt.contains("divides by zero"));
        assert!(!prompt.contains("old finding"));
    }
}
