//! Finding classification for the non-substantive review predicate.

use crate::contract::types::{Finding, FindingSeverity};

/// Decides whether a review finding warrants more review cycles.
pub trait FindingClassifier: Send + Sync {
    fn is_substantive(&self, finding: &Finding) -> bool;
}

/// Trusts the reviewer-declared severity: `minor` and `style` are noise.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeverityClassifier;

impl FindingClassifier for SeverityClassifier {
    fn is_substantive(&self, finding: &Finding) -> bool {
        matches!(
            finding.severity,
            FindingSeverity::Blocking | FindingSeverity::Major
        )
    }
}
