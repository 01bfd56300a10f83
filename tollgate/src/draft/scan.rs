//! Safety scan over the lines a draft adds.
//!
//! Looks for secret-shaped content and machine-specific absolute paths. Any
//! finding rejects the draft.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// Categories of content the gate refuses to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanCategory {
    /// `password = "..."`, `API_KEY=...`
    CredentialAssignment,
    /// PEM private key block
    PrivateKey,
    /// Well-known provider token prefix
    TokenPrefix,
    /// `/home/<user>/`, `/Users/<user>/`, `C:\Users\<user>\`
    AbsolutePath,
    /// Operator-supplied pattern
    Custom,
}

impl std::fmt::Display for ScanCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CredentialAssignment => write!(f, "credential_assignment"),
            Self::PrivateKey => write!(f, "private_key"),
            Self::TokenPrefix => write!(f, "token_prefix"),
            Self::AbsolutePath => write!(f, "absolute_path"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

impl ScanCategory {
    /// Whether the category is a form of secret detection.
    pub fn is_secret(self) -> bool {
        !matches!(self, Self::AbsolutePath)
    }
}

/// One match in an added line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFinding {
    pub category: ScanCategory,
    /// 1-based line number in the draft.
    pub line: usize,
    /// Redacted excerpt of the match.
    pub excerpt: String,
    pub reason: String,
}

struct Pattern {
    category: ScanCategory,
    regex: &'static str,
    reason: &'static str,
}

const PATTERNS: &[Pattern] = &[
    Pattern {
        category: ScanCategory::CredentialAssignment,
        regex: r#"(?i)\b[a-z0-9_]*(?:password|passwd|secret|api[_-]?key|access[_-]?key|auth[_-]?token|private[_-]?key|client[_-]?secret)[a-z0-9_]*\b["']?\s*[:=]\s*["'][^"'\s]{8,}["']"#,
        reason: "Quoted credential assigned to a secret-named key",
    },
    Pattern {
        category: ScanCategory::CredentialAssignment,
        regex: r"^\s*(?:export\s+)?[A-Z0-9_]*(?:PASSWORD|SECRET|TOKEN|API_KEY|ACCESS_KEY)[A-Z0-9_]*\s*=\s*[^\s$]{8,}\s*$",
        reason: "Environment-style credential assignment",
    },
    Pattern {
        category: ScanCategory::PrivateKey,
        regex: r"-----BEGIN (?:[A-Z0-9]+ )*PRIVATE KEY-----",
        reason: "Private key material",
    },
    Pattern {
        category: ScanCategory::TokenPrefix,
        regex: r"\bAKIA[0-9A-Z]{16}\b",
        reason: "AWS access key id",
    },
    Pattern {
        category: ScanCategory::TokenPrefix,
        regex: r"\bgh[pousr]_[A-Za-z0-9]{36,}\b|\bgithub_pat_[A-Za-z0-9_]{22,}",
        reason: "GitHub token",
    },
    Pattern {
        category: ScanCategory::TokenPrefix,
        regex: r"\bxox[abprs]-[A-Za-z0-9-]{10,}",
        reason: "Slack token",
    },
    Pattern {
        category: ScanCategory::TokenPrefix,
        regex: r"\bsk-(?:ant-|proj-)?[A-Za-z0-9_-]{20,}",
        reason: "Model provider API key",
    },
    Pattern {
        category: ScanCategory::TokenPrefix,
        regex: r"\b(?:sk|rk)_live_[0-9A-Za-z]{16,}",
        reason: "Stripe live key",
    },
    Pattern {
        category: ScanCategory::TokenPrefix,
        regex: r"\bAIza[0-9A-Za-z_-]{35}",
        reason: "Google API key",
    },
    Pattern {
        category: ScanCategory::AbsolutePath,
        regex: r"/home/[A-Za-z0-9._-]+/|/Users/[A-Za-z0-9._-]+/",
        reason: "Machine-specific home directory path",
    },
    Pattern {
        category: ScanCategory::AbsolutePath,
        regex: r"(?i)\b[A-Z]:\\Users\\[^\\\s]+\\",
        reason: "Machine-specific Windows profile path",
    },
];

/// Compiled pattern set. Built once per gate.
pub struct SafetyScanner {
    patterns: Vec<(ScanCategory, Regex, String)>,
}

impl SafetyScanner {
    /// Built-in patterns plus operator-supplied regexes.
    pub fn new(extra_patterns: &[String]) -> GateResult<Self> {
        let mut patterns = Vec::with_capacity(PATTERNS.len() + extra_patterns.len());
        for p in PATTERNS {
            let regex = Regex::new(p.regex)
                .map_err(|e| GateError::config(format!("built-in scan pattern: {e}")))?;
            patterns.push((p.category, regex, p.reason.to_string()));
        }
        for p in extra_patterns {
            let regex = Regex::new(p)
                .map_err(|e| GateError::config(format!("invalid secret pattern `{p}`: {e}")))?;
            patterns.push((ScanCategory::Custom, regex, format!("Matches `{p}`")));
        }
        Ok(Self { patterns })
    }

    /// Scan `(line_no, text)` pairs. One finding per category per line.
    pub fn scan<'a>(&self, lines: impl IntoIterator<Item = (usize, &'a str)>) -> Vec<ScanFinding> {
        let mut findings = Vec::new();
        for (line_no, text) in lines {
            let mut seen = Vec::new();
            for (category, regex, reason) in &self.patterns {
                if seen.contains(category) {
                    continue;
                }
                if let Some(m) = regex.find(text) {
                    seen.push(*category);
                    findings.push(ScanFinding {
                        category: *category,
                        line: line_no,
                        excerpt: redact(m.as_str(), *category),
                        reason: reason.clone(),
                    });
                }
            }
        }
        findings
    }
}

/// Keep enough of a match to locate it without echoing the secret.
fn redact(matched: &str, category: ScanCategory) -> String {
    let trimmed = matched.trim();
    if !category.is_secret() {
        return truncate_line(trimmed, 80);
    }
    let visible: String = trimmed.chars().take(6).collect();
    format!("{visible}***")
}

fn truncate_line(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}
