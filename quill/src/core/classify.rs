//! Deterministic classification of failed backend calls.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How the session client reacts to a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The credential's quota is spent: rotate to the next credential.
    QuotaExhausted,
    /// Too many requests: back off on the same credential.
    RateLimited,
    /// Timeouts, crashes, server errors: back off and retry a bounded number of times.
    Transient,
    /// Retrying cannot help (rejected credential, unusable request).
    Fatal,
}

/// What the classifier looks at.
#[derive(Debug, Clone, Copy)]
pub struct FailureSignal<'a> {
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub stdout: &'a str,
    pub stderr: &'a str,
}

static QUOTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)quota|resource[_ ]exhausted|insufficient_quota|billing|credit balance")
        .expect("quota regex")
});

static RATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|too many requests|\b429\b|slow down").expect("rate regex")
});

static AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)invalid api key|api key not valid|unauthori[sz]ed|\b401\b|\b403\b|permission denied")
        .expect("auth regex")
});

/// Classify a failed call.
///
/// Quota patterns are checked before rate patterns because quota errors are
/// commonly reported with HTTP 429 as well.
pub fn classify_failure(signal: &FailureSignal<'_>) -> FailureClass {
    if signal.timed_out {
        return FailureClass::Transient;
    }
    let text = format!("{}\n{}", signal.stderr, signal.stdout);
    if QUOTA_RE.is_match(&text) {
        return FailureClass::QuotaExhausted;
    }
    if RATE_RE.is_match(&text) {
        return FailureClass::RateLimited;
    }
    if AUTH_RE.is_match(&text) {
        return FailureClass::Fatal;
    }
    FailureClass::Transient
}

/// First non-empty line of the diagnostic output, for ledgers and exhaustion reasons.
pub fn failure_summary(signal: &FailureSignal<'_>) -> String {
    if signal.timed_out {
        return "backend call timed out".to_string();
    }
    let line = signal
        .stderr
        .lines()
        .chain(signal.stdout.lines())
        .map(str::trim)
        .find(|line| !line.is_empty());
    match (line, signal.exit_code) {
        (Some(line), _) => truncate(line, 200),
        (None, Some(code)) => format!("backend exited with status {code}"),
        (None, None) => "backend terminated by signal".to_string(),
    }
}

fn truncate(line: &str, max_chars: usize) -> String {
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut out: String = line.chars().take(max_chars).collect();
    out.push('…');
    out
}
