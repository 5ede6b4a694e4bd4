//! Agent log policies
//!
//! A policy lists the success markers a healthy log must eventually contain,
//! the pattern that flags an error line, and an ordered allow-list of known
//! benign lines. Allow rules are evaluated before the error check so every
//! exemption carries an auditable reason.

use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Errors that can occur while building or applying a log policy
#[derive(Debug, Error)]
pub enum LogScanError {
    #[error("Invalid log pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("{policy}: missing success markers: {}", .markers.join(", "))]
    MissingMarkers { policy: String, markers: Vec<String> },

    #[error("{policy}: {} unexpected error line(s), first: {}", .violations.len(), first_violation(.violations))]
    ErrorLines {
        policy: String,
        violations: Vec<LogViolation>,
    },
}

fn first_violation(violations: &[LogViolation]) -> String {
    violations.first().map(ToString::to_string).unwrap_or_default()
}

/// Allow-list entry as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRuleSpec {
    /// Regex searched for anywhere in the line
    pub pattern: String,
    /// Why this line is acceptable
    pub reason: String,
}

impl AllowRuleSpec {
    pub fn new(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

/// Compiled allow-list entry
#[derive(Debug, Clone)]
pub struct AllowRule {
    pattern: Regex,
    reason: String,
}

impl AllowRule {
    pub fn compile(spec: &AllowRuleSpec) -> Result<Self, LogScanError> {
        Ok(Self {
            pattern: Regex::new(&spec.pattern)?,
            reason: spec.reason.clone(),
        })
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn matches(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

/// An error line not covered by the allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogViolation {
    /// 1-based line number
    pub line_number: usize,
    pub line: String,
}

impl fmt::Display for LogViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line_number, self.line)
    }
}

/// Compiled log policy
#[derive(Debug, Clone)]
pub struct LogPolicy {
    name: String,
    success_markers: Vec<Regex>,
    error_pattern: Regex,
    allow_list: Vec<AllowRule>,
}

impl LogPolicy {
    pub fn builder(name: impl Into<String>) -> LogPolicyBuilder {
        LogPolicyBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allow_list(&self) -> &[AllowRule] {
        &self.allow_list
    }

    /// Append allow rules after the built-in ones
    pub fn with_extra_allow_rules(mut self, rules: &[AllowRuleSpec]) -> Result<Self, LogScanError> {
        for spec in rules {
            self.allow_list.push(AllowRule::compile(spec)?);
        }
        Ok(self)
    }

    /// Success markers that do not appear anywhere in `text`
    pub fn missing_markers(&self, text: &str) -> Vec<String> {
        self.success_markers
            .iter()
            .filter(|re| !re.is_match(text))
            .map(|re| re.as_str().to_string())
            .collect()
    }

    /// The allow rule exempting `line`, if any
    pub fn allowed_by(&self, line: &str) -> Option<&AllowRule> {
        self.allow_list.iter().find(|rule| rule.matches(line))
    }

    /// Error lines that no allow rule covers
    pub fn violations(&self, text: &str) -> Vec<LogViolation> {
        text.lines()
            .enumerate()
            .filter_map(|(idx, line)| {
                if let Some(rule) = self.allowed_by(line) {
                    trace!(policy = %self.name, reason = %rule.reason, "Allow-listed log line");
                    return None;
                }
                self.error_pattern.is_match(line).then(|| LogViolation {
                    line_number: idx + 1,
                    line: line.to_string(),
                })
            })
            .collect()
    }

    pub fn check_markers(&self, text: &str) -> Result<(), LogScanError> {
        let markers = self.missing_markers(text);
        if markers.is_empty() {
            Ok(())
        } else {
            Err(LogScanError::MissingMarkers {
                policy: self.name.clone(),
                markers,
            })
        }
    }

    pub fn check_clean(&self, text: &str) -> Result<(), LogScanError> {
        let violations = self.violations(text);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(LogScanError::ErrorLines {
                policy: self.name.clone(),
                violations,
            })
        }
    }
}

/// Builder for [`LogPolicy`]
#[derive(Debug, Clone)]
pub struct LogPolicyBuilder {
    name: String,
    markers: Vec<String>,
    error_pattern: String,
    allow: Vec<AllowRuleSpec>,
}

impl LogPolicyBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            markers: Vec::new(),
            error_pattern: r"\| error \|".to_string(),
            allow: Vec::new(),
        }
    }

    pub fn marker(mut self, pattern: impl Into<String>) -> Self {
        self.markers.push(pattern.into());
        self
    }

    /// Pattern flagging an error line, matched case-insensitively
    pub fn error_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.error_pattern = pattern.into();
        self
    }

    pub fn allow(mut self, pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        self.allow.push(AllowRuleSpec::new(pattern, reason));
        self
    }

    pub fn build(self) -> Result<LogPolicy, LogScanError> {
        let success_markers = self
            .markers
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        let error_pattern = RegexBuilder::new(&self.error_pattern)
            .case_insensitive(true)
            .build()?;

        let allow_list = self
            .allow
            .iter()
            .map(AllowRule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LogPolicy {
            name: self.name,
            success_markers,
            error_pattern,
            allow_list,
        })
    }
}

/// Main agent log on Linux hosts
pub fn linux_agent_log() -> Result<LogPolicy, LogScanError> {
    LogPolicy::builder("agent log")
        .marker("Sent host metadata payload")
        .allow(
            r#"Error code "400 Bad Request" received while sending transaction to "https://.*/stsAgent/intake/"#,
            "update event endpoint rejects intake transactions until the receiver accepts them",
        )
        .allow(
            "x509: certificate signed by unknown authority",
            "test receivers use self-signed certificates",
        )
        .allow(
            "Too many errors for endpoint 'https://testagent.com/",
            "unreachable dummy endpoint configured on purpose",
        )
        .build()
}

/// Process agent log, same expectations on every platform
pub fn process_agent_log() -> Result<LogPolicy, LogScanError> {
    LogPolicy::builder("process-agent log")
        .marker("Finished check #1")
        .marker("starting network tracer locally")
        .error_pattern("error")
        .build()
}

/// Main agent log on Windows hosts
pub fn windows_agent_log() -> Result<LogPolicy, LogScanError> {
    LogPolicy::builder("agent log")
        .marker("Successfully posted payload to.*stsAgent/intake")
        .build()
}

/// Trace agent log on Windows hosts
pub fn trace_agent_log() -> Result<LogPolicy, LogScanError> {
    LogPolicy::builder("trace-agent log")
        .marker("Trace agent running on host")
        .marker("Listening for traces at")
        .marker("No data received")
        .build()
}
