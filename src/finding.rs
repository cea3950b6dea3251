//! Finding and span model.
//!
//! A finding is a structured diagnostic produced by a check: a level, a
//! message, an optional file and span, and optional suggested replacements.
//! Spans are 1-based with inclusive line ranges; the end *column* is
//! exclusive, so a zero-width span `(l, c)–(l, c)` is a pure insertion
//! point. Zero means "unset" for every position field.

use anyhow::bail;
use serde::Serialize;

/// Severity of a finding.
///
/// An `Error` finding causes the run to fail after all checks finish; it
/// does not interrupt other checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Notice,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }

    /// Parse the script-facing level string.
    pub fn from_str(s: &str) -> anyhow::Result<Level> {
        match s {
            "notice" => Ok(Level::Notice),
            "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            _ => bail!("level must be \"notice\", \"warning\" or \"error\", got {s:?}"),
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 1-based position. `0` in either field means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

/// A span inside a file: inclusive line range, exclusive end column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: Pos,
    pub end: Pos,
}

impl Span {
    pub fn is_unset(&self) -> bool {
        *self == Span::default()
    }

    /// Validate the unset/ordering rules: a column requires its line, an end
    /// column requires a start column, and the end must not precede the
    /// start in reading order.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.start.col != 0 && self.start.line == 0 {
            bail!("col requires line");
        }
        if self.end.col != 0 && self.end.line == 0 {
            bail!("end_col requires end_line");
        }
        if self.end.line != 0 && self.start.line == 0 {
            bail!("end_line requires line");
        }
        if self.end.col != 0 && self.start.col == 0 {
            bail!("end_col requires col");
        }
        if self.end.line != 0 {
            if self.end.line < self.start.line {
                bail!("end_line must not be before line");
            }
            if self.end.line == self.start.line && self.end.col != 0 && self.end.col < self.start.col
            {
                bail!("end_col must not be before col");
            }
        }
        Ok(())
    }
}

/// A structured diagnostic tied to an optional file span.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// Name of the check that emitted this finding.
    pub check: String,
    pub level: Level,
    pub message: String,
    /// POSIX path relative to the SCM root, if the finding is tied to a file.
    pub file: Option<String>,
    pub span: Span,
    /// Suggested replacement texts. The fixer only applies findings with
    /// exactly one replacement.
    pub replacements: Vec<String>,
}

impl Finding {
    /// Validate the finding against the emit contract.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.message.is_empty() {
            bail!("message is required");
        }
        match &self.file {
            Some(file) => {
                if file.is_empty() {
                    bail!("filepath must not be empty");
                }
            }
            None => {
                if !self.span.is_unset() {
                    bail!("line requires filepath");
                }
                if !self.replacements.is_empty() {
                    bail!("replacements require filepath");
                }
            }
        }
        self.span.validate()
    }
}
