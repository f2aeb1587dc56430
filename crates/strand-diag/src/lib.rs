//! Error reporting and diagnostics for the strand backend.
//!
//! Generation errors and warnings are collected per emitted unit and surfaced
//! here as structured diagnostics with stable codes. Hard errors drop the
//! affected unit; warnings leave a placeholder in the generated text.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Diagnostic severity and categories
// ---------------------------------------------------------------------------

/// How severe a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Broad category for diagnostics. Used for filtering and grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// An instruction kind the engine does not know how to lower.
    UnknownInstruction,
    /// A type whose size, alignment or field offsets cannot be computed.
    UnresolvedLayout,
    /// A select state whose channel direction is neither send nor receive.
    InvalidChannelDirection,
    /// `go`/`defer` combined with a callee kind that cannot be dispatched that way.
    UnsupportedDispatch,
    /// Structural problems in the input function (numbering, terminators, edges).
    MalformedFunction,
    /// A function was referenced or generated without a body.
    MissingBody,
    /// The target has no mapping for a builtin.
    MissingBuiltin,
    /// Target capability constants are out of range.
    InvalidLimits,
    /// The input program could not be decoded.
    MalformedInput,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::UnknownInstruction,
        Category::UnresolvedLayout,
        Category::InvalidChannelDirection,
        Category::UnsupportedDispatch,
        Category::MalformedFunction,
        Category::MissingBody,
        Category::MissingBuiltin,
        Category::InvalidLimits,
        Category::MalformedInput,
    ];

    pub fn all() -> &'static [Category] {
        &Self::ALL
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::UnknownInstruction => "unknown_instruction",
            Category::UnresolvedLayout => "unresolved_layout",
            Category::InvalidChannelDirection => "invalid_channel_direction",
            Category::UnsupportedDispatch => "unsupported_dispatch",
            Category::MalformedFunction => "malformed_function",
            Category::MissingBody => "missing_body",
            Category::MissingBuiltin => "missing_builtin",
            Category::InvalidLimits => "invalid_limits",
            Category::MalformedInput => "malformed_input",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Category::UnknownInstruction => "G0001",
            Category::UnresolvedLayout => "G0002",
            Category::InvalidChannelDirection => "G0003",
            Category::UnsupportedDispatch => "G0004",
            Category::MalformedFunction => "G0005",
            Category::MissingBody => "W0001",
            Category::MissingBuiltin => "W0002",
            Category::InvalidLimits => "G0101",
            Category::MalformedInput => "G0102",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Category::UnknownInstruction => "The instruction kind has no lowering.",
            Category::UnresolvedLayout => "The size, alignment or offsets of a type are unknown.",
            Category::InvalidChannelDirection => {
                "A select state must either send on or receive from its channel."
            }
            Category::UnsupportedDispatch => {
                "The callee cannot be started with `go` or deferred with `defer`."
            }
            Category::MalformedFunction => "The function violates an SSA well-formedness rule.",
            Category::MissingBody => "A function has no body; calls to it fail at run time.",
            Category::MissingBuiltin => "The target has no code for this builtin.",
            Category::InvalidLimits => "Target word size, alignment or limits are out of range.",
            Category::MalformedInput => "The program file is not a valid SSA program.",
        }
    }

    pub fn example_fix(self) -> &'static str {
        match self {
            Category::UnknownInstruction => "Upgrade the backend or lower the instruction earlier.",
            Category::UnresolvedLayout => {
                "Give every named type an underlying type and keep field indices in range."
            }
            Category::InvalidChannelDirection => {
                "Emit select states with an explicit `send` or `recv` direction."
            }
            Category::UnsupportedDispatch => "Wrap the call in a closure and start that instead.",
            Category::MalformedFunction => "Rebuild the SSA form from the front end.",
            Category::MissingBody => "Link the package that defines the function.",
            Category::MissingBuiltin => "Implement the builtin for this target.",
            Category::InvalidLimits => "Use a word size of at least 4 and limits of at least 1.",
            Category::MalformedInput => "Regenerate the program file with the front end.",
        }
    }
}

// ---------------------------------------------------------------------------
// Source locations
// ---------------------------------------------------------------------------

/// A source location for diagnostics, as reported by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    #[serde(default)]
    pub file_id: u32,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file_id, self.line, self.column)
    }
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable diagnostic code (e.g. G0001).
    pub code: Option<String>,
    pub severity: Severity,
    pub category: Category,
    /// Primary message: what went wrong.
    pub message: String,
    /// Function or package unit the diagnostic belongs to.
    pub unit: Option<String>,
    /// Where it went wrong.
    pub location: Option<SourceLocation>,
    pub labels: Vec<DiagLabel>,
    /// Suggested fix, if any.
    pub help: Option<String>,
}

/// A labeled source location within a diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagLabel {
    pub location: SourceLocation,
    pub message: String,
}

impl Diagnostic {
    fn new(severity: Severity, category: Category, message: impl Into<String>) -> Self {
        Self {
            code: Some(category.code().to_string()),
            severity,
            category,
            message: message.into(),
            unit: None,
            location: None,
            labels: Vec::new(),
            help: None,
        }
    }

    pub fn error(category: Category, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, category, message)
    }

    pub fn warning(category: Category, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, message)
    }

    pub fn info(category: Category, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, category, message)
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn at_opt(mut self, location: Option<SourceLocation>) -> Self {
        self.location = location.or(self.location);
        self
    }

    pub fn in_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_label(mut self, location: SourceLocation, message: impl Into<String>) -> Self {
        self.labels.push(DiagLabel {
            location,
            message: message.into(),
        });
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        if let Some(code) = &self.code {
            write!(f, "{prefix}[{code}]: {}", self.message)?;
        } else {
            write!(f, "{prefix}: {}", self.message)?;
        }
        match (&self.unit, &self.location) {
            (Some(unit), Some(loc)) => write!(f, "\n  --> {unit} @ {loc}")?,
            (Some(unit), None) => write!(f, "\n  --> {unit}")?,
            (None, Some(loc)) => write!(f, "\n  --> {loc}")?,
            (None, None) => {}
        }
        for label in &self.labels {
            write!(f, "\n  note: {} ({})", label.message, label.location)?;
        }
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}

/// Count errors in a diagnostic list.
pub fn error_count(diagnostics: &[Diagnostic]) -> usize {
    diagnostics.iter().filter(|d| d.is_error()).count()
}

// ---------------------------------------------------------------------------
// Error type for crates that produce diagnostics
// ---------------------------------------------------------------------------

/// Error type wrapping one or more diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", .0.first().map(|d| d.to_string()).unwrap_or_default())]
pub struct DiagnosticError(pub Vec<Diagnostic>);

impl DiagnosticError {
    pub fn single(diag: Diagnostic) -> Self {
        Self(vec![diag])
    }

    pub fn multiple(diags: Vec<Diagnostic>) -> Self {
        Self(diags)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_builder() {
        let loc = SourceLocation {
            file_id: 0,
            line: 12,
            column: 4,
        };
        let diag = Diagnostic::error(Category::InvalidChannelDirection, "select state 1 has no direction")
            .at(loc)
            .in_unit("main.pump")
            .with_help("use send or recv");

        assert_eq!(diag.severity, Severity::Error);
        assert_eq!(diag.code.as_deref(), Some("G0003"));
        assert_eq!(diag.unit.as_deref(), Some("main.pump"));
        assert!(diag.help.unwrap().contains("recv"));
    }

    #[test]
    fn diagnostic_display() {
        let diag = Diagnostic::warning(Category::MissingBody, "function `os.Exit` has no body")
            .in_unit("main.main");
        let s = format!("{diag}");
        assert!(s.starts_with("warning[W0001]: function `os.Exit`"));
        assert!(s.contains("--> main.main"));
    }

    #[test]
    fn category_metadata_is_stable_and_unique() {
        let mut codes = std::collections::BTreeSet::new();
        for cat in Category::all() {
            assert!(!cat.as_str().is_empty());
            assert!(!cat.description().is_empty());
            assert!(!cat.example_fix().is_empty());
            assert!(
                codes.insert(cat.code()),
                "duplicate diagnostic code detected: {}",
                cat.code()
            );
        }
    }

    #[test]
    fn diagnostics_serialize_with_snake_case_categories() {
        let diag = Diagnostic::error(Category::UnresolvedLayout, "named type `T` has no underlying type");
        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("\"unresolved_layout\""));
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, diag);
    }

    #[test]
    fn error_count_ignores_warnings() {
        let diags = vec![
            Diagnostic::warning(Category::MissingBuiltin, "no mapping for `ssa:foo`"),
            Diagnostic::error(Category::UnknownInstruction, "unknown"),
        ];
        assert_eq!(error_count(&diags), 1);
        let err = DiagnosticError::multiple(diags);
        assert!(err.to_string().starts_with("warning[W0002]"));
    }
}
