// Diagnostics reported against module text.
//
// Lexing, parsing and resolution report here, and so does the driver when
// the schedule check or the rewrite fails. Every diagnostic carries a stable
// code and a primary span; notes add secondary locations or plain detail.

use std::fmt;

use crate::ast::Span;

/// Stable diagnostic code such as `E0102`. A code keeps its meaning once
/// assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Stable codes, grouped by phase: `E00xx` lexing and parsing, `E01xx`
/// resolution, `E02xx` schedule verification, `E03xx` the rewrite itself.
pub mod codes {
    use super::DiagCode;

    pub const LEX_ERROR: DiagCode = DiagCode("E0001");
    pub const SYNTAX_ERROR: DiagCode = DiagCode("E0002");

    pub const DUPLICATE_COMPUTATION: DiagCode = DiagCode("E0100");
    pub const DUPLICATE_INSTRUCTION: DiagCode = DiagCode("E0101");
    pub const UNKNOWN_INSTRUCTION: DiagCode = DiagCode("E0102");
    pub const UNKNOWN_COMPUTATION: DiagCode = DiagCode("E0103");
    pub const UNKNOWN_ELEMENT_TYPE: DiagCode = DiagCode("E0104");
    pub const BAD_ATTRIBUTE: DiagCode = DiagCode("E0105");
    pub const BAD_PARAMETER: DiagCode = DiagCode("E0106");
    pub const GRAPH_ERROR: DiagCode = DiagCode("E0107");
    pub const EMPTY_COMPUTATION: DiagCode = DiagCode("E0108");
    pub const DUPLICATE_ENTRY: DiagCode = DiagCode("E0109");
    pub const DUPLICATE_ROOT: DiagCode = DiagCode("W0100");

    pub const INVALID_SCHEDULE: DiagCode = DiagCode("E0200");

    pub const PASS_FAILED: DiagCode = DiagCode("E0300");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

/// Extra context under a diagnostic, optionally pointing somewhere else in
/// the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub span: Option<Span>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: DiagCode,
    pub severity: Severity,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub notes: Vec<Note>,
}

impl Diagnostic {
    fn with_severity(severity: Severity, code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            span,
            message: message.into(),
            hint: None,
            notes: Vec::new(),
        }
    }

    pub fn error(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::with_severity(Severity::Error, code, span, message)
    }

    pub fn warning(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::with_severity(Severity::Warning, code, span, message)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Point at a second location, e.g. an earlier definition.
    pub fn with_note(mut self, span: Span, text: impl Into<String>) -> Self {
        self.notes.push(Note {
            span: Some(span),
            text: text.into(),
        });
        self
    }

    /// Add a line of detail with no location of its own.
    pub fn with_detail(mut self, text: impl Into<String>) -> Self {
        self.notes.push(Note {
            span: None,
            text: text.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Line and column (both 1-based) of byte offset `offset` in `source`.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before.rfind('\n').map_or(offset, |nl| offset - nl - 1) + 1;
    (line, col)
}

/// Render `diag` with a `--> path:line:col` location line, then its notes.
pub fn render(diag: &Diagnostic, path: &str, source: &str) -> String {
    let (line, col) = line_col(source, diag.span.start);
    let mut out = format!("{diag}\n  --> {path}:{line}:{col}");
    for note in &diag.notes {
        match note.span {
            Some(span) => {
                let (line, col) = line_col(source, span.start);
                out.push_str(&format!("\n  note: {} ({path}:{line}:{col})", note.text));
            }
            None => out.push_str(&format!("\n  note: {}", note.text)),
        }
    }
    out
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.severity.label(), self.code, self.message)?;
        match &self.hint {
            Some(hint) => write!(f, "\n  hint: {hint}"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(start: usize) -> Span {
        Span::from(start..start + 1)
    }

    #[test]
    fn warning_prints_its_code() {
        let d = Diagnostic::warning(codes::DUPLICATE_ROOT, at(0), "ROOT given twice");
        assert!(!d.is_error());
        assert_eq!(d.to_string(), "warning[W0100]: ROOT given twice");
    }

    #[test]
    fn hint_goes_on_its_own_line() {
        let d = Diagnostic::error(codes::INVALID_SCHEDULE, at(0), "module 'm' has no schedule")
            .with_hint("add `is_scheduled=true` to the HloModule header");
        assert_eq!(
            d.to_string(),
            "error[E0200]: module 'm' has no schedule\n  hint: add `is_scheduled=true` to the HloModule header"
        );
    }

    #[test]
    fn render_points_at_line_and_column() {
        let source = "HloModule m\nENTRY %main () -> s32[] {\n  %x = s32[] y\n}";
        let start = source.find("y\n").unwrap();
        let d = Diagnostic::error(codes::SYNTAX_ERROR, at(start), "found 'y'");
        assert_eq!(
            render(&d, "in.hlo", source),
            "error[E0002]: found 'y'\n  --> in.hlo:3:14"
        );
        assert_eq!(line_col(source, 0), (1, 1));
    }

    #[test]
    fn render_lists_notes_with_and_without_location() {
        let source = "HloModule m\n%a\n%a\n";
        let d = Diagnostic::error(codes::DUPLICATE_INSTRUCTION, at(15), "duplicate '%a'")
            .with_note(at(12), "first defined here")
            .with_detail("in computation '%main'");
        assert_eq!(
            render(&d, "x.hlo", source),
            "error[E0101]: duplicate '%a'\n  --> x.hlo:3:1\
             \n  note: first defined here (x.hlo:2:1)\
             \n  note: in computation '%main'"
        );
    }
}
