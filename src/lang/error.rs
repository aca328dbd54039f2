//! Script engine error types with span-based diagnostics.

use thiserror::Error;

/// Byte range into the script source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both operands.
    pub fn join(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Errors produced by the scripting pipeline (lex, parse, evaluate).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScriptError {
    #[error("lex error at {}: {message}", annotate(.span))]
    Lex { message: String, span: Span },

    #[error("parse error at {}: {message}", annotate(.span))]
    Parse { message: String, span: Span },

    #[error("type error at {}: {message}", annotate(.span))]
    Type { message: String, span: Span },

    #[error("bounds error at {}: {message}", annotate(.span))]
    Bounds { message: String, span: Span },

    #[error("required condition is not (always) fulfilled at {}", annotate(.span))]
    RequireFailed { span: Span },

    #[error("model error at {}: {message}", annotate(.span))]
    Model { message: String, span: Span },

    #[error("evaluation aborted at {}", annotate(.span))]
    Aborted { span: Span },

    #[error("internal error at {}: {message}", annotate(.span))]
    Internal { message: String, span: Span },
}

impl ScriptError {
    pub fn span(&self) -> Span {
        match self {
            Self::Lex { span, .. }
            | Self::Parse { span, .. }
            | Self::Type { span, .. }
            | Self::Bounds { span, .. }
            | Self::RequireFailed { span }
            | Self::Model { span, .. }
            | Self::Aborted { span }
            | Self::Internal { span, .. } => *span,
        }
    }
}

// Spans print as byte offsets; line/col rendering needs the source and lives
// in `annotate_source`.
fn annotate(span: &Span) -> String {
    format!("{}-{}", span.start, span.end)
}

/// Renders a span as `line L, col C` against the source text.
pub fn annotate_source(source: &str, span: Span) -> String {
    let before = &source[..span.start.min(source.len())];
    let line = before.chars().filter(|&c| c == '\n').count() + 1;
    let col = before
        .rfind('\n')
        .map_or(span.start, |nl| span.start - nl - 1)
        + 1;
    format!("line {line}, col {col}")
}

/// Renders the offending source line with a caret marker underneath, for
/// top-level error reports and the interactive mode.
pub fn code_context(source: &str, span: Span) -> String {
    let start = span.start.min(source.len());
    let line_start = source[..start].rfind('\n').map_or(0, |nl| nl + 1);
    let line_end = source[start..]
        .find('\n')
        .map_or(source.len(), |nl| start + nl);
    let line = &source[line_start..line_end];
    let caret_pos = start - line_start;
    let width = (span.end.min(line_end) - start).max(1);
    format!(
        "{line}\n{}{}",
        " ".repeat(caret_pos),
        "^".repeat(width.min(line.len().saturating_sub(caret_pos).max(1)))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotates_line_and_column() {
        let src = "NUMBER x;\nx = 1;\n";
        let span = Span::new(10, 11); // the second 'x'
        assert_eq!(annotate_source(src, span), "line 2, col 1");
    }

    #[test]
    fn code_context_points_at_offender() {
        let src = "NUMBER x;\nx = unknown;\n";
        let span = Span::new(14, 21);
        let ctx = code_context(src, span);
        assert!(ctx.starts_with("x = unknown;"));
        assert!(ctx.contains("^^^^^^^"));
    }

    #[test]
    fn join_covers_both_spans() {
        let joined = Span::new(3, 5).join(Span::new(9, 12));
        assert_eq!(joined, Span::new(3, 12));
    }
}
