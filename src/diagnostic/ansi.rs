use super::Diagnostic;
use crate::source::SourceMap;

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    fn dim(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[2m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        // "error[QL-C002]: message"
        let severity = match d.code {
            Some(code) => self.bold_red(&format!("error[{code}]")),
            None => self.bold_red("error"),
        };
        out.push_str(&format!("{}: {}\n", severity, self.bold(&d.message)));

        let primary = d.labels.first();
        match (primary, &d.source) {
            (Some(label), Some(source)) => {
                let map = SourceMap::new(source);
                let (line, col) = map.lookup(label.span.start);
                let line_text = map.line_text(source, line);

                // "  --> file:line:col"
                let location = match &d.filename {
                    Some(file) => format!("{file}:{line}:{col}"),
                    None => format!("{line}:{col}"),
                };
                out.push_str(&format!("  {} {}\n", self.cyan("-->"), location));

                let gutter = line.to_string().len();
                let pipe = self.cyan("|");
                let pad = " ".repeat(gutter);

                out.push_str(&format!("{pad} {pipe}\n"));
                let line_num = self.cyan(&format!("{line:>gutter$}"));
                out.push_str(&format!("{line_num} {pipe} {line_text}\n"));

                // Carets stop at the end of the line for spans that run past it.
                let start = col.saturating_sub(1);
                let room = line_text.len().saturating_sub(start).max(1);
                let span_len = label.span.end.saturating_sub(label.span.start).clamp(1, room);
                let carets = self.bold_red(&"^".repeat(span_len));
                let indent = " ".repeat(start);
                if label.message.is_empty() {
                    out.push_str(&format!("{pad} {pipe} {indent}{carets}\n"));
                } else {
                    out.push_str(&format!("{pad} {pipe} {indent}{carets} {}\n", self.bold_red(&label.message)));
                }
                out.push_str(&format!("{pad} {pipe}\n"));
            }
            (Some(_), None) | (None, _) => {
                if let Some(file) = &d.filename {
                    out.push_str(&format!("  {} {}\n", self.cyan("-->"), file));
                }
            }
        }

        for note in &d.notes {
            out.push_str(&format!("  {} note: {}\n", self.dim("="), note));
        }

        if let Some(suggestion) = &d.suggestion {
            out.push_str(&format!("  {} suggestion: {}\n", self.dim("="), suggestion));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Span;

    const SOURCE: &str = "let total = 0;\nprintln(totl);";

    fn make_diag(start: usize, end: usize) -> Diagnostic {
        Diagnostic::error("undefined variable 'totl'")
            .with_code("QL-C002")
            .with_filename("main.ql")
            .with_span(Span::new(start, end), "here")
            .with_source(SOURCE)
            .with_note("in function '<script>'")
            .with_suggestion("declare it first: `let totl = ...;`")
    }

    #[test]
    fn render_contains_code_and_message() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag(23, 27));
        assert!(out.starts_with("error[QL-C002]: undefined variable 'totl'\n"), "got:\n{out}");
    }

    #[test]
    fn render_points_at_second_line() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag(23, 27));
        assert!(out.contains("--> main.ql:2:9"), "missing location in:\n{out}");
        assert!(out.contains("2 | println(totl);"), "missing source line in:\n{out}");
        assert!(out.contains("  |         ^^^^ here"), "bad caret line in:\n{out}");
    }

    #[test]
    fn render_contains_note_and_suggestion() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag(23, 27));
        assert!(out.contains("note: in function '<script>'"), "missing note in:\n{out}");
        assert!(out.contains("suggestion: declare it first"), "missing suggestion in:\n{out}");
    }

    #[test]
    fn render_without_source_names_the_file() {
        let r = AnsiRenderer { use_color: false };
        let d = Diagnostic::error("division by zero").with_code("QL-R006").with_filename("a.ql");
        let out = r.render(&d);
        assert!(out.contains("error[QL-R006]: division by zero"));
        assert!(out.contains("--> a.ql\n"));
        assert!(!out.contains('^'));
    }

    #[test]
    fn carets_are_clamped_to_the_line() {
        let r = AnsiRenderer { use_color: false };
        let d = Diagnostic::error("unterminated string literal")
            .with_span(Span::new(4, 40), "")
            .with_source("let \"abc\nnext");
        let out = r.render(&d);
        assert!(out.contains("    ^^^^\n"), "got:\n{out}");
    }

    #[test]
    fn color_toggles_escape_codes() {
        let plain = AnsiRenderer { use_color: false }.render(&make_diag(23, 27));
        let colored = AnsiRenderer { use_color: true }.render(&make_diag(23, 27));
        assert!(!plain.contains("\x1b["));
        assert!(colored.contains("\x1b["));
    }
}
