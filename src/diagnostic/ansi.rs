use super::{Diagnostic, Severity};

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

        // "error[R003]: message"
        let mut severity_label = match d.severity {
            Severity::Error => "error".to_string(),
            Severity::Warning => "warning".to_string(),
        };
        if let Some(code) = d.code {
            severity_label.push_str(&format!("[{code}]"));
        }
        let severity_label = match d.severity {
            Severity::Error => self.bold_red(&severity_label),
            Severity::Warning => self.bold(&self.cyan(&severity_label)),
        };
        out.push_str(&format!("{}: {}\n", severity_label, self.bold(&d.message)));

        if let Some(loc) = &d.location {
            // "  --> function:pc"
            out.push_str(&format!("  {} {}:{}\n", self.cyan("-->"), loc.function, loc.pc));

            if let Some(instr) = &d.instruction {
                let number = format!("{:04}", loc.pc);
                let pad = " ".repeat(number.len());
                let pipe = self.cyan("|");
                let width = instr.split_whitespace().next().map_or(1, str::len);
                out.push_str(&format!("{pad} {pipe}\n"));
                out.push_str(&format!("{} {pipe} {instr}\n", self.cyan(&number)));
                out.push_str(&format!("{pad} {pipe} {}\n", self.bold_red(&"^".repeat(width))));
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

    fn make_diag() -> Diagnostic {
        Diagnostic::error("Type Error: expected list, got number")
            .with_code("R006")
            .at("@main", 3)
            .with_instruction("PUSH    r1, r2")
            .with_note("in function 'f'")
            .with_suggestion("push onto a list")
    }

    #[test]
    fn render_contains_error_label() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag());
        assert!(out.starts_with("error[R006]: Type Error"), "bad header in:\n{out}");
    }

    #[test]
    fn render_contains_location() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag());
        assert!(out.contains("--> @main:3"), "missing location in:\n{out}");
    }

    #[test]
    fn render_contains_instruction_and_carets() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag());
        assert!(out.contains("0003 | PUSH    r1, r2"), "missing instruction in:\n{out}");
        assert!(out.contains("| ^^^^\n"), "missing carets in:\n{out}");
    }

    #[test]
    fn render_contains_note_and_suggestion() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag());
        assert!(out.contains("note: in function 'f'"), "missing note in:\n{out}");
        assert!(out.contains("suggestion: push onto a list"), "missing suggestion in:\n{out}");
    }

    #[test]
    fn render_without_location() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&Diagnostic::error("something bad"));
        assert_eq!(out, "error: something bad\n");
    }

    #[test]
    fn color_toggles_ansi_codes() {
        let colored = AnsiRenderer { use_color: true }.render(&make_diag());
        let plain = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(colored.contains("\x1b["));
        assert!(!plain.contains("\x1b["));
    }
}
