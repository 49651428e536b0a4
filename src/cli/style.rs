//! Terminal styling helpers

use owo_colors::{OwoColorize, Stream, Style};

/// Color helpers that switch themselves off when stdout is not a terminal
pub trait Stylize {
    /// Secondary text
    fn muted(&self) -> String;
    /// Success text
    fn success(&self) -> String;
    /// Warning text
    fn warn(&self) -> String;
    /// Error text
    fn error(&self) -> String;
    /// Highlighted identifiers
    fn accent(&self) -> String;
}

fn styled(text: &str, style: Style) -> String {
    text.if_supports_color(Stream::Stdout, |t| t.style(style))
        .to_string()
}

impl<T: AsRef<str>> Stylize for T {
    fn muted(&self) -> String {
        styled(self.as_ref(), Style::new().dimmed())
    }

    fn success(&self) -> String {
        styled(self.as_ref(), Style::new().green())
    }

    fn warn(&self) -> String {
        styled(self.as_ref(), Style::new().yellow())
    }

    fn error(&self) -> String {
        styled(self.as_ref(), Style::new().red().bold())
    }

    fn accent(&self) -> String {
        styled(self.as_ref(), Style::new().cyan())
    }
}
