use console::{Style, StyledObject, Term};
use lazy_static::lazy_static;

/// Formats its arguments and styles the result for `$ui`.
#[macro_export]
macro_rules! color {
    ($ui:expr, $style:expr, $format_string:expr $(, $arg:expr)*) => {{
        $ui.apply($style.apply_to(format!($format_string $(, $arg)*)))
    }};
}

/// Whether console output carries ANSI styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UI {
    pub should_strip_ansi: bool,
}

impl UI {
    pub fn new(should_strip_ansi: bool) -> Self {
        Self { should_strip_ansi }
    }

    /// Colors unless `NO_COLOR` is set, `FORCE_COLOR` disables it, or
    /// stdout is not a terminal. `FORCE_COLOR` beats the terminal check.
    pub fn infer() -> Self {
        Self::from_env(
            std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty()),
            std::env::var("FORCE_COLOR").ok().as_deref(),
            Term::stdout().is_term(),
        )
    }

    fn from_env(no_color: bool, force_color: Option<&str>, is_term: bool) -> Self {
        if no_color {
            return Self::new(true);
        }
        let forced = force_color.and_then(|value| match value {
            "false" | "0" => Some(false),
            "true" | "1" | "2" | "3" => Some(true),
            _ => None,
        });
        Self::new(!forced.unwrap_or(is_term))
    }

    pub fn apply<D>(&self, obj: StyledObject<D>) -> StyledObject<D> {
        obj.force_styling(!self.should_strip_ansi)
    }
}

lazy_static! {
    pub static ref BOLD: Style = Style::new().bold();
    pub static ref GREY: Style = Style::new().dim();
    pub static ref YELLOW: Style = Style::new().yellow();
    pub static ref BOLD_GREEN: Style = Style::new().green().bold();
    pub static ref BOLD_RED: Style = Style::new().red().bold();
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case(true, Some("1"), true, true ; "no color wins")]
    #[test_case(false, Some("1"), false, false ; "forced on")]
    #[test_case(false, Some("0"), true, true ; "forced off")]
    #[test_case(false, Some("maybe"), true, false ; "unknown value falls back to terminal")]
    #[test_case(false, None, false, true ; "piped output")]
    fn infers_styling(no_color: bool, force_color: Option<&str>, is_term: bool, strip: bool) {
        assert_eq!(
            UI::from_env(no_color, force_color, is_term),
            UI::new(strip)
        );
    }

    #[test]
    fn stripped_output_is_plain() {
        let ui = UI::new(true);
        assert_eq!(color!(ui, BOLD_RED, "{} failed", "compile").to_string(), "compile failed");
    }
}
