/// Bold ANSI colorizer for status lines. One instance is threaded through
/// everything that writes to the terminal; `--no-color` turns every method
/// into a passthrough, including the line-clear escape used by the progress
/// display.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Painter {
    enabled: bool,
}

impl Painter {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn paint(&self, code: u8, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{code};1m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub(crate) fn cyan(&self, text: &str) -> String {
        self.paint(36, text)
    }

    pub(crate) fn green(&self, text: &str) -> String {
        self.paint(32, text)
    }

    pub(crate) fn red(&self, text: &str) -> String {
        self.paint(31, text)
    }

    pub(crate) fn yellow(&self, text: &str) -> String {
        self.paint(33, text)
    }

    /// Carriage return plus erase-line, or a bare `\r` fallback when ANSI
    /// output is disabled.
    pub(crate) fn clear_line(&self) -> &'static str {
        if self.enabled {
            "\r\x1b[2K"
        } else {
            "\r"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_wrap_in_bold_sgr() {
        let p = Painter::new(true);
        assert_eq!(p.green("ok"), "\x1b[32;1mok\x1b[0m");
        assert_eq!(p.red("no"), "\x1b[31;1mno\x1b[0m");
    }

    #[test]
    fn disabled_painter_is_a_passthrough() {
        let p = Painter::new(false);
        assert_eq!(p.cyan("plain"), "plain");
        assert_eq!(p.clear_line(), "\r");
    }
}
