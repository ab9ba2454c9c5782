use std::str::Lines;

pub mod format;

pub use format::{
    FormatMatch, FormatterRegistry, Line, LineFormatter, NickFormatter, ParamValue, RenderedLine,
    TimestampFormatter,
};

/// Splits raw dialog text into logical lines.
///
/// A physical line indented deeper than the line that opened the current
/// logical line is a continuation and gets joined onto it with a single
/// space. Anything at the same or a shallower indent starts a new logical
/// line. The iterator borrows the input and carries no state between calls.
pub fn parse_dialog(text: &str) -> DialogLines<'_> {
    DialogLines {
        physical: text.trim().lines(),
        start_indent: 0,
        current: None,
        done: false,
    }
}

pub struct DialogLines<'a> {
    physical: Lines<'a>,
    start_indent: usize,
    current: Option<String>,
    done: bool,
}

impl<'a> Iterator for DialogLines<'a> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        for raw in self.physical.by_ref() {
            let indent = indent_width(raw);
            let piece = raw.trim();
            match self.current.as_mut() {
                Some(current) if indent > self.start_indent => {
                    if !piece.is_empty() {
                        if !current.is_empty() {
                            current.push(' ');
                        }
                        current.push_str(piece);
                    }
                }
                _ => {
                    self.start_indent = indent;
                    let finished = self.current.replace(piece.to_string());
                    if finished.is_some() {
                        return finished;
                    }
                }
            }
        }
        self.done = true;
        self.current.take().filter(|line| !line.is_empty())
    }
}

fn indent_width(line: &str) -> usize {
    line.chars().take_while(|ch| ch.is_whitespace()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(text: &str) -> Vec<String> {
        parse_dialog(text).collect()
    }

    #[test]
    fn deeper_indent_continues_the_previous_line() {
        assert_eq!(collect("a\n  b\nc"), vec!["a b", "c"]);
    }

    #[test]
    fn equal_indent_starts_a_new_line() {
        assert_eq!(
            collect("<bob> one\n<amy> two\n<bob> three"),
            vec!["<bob> one", "<amy> two", "<bob> three"]
        );
    }

    #[test]
    fn continuation_is_measured_against_the_opening_line() {
        let text = "<bob> this wraps\n    over two\n    and three lines\n  <amy> indented reply";
        assert_eq!(
            collect(text),
            vec!["<bob> this wraps over two and three lines <amy> indented reply"]
        );

        let text = "<bob> first\n  <amy> nested\n<bob> second";
        assert_eq!(collect(text), vec!["<bob> first <amy> nested", "<bob> second"]);
    }

    #[test]
    fn trailing_continuation_is_flushed() {
        assert_eq!(collect("a\n   b\n   c"), vec!["a b c"]);
    }

    #[test]
    fn windows_newlines_are_accepted() {
        assert_eq!(collect("a\r\n  b\r\nc\r\n"), vec!["a b", "c"]);
    }

    #[test]
    fn blank_lines_at_column_zero_are_kept() {
        assert_eq!(collect("a\n\nb"), vec!["a", "", "b"]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(collect("").is_empty());
        assert!(collect("   \n  \n").is_empty());
    }

    #[test]
    fn parsing_is_restartable() {
        let text = "x\n  y\nz";
        assert_eq!(collect(text), collect(text));
    }
}
