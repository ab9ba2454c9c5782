use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::Time;

use super::parse_dialog;

pub const PARAM_TIMESTAMP: &str = "timestamp";
pub const PARAM_ACTOR: &str = "actor";
pub const PARAM_NICKFLAG: &str = "nickflag";
pub const PARAM_NORMALIZED_NICK: &str = "normalized_nick";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Text(String),
    Time(Time),
}

impl ParamValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(value) => Some(value),
            ParamValue::Time(_) => None,
        }
    }

    pub fn as_time(&self) -> Option<Time> {
        match self {
            ParamValue::Time(value) => Some(*value),
            ParamValue::Text(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(value) => f.write_str(value),
            ParamValue::Time(value) => write!(
                f,
                "{:02}:{:02}:{:02}",
                value.hour(),
                value.minute(),
                value.second()
            ),
        }
    }
}

pub type FormatParams = BTreeMap<String, ParamValue>;

/// One piece of leading metadata recognised on a line.
///
/// `start..end` is a byte range into the text the formatter saw, which is
/// the line's original text with every earlier match already cut out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatMatch {
    pub formatter: String,
    pub start: usize,
    pub end: usize,
    pub params: FormatParams,
}

impl FormatMatch {
    pub fn new(formatter: &str, range: Range<usize>, params: FormatParams) -> Self {
        Self {
            formatter: formatter.to_string(),
            start: range.start,
            end: range.end,
            params,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

pub trait LineFormatter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the formatter is retried on the same line after a match.
    fn multiple(&self) -> bool {
        false
    }

    fn match_line(&self, line: &str) -> Option<FormatMatch>;
}

/// Optional `[HH:MM]` / `(H:MM:SS)` prefix.
pub struct TimestampFormatter;

static TIMESTAMP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*[\[(]?(?P<hour>[0-9]?[0-9]):(?P<minute>[0-9]{2})(?::(?P<second>[0-9]{2}))?[)\]]?\s*",
    )
    .expect("valid timestamp pattern")
});

impl LineFormatter for TimestampFormatter {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn match_line(&self, line: &str) -> Option<FormatMatch> {
        let caps = TIMESTAMP_PATTERN.captures(line)?;
        let component = |name: &str| -> Option<u8> {
            caps.name(name)
                .map(|m| m.as_str().parse::<u8>().ok())
                .unwrap_or(Some(0))
        };
        let timestamp = Time::from_hms(
            component("hour")?,
            component("minute")?,
            component("second")?,
        )
        .ok()?;
        let whole = caps.get(0)?;
        let mut params = FormatParams::new();
        params.insert(PARAM_TIMESTAMP.to_string(), ParamValue::Time(timestamp));
        Some(FormatMatch::new(self.name(), whole.range(), params))
    }
}

/// Speaker prefix such as `<bob>`, `[@op]`, `(+voice)` or `alice:`.
pub struct NickFormatter;

static NICK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*[\[<(]?(?P<nickflag>[\s@+])?(?P<nick>[\w`\[\]{}\\|-]+)[\]>):]+\s?",
    )
    .expect("valid nick pattern")
});

pub fn normalize_nick(nick: &str) -> String {
    nick.chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl LineFormatter for NickFormatter {
    fn name(&self) -> &'static str {
        "nick"
    }

    fn match_line(&self, line: &str) -> Option<FormatMatch> {
        let caps = NICK_PATTERN.captures(line)?;
        let nick = caps.name("nick")?.as_str();
        // a bare "12:" is a timestamp fragment, not a speaker
        if nick.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        let mut params = FormatParams::new();
        params.insert(
            PARAM_NORMALIZED_NICK.to_string(),
            ParamValue::Text(normalize_nick(nick)),
        );
        params.insert(PARAM_ACTOR.to_string(), ParamValue::Text(nick.to_string()));
        if let Some(flag) = caps.name("nickflag") {
            params.insert(
                PARAM_NICKFLAG.to_string(),
                ParamValue::Text(flag.as_str().to_string()),
            );
        }
        let whole = caps.get(0)?;
        Some(FormatMatch::new(self.name(), whole.range(), params))
    }
}

/// Ordered chain of formatters applied to every logical line.
pub struct FormatterRegistry {
    formatters: Vec<Box<dyn LineFormatter>>,
}

impl FormatterRegistry {
    pub fn new(formatters: Vec<Box<dyn LineFormatter>>) -> Self {
        Self { formatters }
    }

    pub fn standard() -> Self {
        Self::new(vec![Box::new(TimestampFormatter), Box::new(NickFormatter)])
    }

    pub fn formatter_names(&self) -> Vec<&'static str> {
        self.formatters.iter().map(|f| f.name()).collect()
    }

    pub fn annotate(&self, line: &str) -> Vec<FormatMatch> {
        let mut working = line.to_string();
        let mut matches = Vec::new();
        for formatter in &self.formatters {
            while let Some(found) = formatter.match_line(&working) {
                let range = found.range();
                let consumed = !range.is_empty();
                if working.get(range.clone()).is_none() {
                    tracing::warn!(
                        formatter = formatter.name(),
                        ?range,
                        "formatter reported an invalid range, ignoring match"
                    );
                    break;
                }
                working.replace_range(range, "");
                matches.push(found);
                if !formatter.multiple() || !consumed {
                    break;
                }
            }
        }
        matches
    }

    pub fn build_line(&self, original: String, preserve_formatting: bool) -> Line {
        let matches = if preserve_formatting {
            Vec::new()
        } else {
            self.annotate(&original)
        };
        Line { original, matches }
    }

    pub fn parse(&self, dialog: &str, preserve_formatting: bool) -> Vec<Line> {
        parse_dialog(dialog)
            .map(|line| self.build_line(line, preserve_formatting))
            .collect()
    }
}

impl Default for FormatterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub original: String,
    pub matches: Vec<FormatMatch>,
}

impl Line {
    pub fn render(&self) -> RenderedLine {
        let mut text = self.original.clone();
        let mut params = FormatParams::new();
        for found in &self.matches {
            if text.get(found.range()).is_some() {
                text.replace_range(found.range(), "");
            }
            params.extend(found.params.clone());
        }
        RenderedLine { text, params }
    }

    pub fn normalized_nick(&self) -> Option<&str> {
        self.matches
            .iter()
            .find_map(|found| found.params.get(PARAM_NORMALIZED_NICK))
            .and_then(ParamValue::as_text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedLine {
    pub text: String,
    pub params: FormatParams,
}

impl RenderedLine {
    fn text_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(ParamValue::as_text)
    }

    pub fn actor(&self) -> Option<&str> {
        self.text_param(PARAM_ACTOR)
    }

    pub fn normalized_nick(&self) -> Option<&str> {
        self.text_param(PARAM_NORMALIZED_NICK)
    }

    pub fn timestamp(&self) -> Option<Time> {
        self.params.get(PARAM_TIMESTAMP).and_then(ParamValue::as_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::time;

    #[test]
    fn nick_formatter_strips_angle_bracket_speaker() {
        let registry = FormatterRegistry::standard();
        let line = registry.build_line("<bob> hello".to_string(), false);
        let rendered = line.render();
        assert_eq!(rendered.text, "hello");
        assert_eq!(rendered.actor(), Some("bob"));
        assert_eq!(rendered.normalized_nick(), Some("bob"));
        assert_eq!(line.matches.len(), 1);
        assert_eq!(line.matches[0].range(), 0..6);
    }

    #[test]
    fn nick_formatter_rejects_all_digit_nicks() {
        assert!(NickFormatter.match_line("<123> hi").is_none());
        assert!(NickFormatter.match_line("12: hi").is_none());
    }

    #[test]
    fn nick_formatter_captures_flag_and_normalizes() {
        let found = NickFormatter.match_line("<@Cool_Guy|away> yo").expect("nick match");
        assert_eq!(found.params[PARAM_NICKFLAG], ParamValue::Text("@".into()));
        assert_eq!(
            found.params[PARAM_ACTOR],
            ParamValue::Text("Cool_Guy|away".into())
        );
        assert_eq!(
            found.params[PARAM_NORMALIZED_NICK],
            ParamValue::Text("coolguyaway".into())
        );
        assert_eq!(found.range(), 0..17);
    }

    #[test]
    fn nick_formatter_accepts_colon_and_square_brackets() {
        let found = NickFormatter.match_line("alice: sure").expect("colon nick");
        assert_eq!(found.params[PARAM_ACTOR], ParamValue::Text("alice".into()));
        let found = NickFormatter.match_line("[bob] right").expect("bracket nick");
        assert_eq!(found.params[PARAM_ACTOR], ParamValue::Text("bob".into()));
        assert!(NickFormatter.match_line("just talking here").is_none());
    }

    #[test]
    fn timestamp_formatter_reads_optional_seconds() {
        let found = TimestampFormatter
            .match_line("[12:34:56] <bob> hi")
            .expect("timestamp");
        assert_eq!(
            found.params[PARAM_TIMESTAMP],
            ParamValue::Time(time!(12:34:56))
        );
        assert_eq!(found.range(), 0..11);

        let found = TimestampFormatter.match_line("9:05 hi").expect("short timestamp");
        assert_eq!(found.params[PARAM_TIMESTAMP], ParamValue::Time(time!(9:05)));
    }

    #[test]
    fn timestamp_formatter_ignores_impossible_times() {
        assert!(TimestampFormatter.match_line("[27:99] hi").is_none());
        assert!(TimestampFormatter.match_line("hi at 12:30").is_none());
    }

    #[test]
    fn registry_runs_timestamp_before_nick() {
        let registry = FormatterRegistry::standard();
        assert_eq!(registry.formatter_names(), vec!["timestamp", "nick"]);
        let line = registry.build_line("(08:15) <+amy> morning all".to_string(), false);
        let rendered = line.render();
        assert_eq!(rendered.text, "morning all");
        assert_eq!(rendered.timestamp(), Some(time!(8:15)));
        assert_eq!(rendered.actor(), Some("amy"));
        assert_eq!(line.normalized_nick(), Some("amy"));
        // the nick range is relative to the text left after the timestamp cut
        assert_eq!(line.matches[1].range(), 0..7);
    }

    #[test]
    fn preserve_formatting_bypasses_the_chain() {
        let registry = FormatterRegistry::standard();
        let line = registry.build_line("[10:00] <bob> raw".to_string(), true);
        assert!(line.matches.is_empty());
        let rendered = line.render();
        assert_eq!(rendered.text, "[10:00] <bob> raw");
        assert!(rendered.params.is_empty());
    }

    struct Hashtag;

    impl LineFormatter for Hashtag {
        fn name(&self) -> &'static str {
            "hashtag"
        }

        fn multiple(&self) -> bool {
            true
        }

        fn match_line(&self, line: &str) -> Option<FormatMatch> {
            let start = line.find('#')?;
            let end = line[start..]
                .find(' ')
                .map(|offset| start + offset + 1)
                .unwrap_or(line.len());
            let mut params = FormatParams::new();
            params.insert(
                format!("tag{start}"),
                ParamValue::Text(line[start..end].trim().to_string()),
            );
            Some(FormatMatch::new("hashtag", start..end, params))
        }
    }

    #[test]
    fn multiple_formatters_rerun_on_the_remaining_text() {
        let registry = FormatterRegistry::new(vec![Box::new(Hashtag), Box::new(NickFormatter)]);
        let line = registry.build_line("#a #b <bob> hey".to_string(), false);
        assert_eq!(line.matches.len(), 3);
        assert_eq!(line.render().text, "hey");
    }

    #[test]
    fn lines_survive_json_storage() -> anyhow::Result<()> {
        let registry = FormatterRegistry::standard();
        let lines = registry.parse("[1:02] <bob> hi\n<amy> hello", false);
        let json = serde_json::to_string(&lines)?;
        let back: Vec<Line> = serde_json::from_str(&json)?;
        assert_eq!(back, lines);
        Ok(())
    }
}
