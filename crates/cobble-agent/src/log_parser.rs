use std::{collections::BTreeSet, sync::LazyLock};

use regex::Regex;

const LIST_MARKER: &str = "players online:";
const NO_PLAYERS_MARKER: &str = "there are no players online";

struct Patterns {
    ansi: Regex,
    joined: Regex,
    left: Regex,
    list: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            ansi: Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])")?,
            joined: Regex::new(r"(?i)\b([A-Za-z0-9_]{1,16})\b\s+joined the game")?,
            left: Regex::new(r"(?i)\b([A-Za-z0-9_]{1,16})\b\s+left the game")?,
            list: Regex::new(
                r"(?i)There are\s+\d+\s+of\s+a\s+max\s+of\s+\d+\s+players\s+online:\s*(.*)$",
            )?,
        })
    }
}

static PATTERNS: LazyLock<Result<Patterns, regex::Error>> = LazyLock::new(Patterns::compile);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    #[default]
    Normal,
    ExpectingPlayerListLine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// "Done (..)! For help, type "help"".
    Started,
    Stopping,
    /// World data flushed; the process should exit shortly.
    WorldSaved,
    Joined(String),
    Left(String),
    ReplacePlayers(Vec<String>),
    ClearPlayers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    /// Line with ANSI escapes removed.
    pub text: String,
    /// `list` output is tracked but kept out of the forwarded console.
    pub suppress: bool,
    pub signals: Vec<Signal>,
}

pub struct LogParser {
    patterns: &'static Patterns,
    state: ParserState,
}

impl LogParser {
    pub fn new() -> anyhow::Result<Self> {
        let patterns = PATTERNS
            .as_ref()
            .map_err(|e| anyhow::anyhow!("compile console patterns: {e}"))?;
        Ok(Self {
            patterns,
            state: ParserState::Normal,
        })
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn strip_ansi(&self, raw: &str) -> String {
        self.patterns.ansi.replace_all(raw, "").into_owned()
    }

    pub fn feed(&mut self, raw: &str) -> ParsedLine {
        let text = self.strip_ansi(raw);
        let mut signals = Vec::new();

        if text.contains("Done") && text.contains("For help") {
            signals.push(Signal::Started);
        } else if text.contains("Stopping the server") || text.contains("Stopping server") {
            signals.push(Signal::Stopping);
        } else if text.contains("All dimensions are saved") || text.contains("All chunks are saved")
        {
            signals.push(Signal::WorldSaved);
        }

        if let Some(name) = capture_name(&self.patterns.joined, &text) {
            signals.push(Signal::Joined(name));
        }
        if let Some(name) = capture_name(&self.patterns.left, &text) {
            signals.push(Signal::Left(name));
        }

        let (next, suppress, list_signal) = self.transition(text.trim());
        self.state = next;
        signals.extend(list_signal);

        ParsedLine {
            text,
            suppress,
            signals,
        }
    }

    /// Player-list state machine. Returns the next state, whether the line
    /// is list output, and the resulting set update.
    fn transition(&self, line: &str) -> (ParserState, bool, Option<Signal>) {
        if line.is_empty() {
            return (self.state, false, None);
        }

        match self.state {
            ParserState::ExpectingPlayerListLine => {
                let lower = line.to_ascii_lowercase();
                match lower.find(LIST_MARKER) {
                    Some(idx) => {
                        let names = split_names(&line[idx + LIST_MARKER.len()..]);
                        (ParserState::Normal, true, Some(replace_or_clear(names)))
                    }
                    // Not a member list: drop the expectation and treat the
                    // line as ordinary output.
                    None => self.normal_transition(line),
                }
            }
            ParserState::Normal => self.normal_transition(line),
        }
    }

    fn normal_transition(&self, line: &str) -> (ParserState, bool, Option<Signal>) {
        if line.to_ascii_lowercase().contains(NO_PLAYERS_MARKER) {
            return (ParserState::Normal, true, Some(Signal::ClearPlayers));
        }

        if let Some(caps) = self.patterns.list.captures(line) {
            let tail = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let names = split_names(tail);
            if names.is_empty() {
                return (ParserState::ExpectingPlayerListLine, true, None);
            }
            return (
                ParserState::Normal,
                true,
                Some(Signal::ReplacePlayers(names)),
            );
        }

        (ParserState::Normal, false, None)
    }
}

fn capture_name(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn replace_or_clear(names: Vec<String>) -> Signal {
    if names.is_empty() {
        Signal::ClearPlayers
    } else {
        Signal::ReplacePlayers(names)
    }
}

/// Names of players currently connected, derived from console output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerSet {
    names: BTreeSet<String>,
}

impl PlayerSet {
    pub fn apply(&mut self, signal: &Signal) {
        match signal {
            Signal::Joined(name) => {
                self.names.insert(name.clone());
            }
            Signal::Left(name) => {
                self.names.remove(name);
            }
            Signal::ReplacePlayers(names) => {
                self.names = names.iter().cloned().collect();
            }
            Signal::ClearPlayers => self.names.clear(),
            Signal::Started | Signal::Stopping | Signal::WorldSaved => {}
        }
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> LogParser {
        LogParser::new().unwrap()
    }

    fn feed_all(p: &mut LogParser, set: &mut PlayerSet, lines: &[&str]) -> Vec<ParsedLine> {
        lines
            .iter()
            .map(|l| {
                let parsed = p.feed(l);
                for s in &parsed.signals {
                    set.apply(s);
                }
                parsed
            })
            .collect()
    }

    #[test]
    fn done_line_signals_started() {
        let mut p = parser();
        let parsed =
            p.feed(r#"[12:34:56] [Server thread/INFO]: Done (1.234s)! For help, type "help""#);
        assert_eq!(parsed.signals, vec![Signal::Started]);
        assert!(!parsed.suppress);
    }

    #[test]
    fn ansi_is_stripped_before_matching() {
        let mut p = parser();
        let parsed = p.feed("\x1b[32m[12:00:00 INFO]: Done (3.1s)! For help, type \"help\"\x1b[0m");
        assert_eq!(parsed.signals, vec![Signal::Started]);
        assert!(!parsed.text.contains('\x1b'));
    }

    #[test]
    fn stopping_and_saved_markers() {
        let mut p = parser();
        assert_eq!(
            p.feed("[Server thread/INFO]: Stopping the server").signals,
            vec![Signal::Stopping]
        );
        assert_eq!(
            p.feed("[Server thread/INFO]: ThreadedAnvilChunkStorage: All dimensions are saved")
                .signals,
            vec![Signal::WorldSaved]
        );
    }

    #[test]
    fn join_then_leave_empties_set() {
        let mut p = parser();
        let mut set = PlayerSet::default();
        feed_all(
            &mut p,
            &mut set,
            &[
                "[12:00:01] [Server thread/INFO]: Player123 joined the game",
                "[12:00:09] [Server thread/INFO]: Player123 left the game",
            ],
        );
        assert!(set.is_empty());
    }

    #[test]
    fn join_ignores_overlong_names() {
        let mut p = parser();
        let parsed = p.feed("ThisNameIsWayTooLongForMinecraft joined the game");
        assert!(parsed.signals.is_empty());
    }

    #[test]
    fn inline_list_replaces_set_and_is_suppressed() {
        let mut p = parser();
        let mut set = PlayerSet::default();
        set.apply(&Signal::Joined("Stale".into()));
        let out = feed_all(
            &mut p,
            &mut set,
            &["[12:00:00] [Server thread/INFO]: There are 2 of a max of 20 players online: Alice, Bob"],
        );
        assert!(out[0].suppress);
        assert_eq!(set.names(), vec!["Alice".to_string(), "Bob".to_string()]);
        assert_eq!(p.state(), ParserState::Normal);
    }

    #[test]
    fn header_then_names_on_next_line() {
        let mut p = parser();
        let mut set = PlayerSet::default();
        let out = feed_all(
            &mut p,
            &mut set,
            &[
                "[INFO]: There are 1 of a max of 20 players online:",
                "",
                "[INFO]: players online: Steve",
            ],
        );
        assert!(out[0].suppress);
        assert!(!out[1].suppress);
        assert!(out[2].suppress);
        assert_eq!(set.names(), vec!["Steve".to_string()]);
        assert_eq!(p.state(), ParserState::Normal);
    }

    #[test]
    fn unrelated_line_cancels_expectation_without_being_consumed() {
        let mut p = parser();
        let mut set = PlayerSet::default();
        set.apply(&Signal::Joined("Alex".into()));
        let out = feed_all(
            &mut p,
            &mut set,
            &[
                "[INFO]: There are 0 of a max of 20 players online:",
                "[INFO]: Saving chunks for level 'world'",
            ],
        );
        assert_eq!(p.state(), ParserState::Normal);
        assert!(!out[1].suppress);
        assert_eq!(set.names(), vec!["Alex".to_string()]);
    }

    #[test]
    fn no_players_clears_set() {
        let mut p = parser();
        let mut set = PlayerSet::default();
        set.apply(&Signal::Joined("Alex".into()));
        let out = feed_all(&mut p, &mut set, &["[INFO]: There are no players online"]);
        assert!(out[0].suppress);
        assert!(set.is_empty());
    }
}
