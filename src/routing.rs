use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[rustfmt::skip]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    /// Whether a binding made with `binding_key` accepts a message published
    /// with `routing_key`.
    pub fn accepts(self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            Self::Direct => binding_key == routing_key,
            Self::Fanout => true,
            Self::Topic => topic_matches(binding_key, routing_key),
        }
    }
}

impl Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        })
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            other => Err(format!("unknown exchange type '{other}'")),
        }
    }
}

/// Matches a dot-separated routing key against a topic pattern, where `*`
/// stands for exactly one word and `#` for zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();

    // matched[i][j]: pattern[i..] matches words[j..]
    let mut matched = vec![vec![false; words.len() + 1]; pattern.len() + 1];
    matched[pattern.len()][words.len()] = true;

    for i in (0..pattern.len()).rev() {
        for j in (0..=words.len()).rev() {
            let has_word = j < words.len();
            matched[i][j] = match pattern[i] {
                "#" => matched[i + 1][j] || (has_word && matched[i][j + 1]),
                "*" => has_word && matched[i + 1][j + 1],
                word => has_word && words[j] == word && matched[i + 1][j + 1],
            };
        }
    }

    matched[0][0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("message.#", "message.hello"));
        assert!(topic_matches("message.#", "message.apple.red"));
        assert!(topic_matches("message.#", "message"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.error", "kern.disk.error"));
        assert!(!topic_matches("message.#", "other.hello"));
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(topic_matches("*.orange.*", "quick.orange.rabbit"));
        assert!(!topic_matches("*.orange.*", "quick.orange.male.rabbit"));
        assert!(!topic_matches("*.orange.*", "orange.rabbit"));
        assert!(topic_matches("lazy.*.*", "lazy.brown.fox"));
    }

    #[test]
    fn literal_words_must_be_equal() {
        assert!(topic_matches("message.apple.#", "message.apple"));
        assert!(!topic_matches("message.apple.#", "message.banana"));
        assert!(topic_matches("", ""));
        assert!(!topic_matches("", "a"));
    }

    #[test]
    fn exchange_kinds_route_by_their_rules() {
        assert!(ExchangeKind::Direct.accepts("key", "key"));
        assert!(!ExchangeKind::Direct.accepts("key", "other"));
        assert!(ExchangeKind::Fanout.accepts("", "whatever"));
        assert!(ExchangeKind::Topic.accepts("a.*", "a.b"));
        assert_eq!("topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert!("headers".parse::<ExchangeKind>().is_err());
    }
}
