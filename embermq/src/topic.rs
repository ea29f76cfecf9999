use std::fmt::{self, Write};
use std::str::FromStr;

use crate::error::MqttError;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("invalid topic filter `{0}`")]
    InvalidFilter(String),
    #[error("invalid topic name `{0}`")]
    InvalidName(String),
}

impl From<TopicError> for MqttError {
    #[inline]
    fn from(e: TopicError) -> Self {
        MqttError::Topic(e.to_string())
    }
}

/// True when the topic belongs to the `$`-rooted namespace, which is kept
/// invisible to wildcard filters under the regular root.
#[inline]
pub fn is_dollar(topic: &str) -> bool {
    topic.starts_with('$')
}

/// Splits a topic name into its `/`-separated subtopics. MQTT permits empty
/// subtopics (`/finance` has two, the first one empty).
#[inline]
pub fn split(topic: &str) -> Vec<&str> {
    topic.split('/').collect()
}

/// Validates a PUBLISH topic name: non-empty and free of wildcards.
#[inline]
pub fn validate_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(TopicError::InvalidName(topic.into()));
    }
    Ok(())
}

/// One token of a subscription filter.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash)]
pub enum FilterToken {
    Literal(String),
    /// `+`, matches exactly one subtopic.
    SingleWildcard,
    /// `#`, matches one or more remaining subtopics; must be final.
    MultiWildcard,
}

impl FilterToken {
    #[inline]
    fn parse(s: &str) -> Result<FilterToken, TopicError> {
        match s {
            "+" => Ok(FilterToken::SingleWildcard),
            "#" => Ok(FilterToken::MultiWildcard),
            _ => {
                if s.contains(['+', '#']) {
                    Err(TopicError::InvalidFilter(format!("token `{s}` embeds a wildcard")))
                } else {
                    Ok(FilterToken::Literal(String::from(s)))
                }
            }
        }
    }
}

impl fmt::Display for FilterToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterToken::Literal(s) => f.write_str(s),
            FilterToken::SingleWildcard => f.write_char('+'),
            FilterToken::MultiWildcard => f.write_char('#'),
        }
    }
}

/// A parsed, validated subscription topic filter.
#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct Filter(Vec<FilterToken>);

impl Filter {
    #[inline]
    pub fn tokens(&self) -> &[FilterToken] {
        &self.0
    }

    /// Filters whose first token is a `$`-prefixed literal are rooted in the
    /// `$` tree; wildcard first tokens never are.
    #[inline]
    pub fn is_dollar(&self) -> bool {
        matches!(self.0.first(), Some(FilterToken::Literal(s)) if s.starts_with('$'))
    }

    /// Whether this filter selects the given topic name, under the same
    /// rules the subscription tree applies: `+` consumes exactly one
    /// subtopic, `#` consumes the remaining one-or-more, and topics under
    /// the `$` root are invisible to filters that start with a wildcard.
    pub fn matches(&self, topic: &str) -> bool {
        if is_dollar(topic) && !self.is_dollar() {
            return false;
        }

        let subtopics = split(topic);
        let mut at = 0;
        for token in &self.0 {
            match token {
                FilterToken::MultiWildcard => return at < subtopics.len(),
                FilterToken::SingleWildcard => {
                    if at >= subtopics.len() {
                        return false;
                    }
                    at += 1;
                }
                FilterToken::Literal(l) => {
                    if subtopics.get(at).map(|s| *s == l.as_str()) != Some(true) {
                        return false;
                    }
                    at += 1;
                }
            }
        }
        at == subtopics.len()
    }
}

impl FromStr for Filter {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidFilter("empty filter".into()));
        }
        let tokens =
            s.split('/').map(FilterToken::parse).collect::<Result<Vec<_>, TopicError>>()?;
        if let Some(pos) = tokens.iter().position(|t| matches!(t, FilterToken::MultiWildcard)) {
            if pos != tokens.len() - 1 {
                return Err(TopicError::InvalidFilter(format!("`#` not final in `{s}`")));
            }
        }
        Ok(Filter(tokens))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }
            token.fmt(f)?;
        }
        Ok(())
    }
}
