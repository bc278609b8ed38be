//! Event name patterns
//!
//! Event names are `.`-separated segments (`player.move`). A subscription
//! pattern is one of:
//! - an exact name (`player.move`)
//! - a name followed by `.*`, matching exactly one more segment (`player.*`)
//! - the bare `*`, matching every name
//!
//! There is no recursive wildcard: `player.*` does not match `player.a.b`,
//! and a subscription to `game` does not see `game.level.complete`.

use crate::error::{BusError, BusResult};

/// The pattern that matches every event name
pub const WILDCARD: &str = "*";

/// Parsed subscription pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// `*`
    Any,
    /// An exact event name
    Exact(String),
    /// `prefix.*`, storing the prefix
    Children(String),
}

impl Pattern {
    /// Parse and validate a pattern
    pub fn parse(pattern: &str) -> BusResult<Self> {
        if pattern == WILDCARD {
            return Ok(Self::Any);
        }

        let invalid = |reason| BusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if let Some(prefix) = pattern.strip_suffix(".*") {
            validate_name(prefix).map_err(invalid)?;
            return Ok(Self::Children(prefix.to_string()));
        }

        validate_name(pattern).map_err(invalid)?;
        Ok(Self::Exact(pattern.to_string()))
    }

    /// Check whether an event name matches this pattern
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(exact) => exact == name,
            Self::Children(prefix) => name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|segment| !segment.is_empty() && !segment.contains('.')),
        }
    }

    /// Key under which subscriptions with this pattern are stored
    pub fn key(&self) -> String {
        match self {
            Self::Any => WILDCARD.to_string(),
            Self::Exact(name) => name.clone(),
            Self::Children(prefix) => format!("{prefix}.*"),
        }
    }
}

/// Validate a concrete event name (no wildcards, no empty segments)
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    for segment in name.split('.') {
        if segment.is_empty() {
            return Err("name has an empty segment");
        }
        if segment.contains('*') {
            return Err("`*` is only allowed as a trailing `.*` segment or on its own");
        }
    }
    Ok(())
}

/// The `parent.*` bucket key a concrete name is delivered from, if any
pub(crate) fn parent_wildcard(name: &str) -> Option<String> {
    name.rsplit_once('.').map(|(parent, _)| format!("{parent}.*"))
}
