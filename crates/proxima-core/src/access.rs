//! Allow/deny gating of tag ids.
//!
//! A tag passes when it is on a non-empty allowlist (or the allowlist is
//! empty but a denylist exists) and it is not on the denylist. With both
//! lists empty nothing passes; each newly seen id is then logged once so the
//! operator can copy it into the configuration.

use std::collections::HashSet;
use std::sync::Mutex;

use regex::Regex;
use tracing::warn;

use crate::config::{compile_patterns, BleConfig, ConfigResult};

/// One configured list, literal or pattern based.
#[derive(Debug)]
enum Matcher {
    Literal(Vec<String>),
    Pattern(Vec<Regex>),
}

impl Matcher {
    fn new(field: &'static str, entries: &[String], regex: bool) -> ConfigResult<Self> {
        if regex {
            compile_patterns(field, entries).map(Self::Pattern)
        } else {
            Ok(Self::Literal(
                entries.iter().map(|entry| entry.to_lowercase()).collect(),
            ))
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Literal(entries) => entries.is_empty(),
            Self::Pattern(patterns) => patterns.is_empty(),
        }
    }

    fn matches(&self, id: &str) -> bool {
        match self {
            Self::Literal(entries) => {
                let id = id.to_lowercase();
                entries.iter().any(|entry| *entry == id)
            }
            Self::Pattern(patterns) => patterns.iter().any(|pattern| pattern.is_match(id)),
        }
    }
}

/// Allow/deny filter built from the BLE configuration.
#[derive(Debug)]
pub struct AccessFilter {
    allow: Matcher,
    deny: Matcher,
    seen: Mutex<HashSet<String>>,
}

impl AccessFilter {
    /// Build the filter, compiling pattern lists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRegex`](crate::config::ConfigError::InvalidRegex)
    /// if a pattern list contains an invalid expression.
    pub fn from_config(config: &BleConfig) -> ConfigResult<Self> {
        let filter = Self {
            allow: Matcher::new("ble.allowlist", &config.allowlist, config.allowlist_regex)?,
            deny: Matcher::new("ble.denylist", &config.denylist, config.denylist_regex)?,
            seen: Mutex::new(HashSet::new()),
        };
        if filter.is_unconfigured() {
            warn!("Allowlist and denylist are both empty, no devices will be tracked");
        }
        Ok(filter)
    }

    /// Whether neither list has any entry.
    #[must_use]
    pub fn is_unconfigured(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Pure membership decision for `id`.
    #[must_use]
    pub fn is_allowed(&self, id: &str) -> bool {
        let on_allowlist = self.allow.matches(id);
        let allow_by_default = self.allow.is_empty() && !self.deny.is_empty();
        (on_allowlist || allow_by_default) && !self.deny.matches(id)
    }

    /// Decide for `id`, logging newly observed ids while unconfigured.
    pub fn check(&self, id: &str, name: &str) -> bool {
        if self.is_unconfigured() {
            let newly_seen = self
                .seen
                .lock()
                .map(|mut seen| seen.insert(id.to_string()))
                .unwrap_or(false);
            if newly_seen {
                warn!(
                    tag_id = id,
                    tag_name = name,
                    "Discovered device while allowlist and denylist are empty; \
                     add its id to the allowlist to track it"
                );
            }
            return false;
        }
        self.is_allowed(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(allow: &[&str], deny: &[&str], regex: bool) -> AccessFilter {
        let config = BleConfig {
            allowlist: allow.iter().map(ToString::to_string).collect(),
            allowlist_regex: regex,
            denylist: deny.iter().map(ToString::to_string).collect(),
            denylist_regex: regex,
            ..BleConfig::default()
        };
        AccessFilter::from_config(&config).unwrap()
    }

    #[test]
    fn test_allowlist_only() {
        let filter = build(&["aabbccddeeff"], &[], false);
        assert!(filter.is_allowed("aabbccddeeff"));
        assert!(!filter.is_allowed("112233445566"));
    }

    #[test]
    fn test_literal_match_is_case_insensitive() {
        let filter = build(&["AABBCCDDEEFF"], &[], false);
        assert!(filter.is_allowed("aabbccddeeff"));
    }

    #[test]
    fn test_denylist_only_allows_everything_else() {
        let filter = build(&[], &["112233445566"], false);
        assert!(filter.is_allowed("aabbccddeeff"));
        assert!(!filter.is_allowed("112233445566"));
    }

    #[test]
    fn test_denylist_wins_over_allowlist() {
        let filter = build(&["aabbccddeeff"], &["aabbccddeeff"], false);
        assert!(!filter.is_allowed("aabbccddeeff"));

        let filter = build(&["^aabb"], &["eeff$"], true);
        assert!(!filter.is_allowed("aabbccddeeff"));
        assert!(filter.is_allowed("aabbccdd0000"));
    }

    #[test]
    fn test_regex_lists() {
        let filter = build(&["^app-"], &[], true);
        assert!(filter.is_allowed("app-7f3a"));
        assert!(!filter.is_allowed("aabbccddeeff"));
    }

    #[test]
    fn test_empty_lists_pass_nothing() {
        let filter = build(&[], &[], false);
        assert!(filter.is_unconfigured());
        assert!(!filter.is_allowed("aabbccddeeff"));
        assert!(!filter.check("aabbccddeeff", "Keys"));
        assert!(!filter.check("aabbccddeeff", "Keys"));
    }

    #[test]
    fn test_invalid_regex_fails_construction() {
        let config = BleConfig {
            denylist: vec!["(".into()],
            denylist_regex: true,
            ..BleConfig::default()
        };
        assert!(AccessFilter::from_config(&config).is_err());
    }
}
