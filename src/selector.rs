//! Feature selector parsing and normalization.
//!
//! Grammar: `[namespace.]name[+aggrFn][@-N][[encoding]]`
//! - names and namespaces: letters, digits and underscores, 1-256 chars,
//!   no leading or trailing underscore
//! - `aggrFn` and `encoding`: lowercase words, underscores allowed between letters
//! - matching is case-insensitive

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "default";

const SELECTOR_PATTERN: &str = r"(?i)^(?:(?P<namespace>[a-z0-9](?:[a-z0-9_]{0,254}[a-z0-9])?)\.)?(?P<name>[a-z0-9](?:[a-z0-9_]{0,254}[a-z0-9])?)(?:\+(?P<aggr>[a-z]+(?:_+[a-z]+)*))?(?:@-(?P<version>[0-9]+))?(?:\[(?P<encoding>[a-z]+(?:_+[a-z]+)*)\])?$";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
}

/// A parsed selector with the namespace already defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    pub namespace: String,
    pub name: String,
    pub aggr_fn: Option<String>,
    pub version: u32,
    pub encoding: Option<String>,
}

impl Selector {
    pub fn parse(raw: &str, default_namespace: &str) -> Result<Self, SelectorError> {
        let caps = selector_regex()
            .captures(raw)
            .ok_or_else(|| SelectorError::InvalidSelector(raw.to_string()))?;

        let namespace = caps
            .name("namespace")
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| default_namespace.to_string());
        let name = caps
            .name("name")
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| SelectorError::InvalidSelector(raw.to_string()))?;
        let version = match caps.name("version") {
            Some(m) => m
                .as_str()
                .parse::<u32>()
                .map_err(|_| SelectorError::InvalidSelector(raw.to_string()))?,
            None => 0,
        };

        Ok(Self {
            namespace,
            name,
            aggr_fn: caps.name("aggr").map(|m| m.as_str().to_string()),
            version,
            encoding: caps.name("encoding").map(|m| m.as_str().to_string()),
        })
    }

    /// `namespace.name`, the registry key of the referenced spec.
    pub fn base_fqn(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// `namespace.name[+aggrFn]`, the key records are stored under.
    pub fn storage_fqn(&self) -> String {
        match &self.aggr_fn {
            Some(aggr) => format!("{}.{}+{}", self.namespace, self.name, aggr),
            None => self.base_fqn(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)?;
        if let Some(aggr) = &self.aggr_fn {
            write!(f, "+{aggr}")?;
        }
        if self.version > 0 {
            write!(f, "@-{}", self.version)?;
        }
        if let Some(encoding) = &self.encoding {
            write!(f, "[{encoding}]")?;
        }
        Ok(())
    }
}

/// Canonical form of `selector`, filling a missing namespace with `default_namespace`.
pub fn normalize(selector: &str, default_namespace: &str) -> Result<String, SelectorError> {
    Selector::parse(selector, default_namespace).map(|s| s.to_string())
}

pub fn is_valid_name(name: &str) -> bool {
    Selector::parse(name, DEFAULT_NAMESPACE)
        .map(|s| s.aggr_fn.is_none() && s.version == 0 && s.encoding.is_none() && s.name == name)
        .unwrap_or(false)
}

fn selector_regex() -> &'static Regex {
    static SELECTOR_RE: OnceLock<Regex> = OnceLock::new();
    SELECTOR_RE.get_or_init(|| Regex::new(SELECTOR_PATTERN).expect("selector pattern is valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_missing_namespace() {
        assert_eq!(normalize("total_spend", "bank").unwrap(), "bank.total_spend");
        assert_eq!(
            normalize("total_spend+sum", "default").unwrap(),
            "default.total_spend+sum"
        );
    }

    #[test]
    fn keeps_every_qualifier_in_canonical_order() {
        assert_eq!(
            normalize("ns.name+distinct_count@-2[one_hot]", "x").unwrap(),
            "ns.name+distinct_count@-2[one_hot]"
        );
        let parsed = Selector::parse("ns.name+sum@-1", "x").unwrap();
        assert_eq!(parsed.base_fqn(), "ns.name");
        assert_eq!(parsed.storage_fqn(), "ns.name+sum");
        assert_eq!(parsed.version, 1);
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "a",
            "amount",
            "bank.amount",
            "bank.total_spend+sum",
            "total_spend+avg@-3",
            "x1.y2[enc]",
            "CamelCase.Name+SUM",
        ] {
            let once = normalize(raw, "default").unwrap();
            let twice = normalize(&once, "default").unwrap();
            assert_eq!(once, twice, "selector {raw}");
        }
    }

    #[test]
    fn rejects_invalid_selectors() {
        for raw in [
            "",
            "_leading",
            "trailing_",
            "ns._name",
            "a.b.c",
            "name+",
            "name@1",
            "name@-x",
            "name+sum1",
            "na-me",
            "name[]",
        ] {
            assert_eq!(
                normalize(raw, "default").unwrap_err(),
                SelectorError::InvalidSelector(raw.to_string()),
                "selector {raw:?}"
            );
        }
    }

    #[test]
    fn enforces_name_length_limit() {
        let ok = "a".repeat(256);
        let too_long = "a".repeat(257);
        assert!(normalize(&ok, "default").is_ok());
        assert!(normalize(&too_long, "default").is_err());
    }

    #[test]
    fn validates_plain_names() {
        assert!(is_valid_name("total_spend"));
        assert!(!is_valid_name("total_spend+sum"));
        assert!(!is_valid_name("ns.total"));
        assert!(!is_valid_name("_x"));
    }
}
