//! Label selectors and the free-text search capability.
//!
//! [`Selector`] is the access predicate a subscription carries; [`Query`] and
//! [`SearchIndex`] form the search capability the resource store provides.
//! [`MemoryIndex`] is a small in-process index used by [`MemoryStore`].
//!
//! [`MemoryStore`]: crate::store::MemoryStore

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::resource::Labels;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
}

impl Requirement {
    fn matches(&self, labels: &Labels) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::Exists(k) => write!(f, "{k}"),
        }
    }
}

/// A label selector such as `env=prod,tier!=db,canary`.
///
/// All requirements must hold. The empty selector matches every label set;
/// callers that need "matches nothing" semantics check [`is_empty`](Self::is_empty).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Parse comma-separated requirements: `k=v`, `k==v`, `k!=v` or bare `k`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let invalid = |reason: &str| Error::InvalidSelector {
                selector: s.to_string(),
                reason: reason.to_string(),
            };

            let req = if let Some((k, v)) = part.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once("==").or_else(|| part.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else {
                Requirement::Exists(part.to_string())
            };

            let key = match &req {
                Requirement::Equals(k, _) | Requirement::NotEquals(k, _) | Requirement::Exists(k) => k,
            };
            if key.is_empty() {
                return Err(invalid("empty label key"));
            }
            if key.contains(char::is_whitespace) {
                return Err(invalid("label key contains whitespace"));
            }
            requirements.push(req);
        }
        Ok(Self { requirements })
    }

    /// The selector that matches everything.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl TryFrom<String> for Selector {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Selector::parse(&s)
    }
}

impl From<Selector> for String {
    fn from(s: Selector) -> Self {
        s.to_string()
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryTerm {
    /// `key:value`: the field must equal the value.
    Field(String, String),
    /// Free text: some field key or value must contain it.
    Text(String),
}

/// A parsed search query: whitespace-separated `key:value` and free-text terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    original: String,
    terms: Vec<QueryTerm>,
}

impl Query {
    pub fn parse(s: &str) -> Self {
        let terms = s
            .split_whitespace()
            .map(|t| match t.split_once(':') {
                Some((k, v)) if !k.is_empty() => QueryTerm::Field(k.to_lowercase(), v.to_lowercase()),
                _ => QueryTerm::Text(t.to_lowercase()),
            })
            .collect();
        Self {
            original: s.to_string(),
            terms,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// The last whitespace-separated token, which suggestions complete.
    fn last_token(&self) -> &str {
        if self.original.ends_with(char::is_whitespace) {
            return "";
        }
        self.original.split_whitespace().last().unwrap_or("")
    }
}

/// A completion offered for a partially typed query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    /// The completed token, e.g. `env:prod`.
    pub label: String,
    /// The full query text with the last token replaced by `label`.
    pub query: String,
}

/// Search capability over one resource collection.
pub trait SearchIndex: Send + Sync {
    /// Whether the indexed document `id` matches `query`.
    fn matches(&self, query: &Query, id: &str) -> bool;

    /// Completions for the last token of `query`.
    fn suggestions(&self, query: &Query) -> Vec<Suggestion>;
}

// ---------------------------------------------------------------------------
// MemoryIndex
// ---------------------------------------------------------------------------

/// In-process [`SearchIndex`] over `name` plus label fields.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index (or re-index) a document under `id`.
    pub fn upsert(&self, id: &str, name: &str, labels: &Labels) {
        let mut fields: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
            .collect();
        fields.insert("name".to_string(), name.to_lowercase());
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), fields);
    }

    pub fn remove(&self, id: &str) {
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn term_matches(fields: &BTreeMap<String, String>, term: &QueryTerm) -> bool {
    match term {
        QueryTerm::Field(k, v) => fields.get(k) == Some(v),
        QueryTerm::Text(t) => fields.iter().any(|(k, v)| k.contains(t) || v.contains(t)),
    }
}

impl SearchIndex for MemoryIndex {
    fn matches(&self, query: &Query, id: &str) -> bool {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        match docs.get(id) {
            Some(fields) => query.terms.iter().all(|t| term_matches(fields, t)),
            None => false,
        }
    }

    fn suggestions(&self, query: &Query) -> Vec<Suggestion> {
        let raw = query.last_token();
        if raw.is_empty() {
            return Vec::new();
        }
        let prefix = &query.original[..query.original.len() - raw.len()];
        let token = raw.to_lowercase();

        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        let labels: BTreeSet<String> = docs
            .values()
            .flat_map(|fields| fields.iter().map(|(k, v)| format!("{k}:{v}")))
            .filter(|label| label.starts_with(&token) && *label != token)
            .collect();

        labels
            .into_iter()
            .map(|label| Suggestion {
                query: format!("{prefix}{label}"),
                label,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    // ===== Selector =====

    #[rstest]
    #[case("env=prod", true)]
    #[case("env==prod", true)]
    #[case("env=dev", false)]
    #[case("env!=dev", true)]
    #[case("env!=prod", false)]
    #[case("tier", true)]
    #[case("missing", false)]
    #[case("env=prod,tier=web", true)]
    #[case("env=prod,tier=db", false)]
    #[case("", true)]
    fn test_selector_matches(#[case] selector: &str, #[case] expected: bool) {
        let l = labels(&[("env", "prod"), ("tier", "web")]);
        assert_eq!(Selector::parse(selector).unwrap().matches(&l), expected);
    }

    #[test]
    fn test_selector_rejects_empty_key() {
        assert!(matches!(
            Selector::parse("=prod"),
            Err(Error::InvalidSelector { .. })
        ));
    }

    #[test]
    fn test_selector_display_round_trips_text() {
        let s = Selector::parse("env=prod, tier!=db ,canary").unwrap();
        assert_eq!(s.to_string(), "env=prod,tier!=db,canary");
    }

    #[test]
    fn test_selector_everything_is_empty() {
        assert!(Selector::everything().is_empty());
        assert!(Selector::everything().matches(&Labels::new()));
    }

    // ===== Query / MemoryIndex =====

    fn index() -> MemoryIndex {
        let idx = MemoryIndex::new();
        idx.upsert("a-1", "web-01", &labels(&[("env", "prod")]));
        idx.upsert("a-2", "web-02", &labels(&[("env", "dev")]));
        idx.upsert("a-3", "db-01", &labels(&[("env", "prod"), ("tier", "db")]));
        idx
    }

    #[test]
    fn test_query_keeps_original_text() {
        let q = Query::parse("  Env:Prod web ");
        assert_eq!(q.as_str(), "  Env:Prod web ");
        assert!(!q.is_empty());
        assert!(Query::parse("   ").is_empty());
    }

    #[test]
    fn test_index_field_term() {
        let idx = index();
        let q = Query::parse("env:prod");
        assert!(idx.matches(&q, "a-1"));
        assert!(!idx.matches(&q, "a-2"));
        assert!(idx.matches(&q, "a-3"));
    }

    #[test]
    fn test_index_free_text_term() {
        let idx = index();
        let q = Query::parse("web");
        assert!(idx.matches(&q, "a-1"));
        assert!(idx.matches(&q, "a-2"));
        assert!(!idx.matches(&q, "a-3"));
    }

    #[test]
    fn test_index_all_terms_must_match() {
        let idx = index();
        let q = Query::parse("env:prod web");
        assert!(idx.matches(&q, "a-1"));
        assert!(!idx.matches(&q, "a-3"));
    }

    #[test]
    fn test_index_unknown_id_does_not_match() {
        assert!(!index().matches(&Query::parse("web"), "nope"));
    }

    #[test]
    fn test_index_remove() {
        let idx = index();
        idx.remove("a-1");
        assert_eq!(idx.len(), 2);
        assert!(!idx.matches(&Query::parse("web-01"), "a-1"));
    }

    #[test]
    fn test_index_suggestions_complete_last_token() {
        let idx = index();
        let got = idx.suggestions(&Query::parse("web env:p"));
        assert_eq!(
            got,
            vec![Suggestion {
                label: "env:prod".into(),
                query: "web env:prod".into(),
            }]
        );
    }

    #[test]
    fn test_index_suggestions_empty_after_trailing_space() {
        assert!(index().suggestions(&Query::parse("env:prod ")).is_empty());
    }
}
