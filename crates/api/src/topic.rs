//! Topic names and prefix filters.
//!
//! A topic is a non-empty string; `/` separators express hierarchy by
//! convention, but matching is pure byte-prefix: `a/b` matches `a/bc`
//! as well as `a/b/c`. Callers who want segment matching append `/`.

use crate::{EndpointId, FabError, FabResult};
use std::collections::BTreeSet;

/// The reserved namespace carrying store traffic. Every filter that goes
/// on the wire is unioned with this prefix so store frames always route.
pub const STORE_TOPIC_PREFIX: &str = "telefab/store/";

const STORE_MASTER_PREFIX: &str = "telefab/store/master/";
const STORE_CLONE_PREFIX: &str = "telefab/store/clone/";
const STORE_RESPONSE_PREFIX: &str = "telefab/store/response/";

/// A non-empty message stream name.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Construct a topic. Fails on the empty string.
    pub fn new<S: Into<String>>(s: S) -> FabResult<Self> {
        let s = s.into();
        if s.is_empty() {
            return Err(FabError::other("topic must be non-empty"));
        }
        Ok(Self(s))
    }

    /// The topic as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this topic lies in the reserved store namespace.
    pub fn is_store_topic(&self) -> bool {
        self.0.starts_with(STORE_TOPIC_PREFIX)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Topic {
    type Err = FabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::new(s)
    }
}

/// The command topic of the master for store `name`.
pub fn store_master_topic(name: &str) -> Topic {
    Topic(format!("{STORE_MASTER_PREFIX}{name}"))
}

/// The event topic clones of store `name` listen on.
pub fn store_clone_topic(name: &str) -> Topic {
    Topic(format!("{STORE_CLONE_PREFIX}{name}"))
}

/// The response topic of a single endpoint, carrying store replies.
pub fn store_response_topic(endpoint: EndpointId) -> Topic {
    Topic(format!("{STORE_RESPONSE_PREFIX}{endpoint}"))
}

/// Extract the store name from a master command topic.
pub fn store_name_from_master_topic(topic: &Topic) -> Option<&str> {
    topic.0.strip_prefix(STORE_MASTER_PREFIX)
}

/// Extract the store name from a clone event topic.
pub fn store_name_from_clone_topic(topic: &Topic) -> Option<&str> {
    topic.0.strip_prefix(STORE_CLONE_PREFIX)
}

/// A canonical set of topic prefixes.
///
/// Canonical means no element is a prefix of another: shorter prefixes
/// subsume longer ones. A topic matches the filter iff some element is a
/// byte prefix of it.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Filter(BTreeSet<String>);

impl Filter {
    /// The empty filter, matching nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from prefixes, canonicalizing as it goes.
    pub fn from_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Self::new();
        for p in prefixes {
            out.add(p);
        }
        out
    }

    /// Add one prefix. If an existing element already subsumes it this
    /// is a no-op; any existing elements it subsumes are removed first.
    /// Returns true if the filter changed.
    pub fn add<S: Into<String>>(&mut self, prefix: S) -> bool {
        let prefix = prefix.into();
        if self.0.iter().any(|p| prefix.starts_with(p.as_str())) {
            return false;
        }
        self.0.retain(|p| !p.starts_with(prefix.as_str()));
        self.0.insert(prefix);
        true
    }

    /// Remove one prefix by exact match. Returns true if present.
    pub fn remove(&mut self, prefix: &str) -> bool {
        self.0.remove(prefix)
    }

    /// The union of two filters, canonicalized.
    pub fn union(&self, other: &Filter) -> Filter {
        let mut out = self.clone();
        for p in other.0.iter() {
            out.add(p.clone());
        }
        out
    }

    /// True iff some element is a byte prefix of `topic`.
    pub fn matches(&self, topic: &Topic) -> bool {
        self.matches_str(topic.as_str())
    }

    /// [Filter::matches] on a raw string.
    pub fn matches_str(&self, topic: &str) -> bool {
        self.0.iter().any(|p| topic.starts_with(p.as_str()))
    }

    /// True if the filter has no elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of canonical elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate the canonical prefixes in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }
}

impl<S: Into<String>> FromIterator<S> for Filter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_prefixes(iter)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_topic_is_rejected() {
        assert!(Topic::new("").is_err());
        assert!(Topic::new("a").is_ok());
    }

    #[test]
    fn byte_prefix_matching() {
        let f = Filter::from_prefixes(["a/b"]);
        assert!(f.matches_str("a/b"));
        assert!(f.matches_str("a/bc"));
        assert!(f.matches_str("a/b/c"));
        assert!(!f.matches_str("a"));
        assert!(!f.matches_str("b/a"));
    }

    #[test]
    fn add_subsumption() {
        let mut f = Filter::new();
        assert!(f.add("zeek/events/errors"));
        // shorter prefix subsumes the longer element
        assert!(f.add("zeek/events"));
        assert_eq!(1, f.len());
        assert_eq!(Some("zeek/events"), f.iter().next());
        // already covered: no-op
        assert!(!f.add("zeek/events/data"));
        assert_eq!(1, f.len());
    }

    #[test]
    fn remove_is_exact_match_only() {
        let mut f = Filter::from_prefixes(["a/b"]);
        assert!(!f.remove("a"));
        assert!(!f.remove("a/b/c"));
        assert!(f.remove("a/b"));
        assert!(f.is_empty());
    }

    #[test]
    fn union_canonicalizes() {
        let a = Filter::from_prefixes(["x/1", "y"]);
        let b = Filter::from_prefixes(["x", "z"]);
        let u = a.union(&b);
        let got: Vec<_> = u.iter().collect();
        assert_eq!(vec!["x", "y", "z"], got);
    }

    #[test]
    fn canonical_invariant_holds() {
        let f = Filter::from_prefixes(["a", "ab", "abc", "b/1", "b"]);
        for p1 in f.iter() {
            for p2 in f.iter() {
                if p1 != p2 {
                    assert!(!p2.starts_with(p1), "{p1} subsumes {p2}");
                }
            }
        }
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let f = Filter::new();
        assert!(!f.matches_str("anything"));
    }

    #[test]
    fn store_topic_helpers() {
        let t = store_master_topic("sessions");
        assert!(t.is_store_topic());
        assert_eq!(
            Some("sessions"),
            store_name_from_master_topic(&t),
        );
        assert_eq!(
            None,
            store_name_from_clone_topic(&t),
        );
        assert_eq!(
            Some("sessions"),
            store_name_from_clone_topic(&store_clone_topic("sessions")),
        );
    }
}
