//! The routing table: peer to subscription-filter map with a derived
//! prefix index.

use std::collections::{BTreeMap, HashMap, HashSet};
use telefab_api::{EndpointId, Filter, Topic};

/// Maps peers to their subscription filters and answers "which peers
/// want this topic" via an incrementally maintained prefix index.
///
/// Owned exclusively by the router actor.
#[derive(Debug, Default)]
pub(crate) struct RoutingTable {
    peers: HashMap<EndpointId, Filter>,
    index: BTreeMap<String, HashSet<EndpointId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a peer's filter. The old and new canonical
    /// filters are diffed and the index updated entry by entry.
    pub fn update(&mut self, peer: EndpointId, new_filter: Filter) {
        let old = self.peers.remove(&peer).unwrap_or_default();
        let canonical: HashSet<&str> = new_filter.iter().collect();
        for prefix in old.iter() {
            if !canonical.contains(prefix) {
                self.drop_index_entry(prefix, &peer);
            }
        }
        for prefix in new_filter.iter() {
            self.index
                .entry(prefix.to_string())
                .or_default()
                .insert(peer);
        }
        self.peers.insert(peer, new_filter);
    }

    /// Forget a peer entirely.
    pub fn remove(&mut self, peer: &EndpointId) {
        if let Some(old) = self.peers.remove(peer) {
            for prefix in old.iter() {
                self.drop_index_entry(prefix, peer);
            }
        }
    }

    /// The peers whose filter matches `topic`.
    pub fn routes(&self, topic: &Topic) -> HashSet<EndpointId> {
        let t = topic.as_str();
        let mut out = HashSet::new();
        for (prefix, peers) in self.index.iter() {
            if t.starts_with(prefix.as_str()) {
                out.extend(peers.iter().copied());
            }
        }
        out
    }

    /// True if any peer's filter matches `topic`.
    pub fn has_route(&self, topic: &Topic) -> bool {
        let t = topic.as_str();
        self.index.keys().any(|prefix| t.starts_with(prefix.as_str()))
    }

    /// The filter currently installed for `peer`.
    #[cfg(test)]
    pub fn filter_of(&self, peer: &EndpointId) -> Option<&Filter> {
        self.peers.get(peer)
    }

    /// Iterate every peer and its installed filter.
    pub fn iter(&self) -> impl Iterator<Item = (&EndpointId, &Filter)> {
        self.peers.iter()
    }

    #[cfg(test)]
    pub fn is_known(&self, peer: &EndpointId) -> bool {
        self.peers.contains_key(peer)
    }

    fn drop_index_entry(&mut self, prefix: &str, peer: &EndpointId) {
        if let Some(peers) = self.index.get_mut(prefix) {
            peers.remove(peer);
            if peers.is_empty() {
                self.index.remove(prefix);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn topic(s: &str) -> Topic {
        Topic::new(s).unwrap()
    }

    #[test]
    fn routes_by_prefix() {
        let mut table = RoutingTable::new();
        let b = EndpointId::random();
        let c = EndpointId::random();
        table.update(b, Filter::from_prefixes(["zeek/events"]));
        table.update(c, Filter::from_prefixes(["zeek/events/errors"]));

        let r = table.routes(&topic("zeek/events/errors"));
        assert!(r.contains(&b) && r.contains(&c));

        let r = table.routes(&topic("zeek/events/data"));
        assert!(r.contains(&b) && !r.contains(&c));

        assert!(table.routes(&topic("netflow")).is_empty());
    }

    #[test]
    fn update_replaces_atomically() {
        let mut table = RoutingTable::new();
        let p = EndpointId::random();
        table.update(p, Filter::from_prefixes(["a", "b"]));
        table.update(p, Filter::from_prefixes(["b", "c"]));

        assert!(table.routes(&topic("a/x")).is_empty());
        assert_eq!(1, table.routes(&topic("b/x")).len());
        assert_eq!(1, table.routes(&topic("c/x")).len());
    }

    #[test]
    fn update_collapses_subsumed_entries() {
        let mut table = RoutingTable::new();
        let p = EndpointId::random();
        table.update(p, Filter::from_prefixes(["a/long", "other"]));
        // "a" subsumes "a/long"; the index must not keep a stale entry.
        table.update(p, Filter::from_prefixes(["a", "other"]));
        table.remove(&p);
        assert!(table.index.is_empty());
        assert!(!table.is_known(&p));
    }

    #[test]
    fn empty_filter_receives_nothing() {
        let mut table = RoutingTable::new();
        let p = EndpointId::random();
        table.update(p, Filter::new());
        assert!(table.routes(&topic("anything")).is_empty());
        assert!(table.is_known(&p));
    }

    #[test]
    fn remove_clears_index() {
        let mut table = RoutingTable::new();
        let p = EndpointId::random();
        table.update(p, Filter::from_prefixes(["x"]));
        table.remove(&p);
        assert!(table.routes(&topic("x/y")).is_empty());
        assert!(table.index.is_empty());
    }
}
