//! Longest-prefix routing from destination addresses to next-hop peers.

use {
    crate::domain::{account::PeerId, packet::Address},
    serde::Serialize,
    std::{
        cmp::Reverse,
        sync::{Arc, RwLock},
    },
};

/// One routing entry. Lower `priority` values win ties between routes with
/// equally long prefixes.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub prefix: Address,
    pub next_hop: PeerId,
    pub priority: i32,
}

/// Copy-on-write route list: writers swap a fresh `Arc<Vec<_>>` in, readers
/// clone the current Arc under a brief lock and match without contention.
#[derive(Default)]
pub struct RoutingTable {
    routes: RwLock<Arc<Vec<Route>>>,
}

impl RoutingTable {
    pub fn new(routes: impl IntoIterator<Item = Route>) -> Self {
        let table = Self::default();
        for route in routes {
            table.upsert(route);
        }
        table
    }

    /// Longest matching prefix on dotted-segment boundaries, ties broken by
    /// the lowest priority value.
    pub fn lookup(&self, destination: &Address) -> Option<PeerId> {
        let routes = Arc::clone(&self.routes.read().unwrap());
        routes
            .iter()
            .filter(|route| destination.starts_with_prefix(&route.prefix))
            .max_by_key(|route| (route.prefix.segments().count(), Reverse(route.priority)))
            .map(|route| route.next_hop.clone())
    }

    /// Inserts the route, replacing an existing `(prefix, next_hop)` entry.
    pub fn upsert(&self, route: Route) {
        let mut guard = self.routes.write().unwrap();
        let mut routes = guard.as_ref().clone();
        match routes.iter_mut().find(|existing| {
            existing.prefix == route.prefix && existing.next_hop == route.next_hop
        }) {
            Some(existing) => *existing = route,
            None => routes.push(route),
        }
        routes.sort_by(|a, b| {
            (a.prefix.as_str(), a.priority).cmp(&(b.prefix.as_str(), b.priority))
        });
        *guard = Arc::new(routes);
    }

    pub fn remove(&self, prefix: &Address, next_hop: &PeerId) {
        let mut guard = self.routes.write().unwrap();
        let mut routes = guard.as_ref().clone();
        routes.retain(|route| !(route.prefix == *prefix && route.next_hop == *next_hop));
        *guard = Arc::new(routes);
    }

    pub fn snapshot(&self) -> Arc<Vec<Route>> {
        Arc::clone(&self.routes.read().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, next_hop: &str, priority: i32) -> Route {
        Route {
            prefix: prefix.parse().unwrap(),
            next_hop: PeerId::new(next_hop),
            priority,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RoutingTable::new([
            route("g", "default", 0),
            route("g.c", "peer-c", 0),
            route("g.c.x", "peer-x", 0),
        ]);
        let lookup = |dest: &str| table.lookup(&dest.parse().unwrap());

        assert_eq!(lookup("g.c.x.account"), Some(PeerId::new("peer-x")));
        assert_eq!(lookup("g.c.y"), Some(PeerId::new("peer-c")));
        assert_eq!(lookup("g.other"), Some(PeerId::new("default")));
        assert_eq!(lookup("x.unknown"), None);
    }

    #[test]
    fn ties_break_by_lowest_priority() {
        let table = RoutingTable::new([
            route("g.c", "backup", 10),
            route("g.c", "primary", 1),
        ]);
        assert_eq!(
            table.lookup(&"g.c.x".parse().unwrap()),
            Some(PeerId::new("primary")),
        );
    }

    #[test]
    fn prefix_matching_respects_segment_boundaries() {
        let table = RoutingTable::new([route("g.c", "peer-c", 0)]);
        assert_eq!(table.lookup(&"g.cx".parse().unwrap()), None);
    }

    #[test]
    fn upsert_replaces_and_remove_deletes() {
        let table = RoutingTable::new([route("g.c", "peer-c", 5)]);
        table.upsert(route("g.c", "peer-c", 1));
        assert_eq!(table.snapshot().len(), 1);
        assert_eq!(table.snapshot()[0].priority, 1);

        table.remove(&"g.c".parse().unwrap(), &PeerId::new("peer-c"));
        assert_eq!(table.lookup(&"g.c".parse().unwrap()), None);
    }
}
