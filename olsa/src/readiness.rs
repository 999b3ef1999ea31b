//! The readiness oracle: whether an advertisement scope currently has at least one neighbor able
//! to receive opaque advertisements, and therefore whether origination may proceed.
//!
//! Readiness is always computed from the topology, never stored. The [`ReadinessTracker`] only
//! remembers the previous answer per scope so that a false to true transition can be reported
//! exactly once.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::lsa::{
    LsaScope, LSA_TYPE_OPAQUE_AREA, LSA_TYPE_OPAQUE_DOMAIN, LSA_TYPE_OPAQUE_LINK,
};
use crate::topology::Topology;

/// A scope that is (or just became) ready for opaque origination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyScope {
    Link(Ipv4Addr),
    Area(Ipv4Addr),
    Domain,
}

impl ReadyScope {
    /// The advertisement type that floods with this scope extent.
    pub fn lsa_type(&self) -> u8 {
        match self {
            ReadyScope::Link(_) => LSA_TYPE_OPAQUE_LINK,
            ReadyScope::Area(_) => LSA_TYPE_OPAQUE_AREA,
            ReadyScope::Domain => LSA_TYPE_OPAQUE_DOMAIN,
        }
    }

    /// The address put in a readiness notification for this scope: the interface address for a
    /// link, the area id for an area, unspecified for the whole domain.
    pub fn notify_addr(&self) -> Ipv4Addr {
        match self {
            ReadyScope::Link(addr) => *addr,
            ReadyScope::Area(area_id) => *area_id,
            ReadyScope::Domain => Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Whether origination may currently proceed for the given scope.
pub fn scope_ready(topology: &Topology, scope: &LsaScope) -> bool {
    match scope {
        LsaScope::Link(ifaddr) => topology.link_ready(*ifaddr),
        LsaScope::Area(area_id) => topology.area_ready(*area_id),
        LsaScope::Domain => topology.domain_ready(),
    }
}

/// All scopes of the class matching `lsa_type` that are ready right now. Used to greet a freshly
/// registered opaque type with the readiness it missed.
pub fn ready_scopes_for_type(topology: &Topology, lsa_type: u8) -> Vec<ReadyScope> {
    match lsa_type {
        LSA_TYPE_OPAQUE_LINK => topology
            .interfaces()
            .filter(|interface| topology.link_ready(interface.addr))
            .map(|interface| ReadyScope::Link(interface.addr))
            .collect(),
        LSA_TYPE_OPAQUE_AREA => {
            let mut areas: Vec<_> = topology
                .interfaces()
                .filter(|interface| topology.link_ready(interface.addr))
                .map(|interface| interface.area_id)
                .collect();
            areas.sort_unstable();
            areas.dedup();
            areas.into_iter().map(ReadyScope::Area).collect()
        }
        LSA_TYPE_OPAQUE_DOMAIN if topology.domain_ready() => vec![ReadyScope::Domain],
        _ => Vec::new(),
    }
}

/// Remembers which scopes were ready at the last evaluation, so transitions can be derived.
#[derive(Debug, Default)]
pub struct ReadinessTracker {
    links: HashSet<Ipv4Addr>,
    areas: HashSet<Ipv4Addr>,
    domain: bool,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute readiness for every scope and return the scopes that became ready since the last
    /// evaluation. Scopes that lost readiness are forgotten silently, there is no notification
    /// for the true to false direction.
    pub fn reevaluate(&mut self, topology: &Topology) -> Vec<ReadyScope> {
        let mut transitions = Vec::new();

        let links: HashSet<_> = topology
            .interfaces()
            .map(|interface| interface.addr)
            .filter(|&addr| topology.link_ready(addr))
            .collect();
        for &addr in links.difference(&self.links) {
            transitions.push(ReadyScope::Link(addr));
        }

        let areas: HashSet<_> = topology
            .interfaces()
            .filter(|interface| topology.link_ready(interface.addr))
            .map(|interface| interface.area_id)
            .collect();
        for &area_id in areas.difference(&self.areas) {
            transitions.push(ReadyScope::Area(area_id));
        }

        let domain = !links.is_empty();
        if domain && !self.domain {
            transitions.push(ReadyScope::Domain);
        }

        self.links = links;
        self.areas = areas;
        self.domain = domain;

        transitions
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::{ReadinessTracker, ReadyScope};
    use crate::topology::{IfState, Interface, Neighbor, NeighborState, Topology};

    const IF_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
    const AREA: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

    fn ready_topology() -> Topology {
        let mut topology = Topology::new();
        topology.add_interface(Interface {
            addr: IF_ADDR,
            area_id: AREA,
            state: IfState::PointToPoint,
        });
        topology.upsert_neighbor(
            IF_ADDR,
            Neighbor {
                addr: Ipv4Addr::new(10, 0, 1, 2),
                router_id: Ipv4Addr::new(2, 2, 2, 2),
                state: NeighborState::Full,
                opaque_capable: true,
            },
        );
        topology
    }

    #[test]
    fn transition_reported_exactly_once() {
        let mut tracker = ReadinessTracker::new();

        let empty = Topology::new();
        assert!(tracker.reevaluate(&empty).is_empty());

        let topology = ready_topology();
        let transitions = tracker.reevaluate(&topology);
        assert!(transitions.contains(&ReadyScope::Link(IF_ADDR)));
        assert!(transitions.contains(&ReadyScope::Area(AREA)));
        assert!(transitions.contains(&ReadyScope::Domain));
        assert_eq!(transitions.len(), 3);

        // Re-evaluating an unchanged topology reports nothing new.
        assert!(tracker.reevaluate(&topology).is_empty());
    }

    #[test]
    fn lost_readiness_can_transition_again() {
        let mut tracker = ReadinessTracker::new();
        let mut topology = ready_topology();
        assert_eq!(tracker.reevaluate(&topology).len(), 3);

        topology.remove_neighbor(IF_ADDR, Ipv4Addr::new(10, 0, 1, 2));
        assert!(tracker.reevaluate(&topology).is_empty());

        topology.upsert_neighbor(
            IF_ADDR,
            Neighbor {
                addr: Ipv4Addr::new(10, 0, 1, 2),
                router_id: Ipv4Addr::new(2, 2, 2, 2),
                state: NeighborState::Full,
                opaque_capable: true,
            },
        );
        assert_eq!(tracker.reevaluate(&topology).len(), 3);
    }

    #[test]
    fn register_time_burst_matches_type() {
        let topology = ready_topology();

        let links = super::ready_scopes_for_type(&topology, 9);
        assert_eq!(links, vec![ReadyScope::Link(IF_ADDR)]);

        let areas = super::ready_scopes_for_type(&topology, 10);
        assert_eq!(areas, vec![ReadyScope::Area(AREA)]);

        let domain = super::ready_scopes_for_type(&topology, 11);
        assert_eq!(domain, vec![ReadyScope::Domain]);

        assert!(super::ready_scopes_for_type(&Topology::new(), 10).is_empty());
    }
}
