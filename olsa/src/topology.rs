//! The interface and neighbor model that readiness and the topology notifications are derived
//! from.
//!
//! The daemon embedding the api server owns the real topology, it mirrors changes into this model
//! through the server's hook methods. Only the pieces the api cares about are tracked: which
//! interfaces exist, which area they belong to, their state, and the neighbors reachable through
//! them together with their opaque capability.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Interface state machine states, with their protocol numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum IfState {
    Down = 1,
    Loopback = 2,
    Waiting = 3,
    PointToPoint = 4,
    DrOther = 5,
    Backup = 6,
    Dr = 7,
}

impl IfState {
    /// Decode a state from its protocol value.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => IfState::Down,
            2 => IfState::Loopback,
            3 => IfState::Waiting,
            4 => IfState::PointToPoint,
            5 => IfState::DrOther,
            6 => IfState::Backup,
            7 => IfState::Dr,
            _ => return None,
        })
    }
}

impl fmt::Display for IfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IfState::Down => "Down",
            IfState::Loopback => "Loopback",
            IfState::Waiting => "Waiting",
            IfState::PointToPoint => "PointToPoint",
            IfState::DrOther => "DROther",
            IfState::Backup => "Backup",
            IfState::Dr => "DR",
        })
    }
}

/// Neighbor state machine states, with their protocol numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum NeighborState {
    /// The neighbor is being removed.
    Deleted = 1,
    Down = 2,
    Attempt = 3,
    Init = 4,
    TwoWay = 5,
    ExStart = 6,
    Exchange = 7,
    Loading = 8,
    Full = 9,
}

impl NeighborState {
    /// Decode a state from its protocol value.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => NeighborState::Deleted,
            2 => NeighborState::Down,
            3 => NeighborState::Attempt,
            4 => NeighborState::Init,
            5 => NeighborState::TwoWay,
            6 => NeighborState::ExStart,
            7 => NeighborState::Exchange,
            8 => NeighborState::Loading,
            9 => NeighborState::Full,
            _ => return None,
        })
    }
}

impl fmt::Display for NeighborState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NeighborState::Deleted => "Deleted",
            NeighborState::Down => "Down",
            NeighborState::Attempt => "Attempt",
            NeighborState::Init => "Init",
            NeighborState::TwoWay => "TwoWay",
            NeighborState::ExStart => "ExStart",
            NeighborState::Exchange => "Exchange",
            NeighborState::Loading => "Loading",
            NeighborState::Full => "Full",
        })
    }
}

/// An interface the daemon runs the routing protocol on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub addr: Ipv4Addr,
    pub area_id: Ipv4Addr,
    pub state: IfState,
}

/// A neighbor reachable through one of the daemon's interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbor {
    pub addr: Ipv4Addr,
    pub router_id: Ipv4Addr,
    pub state: NeighborState,
    /// Whether the neighbor advertised the opaque capability option.
    pub opaque_capable: bool,
}

impl Neighbor {
    /// Whether this neighbor can receive opaque advertisements: fully adjacent and opaque
    /// capable.
    pub fn opaque_ready(&self) -> bool {
        self.state == NeighborState::Full && self.opaque_capable
    }
}

/// Mirror of the daemon's interface/neighbor topology.
#[derive(Debug, Default)]
pub struct Topology {
    interfaces: HashMap<Ipv4Addr, Interface>,
    neighbors: HashMap<Ipv4Addr, HashMap<Ipv4Addr, Neighbor>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an interface. Returns the previous entry if one existed.
    pub fn add_interface(&mut self, interface: Interface) -> Option<Interface> {
        self.interfaces.insert(interface.addr, interface)
    }

    /// Remove an interface together with all neighbors reachable through it.
    pub fn remove_interface(&mut self, addr: Ipv4Addr) -> Option<Interface> {
        self.neighbors.remove(&addr);
        self.interfaces.remove(&addr)
    }

    /// Update the state of an interface. Returns false if the interface is unknown.
    pub fn set_interface_state(&mut self, addr: Ipv4Addr, state: IfState) -> bool {
        match self.interfaces.get_mut(&addr) {
            Some(interface) => {
                interface.state = state;
                true
            }
            None => false,
        }
    }

    pub fn interface(&self, addr: Ipv4Addr) -> Option<&Interface> {
        self.interfaces.get(&addr)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values()
    }

    /// The area the interface with the given address belongs to.
    pub fn area_of(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        self.interfaces.get(&addr).map(|interface| interface.area_id)
    }

    /// Whether any interface belongs to the given area.
    pub fn has_area(&self, area_id: Ipv4Addr) -> bool {
        self.interfaces
            .values()
            .any(|interface| interface.area_id == area_id)
    }

    /// Add or update a neighbor on an interface. Returns false if the interface is unknown.
    pub fn upsert_neighbor(&mut self, ifaddr: Ipv4Addr, neighbor: Neighbor) -> bool {
        if !self.interfaces.contains_key(&ifaddr) {
            return false;
        }
        self.neighbors
            .entry(ifaddr)
            .or_default()
            .insert(neighbor.addr, neighbor);
        true
    }

    /// Remove a neighbor from an interface.
    pub fn remove_neighbor(&mut self, ifaddr: Ipv4Addr, addr: Ipv4Addr) -> Option<Neighbor> {
        self.neighbors.get_mut(&ifaddr)?.remove(&addr)
    }

    /// Whether the given interface currently has at least one neighbor able to receive opaque
    /// advertisements.
    pub fn link_ready(&self, ifaddr: Ipv4Addr) -> bool {
        self.neighbors
            .get(&ifaddr)
            .map(|neighbors| neighbors.values().any(Neighbor::opaque_ready))
            .unwrap_or(false)
    }

    /// Whether any interface in the given area is [ready](Self::link_ready).
    pub fn area_ready(&self, area_id: Ipv4Addr) -> bool {
        self.interfaces
            .values()
            .any(|interface| interface.area_id == area_id && self.link_ready(interface.addr))
    }

    /// Whether any interface at all is [ready](Self::link_ready).
    pub fn domain_ready(&self) -> bool {
        self.interfaces
            .keys()
            .any(|&ifaddr| self.link_ready(ifaddr))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::{IfState, Interface, Neighbor, NeighborState, Topology};

    const IF_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
    const AREA: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

    fn topology_with_interface() -> Topology {
        let mut topology = Topology::new();
        topology.add_interface(Interface {
            addr: IF_ADDR,
            area_id: AREA,
            state: IfState::PointToPoint,
        });
        topology
    }

    fn full_neighbor() -> Neighbor {
        Neighbor {
            addr: Ipv4Addr::new(10, 0, 1, 2),
            router_id: Ipv4Addr::new(2, 2, 2, 2),
            state: NeighborState::Full,
            opaque_capable: true,
        }
    }

    #[test]
    fn readiness_requires_full_capable_neighbor() {
        let mut topology = topology_with_interface();
        assert!(!topology.link_ready(IF_ADDR));
        assert!(!topology.area_ready(AREA));
        assert!(!topology.domain_ready());

        let mut neighbor = full_neighbor();
        neighbor.state = NeighborState::Exchange;
        assert!(topology.upsert_neighbor(IF_ADDR, neighbor));
        assert!(!topology.link_ready(IF_ADDR));

        neighbor.state = NeighborState::Full;
        neighbor.opaque_capable = false;
        topology.upsert_neighbor(IF_ADDR, neighbor);
        assert!(!topology.link_ready(IF_ADDR));

        neighbor.opaque_capable = true;
        topology.upsert_neighbor(IF_ADDR, neighbor);
        assert!(topology.link_ready(IF_ADDR));
        assert!(topology.area_ready(AREA));
        assert!(topology.domain_ready());
    }

    #[test]
    fn neighbor_needs_known_interface() {
        let mut topology = Topology::new();
        assert!(!topology.upsert_neighbor(IF_ADDR, full_neighbor()));
    }

    #[test]
    fn removing_interface_drops_neighbors() {
        let mut topology = topology_with_interface();
        topology.upsert_neighbor(IF_ADDR, full_neighbor());
        assert!(topology.domain_ready());

        topology.remove_interface(IF_ADDR);
        assert!(!topology.domain_ready());
        assert!(!topology.has_area(AREA));
    }

    #[test]
    fn state_values_follow_protocol_encoding() {
        assert_eq!(IfState::Down as u8, 1);
        assert_eq!(IfState::Dr as u8, 7);
        assert_eq!(IfState::from_u8(4), Some(IfState::PointToPoint));
        assert_eq!(IfState::from_u8(8), None);

        assert_eq!(NeighborState::Full as u8, 9);
        assert_eq!(NeighborState::from_u8(9), Some(NeighborState::Full));
        assert_eq!(NeighborState::from_u8(10), None);
    }
}
