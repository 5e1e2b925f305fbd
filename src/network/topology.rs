use std::net::Ipv4Addr;

use anyhow::{bail, ensure, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{
    addressing::{LinkAddresses, Subnet},
    echo::ActiveWindow,
    link::LinkConfig,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum Node {
    Router(usize),
    Server(usize),
}

/// A link between a router and a server. Servers are reached through these.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessLink {
    pub router: usize,
    pub server: usize,
}

/// A link that only takes part in the address plan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreLink {
    pub a: Node,
    pub b: Node,
    pub subnet: Subnet,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TopologyConfig {
    pub routers: usize,
    pub servers: usize,
    pub link: LinkConfig,
    pub echo_port: u16,
    pub server_window: ActiveWindow,
    /// Access link `k` gets the subnet `k` places after this one.
    pub access_base: Subnet,
    pub access_links: Vec<AccessLink>,
    pub core_links: Vec<CoreLink>,
}

impl Default for TopologyConfig {
    fn default() -> TopologyConfig {
        let access_links = [(0, 0), (0, 1), (1, 4), (1, 5), (2, 2), (2, 3), (3, 6), (3, 7)]
            .into_iter()
            .map(|(router, server)| AccessLink { router, server })
            .collect();
        let server_mesh = [
            (0, 1),
            (0, 4),
            (1, 5),
            (1, 3),
            (2, 3),
            (2, 6),
            (3, 7),
            (4, 5),
            (4, 6),
            (5, 7),
            (6, 7),
        ];
        let core_links = std::iter::once(CoreLink {
            a: Node::Router(2),
            b: Node::Router(3),
            subnet: Subnet::from_prefix(10, 0, 1),
        })
        .chain(server_mesh.into_iter().zip(9..).map(|((a, b), c)| CoreLink {
            a: Node::Server(a),
            b: Node::Server(b),
            subnet: Subnet::from_prefix(192, 168, c),
        }))
        .collect();
        TopologyConfig {
            routers: 4,
            servers: 8,
            link: LinkConfig::default(),
            echo_port: 9,
            server_window: ActiveWindow::default(),
            access_base: Subnet::from_prefix(192, 168, 1),
            access_links,
            core_links,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessAssignment {
    pub router: usize,
    pub server: usize,
    #[serde(flatten)]
    pub addresses: LinkAddresses,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreAssignment {
    pub a: Node,
    pub b: Node,
    #[serde(flatten)]
    pub addresses: LinkAddresses,
}

/// Which address every link end was given.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AddressPlan {
    pub access: Vec<AccessAssignment>,
    pub core: Vec<CoreAssignment>,
}

impl AddressPlan {
    /// Server addresses in access link order.
    #[must_use]
    pub fn server_addresses(&self) -> Vec<Ipv4Addr> {
        self.access.iter().map(|a| a.addresses.second).collect()
    }

    /// The address a router sends from: its end of its first link.
    #[must_use]
    pub fn router_address(&self, router: usize) -> Ipv4Addr {
        self.access
            .iter()
            .find(|a| a.router == router)
            .map(|a| a.addresses.first)
            .or_else(|| {
                self.core.iter().find_map(|c| match (c.a, c.b) {
                    (Node::Router(r), _) if r == router => Some(c.addresses.first),
                    (_, Node::Router(r)) if r == router => Some(c.addresses.second),
                    _ => None,
                })
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    #[must_use]
    pub fn server_address(&self, server: usize) -> Option<Ipv4Addr> {
        self.access
            .iter()
            .find(|a| a.server == server)
            .map(|a| a.addresses.second)
    }
}

impl TopologyConfig {
    fn check_node(&self, node: Node) -> Result<()> {
        match node {
            Node::Router(r) if r >= self.routers => {
                bail!("Link refers to router {r} but there are only {}", self.routers)
            }
            Node::Server(s) if s >= self.servers => {
                bail!("Link refers to server {s} but there are only {}", self.servers)
            }
            _ => Ok(()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.routers > 0, "Topology needs at least one router");
        ensure!(self.servers > 0, "Topology needs at least one server");
        ensure!(
            self.link.data_rate.is_positive(),
            "Link data rate must be positive, got {}",
            self.link.data_rate
        );
        ensure!(
            !self.link.delay.is_negative(),
            "Link delay must not be negative, got {}",
            self.link.delay
        );
        ensure!(
            self.server_window.start <= self.server_window.stop,
            "Server window starts at {} but stops at {}",
            self.server_window.start,
            self.server_window.stop
        );
        for link in &self.access_links {
            self.check_node(Node::Router(link.router))?;
            self.check_node(Node::Server(link.server))?;
        }
        for link in &self.core_links {
            self.check_node(link.a)?;
            self.check_node(link.b)?;
        }
        Ok(())
    }

    /// Gives every link a `/24`. The first end of a link is host 1, the second host 2.
    pub fn address_plan(&self) -> Result<AddressPlan> {
        self.validate()?;
        let access = self
            .access_links
            .iter()
            .enumerate()
            .map(|(k, link)| {
                Ok(AccessAssignment {
                    router: link.router,
                    server: link.server,
                    addresses: self.access_base.nth_after(k)?.point_to_point(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let core = self
            .core_links
            .iter()
            .map(|link| CoreAssignment {
                a: link.a,
                b: link.b,
                addresses: link.subnet.point_to_point(),
            })
            .collect_vec();
        if let Some(subnet) = access
            .iter()
            .map(|a| a.addresses.subnet)
            .chain(core.iter().map(|c| c.addresses.subnet))
            .duplicates()
            .next()
        {
            bail!("Subnet {subnet} is assigned to more than one link");
        }
        Ok(AddressPlan { access, core })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::{AccessLink, Node, TopologyConfig};

    #[test]
    fn default_server_addresses_follow_access_links() {
        let plan = TopologyConfig::default().address_plan().unwrap();
        assert_eq!(
            plan.server_addresses(),
            (1..=8)
                .map(|c| Ipv4Addr::new(192, 168, c, 2))
                .collect::<Vec<_>>()
        );
        // Server 4 hangs off the third access link.
        assert_eq!(plan.server_address(4), Some(Ipv4Addr::new(192, 168, 3, 2)));
        assert_eq!(plan.router_address(1), Ipv4Addr::new(192, 168, 3, 1));
    }

    #[test]
    fn default_core_links() {
        let plan = TopologyConfig::default().address_plan().unwrap();
        assert_eq!(plan.core.len(), 12);
        assert_eq!(plan.core[0].a, Node::Router(2));
        assert_eq!(plan.core[0].addresses.second, Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(
            plan.core[11].addresses.subnet.network(),
            Ipv4Addr::new(192, 168, 19, 0)
        );
    }

    #[test]
    fn router_without_access_link_uses_core_link() {
        let mut config = TopologyConfig::default();
        config.access_links.retain(|l| l.router != 3);
        let plan = config.address_plan().unwrap();
        assert_eq!(plan.router_address(3), Ipv4Addr::new(10, 0, 1, 2));
    }

    #[test]
    fn rejects_unknown_endpoints() {
        let mut config = TopologyConfig::default();
        config.access_links.push(AccessLink {
            router: 4,
            server: 0,
        });
        assert!(config.address_plan().is_err());
    }

    #[test]
    fn rejects_overlapping_subnets() {
        let mut config = TopologyConfig::default();
        // The ninth access link would take 192.168.9.0, already used by the server mesh.
        config.access_links.push(AccessLink {
            router: 0,
            server: 7,
        });
        let error = config.address_plan().unwrap_err();
        assert!(error.to_string().contains("192.168.9.0/24"));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = TopologyConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"kind\":\"router\""));
        let parsed: TopologyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
