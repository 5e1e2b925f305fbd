use std::{fmt::Display, net::Ipv4Addr};

use anyhow::{anyhow, ensure, Result};
use serde::{Deserialize, Serialize};

/// A `/24` IPv4 subnet, identified by its network address.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "Ipv4Addr", into = "Ipv4Addr")]
pub struct Subnet(Ipv4Addr);

impl Subnet {
    pub fn new(network: Ipv4Addr) -> Result<Subnet> {
        ensure!(
            network.octets()[3] == 0,
            "{network} is not the network address of a /24 subnet"
        );
        Ok(Subnet(network))
    }

    #[must_use]
    pub const fn from_prefix(a: u8, b: u8, c: u8) -> Subnet {
        Subnet(Ipv4Addr::new(a, b, c, 0))
    }

    #[must_use]
    pub const fn network(self) -> Ipv4Addr {
        self.0
    }

    #[must_use]
    pub fn host(self, host: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.0.octets();
        Ipv4Addr::new(a, b, c, host)
    }

    /// The subnet `count` places after this one, counting in the third octet.
    pub fn nth_after(self, count: usize) -> Result<Subnet> {
        let [a, b, c, _] = self.0.octets();
        let third = u8::try_from(usize::from(c) + count)
            .map_err(|_| anyhow!("Ran out of /24 subnets after {self}"))?;
        Subnet::new(Ipv4Addr::new(a, b, third, 0))
    }

    /// Addresses for the two ends of a point-to-point link in this subnet.
    #[must_use]
    pub fn point_to_point(self) -> LinkAddresses {
        LinkAddresses {
            subnet: self,
            first: self.host(1),
            second: self.host(2),
        }
    }
}

impl TryFrom<Ipv4Addr> for Subnet {
    type Error = anyhow::Error;

    fn try_from(value: Ipv4Addr) -> Result<Self> {
        Subnet::new(value)
    }
}

impl From<Subnet> for Ipv4Addr {
    fn from(value: Subnet) -> Self {
        value.0
    }
}

impl Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/24", self.0)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAddresses {
    pub subnet: Subnet,
    pub first: Ipv4Addr,
    pub second: Ipv4Addr,
}
