use std::net::SocketAddrV4;

use derive_more::{From, TryInto};
use derive_where::derive_where;

use crate::{
    quantities::{Information, Time},
    simulation::Address,
};

pub mod addressing;
pub mod echo;
pub mod link;
pub mod topology;

pub type DatagramAddress<'sim, E> = Address<'sim, Datagram<'sim, E>, E>;

/// One side of a datagram exchange: the socket it is addressed by and the
/// component that owns that socket.
#[derive_where(Debug, Clone)]
pub struct Endpoint<'sim, E> {
    pub socket: SocketAddrV4,
    pub component: DatagramAddress<'sim, E>,
}

#[derive_where(Debug)]
pub struct Datagram<'sim, E> {
    pub seq: u64,
    pub source: Endpoint<'sim, E>,
    pub destination: Endpoint<'sim, E>,
    /// The point-to-point link the datagram travels over, in both directions.
    pub link: DatagramAddress<'sim, E>,
    pub size: Information,
    pub sent_time: Time,
}

impl<'sim, E> Datagram<'sim, E> {
    #[must_use]
    pub fn next_hop(&self) -> DatagramAddress<'sim, E> {
        self.destination.component.clone()
    }

    /// The same payload addressed back to where it came from.
    #[must_use]
    pub fn into_reply(self) -> Datagram<'sim, E> {
        Datagram {
            source: self.destination,
            destination: self.source,
            ..self
        }
    }
}

/// The message type of a simulation that only carries datagrams.
#[derive(From, TryInto)]
pub enum NetworkEffect<'sim> {
    Datagram(Datagram<'sim, NetworkEffect<'sim>>),
}
