use anyhow::{ensure, Result};
use derive_where::derive_where;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    network::{DatagramAddress, Endpoint},
    quantities::{bytes, seconds, Float, Information, Time, TimeSpan},
    simulation::EventQueue,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BurstConfig {
    pub max_packets: u32,
    pub interval: TimeSpan,
    pub packet_size: Information,
}

impl Default for BurstConfig {
    fn default() -> BurstConfig {
        BurstConfig {
            max_packets: 1,
            interval: seconds(1.),
            packet_size: bytes(256),
        }
    }
}

impl BurstConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_packets <= 1 || self.interval.is_positive(),
            "Bursts of {} packets need a positive interval, got {}",
            self.max_packets,
            self.interval
        );
        ensure!(
            self.packet_size > Information::ZERO,
            "Packet size must be positive"
        );
        Ok(())
    }
}

/// Where a burst goes: the server socket and the access link in front of it.
#[derive_where(Debug, Clone)]
pub struct Destination<'sim, E> {
    pub endpoint: Endpoint<'sim, E>,
    pub link: DatagramAddress<'sim, E>,
}

/// Up to `max_packets` transmissions, `interval` apart, from `start` until `stop`.
#[derive_where(Debug)]
pub struct Burst<'sim, E> {
    pub destination: Destination<'sim, E>,
    pub start: Time,
    pub stop: Time,
    pub config: BurstConfig,
}

impl<'sim, E> Burst<'sim, E> {
    pub fn transmission_times(&self) -> impl Iterator<Item = Time> {
        let BurstConfig {
            max_packets,
            interval,
            ..
        } = self.config;
        let (start, stop) = (self.start, self.stop);
        (0..max_packets)
            .map(move |k| start + Float::from(k) * interval)
            .take_while(move |&time| time < stop)
    }
}

#[derive_where(Debug)]
pub struct Transmission<'sim, E> {
    pub destination: Destination<'sim, E>,
    pub size: Information,
}

/// Transmissions waiting for their send time, in time order and then in the
/// order they were queued.
#[derive_where(Debug)]
pub struct BurstQueue<'sim, E> {
    next_id: u64,
    waiting: FxHashMap<u64, Transmission<'sim, E>>,
    queue: EventQueue<u64>,
}

impl<'sim, E> BurstQueue<'sim, E> {
    #[must_use]
    pub fn new() -> BurstQueue<'sim, E> {
        BurstQueue {
            next_id: 0,
            waiting: FxHashMap::default(),
            queue: EventQueue::new(),
        }
    }

    /// Queues every transmission of `burst` and returns how many there were.
    pub fn push(&mut self, burst: &Burst<'sim, E>) -> usize {
        let times = burst.transmission_times().collect::<Vec<_>>();
        for &time in &times {
            let id = self.next_id;
            self.next_id += 1;
            self.waiting.insert(
                id,
                Transmission {
                    destination: burst.destination.clone(),
                    size: burst.config.packet_size,
                },
            );
            self.queue.update(id, Some(time));
        }
        times.len()
    }

    #[must_use]
    pub fn next_time(&self) -> Option<Time> {
        self.queue.next_time()
    }

    /// Removes every transmission due at or before `time`.
    pub fn pop_due(&mut self, time: Time) -> Vec<Transmission<'sim, E>> {
        let mut due = Vec::new();
        while self.queue.next_time().is_some_and(|next| next <= time) {
            if let Some((_, id)) = self.queue.pop_next() {
                due.extend(self.waiting.remove(&id));
            }
        }
        due
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

impl<'sim, E> Default for BurstQueue<'sim, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use generativity::make_guard;
    use pretty_assertions::assert_eq;

    use crate::{
        network::{echo::EchoServer, Endpoint, NetworkEffect},
        quantities::{bytes, seconds, Time},
        simulation::{DynComponent, SimulatorBuilder},
        util::logging::NothingLogger,
    };

    use super::{Burst, BurstConfig, BurstQueue, Destination};

    fn at(s: f64) -> Time {
        Time::from_sim_start(seconds(s))
    }

    #[test]
    fn bursts_stop_at_deadline_and_count() {
        make_guard!(guard);
        let builder = SimulatorBuilder::<NetworkEffect>::new(guard);
        let server = builder.insert(DynComponent::new(EchoServer::new(
            Default::default(),
            NothingLogger,
        )));
        let destination = Destination {
            endpoint: Endpoint {
                socket: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 9),
                component: server.clone(),
            },
            link: server,
        };
        let config = BurstConfig {
            max_packets: 4,
            interval: seconds(1.),
            packet_size: bytes(256),
        };
        let burst = Burst {
            destination: destination.clone(),
            start: at(2.),
            stop: at(4.5),
            config,
        };
        assert_eq!(
            burst.transmission_times().collect::<Vec<_>>(),
            vec![at(2.), at(3.), at(4.)]
        );
        let late = Burst {
            destination,
            start: at(4.5),
            stop: at(4.5),
            config,
        };
        assert_eq!(late.transmission_times().count(), 0);

        let mut queue = BurstQueue::new();
        assert_eq!(queue.push(&burst), 3);
        assert_eq!(queue.push(&late), 0);
        assert_eq!(queue.next_time(), Some(at(2.)));
        assert_eq!(queue.pop_due(at(3.)).len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_time(), Some(at(4.)));
        assert!(queue.pop_due(at(3.5)).is_empty());
        assert_eq!(queue.pop_due(at(4.)).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn multi_packet_bursts_need_an_interval() {
        let config = BurstConfig {
            max_packets: 3,
            interval: seconds(0.),
            ..BurstConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(BurstConfig::default().validate().is_ok());
    }
}
