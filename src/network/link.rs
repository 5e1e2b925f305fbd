use std::collections::VecDeque;

use derive_where::derive_where;
use serde::{Deserialize, Serialize};

use crate::{
    quantities::{latest, megabits_per_second, milliseconds, InformationRate, Time, TimeSpan},
    simulation::{Component, ComponentId, EffectContext, Message},
    util::logging::Logger,
};

use super::Datagram;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LinkConfig {
    pub data_rate: InformationRate,
    pub delay: TimeSpan,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            data_rate: megabits_per_second(10.),
            delay: milliseconds(1.),
        }
    }
}

/// One direction of a link, identified by the component it delivers to.
#[derive_where(Debug)]
struct Channel<'sim, E> {
    towards: ComponentId<'sim>,
    earliest_transmit: Time,
    transmitting: VecDeque<(Datagram<'sim, E>, Time)>,
}

impl<'sim, E> Channel<'sim, E> {
    const fn new(towards: ComponentId<'sim>) -> Channel<'sim, E> {
        Channel {
            towards,
            earliest_transmit: Time::MIN,
            transmitting: VecDeque::new(),
        }
    }

    fn next_arrival(&self) -> Option<Time> {
        self.transmitting.front().map(|x| x.1)
    }
}

/// A lossless full-duplex point-to-point link. In each direction, datagrams
/// are serialized one after another at the data rate and arrive `delay`
/// after they finish sending.
#[derive_where(Debug; L)]
pub struct Link<'sim, E, L> {
    config: LinkConfig,
    channels: Vec<Channel<'sim, E>>,
    delivered: u64,
    logger: L,
}

impl<'sim, E, L> Link<'sim, E, L>
where
    L: Logger,
{
    #[must_use]
    pub const fn new(config: LinkConfig, logger: L) -> Link<'sim, E, L> {
        Link {
            config,
            channels: Vec::new(),
            delivered: 0,
            logger,
        }
    }

    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    fn channel_index(&mut self, towards: ComponentId<'sim>) -> usize {
        self.channels
            .iter()
            .position(|c| c.towards == towards)
            .unwrap_or_else(|| {
                self.channels.push(Channel::new(towards));
                self.channels.len() - 1
            })
    }
}

impl<'sim, E, L> Component<'sim, E> for Link<'sim, E, L>
where
    L: Logger,
{
    type Receive = Datagram<'sim, E>;

    fn tick(&mut self, EffectContext { time }: EffectContext) -> Vec<Message<'sim, E>> {
        assert_eq!(Some(time), Component::next_tick(self, time));
        let mut due = Vec::new();
        for channel in &mut self.channels {
            while channel.next_arrival().is_some_and(|arrival| arrival <= time) {
                due.extend(channel.transmitting.pop_front());
            }
        }
        due.sort_by_key(|(_, arrival)| *arrival);
        self.delivered += due.len() as u64;
        due.into_iter()
            .map(|(datagram, _)| datagram.next_hop().create_message(datagram))
            .collect()
    }

    fn receive(&mut self, datagram: Self::Receive, ctx: EffectContext) -> Vec<Message<'sim, E>> {
        let LinkConfig { data_rate, delay } = self.config;
        let index = self.channel_index(datagram.next_hop().component_id());
        let channel = &mut self.channels[index];
        let start = latest(&[ctx.time, channel.earliest_transmit]);
        channel.earliest_transmit = start + datagram.size / data_rate;
        let arrival = channel.earliest_transmit + delay;
        log!(
            self.logger,
            "Sending datagram {} from {} to {}, arriving at {}",
            datagram.seq,
            datagram.source.socket,
            datagram.destination.socket,
            arrival
        );
        channel.transmitting.push_back((datagram, arrival));
        vec![]
    }

    fn next_tick(&self, _time: Time) -> Option<Time> {
        self.channels.iter().filter_map(Channel::next_arrival).min()
    }
}
