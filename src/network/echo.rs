use serde::{Deserialize, Serialize};

use crate::{
    quantities::{seconds, Time},
    simulation::{Component, EffectContext, Message},
    util::logging::Logger,
};

use super::Datagram;

/// The virtual time range `[start, stop)` during which a server answers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ActiveWindow {
    pub start: Time,
    pub stop: Time,
}

impl ActiveWindow {
    #[must_use]
    pub fn contains(&self, time: Time) -> bool {
        self.start <= time && time < self.stop
    }
}

impl Default for ActiveWindow {
    fn default() -> ActiveWindow {
        ActiveWindow {
            start: Time::from_sim_start(seconds(1.)),
            stop: Time::from_sim_start(seconds(100.)),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoStats {
    pub received: u64,
    pub echoed: u64,
    pub dropped: u64,
}

/// Sends every datagram that arrives inside its active window straight back
/// over the link it came in on.
#[derive(Debug)]
pub struct EchoServer<L> {
    window: ActiveWindow,
    stats: EchoStats,
    logger: L,
}

impl<L> EchoServer<L> {
    pub const fn new(window: ActiveWindow, logger: L) -> EchoServer<L> {
        EchoServer {
            window,
            stats: EchoStats {
                received: 0,
                echoed: 0,
                dropped: 0,
            },
            logger,
        }
    }

    #[must_use]
    pub const fn stats(&self) -> EchoStats {
        self.stats
    }
}

impl<'sim, E, L> Component<'sim, E> for EchoServer<L>
where
    L: Logger,
{
    type Receive = Datagram<'sim, E>;

    fn tick(&mut self, _: EffectContext) -> Vec<Message<'sim, E>> {
        vec![]
    }

    fn receive(&mut self, datagram: Self::Receive, ctx: EffectContext) -> Vec<Message<'sim, E>> {
        self.stats.received += 1;
        if !self.window.contains(ctx.time) {
            self.stats.dropped += 1;
            log!(
                self.logger,
                "Dropped datagram {} from {} (server inactive)",
                datagram.seq,
                datagram.source.socket
            );
            return vec![];
        }
        self.stats.echoed += 1;
        log!(
            self.logger,
            "Echoing datagram {} to {}",
            datagram.seq,
            datagram.source.socket
        );
        let link = datagram.link.clone();
        vec![link.create_message(datagram.into_reply())]
    }

    fn next_tick(&self, _time: Time) -> Option<Time> {
        None
    }
}
