//! Routers that wake up every `period`, issue one burst to each of their
//! destinations and go back to sleep.
//!
//! Start times are staggered so that a firing at `t` for source `i` starts
//! its burst to destination `j` at `t + base_offset + i * source_spacing +
//! j * stagger`. Every burst stops at the same absolute `deadline`.

use std::{
    cell::{Cell, RefCell},
    net::{Ipv4Addr, SocketAddrV4},
    rc::Rc,
};

use anyhow::{ensure, Result};
use derive_where::derive_where;
use serde::{Deserialize, Serialize};

use crate::{
    network::{Datagram, DatagramAddress, Endpoint},
    quantities::{earliest_opt, seconds, Float, Time, TimeSpan},
    simulation::{Component, EffectContext, Message},
    util::logging::Logger,
};

use super::burst::{Burst, BurstConfig, BurstQueue, Destination, Transmission};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CycleConfig {
    pub base_offset: TimeSpan,
    pub source_spacing: TimeSpan,
    pub stagger: TimeSpan,
    pub period: TimeSpan,
    pub deadline: Time,
    pub burst: BurstConfig,
}

impl Default for CycleConfig {
    fn default() -> CycleConfig {
        CycleConfig {
            base_offset: seconds(2.),
            source_spacing: seconds(1.),
            stagger: seconds(5.),
            period: seconds(5.),
            deadline: Time::from_sim_start(seconds(120.)),
            burst: BurstConfig::default(),
        }
    }
}

impl CycleConfig {
    /// Offset from the firing time at which `source` starts its burst to `destination`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn start_offset(&self, source: usize, destination: usize) -> TimeSpan {
        self.base_offset
            + (source as Float) * self.source_spacing
            + (destination as Float) * self.stagger
    }

    pub fn validate(&self, destinations: usize) -> Result<()> {
        ensure!(
            self.period.is_positive(),
            "Cycle period must be positive, got {}",
            self.period
        );
        ensure!(
            !self.base_offset.is_negative() && !self.source_spacing.is_negative(),
            "Start offsets must not be negative"
        );
        ensure!(
            destinations <= 1 || self.stagger.is_positive(),
            "Stagger must be positive to order {destinations} destinations, got {}",
            self.stagger
        );
        self.burst.validate()
    }
}

/// When a sender stops re-arming itself. A firing at `t` is allowed while `t`
/// is not past `horizon` and fewer than `max_loops` firings have happened.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Termination {
    pub horizon: Option<Time>,
    pub max_loops: Option<u64>,
}

impl Termination {
    pub const NEVER: Termination = Termination {
        horizon: None,
        max_loops: None,
    };

    #[must_use]
    pub fn allows(&self, time: Time, loop_count: u64) -> bool {
        self.horizon.map_or(true, |horizon| time <= horizon)
            && self.max_loops.map_or(true, |max| loop_count < max)
    }

    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        self.horizon.is_some() || self.max_loops.is_some()
    }
}

/// Firings across every sender that shares it.
#[derive(Debug, Clone, Default)]
pub struct LoopCounter(Rc<Cell<u64>>);

impl LoopCounter {
    pub fn increment(&self) {
        self.0.set(self.0.get() + 1);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstRecord {
    pub source: usize,
    pub destination: SocketAddrV4,
    pub start: Time,
    /// The sender's loop count at the firing that issued the burst.
    pub loop_count: u64,
}

/// Every burst issued by the senders that share it, in issue order.
#[derive(Debug, Clone, Default)]
pub struct BurstLog(Rc<RefCell<Vec<BurstRecord>>>);

impl BurstLog {
    fn push(&self, record: BurstRecord) {
        self.0.borrow_mut().push(record);
    }

    #[must_use]
    pub fn records(&self) -> Vec<BurstRecord> {
        self.0.borrow().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Armed { next_fire: Time },
    Stopped,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub loop_count: u64,
    pub bursts_issued: u64,
    pub datagrams_sent: u64,
    pub echoes_received: u64,
}

const EPHEMERAL_PORT: u16 = 49153;

#[derive_where(Debug; L)]
pub struct PeriodicSender<'sim, E, L> {
    source: usize,
    endpoint: Endpoint<'sim, E>,
    destinations: Vec<Destination<'sim, E>>,
    cycle: CycleConfig,
    termination: Termination,
    state: SenderState,
    stats: SenderStats,
    total_loops: LoopCounter,
    burst_log: Option<BurstLog>,
    pending: BurstQueue<'sim, E>,
    next_seq: u64,
    logger: L,
}

impl<'sim, E, L> PeriodicSender<'sim, E, L>
where
    L: Logger,
{
    /// A sender armed to fire at the start of the simulation, unless
    /// `termination` rules out even the first firing. Fails when `cycle`
    /// cannot order bursts to `destinations`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: usize,
        address: Ipv4Addr,
        component: DatagramAddress<'sim, E>,
        destinations: Vec<Destination<'sim, E>>,
        cycle: CycleConfig,
        termination: Termination,
        total_loops: LoopCounter,
        logger: L,
    ) -> Result<PeriodicSender<'sim, E, L>> {
        cycle.validate(destinations.len())?;
        let state = if termination.allows(Time::SIM_START, 0) {
            SenderState::Armed {
                next_fire: Time::SIM_START,
            }
        } else {
            SenderState::Stopped
        };
        Ok(PeriodicSender {
            source,
            endpoint: Endpoint {
                socket: SocketAddrV4::new(address, EPHEMERAL_PORT),
                component,
            },
            destinations,
            cycle,
            termination,
            state,
            stats: SenderStats::default(),
            total_loops,
            burst_log: None,
            pending: BurstQueue::new(),
            next_seq: 0,
            logger,
        })
    }

    /// Continues counting from `loop_count` instead of 0. The shared
    /// `LoopCounter` only counts firings made by this run.
    #[must_use]
    pub fn starting_at_loop(mut self, loop_count: u64) -> PeriodicSender<'sim, E, L> {
        self.stats.loop_count = loop_count;
        if let SenderState::Armed { next_fire } = self.state {
            if !self.termination.allows(next_fire, loop_count) {
                self.state = SenderState::Stopped;
            }
        }
        self
    }

    #[must_use]
    pub fn with_burst_log(mut self, burst_log: BurstLog) -> PeriodicSender<'sim, E, L> {
        self.burst_log = Some(burst_log);
        self
    }

    #[must_use]
    pub const fn source(&self) -> usize {
        self.source
    }

    #[must_use]
    pub const fn loop_count(&self) -> u64 {
        self.stats.loop_count
    }

    #[must_use]
    pub const fn state(&self) -> SenderState {
        self.state
    }

    #[must_use]
    pub const fn stats(&self) -> SenderStats {
        self.stats
    }

    fn fire(&mut self, time: Time) {
        for (j, destination) in self.destinations.iter().enumerate() {
            let burst = Burst {
                destination: destination.clone(),
                start: time + self.cycle.start_offset(self.source, j),
                stop: self.cycle.deadline,
                config: self.cycle.burst,
            };
            let transmissions = self.pending.push(&burst);
            self.stats.bursts_issued += 1;
            if let Some(log) = &self.burst_log {
                log.push(BurstRecord {
                    source: self.source,
                    destination: destination.endpoint.socket,
                    start: burst.start,
                    loop_count: self.stats.loop_count,
                });
            }
            log!(
                self.logger,
                "Burst of {} to {} starting at {}",
                transmissions,
                destination.endpoint.socket,
                burst.start
            );
        }

        self.stats.loop_count += 1;
        self.total_loops.increment();

        let next_fire = time + self.cycle.period;
        self.state = if self.termination.allows(next_fire, self.stats.loop_count) {
            SenderState::Armed { next_fire }
        } else {
            log!(self.logger, "Stopping after {} loops", self.stats.loop_count);
            SenderState::Stopped
        };
    }

    fn transmit(&mut self, transmission: Transmission<'sim, E>, time: Time) -> Message<'sim, E> {
        let Transmission { destination, size } = transmission;
        let datagram = Datagram {
            seq: self.next_seq,
            source: self.endpoint.clone(),
            destination: destination.endpoint,
            link: destination.link.clone(),
            size,
            sent_time: time,
        };
        self.next_seq += 1;
        self.stats.datagrams_sent += 1;
        destination.link.create_message(datagram)
    }
}

impl<'sim, E, L> Component<'sim, E> for PeriodicSender<'sim, E, L>
where
    L: Logger,
{
    type Receive = Datagram<'sim, E>;

    fn next_tick(&self, _time: Time) -> Option<Time> {
        let next_fire = match self.state {
            SenderState::Armed { next_fire } => Some(next_fire),
            SenderState::Stopped => None,
        };
        earliest_opt(&[next_fire, self.pending.next_time()])
    }

    fn tick(&mut self, EffectContext { time }: EffectContext) -> Vec<Message<'sim, E>> {
        if self.state == (SenderState::Armed { next_fire: time }) {
            log!(
                self.logger,
                "Firing loop {} at {}",
                self.stats.loop_count,
                time
            );
            self.fire(time);
        }
        self.pending
            .pop_due(time)
            .into_iter()
            .map(|transmission| self.transmit(transmission, time))
            .collect()
    }

    fn receive(&mut self, datagram: Self::Receive, ctx: EffectContext) -> Vec<Message<'sim, E>> {
        self.stats.echoes_received += 1;
        log!(
            self.logger,
            "Echo of datagram {} from {} after {}",
            datagram.seq,
            datagram.source.socket,
            ctx.time - datagram.sent_time
        );
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        net::{Ipv4Addr, SocketAddrV4},
        rc::Rc,
    };

    use generativity::make_guard;
    use itertools::Itertools;
    use pretty_assertions::assert_eq;

    use crate::{
        network::{
            echo::{ActiveWindow, EchoServer},
            link::{Link, LinkConfig},
            Endpoint, NetworkEffect,
        },
        quantities::{seconds, Time},
        simulation::{DynComponent, SimulatorBuilder},
        util::logging::{NothingLogger, VecLogger},
    };

    use super::{
        BurstLog, BurstRecord, CycleConfig, Destination, LoopCounter, PeriodicSender,
        SenderState, Termination,
    };

    const ALWAYS_ON: ActiveWindow = ActiveWindow {
        start: Time::SIM_START,
        stop: Time::MAX,
    };

    fn at(s: f64) -> Time {
        Time::from_sim_start(seconds(s))
    }

    fn server_socket(c: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, c, 2), 9)
    }

    struct Outcome {
        records: Vec<BurstRecord>,
        loop_counts: Vec<u64>,
        total_loops: u64,
        states: Vec<SenderState>,
    }

    /// Runs `sources` senders that all target `destinations` servers, each
    /// behind its own default link.
    fn simulate(
        sources: usize,
        destinations: u8,
        cycle: CycleConfig,
        termination: Termination,
        horizon: Option<Time>,
    ) -> Outcome {
        simulate_from(0, sources, destinations, cycle, termination, horizon)
    }

    fn simulate_from(
        first_loop: u64,
        sources: usize,
        destinations: u8,
        cycle: CycleConfig,
        termination: Termination,
        horizon: Option<Time>,
    ) -> Outcome {
        make_guard!(guard);
        let builder = SimulatorBuilder::<NetworkEffect>::new(guard);
        let destinations = (1..=destinations)
            .map(|c| {
                let server = builder.insert(DynComponent::new(EchoServer::new(
                    ALWAYS_ON,
                    NothingLogger,
                )));
                let link = builder.insert(DynComponent::new(Link::new(
                    LinkConfig::default(),
                    NothingLogger,
                )));
                Destination {
                    endpoint: Endpoint {
                        socket: server_socket(c),
                        component: server,
                    },
                    link,
                }
            })
            .collect_vec();
        let total_loops = LoopCounter::default();
        let burst_log = BurstLog::default();
        let senders = (0..sources)
            .map(|source| {
                let slot = builder.reserve_slot();
                let sender = Rc::new(RefCell::new(
                    PeriodicSender::new(
                        source,
                        Ipv4Addr::new(10, 0, 0, 1),
                        slot.address(),
                        destinations.clone(),
                        cycle,
                        termination,
                        total_loops.clone(),
                        NothingLogger,
                    )
                    .unwrap()
                    .starting_at_loop(first_loop)
                    .with_burst_log(burst_log.clone()),
                ));
                slot.set(DynComponent::shared(sender.clone()));
                sender
            })
            .collect_vec();
        let sim = builder.build(NothingLogger);
        match horizon {
            Some(end) => sim.run_while(|t| t <= end),
            None => sim.run_to_completion(),
        };
        Outcome {
            records: burst_log.records(),
            loop_counts: senders.iter().map(|s| s.borrow().loop_count()).collect(),
            total_loops: total_loops.get(),
            states: senders.iter().map(|s| s.borrow().state()).collect(),
        }
    }

    fn describe(records: &[BurstRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| {
                format!(
                    "loop {} source {} -> {} at {:.1}s",
                    r.loop_count,
                    r.source,
                    r.destination,
                    r.start.seconds_since_start()
                )
            })
            .collect()
    }

    #[test]
    fn staggered_bursts_follow_each_firing() {
        let outcome = simulate(
            1,
            2,
            CycleConfig::default(),
            Termination {
                horizon: None,
                max_loops: Some(2),
            },
            None,
        );
        insta::assert_debug_snapshot!(describe(&outcome.records), @r###"
        [
            "loop 0 source 0 -> 192.168.1.2:9 at 2.0s",
            "loop 0 source 0 -> 192.168.2.2:9 at 7.0s",
            "loop 1 source 0 -> 192.168.1.2:9 at 7.0s",
            "loop 1 source 0 -> 192.168.2.2:9 at 12.0s",
        ]
        "###);
        assert_eq!(outcome.loop_counts, vec![2]);
        assert_eq!(outcome.states, vec![SenderState::Stopped]);
    }

    #[test]
    fn one_burst_per_destination_with_increasing_starts() {
        let cycle = CycleConfig::default();
        let outcome = simulate(
            3,
            4,
            cycle,
            Termination {
                horizon: None,
                max_loops: Some(3),
            },
            None,
        );
        assert_eq!(outcome.records.len(), 3 * 3 * 4);
        for ((_, _), firing) in &outcome
            .records
            .iter()
            .group_by(|r| (r.source, r.loop_count))
        {
            let firing = firing.collect_vec();
            assert_eq!(firing.len(), 4);
            for (a, b) in firing.iter().tuple_windows() {
                assert_eq!(b.start - a.start, cycle.stagger);
            }
        }
        // Source 2 starts two source spacings after source 0.
        assert_eq!(outcome.records[8].start - outcome.records[0].start, seconds(2.));
    }

    #[test]
    fn total_loops_is_sum_of_loop_counts() {
        for horizon in [0., 4.9, 5., 23., 60.] {
            let outcome = simulate(
                4,
                3,
                CycleConfig::default(),
                Termination::NEVER,
                Some(at(horizon)),
            );
            assert_eq!(
                outcome.total_loops,
                outcome.loop_counts.iter().sum::<u64>()
            );
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let expected = (horizon / 5.).floor() as u64 + 1;
            assert_eq!(outcome.loop_counts, vec![expected; 4]);
        }
    }

    #[test]
    fn horizon_stops_rearming() {
        let outcome = simulate(
            2,
            1,
            CycleConfig::default(),
            Termination {
                horizon: Some(at(12.)),
                max_loops: None,
            },
            None,
        );
        assert_eq!(outcome.loop_counts, vec![3, 3]);
        assert_eq!(outcome.total_loops, 6);
        assert_eq!(outcome.states, vec![SenderState::Stopped; 2]);
    }

    #[test]
    fn zero_max_loops_never_fires() {
        let outcome = simulate(
            1,
            2,
            CycleConfig::default(),
            Termination {
                horizon: None,
                max_loops: Some(0),
            },
            None,
        );
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.total_loops, 0);
        assert_eq!(outcome.states, vec![SenderState::Stopped]);
    }

    #[test]
    fn empty_destination_list_still_counts_loops() {
        let outcome = simulate(
            2,
            0,
            CycleConfig::default(),
            Termination {
                horizon: None,
                max_loops: Some(4),
            },
            None,
        );
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.loop_counts, vec![4, 4]);
        assert_eq!(outcome.total_loops, 8);
    }

    #[test]
    fn reruns_are_identical() {
        let run = || {
            simulate(
                4,
                8,
                CycleConfig::default(),
                Termination {
                    horizon: Some(at(120.)),
                    max_loops: None,
                },
                None,
            )
            .records
        };
        let first = run();
        assert_eq!(first.len(), 4 * 25 * 8);
        assert_eq!(first, run());
    }

    #[test]
    fn sends_only_before_deadline_and_counts_echoes() {
        make_guard!(guard);
        let builder = SimulatorBuilder::<NetworkEffect>::new(guard);
        let server = builder.insert(DynComponent::new(EchoServer::new(
            ALWAYS_ON,
            NothingLogger,
        )));
        let link = builder.insert(DynComponent::new(Link::new(
            LinkConfig::default(),
            NothingLogger,
        )));
        let destination = Destination {
            endpoint: Endpoint {
                socket: server_socket(1),
                component: server,
            },
            link,
        };
        let cycle = CycleConfig {
            deadline: at(10.),
            ..CycleConfig::default()
        };
        let slot = builder.reserve_slot();
        let sender = Rc::new(RefCell::new(PeriodicSender::new(
            0,
            Ipv4Addr::new(10, 0, 0, 1),
            slot.address(),
            vec![destination],
            cycle,
            Termination {
                horizon: Some(at(20.)),
                max_loops: None,
            },
            LoopCounter::default(),
            VecLogger::default(),
        )
        .unwrap()));
        slot.set(DynComponent::shared(sender.clone()));
        builder.build(NothingLogger).run_to_completion();

        let sender = sender.borrow();
        let stats = sender.stats();
        // Firings at 0, 5, 10, 15 and 20 start bursts at 2, 7, 12, 17 and 22.
        assert_eq!(stats.loop_count, 5);
        assert_eq!(stats.bursts_issued, 5);
        assert_eq!(stats.datagrams_sent, 2);
        assert_eq!(stats.echoes_received, 2);
    }

    #[test]
    fn continues_from_a_starting_loop_count() {
        let outcome = simulate_from(
            3,
            1,
            1,
            CycleConfig::default(),
            Termination {
                horizon: None,
                max_loops: Some(5),
            },
            None,
        );
        assert_eq!(
            outcome
                .records
                .iter()
                .map(|r| (r.loop_count, r.start))
                .collect::<Vec<_>>(),
            vec![(3, at(2.)), (4, at(7.))]
        );
        assert_eq!(outcome.loop_counts, vec![5]);
        assert_eq!(outcome.total_loops, 2);

        let exhausted = simulate_from(
            5,
            1,
            1,
            CycleConfig::default(),
            Termination {
                horizon: None,
                max_loops: Some(5),
            },
            None,
        );
        assert!(exhausted.records.is_empty());
        assert_eq!(exhausted.states, vec![SenderState::Stopped]);
    }

    #[test]
    fn rejects_cycles_that_cannot_order_destinations() {
        make_guard!(guard);
        let builder = SimulatorBuilder::<NetworkEffect>::new(guard);
        let server = builder.insert(DynComponent::new(EchoServer::new(
            ALWAYS_ON,
            NothingLogger,
        )));
        let destinations = (1..=2)
            .map(|c| Destination {
                endpoint: Endpoint {
                    socket: server_socket(c),
                    component: server.clone(),
                },
                link: server.clone(),
            })
            .collect_vec();
        let flat = CycleConfig {
            stagger: seconds(0.),
            ..CycleConfig::default()
        };
        let slot = builder.reserve_slot();
        let new_sender = |destinations, cycle| {
            PeriodicSender::new(
                0,
                Ipv4Addr::new(10, 0, 0, 1),
                slot.address(),
                destinations,
                cycle,
                Termination::NEVER,
                LoopCounter::default(),
                NothingLogger,
            )
        };
        assert!(new_sender(destinations.clone(), flat).is_err());
        // A single destination needs no stagger.
        assert!(new_sender(destinations[..1].to_vec(), flat).is_ok());
        assert!(new_sender(destinations, CycleConfig::default()).is_ok());
    }
}
