use std::{
    cell::RefCell,
    net::{Ipv4Addr, SocketAddrV4},
    rc::Rc,
};

use anyhow::{ensure, Result};
use generativity::make_guard;
use serde::{Deserialize, Serialize};
use vec_map::VecMap;

use crate::{
    network::{
        echo::{EchoServer, EchoStats},
        link::Link,
        topology::{AccessAssignment, AddressPlan, CoreAssignment, TopologyConfig},
        Endpoint, NetworkEffect,
    },
    quantities::{Time, TimeSpan},
    simulation::{DynComponent, SimulatorBuilder},
    traffic::{
        burst::Destination,
        periodic::{
            BurstLog, BurstRecord, CycleConfig, LoopCounter, PeriodicSender, SenderStats,
            Termination,
        },
    },
    util::logging::Logger,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScenarioConfig {
    pub topology: TopologyConfig,
    pub cycle: CycleConfig,
    pub termination: Termination,
    /// Hard limit on virtual time. Required when `termination` is unbounded.
    pub duration: Option<TimeSpan>,
    pub record_bursts: bool,
}

impl Default for ScenarioConfig {
    fn default() -> ScenarioConfig {
        let cycle = CycleConfig::default();
        ScenarioConfig {
            topology: TopologyConfig::default(),
            cycle,
            termination: Termination {
                horizon: Some(cycle.deadline),
                max_loops: None,
            },
            duration: None,
            record_bursts: true,
        }
    }
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<AddressPlan> {
        let plan = self.topology.address_plan()?;
        self.cycle.validate(plan.access.len())?;
        ensure!(
            self.termination.is_bounded() || self.duration.is_some(),
            "Senders never stop without a horizon or loop limit, so a duration is required"
        );
        if let Some(duration) = self.duration {
            ensure!(
                !duration.is_negative(),
                "Duration must not be negative, got {duration}"
            );
        }
        Ok(plan)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RouterReport {
    pub index: usize,
    pub address: Ipv4Addr,
    #[serde(flatten)]
    pub stats: SenderStats,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerReport {
    pub index: usize,
    pub address: Ipv4Addr,
    #[serde(flatten)]
    pub stats: EchoStats,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LinkReport {
    #[serde(flatten)]
    pub assignment: AccessAssignment,
    pub delivered: u64,
}

#[derive(Serialize, Debug, Clone)]
pub struct Report {
    pub end_time: Time,
    pub events: u64,
    pub exhausted: bool,
    pub total_loops: u64,
    pub routers: Vec<RouterReport>,
    pub servers: Vec<ServerReport>,
    pub links: Vec<LinkReport>,
    pub core_links: Vec<CoreAssignment>,
    pub bursts: Option<Vec<BurstRecord>>,
}

impl Report {
    #[must_use]
    pub fn datagrams_sent(&self) -> u64 {
        self.routers.iter().map(|r| r.stats.datagrams_sent).sum()
    }

    #[must_use]
    pub fn echoes_received(&self) -> u64 {
        self.routers.iter().map(|r| r.stats.echoes_received).sum()
    }

    #[must_use]
    pub fn echoed(&self) -> u64 {
        self.servers.iter().map(|s| s.stats.echoed).sum()
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.servers.iter().map(|s| s.stats.dropped).sum()
    }
}

/// Builds the topology, starts one periodic sender per router and runs the
/// simulation until it is exhausted or `duration` has passed.
///
/// `new_logger` is called once per component with a name like `router 2`.
pub fn run<L, F>(config: &ScenarioConfig, mut new_logger: F) -> Result<Report>
where
    L: Logger,
    F: FnMut(&str) -> L,
{
    let plan = config.validate()?;
    let topology = &config.topology;

    make_guard!(guard);
    let builder = SimulatorBuilder::<NetworkEffect>::new(guard);

    let mut servers = VecMap::new();
    for assignment in &plan.access {
        if servers.contains_key(assignment.server) {
            continue;
        }
        let server = Rc::new(RefCell::new(EchoServer::new(
            topology.server_window,
            new_logger(&format!("server {}", assignment.server)),
        )));
        let address = builder.insert(DynComponent::shared(server.clone()));
        servers.insert(assignment.server, (server, address));
    }

    let mut links = Vec::with_capacity(plan.access.len());
    let mut destinations = Vec::with_capacity(plan.access.len());
    for assignment in &plan.access {
        let link = Rc::new(RefCell::new(Link::new(
            topology.link,
            new_logger(&format!("link {}", assignment.addresses.subnet)),
        )));
        let link_address = builder.insert(DynComponent::shared(link.clone()));
        let (_, server_address) = &servers[assignment.server];
        destinations.push(Destination {
            endpoint: Endpoint {
                socket: SocketAddrV4::new(assignment.addresses.second, topology.echo_port),
                component: server_address.clone(),
            },
            link: link_address,
        });
        links.push(link);
    }

    let total_loops = LoopCounter::default();
    let burst_log = config.record_bursts.then(BurstLog::default);
    let senders = (0..topology.routers)
        .map(|router| {
            let slot = builder.reserve_slot();
            let mut sender = PeriodicSender::new(
                router,
                plan.router_address(router),
                slot.address(),
                destinations.clone(),
                config.cycle,
                config.termination,
                total_loops.clone(),
                new_logger(&format!("router {router}")),
            )?;
            if let Some(burst_log) = &burst_log {
                sender = sender.with_burst_log(burst_log.clone());
            }
            let sender = Rc::new(RefCell::new(sender));
            slot.set(DynComponent::shared(sender.clone()));
            Ok::<_, anyhow::Error>(sender)
        })
        .collect::<Result<Vec<_>>>()?;

    let sim = builder.build(new_logger("simulator"));
    let summary = match config.duration {
        Some(duration) => sim.run_for(duration),
        None => sim.run_to_completion(),
    };

    let report = Report {
        end_time: summary.end_time,
        events: summary.events,
        exhausted: summary.exhausted,
        total_loops: total_loops.get(),
        routers: senders
            .iter()
            .map(|sender| {
                let sender = sender.borrow();
                RouterReport {
                    index: sender.source(),
                    address: plan.router_address(sender.source()),
                    stats: sender.stats(),
                }
            })
            .collect(),
        servers: servers
            .iter()
            .map(|(index, (server, _))| ServerReport {
                index,
                address: plan
                    .server_address(index)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED),
                stats: server.borrow().stats(),
            })
            .collect(),
        links: plan
            .access
            .iter()
            .zip(&links)
            .map(|(assignment, link)| LinkReport {
                assignment: *assignment,
                delivered: link.borrow().delivered(),
            })
            .collect(),
        core_links: plan.core.clone(),
        bursts: burst_log.map(|log| log.records()),
    };
    Ok(report)
}
