use std::{fs::File, path::Path};

use anyhow::{anyhow, Context, Result};
use echosim::{
    scenario::{self, Report, ScenarioConfig},
    util::logging::{NothingLogger, PrintLogger},
    Config,
};
use format_num::format_num;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct RouterRow {
    router: usize,
    address: String,
    loops: u64,
    bursts: u64,
    sent: u64,
    echoes: u64,
}

#[derive(Tabled)]
struct ServerRow {
    server: usize,
    address: String,
    received: u64,
    echoed: u64,
    dropped: u64,
}

fn print_report(report: &Report) {
    let routers = report.routers.iter().map(|r| RouterRow {
        router: r.index,
        address: r.address.to_string(),
        loops: r.stats.loop_count,
        bursts: r.stats.bursts_issued,
        sent: r.stats.datagrams_sent,
        echoes: r.stats.echoes_received,
    });
    println!("{}", Table::new(routers).with(Style::modern()));

    let servers = report.servers.iter().map(|s| ServerRow {
        server: s.index,
        address: s.address.to_string(),
        received: s.stats.received,
        echoed: s.stats.echoed,
        dropped: s.stats.dropped,
    });
    println!("{}", Table::new(servers).with(Style::modern()));

    #[allow(clippy::cast_precision_loss)]
    let echo_ratio = if report.datagrams_sent() == 0 {
        0.
    } else {
        report.echoes_received() as f64 / report.datagrams_sent() as f64
    };
    println!(
        "{} loops, {} datagrams sent, {} echoed ({}), {} dropped, run ended at {}{}",
        report.total_loops,
        report.datagrams_sent(),
        report.echoes_received(),
        format_num!(".1%", echo_ratio),
        report.dropped(),
        report.end_time,
        if report.exhausted {
            ""
        } else {
            " (duration reached)"
        }
    );
}

pub(super) fn run(config_path: &Path, trace: Option<&Path>, verbose: bool) -> Result<()> {
    let config = ScenarioConfig::load(config_path)?;
    let report = if verbose {
        let root = PrintLogger::new("echosim".to_string());
        scenario::run(&config, |name| root.child(name))?
    } else {
        scenario::run(&config, |_| NothingLogger)?
    };
    print_report(&report);

    if let Some(path) = trace {
        if path.extension().and_then(|x| x.to_str()) != Some("json") {
            return Err(anyhow!("Tried to write trace to non-json file!"));
        }
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report)?;
        println!("Wrote report to {}", path.display());
    }
    Ok(())
}
