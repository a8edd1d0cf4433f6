use anyhow::{anyhow, Context, Result};
use barkeep::{Patron, PatronMetrics, Report, Server, WallClock, DEFAULT_QUANTUM};
use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tabled::{Table, Tabled};

/// Bar simulation: one barman serves drink orders from staggered patrons
/// under FCFS, SJF or round robin, and each patron's turnaround, response
/// and waiting times are written to a file.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of patrons.
    #[clap(short = 'p', long, default_value = "20")]
    patrons: usize,

    /// Scheduling discipline: 0 = FCFS, 1 = SJF, 2 = round robin.
    #[clap(short = 'd', long, default_value = "0")]
    discipline: u8,

    /// Round robin quantum, in time units.
    #[clap(short = 'q', long, default_value_t = DEFAULT_QUANTUM)]
    quantum: u64,

    /// Length of one time unit in milliseconds.
    #[clap(short = 'u', long, default_value = "1")]
    unit_ms: u64,

    /// Seed for orders and arrival times. Random when omitted.
    #[clap(short = 's', long)]
    seed: Option<u64>,

    /// File receiving one "id, arrival, turnaround, response, waiting" line
    /// per patron.
    #[clap(short = 'o', long, default_value = "metrics.csv")]
    output: PathBuf,

    /// Print every patron's metrics as a table.
    #[clap(short = 't', long, action = clap::ArgAction::SetTrue)]
    table: bool,

    /// Enable verbose output, including per-order logs. Specify multiple
    /// times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Tabled)]
struct Summary {
    discipline: String,
    patrons: usize,
    drinks: u64,
    #[tabled(rename = "mean turnaround")]
    turnaround: String,
    #[tabled(rename = "mean response")]
    response: String,
    #[tabled(rename = "mean waiting")]
    waiting: String,
    utilization: String,
}

fn mean(metrics: &[PatronMetrics], f: impl Fn(&PatronMetrics) -> u64) -> String {
    if metrics.is_empty() {
        return "-".to_string();
    }
    let sum: u64 = metrics.iter().map(f).sum();
    format!("{:.1}", sum as f64 / metrics.len() as f64)
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let clock = Arc::new(WallClock::new(Duration::from_millis(opts.unit_ms))?);
    let server = Server::builder()
        .selector(opts.discipline, opts.quantum)
        .clock(clock)
        .build()
        .context("Invalid scheduler configuration")?;

    let file = File::create(&opts.output)
        .with_context(|| format!("Failed to create {}", opts.output.display()))?;
    let report = Arc::new(Report::new(BufWriter::new(file)));
    let mut rng = match opts.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    // the barman and every patron start together
    let gate = Arc::new(Barrier::new(opts.patrons + 1));
    let worker = server
        .spawn(Some(gate.clone()))
        .context("Failed to spawn server thread")?;
    info!(
        "bar open: {} patrons, discipline {}",
        opts.patrons,
        server.discipline()
    );

    let mut handles = Vec::with_capacity(opts.patrons);
    for id in 0..opts.patrons {
        let patron = Patron::new(id, &mut rng);
        let server = server.clone();
        let gate = gate.clone();
        let report = report.clone();
        let handle = thread::Builder::new()
            .name(format!("patron-{}", id))
            .spawn(move || -> Result<PatronMetrics> {
                let metrics = patron.run(&server, Some(&gate))?;
                report.record(&metrics)?;
                Ok(metrics)
            })
            .context("Failed to spawn patron thread")?;
        handles.push(handle);
    }

    let mut metrics = Vec::with_capacity(handles.len());
    for handle in handles {
        let m = handle
            .join()
            .map_err(|_| anyhow!("patron thread panicked"))??;
        metrics.push(m);
    }

    worker
        .shutdown_and_join()
        .map_err(|_| anyhow!("server thread panicked"))??;
    report.flush().context("Failed to flush metrics")?;
    info!("bar closed, metrics in {}", opts.output.display());

    metrics.sort_by_key(|m| m.id);
    if opts.table {
        println!("{}", Table::new(metrics.iter().copied()));
    }
    let stats = server.stats();
    let summary = Summary {
        discipline: server.discipline().to_string(),
        patrons: metrics.len(),
        drinks: stats.completions,
        turnaround: mean(&metrics, |m| m.turnaround),
        response: mean(&metrics, |m| m.response),
        waiting: mean(&metrics, |m| m.waiting),
        utilization: stats
            .utilization()
            .map_or("-".to_string(), |u| format!("{:.1}%", u * 100.0)),
    };
    println!("{}", Table::new([summary]));
    Ok(())
}
