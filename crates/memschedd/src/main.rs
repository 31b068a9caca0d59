mod config;
mod gate;
mod logging;
mod metrics;
mod perf;
mod runtime;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use memsched::{RecordingGate, Regulator, ThrottleGate};
use utils::version;

use crate::config::{Cli, Commands, ProbeArgs, Resolved, RunArgs};
use crate::gate::SignalGate;
use crate::perf::{PerfCounter, PerfProvider};
use crate::runtime::{Runtime, RuntimeOptions};
use crate::tasks::Tasks;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(*args).await,
        Commands::Probe(args) => probe(args),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let _guard = logging::init(&args.metrics_file)?;

    tracing::info!("Starting memsched daemon {}", &**version::VERSION);

    let resolved = args.resolve()?;
    tracing::info!(
        cpus = resolved.units.len(),
        period = ?resolved.regulator.period,
        max_bandwidth_mb = resolved.regulator.max_bandwidth_mb,
        reclaim = resolved.regulator.reclaim,
        task_priority = resolved.regulator.task_priority,
        "resolved configuration"
    );

    if args.dry_run {
        tracing::warn!("dry run: processes are never stopped");
        return serve(&args, resolved, RecordingGate::default()).await;
    }

    let gate = SignalGate::new(resolved.units.len());
    for (&cpu, pids) in &resolved.pids {
        for &pid in pids {
            utils::affinity::pin_process(pid, cpu);
            gate.register(cpu, pid);
        }
    }
    serve(&args, resolved, gate).await
}

async fn serve<G: ThrottleGate + 'static>(args: &RunArgs, resolved: Resolved, gate: G) -> Result<()> {
    let provider = PerfProvider;
    let regulator = Regulator::activate(resolved.regulator, resolved.units, &provider, gate)
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to activate regulator")?;
    let regulator = Arc::new(regulator);
    if regulator.regulated_units() == 0 {
        anyhow::bail!("no CPU has a usable counter");
    }

    let runtime = Runtime::start(
        Arc::clone(&regulator),
        RuntimeOptions {
            poll_interval: Duration::from_micros(args.poll_interval_us),
            queue_depth: args.queue_depth,
            pin_threads: true,
        },
    )?;

    let mut tasks = Tasks::new();
    tasks.spawn_metrics_task(
        Arc::clone(&regulator),
        Duration::from_secs(args.stats_interval_secs.max(1)),
        args.node_name.clone(),
    );
    let result = tasks.wait_for_completion().await;

    tokio::task::spawn_blocking(move || runtime.shutdown())
        .await
        .context("runtime shutdown panicked")?;
    tracing::info!("memsched daemon stopped");
    result
}

fn probe(args: ProbeArgs) -> Result<()> {
    utils::logging::init();

    let cpus = args.cpus.unwrap_or_else(utils::affinity::online_cpus);
    for cpu in 0..cpus {
        match PerfCounter::open(cpu, args.event) {
            Ok(_) => println!("cpu {cpu}: {} available", args.event),
            Err(e) => {
                let reason = e.to_counter_error(cpu);
                println!("cpu {cpu}: unavailable ({reason})");
            }
        }
    }
    Ok(())
}
