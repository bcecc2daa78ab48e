mod cli;
mod loopback;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pywren_client_core::config::{Config, Region};
use pywren_client_engine::{
    ByteRange, FunctionInvoker, InvokerEvent, InvokerOptions, JobSpec,
};

use crate::cli::{Cli, Command, ConfigArgs, SimulateArgs};
use crate::loopback::{LOOPBACK_VERSION, LoopbackHandler, LoopbackStorage, LoopbackWorld};

fn init_tracing() {
    let filter = match std::env::var("PYWREN_LOGLEVEL") {
        Ok(level) => {
            EnvFilter::try_new(level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"))
        }
        Err(_) => EnvFilter::new("warn"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Config(args) => show_config(cli.config.as_deref(), &args),
        Command::Simulate(args) => simulate(args).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_file(path)?,
        None => Config::resolve(None)?,
    };
    Ok(config)
}

fn show_config(path: Option<&Path>, args: &ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(path)?;
    if args.full {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let pywren = &config.pywren;
    println!("compute backend: {}", pywren.compute_backend);
    match &pywren.compute_backend_region {
        Some(Region::One(region)) => println!("region:          {region}"),
        Some(Region::Many(regions)) => println!("regions:         {}", regions.join(", ")),
        None => {}
    }
    println!("storage backend: {}", pywren.storage_backend);
    println!("workers:         {}", pywren.workers);
    println!(
        "runtime:         {} ({}MB, {}s deploy timeout)",
        pywren.runtime, pywren.runtime_memory, pywren.runtime_timeout
    );
    println!(
        "completions via: {}",
        if pywren.rabbitmq_monitor {
            "rabbitmq"
        } else {
            "object storage"
        }
    );
    Ok(())
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let region_line = if args.regions > 1 {
        let regions: Vec<String> = (1..=args.regions).map(|i| format!("sim-{i}")).collect();
        format!("  compute_backend_region: [{}]\n", regions.join(", "))
    } else {
        String::new()
    };
    let config = Config::from_yaml_str(&format!(
        "pywren:\n  compute_backend: loopback\n  storage_backend: loopback\n  workers: {}\n  runtime: python3.8\n  runtime_memory: 256\n  runtime_timeout: 600\n{region_line}",
        args.workers
    ))?;

    let world = LoopbackWorld::new(Duration::from_millis(args.call_ms), args.flaky_every);
    let storage = Arc::new(LoopbackStorage::new(world.clone()));
    let invoker = FunctionInvoker::new(
        config,
        "sim",
        storage,
        {
            let world = world.clone();
            move |compute| Ok(LoopbackHandler::create(&compute, world.clone()))
        },
        LOOPBACK_VERSION,
        InvokerOptions::default(),
    )?;

    let mut events = invoker.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                InvokerEvent::JobStarted {
                    total_calls,
                    direct_calls,
                    ..
                } => println!("job started: {total_calls} calls, {direct_calls} dispatched directly"),
                InvokerEvent::CallDispatched {
                    call_id,
                    activation_id,
                    roundtrip_ms,
                    ..
                } => println!("call {call_id} -> {activation_id} ({roundtrip_ms} ms)"),
                InvokerEvent::CallRequeued {
                    call_id, attempt, ..
                } => println!("call {call_id} rejected on attempt {attempt}, requeued"),
                InvokerEvent::CallFailed {
                    call_id, reason, ..
                } => println!("call {call_id} failed: {reason}"),
                InvokerEvent::WatcherFailed { reason, .. } => {
                    println!("completion watcher failed: {reason}")
                }
                InvokerEvent::JobCompleted { .. } => println!("all completions seen"),
                InvokerEvent::StopRequested => println!("stop requested"),
                InvokerEvent::Started | InvokerEvent::Stopped => {}
            }
        }
    });

    let spec = JobSpec {
        executor_id: "sim".to_string(),
        job_id: "A000".to_string(),
        total_calls: args.calls,
        func_key: "pywren.jobs/sim/agg/func.pickle".to_string(),
        data_key: "pywren.jobs/sim/agg/data.pickle".to_string(),
        data_ranges: (0..u64::from(args.calls))
            .map(|i| ByteRange(i * 1024, (i + 1) * 1024 - 1))
            .collect(),
        runtime_name: "python3.8".to_string(),
        runtime_memory: 256,
        execution_timeout: 600,
        extra_env: BTreeMap::new(),
        metadata: serde_json::Value::Null,
        invoke_pool_threads: 16,
        remote_invocation: false,
        func_name: "simulated_fn".to_string(),
        original_total_calls: args.calls,
    };

    let started = Instant::now();
    let handles = invoker.run(spec).await?;
    println!(
        "submitted {} calls (workers={}, call time {}ms)",
        handles.len(),
        args.workers,
        args.call_ms
    );

    let wait_all = async {
        let mut completed = 0usize;
        let mut failed = 0usize;
        for handle in &handles {
            match handle.wait().await {
                Ok(()) => completed += 1,
                Err(err) => {
                    failed += 1;
                    eprintln!("{err}");
                }
            }
        }
        (completed, failed)
    };
    tokio::pin!(wait_all);

    let (completed, failed) = tokio::select! {
        result = &mut wait_all => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!(
                "stop requested; waiting for calls already in flight (press CTRL+C again to exit)"
            );
            invoker.stop();
            tokio::select! {
                result = &mut wait_all => result,
                _ = tokio::signal::ctrl_c() => {
                    printer.abort();
                    anyhow::bail!("aborted");
                }
            }
        }
    };

    printer.abort();
    println!(
        "{completed} calls completed, {failed} failed in {:.2?}",
        started.elapsed()
    );
    Ok(())
}
