use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tracing::{debug, info};

use taskpace::cli::{Cli, Command};
use taskpace::config::Config;
use taskpace::{CancellationToken, FanOut, RecurringTimer, TimerConfig};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

    debug!(?level, "Logging initialized");
    Ok(())
}

async fn run_tick(config: &TimerConfig, work: Duration, run_for: Duration, fail_on: Option<u64>) -> Result<()> {
    debug!(?config, ?work, ?run_for, ?fail_on, "run_tick: called");
    let started = Instant::now();
    let ticks = Arc::new(AtomicU64::new(0));

    let t = ticks.clone();
    let timer = RecurringTimer::from_config(config, move |token: CancellationToken| {
        let n = t.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            println!("{} tick {} at {}ms", "•".cyan(), n, started.elapsed().as_millis());
            if fail_on == Some(n) {
                return Err(eyre!("tick {} failed on request", n));
            }
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(work) => {}
            }
            Ok(())
        }
    })
    .context("Invalid timer configuration")?;

    timer.on_error(|err| println!("{} {}", "✗".red(), err));

    timer.start().await?;
    tokio::time::sleep(run_for).await;
    timer.stop().await?;

    let stats = timer.stats();
    println!(
        "{} {} invocations, {} failures over {}ms",
        "✓".green(),
        stats.invocations,
        stats.failures,
        run_for.as_millis()
    );

    timer.dispose().await;
    Ok(())
}

async fn run_fanout(fan_out: FanOut, items: u64, delay: Duration) -> Result<()> {
    debug!(?fan_out, items, ?delay, "run_fanout: called");
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let (a, p) = (active.clone(), peak.clone());
    let results = fan_out
        .run_for_each_collecting(0..items, move |x| {
            let (a, p) = (a.clone(), p.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(x * 2)
            }
        })
        .await?;

    let rendered: Vec<String> = results.iter().map(|r| r.to_string()).collect();
    println!("{} [{}]", "✓".green(), rendered.join(", "));
    println!(
        "  {} items in {}ms, peak concurrency {}",
        items,
        started.elapsed().as_millis(),
        peak.load(Ordering::SeqCst).to_string().cyan()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;
    info!("taskpace starting");

    match cli.command {
        Command::Tick {
            due_ms,
            period_ms,
            overlap,
            work_ms,
            run_for_ms,
            fail_on,
        } => {
            // CLI flags override config
            if let Some(due_ms) = due_ms {
                config.timer.due_time_ms = due_ms;
            }
            if let Some(period_ms) = period_ms {
                config.timer.period_ms = period_ms;
            }
            if overlap {
                config.timer.allow_overlap = true;
            }
            run_tick(
                &config.timer,
                Duration::from_millis(work_ms),
                Duration::from_millis(run_for_ms),
                fail_on,
            )
            .await?;
        }
        Command::Fanout {
            items,
            max_concurrency,
            delay_ms,
        } => {
            if max_concurrency.is_some() {
                config.executor.max_concurrency = max_concurrency;
            }
            let fan_out = FanOut::from_config(&config.executor).context("Invalid executor configuration")?;
            run_fanout(fan_out, items, Duration::from_millis(delay_ms)).await?;
        }
    }

    Ok(())
}
