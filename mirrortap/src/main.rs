use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use mirrortap_lib::{load_from_path, Capture, Config, ResourceSampler, StatsSnapshot};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "High-performance multi-worker packet tap")]
struct Cli {
    /// Path to configuration YAML file
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    validate_config: bool,
}

/// SIGINT/SIGTERM escalation: first = graceful, second = forced shutdown
/// warning, third = immediate exit.
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn handle_signal(_sig: libc::c_int) {
    let n = SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
    match n {
        1 => {}
        2 => {
            // async-signal-safe write; tracing is off-limits here
            let msg = b"\nsecond signal, forcing shutdown...\n";
            unsafe { libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len()) };
        }
        _ => unsafe { libc::_exit(1) },
    }
}

fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

fn shutdown_requested() -> bool {
    SIGNAL_COUNT.load(Ordering::SeqCst) > 0
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if cli.validate_config {
        info!(config = %cli.config.display(), "configuration OK");
        return;
    }

    if unsafe { libc::geteuid() } != 0 {
        error!("root privileges are required (raw sockets, eBPF)");
        std::process::exit(1);
    }

    install_signal_handlers();

    if let Err(err) = run(&cfg) {
        error!(%err, "initialization failed");
        std::process::exit(1);
    }
}

fn run(cfg: &Config) -> mirrortap_lib::Result<()> {
    info!(
        input = %cfg.runtime.input_iface,
        output = %if cfg.runtime.output_iface.is_empty() {
            "(drop mode)"
        } else {
            cfg.runtime.output_iface.as_str()
        },
        mode = ?cfg.runtime.mode,
        "starting packet tap"
    );

    let mut capture = Capture::init(cfg)?;
    capture.reset_stats();
    capture.start()?;

    info!("packet tap running, Ctrl+C to stop");

    let start = Instant::now();
    let mut prev = StatsSnapshot::default();
    let mut prev_at = start;
    let mut resources = cfg.runtime.resource_usage.then(ResourceSampler::new);

    while !shutdown_requested() {
        std::thread::sleep(Duration::from_secs(1));
        if cfg.runtime.stats {
            let now = Instant::now();
            let total = capture.aggregate_stats();
            print_stats(&capture, cfg, &total, &prev, now - prev_at, start.elapsed());
            prev = total;
            prev_at = now;
            if let Some(sampler) = resources.as_mut() {
                sampler.sample();
            }
        }
    }

    info!("shutting down");
    capture.stop();

    // Final numbers after the workers drained.
    let total = capture.aggregate_stats();
    print_stats(&capture, cfg, &total, &StatsSnapshot::default(), start.elapsed(), start.elapsed());

    Ok(())
}

fn print_stats(
    capture: &Capture,
    cfg: &Config,
    total: &StatsSnapshot,
    prev: &StatsSnapshot,
    interval: Duration,
    elapsed: Duration,
) {
    let rates = total.rates_since(prev, interval);
    info!(
        elapsed_s = elapsed.as_secs(),
        rx_packets = total.packets_received,
        rx_pps = format!("{:.0}", rates.rx_pps),
        rx_mbps = format!("{:.2}", rates.rx_mbps),
        tx_packets = total.packets_sent,
        tx_pps = format!("{:.0}", rates.tx_pps),
        tx_mbps = format!("{:.2}", rates.tx_mbps),
        dropped = total.packets_dropped,
        truncated = total.packets_truncated,
        "statistics"
    );

    if cfg.runtime.verbose {
        for (id, w) in capture.per_worker_stats().iter().enumerate() {
            info!(
                worker = id,
                rx = w.packets_received,
                tx = w.packets_sent,
                dropped = w.packets_dropped,
                "worker statistics"
            );
        }
    }

    if cfg.runtime.filter_stats {
        if let Some(filter) = capture.filter() {
            if let Some(hits) = filter.hit_counts() {
                for (slot, count) in hits.iter().enumerate() {
                    info!(slot, hits = *count, rule = %filter.describe_slot(slot), "filter rule hits");
                }
            }
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
