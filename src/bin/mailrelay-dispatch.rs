use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info, warn};

use mailrelay::{Config, Dispatcher, Error, RunReport};

/// Deliver everything currently waiting in the mail queue, then exit.
/// Messages that cannot be delivered stay queued for the next run.
#[derive(Parser, Debug)]
#[command(name = "mailrelay-dispatch", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Queue directory (overrides the configuration file)
    #[arg(long)]
    queue_dir: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Name announced in EHLO (default: this host's name)
    #[arg(long)]
    helo_name: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(args) {
        Ok(report) => {
            if !report.all_delivered() {
                info!(
                    "{} message(s) left in the queue for the next run",
                    report.retained.len() + report.skipped
                );
            }
        }
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<RunReport, Error> {
    let mut config = match args.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(queue_dir) = args.queue_dir {
        config.queue_dir = queue_dir;
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(helo_name) = args.helo_name {
        config.helo_name = helo_name;
    }
    info!("Using HELO hostname: {}", config.helo_name);

    let dispatcher = Dispatcher::from_config(config)?;

    let shutdown = dispatcher.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("shutdown requested, finishing in-flight deliveries");
        shutdown.trigger();
    }) {
        warn!("cannot install Ctrl-C handler: {}", e);
    }

    dispatcher.run()
}
