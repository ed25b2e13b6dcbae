use anyhow::{Context, Result};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kvloadgen::config::{build_cli, AppConfig, ClientConfig, ModeConfig, ServerConfig};
use kvloadgen::logging;
use kvloadgen::router::Server;
use kvloadgen::sink::LineSink;
use kvloadgen::sweep::{self, UdpTrialRunner};

fn run_client(config: ClientConfig, stop: &AtomicBool) -> Result<()> {
    let mut sink = LineSink::append_to(&config.output)
        .with_context(|| format!("opening result file {}", config.output.display()))?;
    let mut runner = UdpTrialRunner {
        server: config.server,
        clock: config.clock,
        pacing: config.pacing,
    };
    info!(
        "Sweeping {} from {} req/s in steps of {} (max {}), seed {}",
        config.server,
        config.sweep.start_rate,
        config.sweep.rate_step,
        config.sweep.max_rate,
        config.sweep.template.seed
    );
    sweep::run_sweep(&config.sweep, &mut runner, &mut sink, stop).context("sweep aborted")?;
    Ok(())
}

fn run_server(config: ServerConfig, stop: Arc<AtomicBool>) -> Result<()> {
    let server = Server::bind(&config)
        .with_context(|| format!("starting router on {} ({:?} backend)", config.listen, config.backend))?;
    server.run(stop).context("router failed")?;
    Ok(())
}

fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = AppConfig::from_matches(&matches)?;

    logging::set_up_logger(config.log_level, config.log_file.as_deref())
        .context("setting up logger")?;

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    ctrlc::set_handler(move || {
        s.store(true, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    match config.mode {
        ModeConfig::Client(client) => run_client(client, &stop),
        ModeConfig::Server(server) => run_server(server, stop),
    }
}
