use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lillia::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    constants::THREAD_JOIN_TIMEOUT,
    logs::LogEntry,
    monitor::{MonitorDriver, MonitorIntervals, MonitorObserver},
    port::find_available_port,
    supervisor::{ProcessStatus, Supervisor},
    target::TargetProcessInfo,
};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run {
            config,
            no_bot,
            stop_target,
        } => {
            let shutdown = Arc::new(AtomicBool::new(false));
            register_signal_handler(Arc::clone(&shutdown))?;
            run(&config, no_bot, stop_target, &shutdown)?;
        }
        Commands::Port { start, attempts } => {
            let port = find_available_port(start, attempts)?;
            println!("{port}");
        }
        Commands::Check { config } => {
            let config = load_config(Some(&config))?;
            let control_plane = config.control_plane_launch();
            println!(
                "Configuration OK: control plane '{}' at {}",
                control_plane.name,
                control_plane.executable.display()
            );
            if let Some(bot) = config.bot_runtime_launch() {
                println!(
                    "Bot runtime '{}': {} {}",
                    bot.name,
                    bot.node.display(),
                    bot.script.display()
                );
            }
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn register_signal_handler(shutdown: Arc<AtomicBool>) -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        if shutdown.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already in progress");
        } else {
            info!("lillia is shutting down...");
        }
    })?;

    Ok(())
}

/// Reports target resources as they are refreshed.
struct StatusReporter;

impl MonitorObserver for StatusReporter {
    fn on_logs(&self, entries: &[LogEntry]) {
        debug!("{} new log line(s)", entries.len());
    }

    fn on_target(&self, info: &TargetProcessInfo) {
        if let Some(pid) = info.pid {
            debug!(
                "Target PID {pid}: cpu {:.1}%, memory {:.1} MB",
                info.cpu_percent, info.memory_mb
            );
        }
    }
}

fn run(
    config_path: &str,
    no_bot: bool,
    stop_target: bool,
    shutdown: &AtomicBool,
) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let settings = config.settings();
    let supervisor = Supervisor::new(settings);
    supervisor.set_identity_callback(|identity| {
        info!(
            "Target logged in as {} ({})",
            identity.account_id, identity.display_name
        );
    });

    let control_plane = config.control_plane_launch();
    if !supervisor.start_control_plane(&control_plane) {
        supervisor.shutdown(false);
        return Err(format!("control plane '{}' failed to start", control_plane.name).into());
    }

    if !no_bot
        && let Some(bot) = config.bot_runtime_launch()
        && !supervisor.start_bot_runtime(&bot)
    {
        warn!("Bot runtime '{}' failed to start", bot.name);
    }

    let driver = MonitorDriver::spawn(
        supervisor.logs(),
        supervisor.target(),
        Arc::new(StatusReporter),
        MonitorIntervals::from(&settings),
    );

    let mut last_statuses = supervisor.statuses();
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(STATUS_POLL_INTERVAL);

        let statuses = supervisor.statuses();
        for (name, status) in &statuses {
            let previous = last_statuses
                .iter()
                .find(|(previous_name, _)| previous_name == name)
                .map(|(_, previous)| *previous);
            if previous != Some(*status) {
                info!("Process '{name}' is now {status}");
            }
        }
        last_statuses = statuses;

        if supervisor.get_status(&control_plane.name) == ProcessStatus::Error {
            error!("Control plane '{}' exited unexpectedly", control_plane.name);
            break;
        }
    }

    if !driver.stop(THREAD_JOIN_TIMEOUT) {
        warn!("Monitor driver did not stop cleanly");
    }
    supervisor.shutdown(stop_target);
    Ok(())
}
