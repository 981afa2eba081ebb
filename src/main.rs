#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use wraith::config::WraithConfig;
use wraith::error::WraithError;
use wraith::server::bootstrap::{self, BootstrapArgs, RunOutcome};
use wraith::server::runtime;

const EXIT_CONFIG_INVALID: i32 = 2;
const EXIT_BIND_FAILURE: i32 = 3;
const EXIT_SIGNAL: i32 = 130;

#[derive(Parser)]
#[command(name = "wraith", about = "QUIC-first reverse proxy and edge gateway", version)]
struct Cli {
    /// Path to the gateway config file
    #[arg(short, long, global = true, default_value = "wraith.toml")]
    config: PathBuf,

    /// Override the listen port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Development mode: human-readable debug logging
    #[arg(short, long, global = true)]
    dev: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// Query a running instance's /status endpoint
    Status,
    /// Print the version
    Version,
    /// Signal a running instance to reload its configuration
    Reload,
    /// Signal a running instance to shut down
    Stop,
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.config, cli.port, cli.dev),
        Command::Status => status(cli.config, cli.port),
        Command::Version => {
            println!("wraith {}", env!("CARGO_PKG_VERSION"));
            0
        }
        Command::Reload => signal_running(cli.config, SignalKind::Reload),
        Command::Stop => signal_running(cli.config, SignalKind::Stop),
    };

    std::process::exit(code);
}

fn serve(config: PathBuf, port: Option<u16>, dev: bool) -> i32 {
    let worker_threads = runtime::get_container_cpu_limit();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("wraith: failed to build runtime: {}", e);
            return 1;
        }
    };

    match rt.block_on(bootstrap::run(BootstrapArgs {
        config_path: config,
        port_override: port,
        dev,
    })) {
        Ok(RunOutcome::Completed) => 0,
        Ok(RunOutcome::Signalled) => EXIT_SIGNAL,
        Err(e @ WraithError::Config(_)) => {
            eprintln!("wraith: {}", e);
            EXIT_CONFIG_INVALID
        }
        Err(e @ WraithError::Bind(_)) => {
            eprintln!("wraith: {}", e);
            EXIT_BIND_FAILURE
        }
        Err(e) => {
            eprintln!("wraith: {}", e);
            1
        }
    }
}

fn status(config: PathBuf, port: Option<u16>) -> i32 {
    let cfg = match WraithConfig::load(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("wraith: {}", e);
            return EXIT_CONFIG_INVALID;
        }
    };
    let port = port.unwrap_or(cfg.server.port);
    let url = format!("http://127.0.0.1:{}/status", port);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    rt.block_on(async {
        match reqwest::get(&url).await {
            Ok(resp) => match resp.text().await {
                Ok(body) => {
                    println!("{}", body);
                    0
                }
                Err(e) => {
                    eprintln!("wraith: reading status failed: {}", e);
                    1
                }
            },
            Err(e) => {
                eprintln!("wraith: no running instance at {}: {}", url, e);
                1
            }
        }
    })
}

enum SignalKind {
    Reload,
    Stop,
}

#[cfg(unix)]
fn signal_running(config: PathBuf, kind: SignalKind) -> i32 {
    let cfg = match WraithConfig::load(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("wraith: {}", e);
            return EXIT_CONFIG_INVALID;
        }
    };
    let Some(pidfile) = cfg.server.pidfile else {
        eprintln!("wraith: server.pidfile is not configured");
        return 1;
    };
    let pid = match std::fs::read_to_string(&pidfile)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
    {
        Some(p) => p,
        None => {
            eprintln!("wraith: cannot read pid from {}", pidfile.display());
            return 1;
        }
    };

    let signal = match kind {
        SignalKind::Reload => nix::sys::signal::Signal::SIGHUP,
        SignalKind::Stop => nix::sys::signal::Signal::SIGTERM,
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("wraith: signalling pid {} failed: {}", pid, e);
            1
        }
    }
}

#[cfg(not(unix))]
fn signal_running(_config: PathBuf, _kind: SignalKind) -> i32 {
    eprintln!("wraith: reload/stop signalling is only supported on unix");
    1
}
