use crate::config::WraithConfig;
use crate::error::WraithError;
use crate::metrics::Metrics;
use crate::server::{self, Services};
use crate::upstream;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub port_override: Option<u16>,
    pub dev: bool,
}

/// How the serve loop ended — the caller maps this to an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Signalled,
}

/// Gateway lifecycle: init → load → bind → watch → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<RunOutcome, WraithError> {
    init_tracing(args.dev);

    let mut config = WraithConfig::load(&args.config_path)?;
    if let Some(port) = args.port_override {
        config.server.port = port;
    }

    let metrics = Metrics::install();
    let state = Services::new(config, metrics)?;

    // Bind both listeners up front so failures surface as exit code 3.
    let cfg = state.config.load_full();
    let proxy_addr = format!("{}:{}", cfg.server.bind_address, cfg.server.port);
    let proxy_listener = TcpListener::bind(&proxy_addr)
        .await
        .map_err(|e| WraithError::Bind(format!("{}: {}", proxy_addr, e)))?;
    let admin_listener = TcpListener::bind(&cfg.server.admin_listen)
        .await
        .map_err(|e| WraithError::Bind(format!("{}: {}", cfg.server.admin_listen, e)))?;

    let pidfile = cfg.server.pidfile.clone();
    if let Some(ref path) = pidfile {
        if let Err(e) = std::fs::write(path, std::process::id().to_string()) {
            error!("server: pidfile write failed, path={}, error={}", path.display(), e);
        }
    }

    let shutdown = Arc::new(Notify::new());
    start_health_check_loop(&state, &shutdown);
    start_sweep_loop(&state, &shutdown);
    start_reload_watcher(&state, args.config_path.clone(), &shutdown);
    start_admin_server(&state, admin_listener);

    info!(
        "server: starting wraith, listen={}, admin={}",
        proxy_addr, cfg.server.admin_listen
    );

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(proxy_listener, state, shutdown).await }
    });

    let outcome = wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        error!("server: proxy task error: {}", e);
    }

    if let Some(ref path) = pidfile {
        std::fs::remove_file(path).ok();
    }

    info!("server: shutdown complete");
    Ok(outcome)
}

fn init_tracing(dev: bool) {
    let default_level = if dev { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if dev {
        // Human-readable output for local development.
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
        return;
    }

    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

// ---------------------------------------------------------------------------
// Loop owners — each function spawns a task with the interval loop. The
// subsystem modules only provide single-shot operations.
// ---------------------------------------------------------------------------

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_health_check_loop(state: &Services, shutdown: &Arc<Notify>) {
    let hc = state.config.load().proxy.health_check.clone();
    if !state.config.load().proxy.enabled || !hc.enabled {
        info!("health: active probes disabled");
        return;
    }

    let pool = state.upstreams.clone();
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let client = upstream::build_probe_client(&hc);
        loop {
            // Interval is re-read so a reload can retune the cadence.
            let cfg = state.config.load().proxy.health_check.clone();
            if sleep_or_shutdown(std::time::Duration::from_secs(cfg.interval), &shutdown).await {
                return;
            }
            upstream::run_health_probes(&pool, &cfg, &client).await;
        }
    });
}

/// Admission and burst-tracker cleanup, once per minute.
fn start_sweep_loop(state: &Services, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(std::time::Duration::from_secs(60), &shutdown).await {
                return;
            }
            state.admission.sweep();
            let window = state.config.load().security.ddos_protection.window_size;
            state.burst.sweep(window);
        }
    });
}

/// SIGHUP triggers a config reload. A reload that fails to load or
/// validate leaves the running configuration in force.
fn start_reload_watcher(state: &Services, config_path: PathBuf, shutdown: &Arc<Notify>) {
    #[cfg(unix)]
    {
        let state = state.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut hup =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("server: SIGHUP handler install failed: {}", e);
                        return;
                    }
                };

            loop {
                tokio::select! {
                    _ = hup.recv() => {}
                    _ = shutdown.notified() => return,
                }

                info!("reload: SIGHUP received, loading {}", config_path.display());
                match WraithConfig::load(&config_path) {
                    Ok(new_config) => {
                        if let Err(e) = state.reload(new_config).await {
                            error!("reload: apply failed, keeping old config: {}", e);
                            metrics::counter!("wraith_config_reloads_total", "result" => "error")
                                .increment(1);
                        }
                    }
                    Err(e) => {
                        error!("reload: load failed, keeping old config: {}", e);
                        metrics::counter!("wraith_config_reloads_total", "result" => "error")
                            .increment(1);
                    }
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (state, config_path, shutdown);
    }
}

fn start_admin_server(state: &Services, listener: TcpListener) {
    let s = state.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(listener, s).await {
            error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) -> RunOutcome {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
    RunOutcome::Signalled
}
