//! `switchboard` – run the Hub, Workers and the HTTP front-end.
//!
//! ```text
//! switchboard hub            # own the upstream connection (console upstream)
//! switchboard worker         # one Worker process
//! switchboard pool -n 4      # supervise N Worker processes
//! switchboard web            # HTTP front-end on :5000
//! ```
//!
//! Settings come from `~/.switchboard/config.toml` (see [`config`]), then
//! `SWITCHBOARD_*` variables, then flags. Ctrl-C shuts every sub-command
//! down gracefully.

mod builtin;
mod config;
mod console;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use switchboard_hub::{ChannelGateway, Hub};
use switchboard_types::BridgeError;
use switchboard_web::WebServer;
use switchboard_worker::telemetry::init_tracing;
use switchboard_worker::{WebBridge, Worker};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Hub, Worker pool and web front-end for a single chat-bot connection")]
struct Cli {
    /// Config file (default: ~/.switchboard/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Skip the banner
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Own the upstream connection and serve Workers
    Hub {
        #[arg(long)]
        addr: Option<String>,
        /// Account id the console upstream is logged in as
        #[arg(long, default_value_t = 0)]
        self_id: u64,
    },
    /// Run one Worker
    Worker {
        #[arg(long)]
        hub_url: Option<String>,
        #[arg(long)]
        web_url: Option<String>,
        /// Do not connect to the HTTP front-end
        #[arg(long)]
        no_web: bool,
    },
    /// Start and supervise several Worker processes
    Pool {
        #[arg(long, short = 'n')]
        size: Option<usize>,
        #[arg(long)]
        hub_url: Option<String>,
        #[arg(long)]
        web_url: Option<String>,
    },
    /// Serve HTTP and forward requests to Workers
    Web {
        #[arg(long)]
        addr: Option<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Hub { .. } => "hub",
            Commands::Worker { .. } => "worker",
            Commands::Pool { .. } => "pool",
            Commands::Web { .. } => "web",
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    match config::write_default_if_missing(&config_path) {
        Ok(true) if !cli.quiet => println!("  Wrote default config to {}", config_path.display().to_string().bold()),
        Ok(_) => {}
        Err(e) => eprintln!("{}: {}", "Config warning".yellow(), e),
    }
    let mut cfg = match config::load_or_default(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = &cli.log_level {
        cfg.log_level = level.clone();
    }

    let role = cli.command.name();
    let _tracing = init_tracing(&format!("switchboard-{role}"), &cfg.log_level);

    if !cli.quiet {
        print_banner(role);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        let _ = shutdown_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Runtime error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, cfg, &config_path, shutdown_rx)) {
        Ok(()) => {
            info!(role, "stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(role, error = %e, "exiting");
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn listen_addr(addr: &str) -> Result<SocketAddr, BridgeError> {
    addr.parse()
        .map_err(|e| BridgeError::Connection(format!("invalid listen address {addr:?}: {e}")))
}

async fn run(
    cli: Cli,
    cfg: config::Config,
    config_path: &Path,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BridgeError> {
    match cli.command {
        Commands::Hub { addr, self_id } => {
            let addr = listen_addr(addr.as_deref().unwrap_or(&cfg.hub_addr))?;
            let (gateway, handle) = ChannelGateway::new(json!({"id": self_id, "username": "switchboard"}));
            let hub = Hub::new(Arc::new(gateway), console::console_proxy()?);
            let bound = hub.bind(addr).await?;
            println!(
                "  Hub listening on {}; type messages or JSON events below.\n",
                bound.local_addr()?.to_string().bold()
            );
            tokio::spawn(console::feed_stdin(handle));
            bound.run_until(shutdown_signal(shutdown)).await
        }

        Commands::Worker { hub_url, web_url, no_web } => {
            let mut worker_cfg = cfg.worker_config();
            if let Some(url) = hub_url {
                worker_cfg.hub_url = url;
            }
            let worker = Worker::new(worker_cfg);
            worker.add_cog(builtin::Core)?;

            let web_url = web_url.unwrap_or(cfg.web_url);
            if no_web || web_url.is_empty() {
                return worker.run_until(shutdown_signal(shutdown)).await;
            }
            let bridge = WebBridge::new(worker.clone(), web_url);
            tokio::try_join!(
                worker.run_until(shutdown_signal(shutdown.clone())),
                bridge.run_until(shutdown_signal(shutdown)),
            )
            .map(|_| ())
        }

        Commands::Pool { size, hub_url, web_url } => {
            let size = size.unwrap_or(cfg.worker_pool_size);
            run_pool(size, config_path, hub_url, web_url, shutdown).await
        }

        Commands::Web { addr } => {
            let addr = listen_addr(addr.as_deref().unwrap_or(&cfg.web_addr))?;
            let bound = WebServer::new().bind(addr).await?;
            println!("  Web front-end listening on {}\n", bound.local_addr()?.to_string().bold());
            bound.run_until(shutdown_signal(shutdown)).await
        }
    }
}

/// Spawn `size` copies of this binary running `worker`. Children are killed
/// when the pool stops.
async fn run_pool(
    size: usize,
    config_path: &Path,
    hub_url: Option<String>,
    web_url: Option<String>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BridgeError> {
    let exe = std::env::current_exe()
        .map_err(|e| BridgeError::Connection(format!("cannot locate own executable: {e}")))?;

    let mut children = JoinSet::new();
    for n in 0..size {
        let mut command = tokio::process::Command::new(&exe);
        command.arg("--quiet").arg("--config").arg(config_path).arg("worker");
        if let Some(url) = &hub_url {
            command.arg("--hub-url").arg(url);
        }
        if let Some(url) = &web_url {
            command.arg("--web-url").arg(url);
        }
        command.kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| BridgeError::Connection(format!("cannot start worker {n}: {e}")))?;
        info!(worker = n, pid = ?child.id(), "worker process started");
        children.spawn(async move { (n, child.wait().await) });
    }
    println!("  Pool of {} worker process(es) running.\n", size.to_string().bold());

    tokio::select! {
        _ = shutdown_signal(shutdown) => {
            info!("stopping worker pool");
        }
        _ = async {
            while let Some(joined) = children.join_next().await {
                match joined {
                    Ok((n, Ok(status))) => warn!(worker = n, %status, "worker process exited"),
                    Ok((n, Err(e))) => error!(worker = n, error = %e, "cannot wait on worker process"),
                    Err(e) => error!(error = %e, "worker supervisor task failed"),
                }
            }
        } => {
            info!("all worker processes exited");
        }
    }
    Ok(())
}

fn print_banner(role: &str) {
    println!();
    println!("{}", r#"   ____       _ __       __   __                      __"#.bold().cyan());
    println!("{}", r#"  / __/    __(_) /_____ / /  / /  ___  ___ ________  / /"#.bold().cyan());
    println!("{}", r#" _\ \| |/|/ / / __/ __// _ \/ _ \/ _ \/ _ `/ __/ _ \/_/ "#.bold().cyan());
    println!("{}", r#"/___/|__,__/_/\__/\__//_//_/_.__/\___/\_,_/_/  \_,_(_)  "#.bold().cyan());
    println!();
    println!(
        "  {} {}  {}",
        "Switchboard".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed(),
        role.green().bold()
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pool_flags() {
        let cli = Cli::try_parse_from(["switchboard", "--quiet", "pool", "-n", "4", "--hub-url", "ws://h:1"]).unwrap();
        assert!(cli.quiet);
        match cli.command {
            Commands::Pool { size, hub_url, .. } => {
                assert_eq!(size, Some(4));
                assert_eq!(hub_url.as_deref(), Some("ws://h:1"));
            }
            _ => panic!("expected pool"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["switchboard", "worker", "--no-web", "--config", "/tmp/sb.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sb.toml")));
        assert_eq!(cli.command.name(), "worker");
    }

    #[test]
    fn invalid_listen_address_is_reported() {
        assert!(matches!(listen_addr("nope:99"), Err(BridgeError::Connection(_))));
        assert_eq!(listen_addr("127.0.0.1:3000").unwrap().port(), 3000);
    }
}
