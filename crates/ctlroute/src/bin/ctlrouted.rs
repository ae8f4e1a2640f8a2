use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;

use ctlroute::telemetry::init_tracing;
use ctlroute::{
    ControlServer, HandlerRegistry, PowerManager, RouterConfig, RouterService, register_power_handlers,
    register_system_handlers, shutdown_signal,
};

#[derive(Debug, Default)]
struct Args {
    socket: Option<PathBuf>,
    health: Option<SocketAddr>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: ctlrouted [--socket <path>] [--health <addr>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --socket <path>  Control socket path [env: CTLROUTE_SOCKET]");
            eprintln!("  --health <addr>  Serve /health-check on host:port [env: CTLROUTE_HEALTH_ADDR]");
            process::exit(if msg.is_empty() { 0 } else { 2 });
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        tracing::error!("ctlrouted failed: {e:#}");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--socket" => {
                i += 1;
                parsed.socket = Some(PathBuf::from(args.get(i).ok_or("--socket requires a value")?));
            }
            "--health" => {
                i += 1;
                let value = args.get(i).ok_or("--health requires a value")?;
                let addr = value
                    .parse::<SocketAddr>()
                    .map_err(|e| format!("invalid --health address '{value}': {e}"))?;
                parsed.health = Some(addr);
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = RouterConfig::from_env().context("invalid configuration")?;
    if let Some(socket) = args.socket {
        config = config.with_socket_path(socket);
    }
    if let Some(addr) = args.health {
        config = config.with_health_addr(addr);
    }

    let registry = Arc::new(HandlerRegistry::new());
    register_system_handlers(&registry)?;
    let power = Arc::new(PowerManager::default());
    register_power_handlers(&registry, Arc::clone(&power))?;

    let service = Arc::new(RouterService::new(registry));
    tracing::info!(
        version = ctlroute::CTLROUTE_VERSION,
        socket = %config.socket_path.display(),
        max_in_flight = config.max_in_flight,
        "Starting ctlrouted"
    );

    let health = config.health_addr.map(|addr| {
        let service = Arc::clone(&service);
        tokio::spawn(async move { ctlroute::transport::serve(addr, service).await })
    });

    let signal_service = Arc::clone(&service);
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_service.trigger_shutdown();
    });

    let server = ControlServer::new(config, Arc::clone(&service));
    let result = server.serve().await;
    // A bind failure must not leave the health endpoint running.
    service.trigger_shutdown();

    if let Some(health) = health {
        health.await.context("health endpoint task failed")??;
    }
    result?;

    tracing::info!(prevented = power.is_sleep_prevented(), "ctlrouted stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("ctlrouted")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_flags() {
        let parsed = parse_args(&args(&["--socket", "/tmp/c.sock", "--health", "127.0.0.1:9000"])).unwrap();
        assert_eq!(parsed.socket, Some(PathBuf::from("/tmp/c.sock")));
        assert_eq!(parsed.health, Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn no_flags_is_fine() {
        let parsed = parse_args(&args(&[])).unwrap();
        assert!(parsed.socket.is_none());
        assert!(parsed.health.is_none());
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse_args(&args(&["--help"])).unwrap_err(), "");
        assert!(parse_args(&args(&["--socket"])).is_err());
        assert!(parse_args(&args(&["--health", "nowhere"])).is_err());
        assert!(parse_args(&args(&["extra"])).is_err());
    }
}
