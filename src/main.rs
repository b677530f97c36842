//! Agent entry point: port selection, token minting, lockfile, bootstrap
//!
//! Exit codes: 0 on normal shutdown, 97 when the preferred port is busy in
//! strict mode, 1 on startup configuration errors.

use anyhow::Context;
use log::{info, warn};
use plc_logger_agent::catalog::app_folder;
use plc_logger_agent::middleware::auth::generate_token;
use plc_logger_agent::Agent;
use std::net::TcpListener;
use std::path::PathBuf;

const EXIT_PORT_BUSY: i32 = 97;

/// Try the preferred port; in strict mode a busy port is fatal, otherwise
/// fall back to an ephemeral one
fn choose_port(host: &str, preferred: u16) -> u16 {
    let strict = std::env::var("AGENT_STRICT_PORT")
        .map(|v| !matches!(v.as_str(), "" | "0" | "false" | "False"))
        .unwrap_or(false);
    match TcpListener::bind((host, preferred)) {
        Ok(_listener) => preferred,
        Err(_) if strict => {
            eprintln!("Port {} busy and strict mode enabled", preferred);
            std::process::exit(EXIT_PORT_BUSY);
        }
        Err(_) => TcpListener::bind((host, 0))
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap_or(preferred),
    }
}

/// Write `agent.lock.json` so the UI can discover the port and token.
/// Prefers the service path, falls back to the per-user path, then CWD.
fn write_lockfile(port: u16, token: &str) {
    let payload = serde_json::json!({
        "pid": std::process::id(),
        "port": port,
        "token": token,
    })
    .to_string();

    let mut wrote_any = false;
    let service_path = app_folder().join("agent.lock.json");
    match std::fs::write(&service_path, &payload) {
        Ok(()) => {
            info!("lockfile: {}", service_path.display());
            wrote_any = true;
        }
        Err(e) => warn!("lockfile write failed ({}): {}", service_path.display(), e),
    }
    if let Ok(base) = std::env::var("LOCALAPPDATA") {
        let folder = PathBuf::from(base).join("PLCLogger").join("agent");
        if std::fs::create_dir_all(&folder).is_ok() {
            let path = folder.join("agent.lock.json");
            if std::fs::write(&path, &payload).is_ok() {
                info!("lockfile (LocalAppData): {}", path.display());
                wrote_any = true;
            }
        }
    }
    if !wrote_any {
        let path = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("agent.dev.lock.json");
        if std::fs::write(&path, &payload).is_ok() {
            info!("lockfile (cwd): {}", path.display());
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    info!("Starting PLC Logger Agent {}", env!("CARGO_PKG_VERSION"));

    let host = std::env::var("AGENT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let preferred: u16 = std::env::var("AGENT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5175);
    let port = choose_port(&host, preferred);

    let token = std::env::var("AGENT_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(generate_token);
    write_lockfile(port, &token);

    let _agent = Agent::bootstrap(port, token).context("agent bootstrap failed")?;
    info!("agent ready on {}:{}", host, port);

    // The HTTP transport is hosted outside this crate; the binary parks
    // while the supervisor, sampler, rollup and job workers run. The
    // service wrapper terminates the process to stop the agent.
    loop {
        std::thread::park();
    }
}
