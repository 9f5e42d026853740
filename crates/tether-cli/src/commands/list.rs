use std::time::Duration;

use anyhow::Result;
use tether_client::list_sessions;

use super::registry;
use crate::config::Config;

pub async fn run(cfg: &Config, json: bool) -> Result<()> {
    let probe_timeout = Duration::from_millis(cfg.reaper.probe_timeout_ms);
    let sessions = list_sessions(registry(cfg).as_ref(), &cfg.socket_dir(), probe_timeout).await?;

    if json {
        let rows: Vec<_> = sessions
            .iter()
            .map(|s| {
                serde_json::json!({
                    "session_id": s.session_id,
                    "scope_key": s.scope_key,
                    "socket_path": s.socket_path,
                    "registered": s.registered,
                    "liveness": s.liveness.to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    println!("{:<20} {:<18} {:<14} {:<12} {}", "SESSION", "SCOPE", "STATE", "REGISTERED", "SOCKET");
    for s in &sessions {
        println!(
            "{:<20} {:<18} {:<14} {:<12} {}",
            s.session_id,
            s.scope_key,
            s.liveness,
            if s.registered { "yes" } else { "no" },
            s.socket_path.display()
        );
    }
    Ok(())
}
