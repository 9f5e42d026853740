use std::time::Duration;

use anyhow::Result;
use tether_client::{Reaper, ReaperConfig};

use super::registry;
use crate::config::Config;

pub async fn run(cfg: &Config, watch: bool) -> Result<()> {
    let reaper = Reaper::new(
        ReaperConfig {
            interval: Duration::from_secs(cfg.reaper.interval_secs.max(1)),
            probe_timeout: Duration::from_millis(cfg.reaper.probe_timeout_ms),
            grace: Duration::from_secs(cfg.reaper.grace_secs),
            marker_stale_after: Duration::from_secs(cfg.reaper.marker_stale_secs),
            ..ReaperConfig::new(cfg.socket_dir())
        },
        registry(cfg),
    );

    if watch {
        reaper
            .run(async {
                tokio::signal::ctrl_c().await.ok();
            })
            .await;
        return Ok(());
    }

    let report = reaper.run_once().await?;
    for path in &report.purged {
        println!("purged {}", path.display());
    }
    println!(
        "examined {}, purged {}, alive {}, unresponsive {}, creating {}",
        report.examined,
        report.purged.len(),
        report.alive,
        report.unresponsive,
        report.skipped_in_flight
    );
    Ok(())
}
