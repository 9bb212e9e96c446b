//! The central reconciliation loop: on each tick, compares the zone's SOA
//! serial and the config file's mtime against the last successful pass,
//! and only recompiles the filter scripts when either has moved forward.

use crate::compiler::{compile_router, render_script};
use crate::zone_reader::ZoneReader;
use bridge_core::config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

pub struct TickState {
    last_serial: Option<u32>,
    last_mtime: Option<SystemTime>,
}

impl TickState {
    pub fn new() -> Self {
        Self {
            last_serial: None,
            last_mtime: None,
        }
    }
}

impl Default for TickState {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one tick: gates on serial/mtime, and if due, reads the zone,
/// compiles every discovered router, and writes its script. Returns
/// whether a compilation actually happened.
pub async fn run_tick(
    state: &mut TickState,
    config: &Config,
    config_path: &Path,
    output_dir: &Path,
) -> bool {
    let mtime = fs::metadata(config_path).and_then(|m| m.modified()).ok();

    let reader = match ZoneReader::new(&config.domain) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "cannot construct zone reader, skipping tick");
            return false;
        }
    };

    let serial = reader.read_soa_serial().await;

    let serial_advanced = match (serial, state.last_serial) {
        (Some(s), Some(last)) => s > last,
        (Some(_), None) => true,
        (None, _) => false,
    };
    let mtime_advanced = match (mtime, state.last_mtime) {
        (Some(m), Some(last)) => m > last,
        (Some(_), None) => true,
        (None, _) => false,
    };

    if !serial_advanced && !mtime_advanced {
        info!("no change in zone serial or config mtime, skipping compile");
        return false;
    }

    let Some(snapshot) = reader.read().await else {
        warn!("zone read failed, will retry next tick");
        return false;
    };

    if snapshot.is_empty() || config.rules.is_empty() {
        info!("zone or rules empty, skipping watermark update");
        return false;
    }

    for (router, types) in &snapshot {
        let public_interfaces = reader
            .read_public_interfaces(router)
            .await
            .unwrap_or_default();

        let lines = match compile_router(router, &config.rules, types, &public_interfaces) {
            Ok(l) => l,
            Err(e) => {
                warn!(router, error = %e, "failed to compile router, skipping");
                continue;
            }
        };

        let script = render_script(&lines);
        if let Err(e) = write_script_atomically(output_dir, router, &script) {
            warn!(router, error = %e, "failed to write filter script");
            continue;
        }
        info!(router, rule_count = lines.len(), "wrote filter script");
    }

    if let Some(s) = serial {
        state.last_serial = Some(s);
    }
    if let Some(m) = mtime {
        state.last_mtime = Some(m);
    }
    true
}

fn write_script_atomically(output_dir: &Path, router: &str, contents: &str) -> std::io::Result<()> {
    fs::create_dir_all(output_dir)?;
    let final_path: PathBuf = output_dir.join(format!("iptables_{router}.sh"));
    let tmp_path = output_dir.join(format!(".iptables_{router}.sh.tmp"));
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_script_with_shebang() {
        let dir = tempdir().unwrap();
        write_script_atomically(dir.path(), "rtr1", "#!/bin/sh\niptables -t filter -A FORWARD -j DROP\n")
            .unwrap();
        let content = fs::read_to_string(dir.path().join("iptables_rtr1.sh")).unwrap();
        assert!(content.starts_with("#!/bin/sh\n"));
    }
}
