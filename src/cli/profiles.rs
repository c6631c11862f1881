//! Profiles command - list configured profiles.

use anyhow::Result;
use std::path::Path;

use crate::config;
use crate::logging;
use crate::sandbox::ProfileRegistry;

pub async fn cmd_profiles(config_path: Option<&Path>) -> Result<()> {
    logging::init_simple_logging();
    let cfg = config::load_config(config_path)?;

    let registry = ProfileRegistry::from_profiles(cfg.profiles.iter().cloned());
    if registry.is_empty() {
        println!(
            "No profiles configured. Add some to {}",
            config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(config::config_path)
                .display()
        );
        return Ok(());
    }

    for profile in registry.iter() {
        let mut flags = Vec::new();
        if profile.read_only {
            flags.push("read-only");
        }
        if !profile.network_disabled {
            flags.push("network");
        }
        println!(
            "{:<16} {:<32} user={} {}",
            profile.name,
            profile.docker_image,
            profile.user.as_deref().unwrap_or(&cfg.sandbox.default_user),
            flags.join(",")
        );
    }
    Ok(())
}
