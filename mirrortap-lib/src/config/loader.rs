use std::fs;
use std::path::Path;

use crate::config::{Config, TunnelType};
use crate::error::{Result, TapError};
use crate::filter::MAX_RULES;

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(&p).map_err(|e| {
        TapError::Config(format!("failed to read config file {}: {e}", p.as_ref().display()))
    })?;
    let cfg: Config = serde_norway::from_str(&txt)
        .map_err(|e| TapError::Config(format!("failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    let rt = &cfg.runtime;

    if rt.input_iface.is_empty() {
        return Err(TapError::Config("runtime.input_iface must not be empty".into()));
    }
    if rt.workers > 128 {
        return Err(TapError::Config(format!(
            "runtime.workers must be 0-128, got {}",
            rt.workers
        )));
    }
    if rt.truncate.enabled {
        if rt.truncate.length == 0 {
            return Err(TapError::Config(
                "runtime.truncate.length is required when truncate.enabled is true".into(),
            ));
        }
        if !(64..=9000).contains(&rt.truncate.length) {
            return Err(TapError::Config(format!(
                "runtime.truncate.length must be 64-9000 when enabled, got {}",
                rt.truncate.length
            )));
        }
    }

    if let Some(filter) = &cfg.filter {
        if filter.rules.len() > MAX_RULES {
            return Err(TapError::Config(format!(
                "filter.rules: too many rules (max {MAX_RULES}, got {})",
                filter.rules.len()
            )));
        }
    }

    if let Some(tunnel) = &cfg.tunnel {
        if tunnel.r#type == TunnelType::Vxlan && tunnel.vni > 0x00FF_FFFF {
            return Err(TapError::Config(format!(
                "tunnel.vni must be 0-16777215, got {}",
                tunnel.vni
            )));
        }
        if rt.output_iface.is_empty() {
            return Err(TapError::Config(
                "runtime.output_iface is required when tunnel is configured".into(),
            ));
        }
        if rt.output_iface == "lo" {
            return Err(TapError::Config(
                "runtime.output_iface cannot be loopback when tunnel is configured; \
                 use an interface that can reach the remote endpoint"
                    .into(),
            ));
        }
    }

    Ok(())
}
