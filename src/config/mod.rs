pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used, allowing the daemon to start with zero configuration for
    /// local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            Config::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!("loaded traffic director configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STEERD_UPSTREAMS") {
            self.traffic.upstreams = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("STEERD_NODE_ID") {
            self.traffic.id = v;
        }
        if let Ok(v) = std::env::var("STEERD_MANAGEMENT_CLUSTER") {
            self.traffic.cluster = v;
        }
        if let Ok(v) = std::env::var("STEERD_ORIGINS") {
            self.traffic.origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("STEERD_IGNORE_HEALTH") {
            self.traffic.ignore_health = v == "true" || v == "1";
        }
    }

    /// Synchronous validation. Any failure here is fatal at startup; every
    /// later error is contained and logged instead.
    pub fn validate(&self) -> Result<()> {
        let t = &self.traffic;

        if t.upstreams.is_empty() {
            anyhow::bail!("traffic: at least one grpc:// upstream is required");
        }
        for upstream in &t.upstreams {
            let Some(hostport) = upstream.strip_prefix("grpc://") else {
                anyhow::bail!("traffic: upstream {:?} must use the grpc:// scheme", upstream);
            };
            if hostport.is_empty() {
                anyhow::bail!("traffic: upstream {:?} has no host", upstream);
            }
        }

        if t.id.is_empty() {
            anyhow::bail!("traffic: node id cannot be empty");
        }
        if t.cluster.is_empty() {
            anyhow::bail!("traffic: management cluster name cannot be empty");
        }

        for origin in &t.origins {
            if origin.is_empty() {
                anyhow::bail!("traffic: origin cannot be empty");
            }
        }

        for locality in &t.localities {
            Locality::parse(locality).map_err(|e| anyhow::anyhow!("traffic: {}", e))?;
        }

        if let Some(ref tls) = t.tls {
            if tls.key.is_some() && tls.cert.is_none() {
                anyhow::bail!("traffic: tls key given without a certificate");
            }
        }

        Ok(())
    }

    /// The parsed locality preference list. Only valid after `validate()`.
    pub fn localities(&self) -> Vec<Locality> {
        self.traffic
            .localities
            .iter()
            .filter_map(|s| Locality::parse(s).ok())
            .collect()
    }
}
