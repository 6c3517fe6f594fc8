use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub traffic: TrafficConfig,
}

/// The `traffic` block: where the control plane lives and which DNS zones we
/// answer for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Control-plane endpoints. The `grpc://` scheme is mandatory and is
    /// stripped before dialing. Only the first endpoint is dialed; the rest
    /// are accepted as idle spares.
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<String>,

    /// Node id sent to the control plane with every DiscoveryRequest.
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Management cluster: the cluster whose endpoints are the control-plane
    /// servers themselves, surfaced via `_grpclb._tcp` SRV queries.
    #[serde(default = "default_management_cluster")]
    pub cluster: String,

    /// Fully-qualified zone suffixes we are authoritative for,
    /// e.g. `lb.example.org.`. Cluster names appear as labels in front of
    /// one of these.
    #[serde(default)]
    pub origins: Vec<String>,

    /// Disable the HEALTHY filter for A/AAAA/SRV answers. TXT answers always
    /// include unhealthy endpoints.
    #[serde(default)]
    pub ignore_health: bool,

    /// Locality preference list, one entry per locality as
    /// `region[,zone[,subzone]]`. Parsed and carried as metadata; selection
    /// does not consult it.
    #[serde(default)]
    pub localities: Vec<String>,

    /// TLS material for dialing the control plane. Absent means plaintext.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            upstreams: default_upstreams(),
            id: default_node_id(),
            cluster: default_management_cluster(),
            origins: Vec::new(),
            ignore_health: false,
            localities: Vec::new(),
            tls: None,
        }
    }
}

fn default_upstreams() -> Vec<String> {
    vec!["grpc://127.0.0.1:18000".to_string()]
}

fn default_node_id() -> String {
    "steerd".to_string()
}

fn default_management_cluster() -> String {
    "xds".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert: Option<PathBuf>,

    #[serde(default)]
    pub key: Option<PathBuf>,

    #[serde(default)]
    pub ca: Option<PathBuf>,

    /// Override the SNI name used when dialing.
    #[serde(default)]
    pub servername: Option<String>,
}

/// A locality tag: region is mandatory, zone and sub-zone are optional but
/// must be non-empty when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locality {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

impl Locality {
    /// Parse `region[,zone[,subzone]]`. Empty tokens are rejected.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(format!("invalid locality {:?}", s));
        }
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(format!("empty token in locality {:?}", s));
        }
        Ok(Self {
            region: parts[0].trim().to_string(),
            zone: parts.get(1).map(|z| z.trim().to_string()).unwrap_or_default(),
            sub_zone: parts.get(2).map(|z| z.trim().to_string()).unwrap_or_default(),
        })
    }
}
