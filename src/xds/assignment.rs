use envoy_types::pb::envoy::config::core::v3::{address, socket_address, HealthStatus, Locality};
use envoy_types::pb::envoy::config::endpoint::v3::{lb_endpoint, ClusterLoadAssignment, LbEndpoint};
use rand::Rng;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

/// A selectable backend: one endpoint of a cluster, flattened out of its
/// locality group.
#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub addr: IpAddr,
    pub port: u16,
    pub health: HealthStatus,
    pub weight: u32,
    pub locality: Option<Locality>,
}

impl Backend {
    pub fn is_healthy(&self) -> bool {
        self.health == HealthStatus::Healthy
    }

    /// The control plane's name for the health state, e.g. `HEALTHY`.
    pub fn health_name(&self) -> &'static str {
        self.health.as_str_name()
    }
}

/// One snapshot of the cluster map. A cluster key with a `None` value means
/// "cluster delivered by CDS, endpoints not yet delivered by EDS".
///
/// Snapshots are replaced wholesale when a new CDS response arrives, so a
/// cluster absent from the latest response stops being selectable without
/// tearing concurrent readers. Individual load assignments are replaced
/// in-place as EDS responses come in; published assignments themselves are
/// immutable and shared by `Arc`.
pub struct AssignmentSet {
    cla: RwLock<HashMap<String, Option<Arc<ClusterLoadAssignment>>>>,
}

impl Default for AssignmentSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AssignmentSet {
    pub fn new() -> Self {
        Self {
            cla: RwLock::new(HashMap::new()),
        }
    }

    /// Set the load assignment for a cluster.
    ///
    /// A `None` assignment only ever creates the cluster entry: if the
    /// cluster already holds endpoints, `None` means "still exists" and the
    /// endpoints are kept.
    pub fn put(&self, cluster: &str, cla: Option<ClusterLoadAssignment>) {
        let mut map = self.cla.write().expect("assignment lock poisoned");
        match map.get(cluster) {
            None => {
                map.insert(cluster.to_string(), cla.map(Arc::new));
            }
            Some(_) => {
                if let Some(cla) = cla {
                    map.insert(cluster.to_string(), Some(Arc::new(cla)));
                }
            }
        }
    }

    pub fn contains(&self, cluster: &str) -> bool {
        self.cla
            .read()
            .expect("assignment lock poisoned")
            .contains_key(cluster)
    }

    /// The current load assignment for a cluster. Outer `None` means the
    /// cluster is unknown; inner `None` means known but without endpoints.
    pub fn get(&self, cluster: &str) -> Option<Option<Arc<ClusterLoadAssignment>>> {
        self.cla
            .read()
            .expect("assignment lock poisoned")
            .get(cluster)
            .cloned()
    }

    /// Names of all currently known clusters.
    pub fn clusters(&self) -> Vec<String> {
        self.cla
            .read()
            .expect("assignment lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cla.read().expect("assignment lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick one endpoint of `cluster` by weighted random selection.
    ///
    /// The returned flag tells whether the cluster is known at all; a known
    /// cluster without a selectable endpoint yields `(None, true)`. When
    /// every candidate has zero (or absent) weight the draw degrades to
    /// equal random over the candidates.
    pub fn select(&self, cluster: &str, healthy: bool) -> (Option<Backend>, bool) {
        let backends = match self.get(cluster) {
            None => return (None, false),
            Some(cla) => candidates(cla.as_deref(), healthy),
        };
        if backends.is_empty() {
            return (None, true);
        }

        let total: u64 = backends.iter().map(|b| b.weight as u64).sum();
        let mut rng = rand::thread_rng();

        if total == 0 {
            let r = rng.gen_range(0..backends.len());
            return (Some(backends[r].clone()), true);
        }

        let mut r = rng.gen_range(1..=total) as i64;
        for backend in &backends {
            r -= backend.weight as i64;
            if r <= 0 {
                return (Some(backend.clone()), true);
            }
        }
        // Unreachable for a correct prefix walk; keep the draw total anyway.
        (backends.last().cloned(), true)
    }

    /// All endpoints of `cluster` passing the health filter, in encounter
    /// order. This order is what numbers `endpoint-N` names, so it must be
    /// stable for a given snapshot.
    pub fn all(&self, cluster: &str, healthy: bool) -> (Vec<Backend>, bool) {
        match self.get(cluster) {
            None => (Vec::new(), false),
            Some(cla) => {
                let backends = candidates(cla.as_deref(), healthy);
                for backend in &backends {
                    if backend.weight > u16::MAX as u32 {
                        tracing::warn!(
                            "cluster {:?} endpoint weight {} exceeds {}, truncated in SRV responses",
                            cluster,
                            backend.weight,
                            u16::MAX
                        );
                    }
                }
                (backends, true)
            }
        }
    }
}

/// Flatten a load assignment into backends, applying the health filter.
/// Iteration order is the delivery order of the locality groups and of the
/// endpoints within each group.
fn candidates(cla: Option<&ClusterLoadAssignment>, healthy: bool) -> Vec<Backend> {
    let Some(cla) = cla else {
        return Vec::new();
    };
    let mut backends = Vec::new();
    for group in &cla.endpoints {
        for lb in &group.lb_endpoints {
            if healthy && lb.health_status() != HealthStatus::Healthy {
                continue;
            }
            if let Some(backend) = backend_of(lb, group.locality.clone()) {
                backends.push(backend);
            }
        }
    }
    backends
}

/// Extract address, port, health and weight from an LbEndpoint. Endpoints
/// without a plain socket address (pipes, named ports, unparsable IPs) are
/// not selectable.
fn backend_of(lb: &LbEndpoint, locality: Option<Locality>) -> Option<Backend> {
    let endpoint = match lb.host_identifier.as_ref()? {
        lb_endpoint::HostIdentifier::Endpoint(endpoint) => endpoint,
        _ => return None,
    };
    let socket = match endpoint.address.as_ref()?.address.as_ref()? {
        address::Address::SocketAddress(socket) => socket,
        _ => return None,
    };
    let addr: IpAddr = socket.address.parse().ok()?;
    let port = match socket.port_specifier.as_ref()? {
        socket_address::PortSpecifier::PortValue(port) => *port,
        _ => return None,
    };

    Some(Backend {
        addr,
        port: port as u16,
        health: lb.health_status(),
        weight: lb.load_balancing_weight.as_ref().map(|w| w.value).unwrap_or(0),
        locality,
    })
}
