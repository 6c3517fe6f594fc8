use crate::config::TrafficConfig;
use crate::error::DirectorError;
use crate::xds::{AssignmentSet, Backend, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL};
use arc_swap::ArcSwap;
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::{node, Node};
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use prost::Message;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, warn};

/// Fixed pause between stream attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Cadence of the keep-alive CDS request while a stream is up.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Version and nonce bookkeeping, per type URL, plus the synced flag. Updated
/// only by the receive path; the lock is never held across an await.
#[derive(Default)]
struct StreamState {
    version: HashMap<String, String>,
    nonce: HashMap<String, String>,
    synced: bool,
}

/// Client side of the Aggregated Discovery stream.
///
/// Owns one long-lived bidirectional stream to the control plane and runs
/// the CDS→EDS discovery protocol over it. Every CDS response replaces the
/// assignment snapshot wholesale; EDS responses fill in per-cluster load
/// assignments. The snapshot is retained across reconnects so DNS serving
/// continues from stale data while the stream is down.
pub struct XdsClient {
    endpoint: Endpoint,
    /// Upstream address, kept for logging.
    to: String,
    node: Node,
    assignments: ArcSwap<AssignmentSet>,
    state: RwLock<StreamState>,
    cancel: CancellationToken,
}

impl XdsClient {
    /// Build a client for the first configured upstream. Does not dial;
    /// `run` owns all network activity.
    pub fn new(cfg: &TrafficConfig) -> Result<Arc<Self>, DirectorError> {
        let upstream = cfg
            .upstreams
            .first()
            .ok_or_else(|| DirectorError::Config("no upstream configured".to_string()))?;
        let hostport = upstream.strip_prefix("grpc://").ok_or_else(|| {
            DirectorError::Config(format!("upstream {:?} must use the grpc:// scheme", upstream))
        })?;
        if cfg.upstreams.len() > 1 {
            info!(
                "ads: {} upstreams configured, dialing only {:?}",
                cfg.upstreams.len(),
                hostport
            );
        }

        let scheme = if cfg.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, hostport))
            .map_err(|e| DirectorError::Config(format!("upstream {:?}: {}", upstream, e)))?;

        if let Some(ref tls) = cfg.tls {
            let mut tls_config = ClientTlsConfig::new();
            if let Some(ref ca) = tls.ca {
                let pem = std::fs::read(ca)
                    .map_err(|e| DirectorError::Config(format!("tls ca {:?}: {}", ca, e)))?;
                tls_config = tls_config.ca_certificate(Certificate::from_pem(pem));
            }
            if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
                let cert_pem = std::fs::read(cert)
                    .map_err(|e| DirectorError::Config(format!("tls cert {:?}: {}", cert, e)))?;
                let key_pem = std::fs::read(key)
                    .map_err(|e| DirectorError::Config(format!("tls key {:?}: {}", key, e)))?;
                tls_config = tls_config.identity(Identity::from_pem(cert_pem, key_pem));
            }
            if let Some(ref servername) = tls.servername {
                tls_config = tls_config.domain_name(servername.clone());
            }
            endpoint = endpoint.tls_config(tls_config).map_err(DirectorError::Transport)?;
        }

        let node = Node {
            id: cfg.id.clone(),
            user_agent_name: env!("CARGO_PKG_NAME").to_string(),
            user_agent_version_type: Some(node::UserAgentVersionType::UserAgentVersion(
                env!("CARGO_PKG_VERSION").to_string(),
            )),
            ..Default::default()
        };

        Ok(Arc::new(Self {
            endpoint,
            to: hostport.to_string(),
            node,
            assignments: ArcSwap::from_pointee(AssignmentSet::new()),
            state: RwLock::new(StreamState::default()),
            cancel: CancellationToken::new(),
        }))
    }

    // ---- Contract consumed by the DNS handler ----

    /// Pick one endpoint for the cluster. The flag tells whether the cluster
    /// is known at all.
    pub fn select(&self, cluster: &str, healthy: bool) -> (Option<Backend>, bool) {
        if cluster.is_empty() {
            return (None, false);
        }
        self.assignments.load().select(cluster, healthy)
    }

    /// All endpoints for the cluster in stable encounter order.
    pub fn all(&self, cluster: &str, healthy: bool) -> (Vec<Backend>, bool) {
        if cluster.is_empty() {
            return (Vec::new(), false);
        }
        self.assignments.load().all(cluster, healthy)
    }

    /// True once the first stream was established, independent of whether
    /// any resources have been received yet.
    pub fn has_synced(&self) -> bool {
        self.state.read().expect("state lock poisoned").synced
    }

    /// The current snapshot, for introspection surfaces.
    pub fn assignments(&self) -> Arc<AssignmentSet> {
        self.assignments.load_full()
    }

    /// Stop the client: cancels the run loop and both inner loops.
    /// Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    // ---- Stream lifecycle ----

    /// Drive the discovery stream until `stop` is called. Any stream error
    /// is logged at warning level and retried after a fixed back-off; the
    /// assignment snapshot survives reconnects.
    pub async fn run(self: Arc<Self>) {
        let mut first = true;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.stream_once(&mut first).await {
                Ok(()) => return, // cancelled
                Err(e) => {
                    warn!("ads: stream to {:?} failed: {}, retrying in {:?}", self.to, e, RECONNECT_BACKOFF);
                    metrics::counter!("traffic_ads_reconnects_total").increment(1);
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }

    /// One stream attempt: dial, open the ADS stream, pump responses until
    /// the stream dies or the client is stopped. Returns `Ok(())` only on
    /// cancellation.
    async fn stream_once(self: &Arc<Self>, first: &mut bool) -> Result<(), DirectorError> {
        let channel = self.endpoint.connect().await?;
        let mut ads = AggregatedDiscoveryServiceClient::new(channel);

        let (tx, rx) = mpsc::channel::<DiscoveryRequest>(16);
        let mut responses = ads
            .stream_aggregated_resources(ReceiverStream::new(rx))
            .await?
            .into_inner();

        if *first {
            // Wildcard CDS request creates the stream; updates flow from here.
            let request = self.discovery_request(CLUSTER_TYPE_URL, Vec::new());
            tx.send(request)
                .await
                .map_err(|_| DirectorError::Stream("request channel closed".to_string()))?;
            info!("ads: stream established to {:?}", self.to);
            self.state.write().expect("state lock poisoned").synced = true;
            *first = false;
        }

        let heartbeat = tokio::spawn(self.clone().heartbeat(tx.clone()));

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                message = responses.message() => match message {
                    Ok(Some(response)) => {
                        for request in self.handle_response(response) {
                            if tx.send(request).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        break Err(DirectorError::Stream(
                            "stream closed by control plane".to_string(),
                        ));
                    }
                    Err(status) => break Err(DirectorError::Grpc(status)),
                },
            }
        };

        heartbeat.abort();
        result
    }

    /// Re-send a CDS request with the last-seen version and nonce every tick
    /// so the control plane does not assume we went silent, and so a fresh
    /// stream gets re-delivery without replaying the initial request.
    async fn heartbeat(self: Arc<Self>, tx: mpsc::Sender<DiscoveryRequest>) {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        tick.tick().await; // first tick fires immediately, skip it
        loop {
            tick.tick().await;
            let request = self.discovery_request(CLUSTER_TYPE_URL, Vec::new());
            if tx.send(request).await.is_err() {
                return; // stream gone, owner will reconnect
            }
        }
    }

    // ---- Discovery protocol ----

    /// Build a DiscoveryRequest for `type_url` carrying the stored version
    /// and nonce. Echoing the values of the last response ACKs it.
    fn discovery_request(&self, type_url: &str, resource_names: Vec<String>) -> DiscoveryRequest {
        let state = self.state.read().expect("state lock poisoned");
        DiscoveryRequest {
            node: Some(self.node.clone()),
            type_url: type_url.to_string(),
            resource_names,
            version_info: state.version.get(type_url).cloned().unwrap_or_default(),
            response_nonce: state.nonce.get(type_url).cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    fn record_version(&self, type_url: &str, version: String, nonce: String) {
        let mut state = self.state.write().expect("state lock poisoned");
        state.version.insert(type_url.to_string(), version);
        state.nonce.insert(type_url.to_string(), nonce);
    }

    /// Process one DiscoveryResponse and return the requests it calls for.
    /// Malformed resources are skipped; the response is still ACKed.
    fn handle_response(&self, response: DiscoveryResponse) -> Vec<DiscoveryRequest> {
        match response.type_url.as_str() {
            CLUSTER_TYPE_URL => self.handle_clusters(response),
            ENDPOINT_TYPE_URL => self.handle_endpoints(response),
            other => {
                debug!("ads: ignoring response with type url {:?}", other);
                Vec::new()
            }
        }
    }

    /// CDS: rebuild the snapshot from scratch so clusters absent from this
    /// response stop being selectable, then ACK and kick off EDS for the
    /// delivered clusters.
    fn handle_clusters(&self, response: DiscoveryResponse) -> Vec<DiscoveryRequest> {
        let set = AssignmentSet::new();
        for resource in &response.resources {
            match Cluster::decode(resource.value.as_slice()) {
                Ok(cluster) => set.put(&cluster.name, None),
                Err(e) => debug!("ads: failed to decode cluster resource: {}", e),
            }
        }
        let clusters = set.clusters();

        let version = response.version_info;
        debug!(
            "ads: cluster discovery processed, clusters={}, version={:?}",
            clusters.len(),
            version
        );
        self.record_version(CLUSTER_TYPE_URL, version, response.nonce);
        self.assignments.store(Arc::new(set));
        metrics::gauge!("traffic_clusters_tracked").set(clusters.len() as f64);

        vec![
            self.discovery_request(CLUSTER_TYPE_URL, clusters.clone()),
            self.discovery_request(ENDPOINT_TYPE_URL, clusters),
        ]
    }

    /// EDS: fill in load assignments for clusters CDS already declared.
    /// Assignments for unknown clusters are dropped.
    fn handle_endpoints(&self, response: DiscoveryResponse) -> Vec<DiscoveryRequest> {
        let snapshot = self.assignments.load();
        let mut endpoints = 0usize;
        for resource in &response.resources {
            match ClusterLoadAssignment::decode(resource.value.as_slice()) {
                Ok(cla) => {
                    if !snapshot.contains(&cla.cluster_name) {
                        debug!(
                            "ads: load assignment for unknown cluster {:?}, dropping",
                            cla.cluster_name
                        );
                        continue;
                    }
                    endpoints += cla.endpoints.iter().map(|g| g.lb_endpoints.len()).sum::<usize>();
                    let name = cla.cluster_name.clone();
                    snapshot.put(&name, Some(cla));
                }
                Err(e) => debug!("ads: failed to decode endpoint resource: {}", e),
            }
        }

        self.record_version(ENDPOINT_TYPE_URL, response.version_info, response.nonce);

        debug!("ads: endpoint discovery processed, endpoints={}", endpoints);
        metrics::gauge!("traffic_endpoints_tracked").set(endpoints as f64);

        Vec::new()
    }

    #[cfg(test)]
    pub(crate) fn replace_assignments(&self, set: AssignmentSet) {
        self.assignments.store(Arc::new(set));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrafficConfig;
    use crate::xds::testing::load_assignment;
    use envoy_types::pb::envoy::config::core::v3::HealthStatus;
    use envoy_types::pb::google::protobuf::Any;

    fn test_client() -> Arc<XdsClient> {
        let cfg = TrafficConfig {
            upstreams: vec!["grpc://127.0.0.1:0".to_string()],
            id: "test-id".to_string(),
            ..TrafficConfig::default()
        };
        XdsClient::new(&cfg).unwrap()
    }

    fn cds_response(version: &str, nonce: &str, clusters: &[&str]) -> DiscoveryResponse {
        DiscoveryResponse {
            type_url: CLUSTER_TYPE_URL.to_string(),
            version_info: version.to_string(),
            nonce: nonce.to_string(),
            resources: clusters
                .iter()
                .map(|name| {
                    let cluster = Cluster {
                        name: name.to_string(),
                        ..Default::default()
                    };
                    Any {
                        type_url: CLUSTER_TYPE_URL.to_string(),
                        value: cluster.encode_to_vec(),
                    }
                })
                .collect(),
            ..Default::default()
        }
    }

    fn eds_response(version: &str, nonce: &str, clas: Vec<ClusterLoadAssignment>) -> DiscoveryResponse {
        DiscoveryResponse {
            type_url: ENDPOINT_TYPE_URL.to_string(),
            version_info: version.to_string(),
            nonce: nonce.to_string(),
            resources: clas
                .into_iter()
                .map(|cla| Any {
                    type_url: ENDPOINT_TYPE_URL.to_string(),
                    value: cla.encode_to_vec(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_missing_scheme() {
        let cfg = TrafficConfig {
            upstreams: vec!["127.0.0.1:18000".to_string()],
            ..TrafficConfig::default()
        };
        assert!(XdsClient::new(&cfg).is_err());
    }

    #[test]
    fn test_not_synced_before_stream() {
        let client = test_client();
        assert!(!client.has_synced());
    }

    #[test]
    fn test_cds_acks_and_requests_endpoints() {
        let client = test_client();
        let requests = client.handle_response(cds_response("v1", "n1", &["web", "api"]));

        assert_eq!(requests.len(), 2);

        let ack = &requests[0];
        assert_eq!(ack.type_url, CLUSTER_TYPE_URL);
        assert_eq!(ack.version_info, "v1");
        assert_eq!(ack.response_nonce, "n1");
        let mut names = ack.resource_names.clone();
        names.sort();
        assert_eq!(names, vec!["api".to_string(), "web".to_string()]);
        assert_eq!(ack.node.as_ref().unwrap().id, "test-id");

        // The EDS kick carries EDS bookkeeping, which is still empty.
        let eds = &requests[1];
        assert_eq!(eds.type_url, ENDPOINT_TYPE_URL);
        assert_eq!(eds.version_info, "");
        assert_eq!(eds.response_nonce, "");
        assert_eq!(eds.resource_names.len(), 2);
    }

    #[test]
    fn test_cds_replaces_snapshot() {
        let client = test_client();
        client.handle_response(cds_response("v1", "n1", &["a", "b"]));
        client.handle_response(eds_response(
            "e1",
            "en1",
            vec![load_assignment(
                "a",
                &[("127.0.0.1", 80, HealthStatus::Healthy, 1)],
            )],
        ));

        let (backend, known) = client.select("a", true);
        assert!(known);
        assert!(backend.is_some());

        // Second CDS round no longer advertises "a".
        client.handle_response(cds_response("v2", "n2", &["b"]));

        let (backend, known) = client.select("a", true);
        assert!(backend.is_none());
        assert!(!known);
        let (_, known) = client.select("b", true);
        assert!(known);
    }

    #[test]
    fn test_snapshot_swap_is_atomic() {
        // Readers racing a CDS swap must see either the whole old cluster
        // set or the whole new one, never a mix.
        let client = test_client();
        client.handle_response(cds_response("v0", "n0", &["a1", "a2"]));

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = std::thread::spawn({
            let client = client.clone();
            let stop = stop.clone();
            move || {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let snapshot = client.assignments();
                    assert_eq!(snapshot.contains("a1"), snapshot.contains("a2"));
                    assert_eq!(snapshot.contains("b1"), snapshot.contains("b2"));
                }
            }
        });

        for round in 0..500 {
            let clusters: &[&str] = if round % 2 == 0 {
                &["b1", "b2"]
            } else {
                &["a1", "a2"]
            };
            client.handle_response(cds_response(&format!("v{}", round), "n", clusters));
        }

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        reader.join().unwrap();
    }

    #[test]
    fn test_eds_for_unknown_cluster_is_dropped() {
        let client = test_client();
        client.handle_response(cds_response("v1", "n1", &["web"]));
        let requests = client.handle_response(eds_response(
            "e1",
            "en1",
            vec![load_assignment(
                "rogue",
                &[("127.0.0.1", 80, HealthStatus::Healthy, 1)],
            )],
        ));

        assert!(requests.is_empty());
        let (_, known) = client.select("rogue", true);
        assert!(!known);
    }

    #[test]
    fn test_version_and_nonce_are_kept_per_type_url() {
        let client = test_client();
        client.handle_response(cds_response("v1", "n1", &["web"]));
        client.handle_response(eds_response(
            "e9",
            "en9",
            vec![load_assignment(
                "web",
                &[("127.0.0.1", 80, HealthStatus::Healthy, 1)],
            )],
        ));

        // A fresh CDS heartbeat echoes CDS bookkeeping.
        let request = client.discovery_request(CLUSTER_TYPE_URL, Vec::new());
        assert_eq!(request.version_info, "v1");
        assert_eq!(request.response_nonce, "n1");

        // And a new CDS round requests EDS with EDS bookkeeping.
        let requests = client.handle_response(cds_response("v2", "n2", &["web"]));
        assert_eq!(requests[1].version_info, "e9");
        assert_eq!(requests[1].response_nonce, "en9");
    }

    #[test]
    fn test_unknown_type_url_is_ignored() {
        let client = test_client();
        let response = DiscoveryResponse {
            type_url: "type.googleapis.com/envoy.config.listener.v3.Listener".to_string(),
            ..Default::default()
        };
        assert!(client.handle_response(response).is_empty());
    }

    #[test]
    fn test_malformed_resource_is_skipped() {
        let client = test_client();
        let mut response = cds_response("v1", "n1", &["web"]);
        response.resources.push(Any {
            type_url: CLUSTER_TYPE_URL.to_string(),
            value: vec![0xff, 0xff, 0xff],
        });

        let requests = client.handle_response(response);
        // The valid cluster survives and the response is still ACKed.
        assert_eq!(requests[0].version_info, "v1");
        assert_eq!(requests[0].resource_names, vec!["web".to_string()]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let client = test_client();
        client.stop();
        client.stop();
        assert!(client.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_exits_on_stop() {
        // Nothing listens on port 0, so the loop sits in dial-retry-backoff
        // until it observes cancellation.
        let client = test_client();
        let handle = tokio::spawn(client.clone().run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        client.stop();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not observe stop")
            .unwrap();
    }
}
