pub mod assignment;
pub mod client;

pub use assignment::{AssignmentSet, Backend};
pub use client::XdsClient;

/// Canonical type URL for CDS resources.
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

/// Canonical type URL for EDS resources.
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

#[cfg(test)]
pub(crate) mod testing {
    use envoy_types::pb::envoy::config::core::v3::{
        address, socket_address, Address, HealthStatus, SocketAddress,
    };
    use envoy_types::pb::envoy::config::endpoint::v3::{
        lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
    };
    use envoy_types::pb::google::protobuf::UInt32Value;

    /// Build a ClusterLoadAssignment with one locality group per endpoint,
    /// mirroring the way control planes commonly shape them.
    pub fn load_assignment(
        cluster: &str,
        endpoints: &[(&str, u16, HealthStatus, u32)],
    ) -> ClusterLoadAssignment {
        let groups = endpoints
            .iter()
            .map(|&(addr, port, health, weight)| LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    health_status: health as i32,
                    load_balancing_weight: (weight > 0).then_some(UInt32Value { value: weight }),
                    host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                        address: Some(Address {
                            address: Some(address::Address::SocketAddress(SocketAddress {
                                address: addr.to_string(),
                                port_specifier: Some(socket_address::PortSpecifier::PortValue(
                                    port as u32,
                                )),
                                ..Default::default()
                            })),
                        }),
                        ..Default::default()
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .collect();

        ClusterLoadAssignment {
            cluster_name: cluster.to_string(),
            endpoints: groups,
            ..Default::default()
        }
    }
}
