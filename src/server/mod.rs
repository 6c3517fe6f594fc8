mod admin;
pub mod bootstrap;
pub mod runtime;

use crate::dns::Traffic;
use crate::metrics::Metrics;
use crate::xds::XdsClient;
use anyhow::Result;
use hickory_proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::Name;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use hickory_server::ServerFuture;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Idle timeout for DNS-over-TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state handed to the admin server. Cheaply cloneable.
#[derive(Clone)]
pub struct DirectorState {
    pub metrics: Metrics,
    pub client: Arc<XdsClient>,
}

/// Adapter between the hosting DNS server and the traffic handler. The
/// handler itself is transport-agnostic; this glue mirrors the question,
/// sets the authoritative bit, and never surfaces an error to the server.
/// Write failures are the transport's to log.
pub struct DnsService {
    handler: Arc<Traffic>,
}

impl DnsService {
    pub fn new(handler: Arc<Traffic>) -> Self {
        Self { handler }
    }

    async fn refuse<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        code: ResponseCode,
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.error_msg(request.header(), code);
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                debug!("dns: failed to write response: {}", e);
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(code);
                ResponseInfo::from(header)
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsService {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        if request.message_type() != MessageType::Query || request.op_code() != OpCode::Query {
            return self.refuse(request, response_handle, ResponseCode::Refused).await;
        }

        let qname = Name::from(request.query().name().clone());
        let qtype = request.query().query_type();

        metrics::counter!(
            "traffic_dns_requests_total",
            "qtype" => qtype.to_string(),
        )
        .increment(1);

        // Outside every configured origin there is nothing to be
        // authoritative for.
        let Some(answer) = self.handler.resolve(&qname, qtype) else {
            return self.refuse(request, response_handle, ResponseCode::Refused).await;
        };

        metrics::counter!(
            "traffic_dns_responses_total",
            "rcode" => answer.rcode.to_string(),
        )
        .increment(1);

        let builder = MessageResponseBuilder::from_message_request(request);
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_response_code(answer.rcode);

        let response = builder.build(
            header,
            answer.answers.iter(),
            std::iter::empty(),
            answer.authority.iter(),
            answer.additionals.iter(),
        );

        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                debug!("dns: failed to write response: {}", e);
                ResponseInfo::from(header)
            }
        }
    }
}

/// Run the DNS server on UDP and TCP until shutdown is signalled.
pub async fn run_dns_server(
    listen: &str,
    handler: Arc<Traffic>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let udp = UdpSocket::bind(addr).await?;
    let tcp = TcpListener::bind(addr).await?;
    info!("server: dns listening, addr={}", addr);

    let mut server = ServerFuture::new(DnsService::new(handler));
    server.register_socket(udp);
    server.register_listener(tcp, TCP_TIMEOUT);

    tokio::select! {
        result = server.block_until_done() => {
            result?;
            Ok(())
        }
        _ = shutdown.cancelled() => {
            info!("server: dns shutting down");
            server.shutdown_gracefully().await?;
            Ok(())
        }
    }
}

/// Run a simple admin server for health/readiness checks and metrics.
pub async fn run_admin_server(listen: &str, state: DirectorState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: hyper::Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
