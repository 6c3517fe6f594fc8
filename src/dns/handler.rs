use crate::config::TrafficConfig;
use crate::xds::{Backend, XdsClient};
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, AAAA, SOA, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// TTL for every synthesized record.
const TTL: u32 = 5;

/// Fixed priority/weight advertised in SRV and TXT answers.
const SRV_PRIORITY: u16 = 100;
const SRV_WEIGHT: u16 = 100;

/// The sections of a synthesized response. The server glue mirrors the
/// question and sets the authoritative bit; everything else lives here.
#[derive(Debug)]
pub struct Answer {
    pub rcode: ResponseCode,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Answer {
    fn empty(rcode: ResponseCode) -> Self {
        Self {
            rcode,
            answers: Vec::new(),
            authority: Vec::new(),
            additionals: Vec::new(),
        }
    }
}

/// DNS-facing side of the traffic director: maps questions inside the
/// configured origin zones onto selections against the assignment cache and
/// synthesizes the response sections.
pub struct Traffic {
    client: Arc<XdsClient>,
    origins: Vec<Name>,
    management_cluster: String,
    ignore_health: bool,
}

impl Traffic {
    pub fn new(client: Arc<XdsClient>, cfg: &TrafficConfig) -> Result<Self, anyhow::Error> {
        let origins = cfg
            .origins
            .iter()
            .map(|o| {
                let mut name =
                    Name::from_ascii(o).map_err(|e| anyhow::anyhow!("origin {:?}: {}", o, e))?;
                name.set_fqdn(true);
                Ok(name)
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()?;

        Ok(Self {
            client,
            origins,
            management_cluster: cfg.cluster.clone(),
            ignore_health: cfg.ignore_health,
        })
    }

    /// Answer a question, or `None` when no configured origin is a suffix of
    /// the query name (the caller decides what non-authoritative means).
    pub fn resolve(&self, qname: &Name, qtype: RecordType) -> Option<Answer> {
        let origin = self
            .origins
            .iter()
            .filter(|o| o.zone_of(qname))
            .max_by_key(|o| o.num_labels())?;

        let labels = subzone_labels(qname, origin);
        let cluster = labels.join(".");

        // TXT answers are informational and always include unhealthy
        // endpoints; everything else filters unless configured not to.
        let healthy = qtype != RecordType::TXT && !self.ignore_health;

        let (backend, known) = self.client.select(&cluster, healthy);
        if !known {
            return Some(self.resolve_indirect(qname, origin, &labels, qtype, healthy));
        }

        debug!("traffic: cluster {:?} matched for {}", cluster, qname);

        Some(match qtype {
            RecordType::A | RecordType::AAAA => match backend {
                Some(backend) => self.address_answer(qname, origin, qtype, &backend),
                None => self.no_data(origin),
            },
            RecordType::SRV => self.srv_answer(qname, origin, &cluster, healthy),
            RecordType::TXT => self.txt_answer(qname, origin, &cluster),
            _ => self.no_data(origin),
        })
    }

    /// The cluster label path did not name a cluster directly: it may still
    /// be an `endpoint-N` name or a `_grpclb._tcp` / `_tcp` service
    /// question.
    fn resolve_indirect(
        &self,
        qname: &Name,
        origin: &Name,
        labels: &[String],
        qtype: RecordType,
        healthy: bool,
    ) -> Answer {
        if labels.len() == 2 {
            if let Some(index) = endpoint_index(&labels[0]) {
                let cluster = labels[1].as_str();
                let (_, known) = self.client.select(cluster, healthy);
                if !known {
                    return self.nxdomain(origin);
                }
                return self.endpoint_answer(qname, origin, cluster, index, qtype, healthy);
            }
        }

        if matches!(labels.first().map(String::as_str), Some("_grpclb") | Some("_tcp")) {
            let mut rest = &labels[1..];
            while matches!(rest.first().map(String::as_str), Some("_grpclb") | Some("_tcp")) {
                rest = &rest[1..];
            }
            let cluster = rest.join(".");
            let (_, known) = self.client.select(&cluster, healthy);
            if !known {
                return self.nxdomain(origin);
            }
            return self.management_answer(qname, origin, qtype, healthy);
        }

        self.nxdomain(origin)
    }

    // ---- Per-QType synthesis ----

    /// A or AAAA answer for one endpoint. A v6 address under an A question
    /// (and vice versa) is NODATA, not an error.
    fn address_answer(&self, qname: &Name, origin: &Name, qtype: RecordType, backend: &Backend) -> Answer {
        let record = address_record(qname.clone(), backend.addr);
        if record.record_type() != qtype {
            return self.no_data(origin);
        }
        Answer {
            rcode: ResponseCode::NoError,
            answers: vec![record],
            authority: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// One SRV per endpoint, targets pointing at the `endpoint-N` names, and
    /// matching address records in the additional section. All endpoints are
    /// read in one pass so the targets and the additionals agree on one
    /// snapshot.
    fn srv_answer(&self, qname: &Name, origin: &Name, cluster: &str, healthy: bool) -> Answer {
        let (backends, _) = self.client.all(cluster, healthy);
        if backends.is_empty() {
            return self.no_data(origin);
        }

        let mut answer = Answer::empty(ResponseCode::NoError);
        for (i, backend) in backends.iter().enumerate() {
            let Some(target) = endpoint_name(i, cluster, origin) else {
                continue;
            };
            answer.answers.push(Record::from_rdata(
                qname.clone(),
                TTL,
                RData::SRV(SRV::new(SRV_PRIORITY, SRV_WEIGHT, backend.port, target.clone())),
            ));
            answer.additionals.push(address_record(target, backend.addr));
        }
        answer
    }

    /// Informational TXT answer: one record per endpoint, health filter off,
    /// with the health state spelled out. The additional section carries the
    /// endpoint addresses as TXT under the target names.
    fn txt_answer(&self, qname: &Name, origin: &Name, cluster: &str) -> Answer {
        let (backends, _) = self.client.all(cluster, false);
        if backends.is_empty() {
            return self.no_data(origin);
        }

        let mut answer = Answer::empty(ResponseCode::NoError);
        for (i, backend) in backends.iter().enumerate() {
            let Some(target) = endpoint_name(i, cluster, origin) else {
                continue;
            };
            answer.answers.push(Record::from_rdata(
                qname.clone(),
                TTL,
                RData::TXT(TXT::new(vec![
                    SRV_PRIORITY.to_string(),
                    SRV_WEIGHT.to_string(),
                    backend.port.to_string(),
                    target.to_string(),
                    backend.health_name().to_string(),
                ])),
            ));
            answer.additionals.push(Record::from_rdata(
                target,
                TTL,
                RData::TXT(TXT::new(vec![backend.addr.to_string()])),
            ));
        }
        answer
    }

    /// `endpoint-N.<cluster>` question: address of the N-th endpoint in
    /// enumeration order, NXDOMAIN when the index is out of range.
    fn endpoint_answer(
        &self,
        qname: &Name,
        origin: &Name,
        cluster: &str,
        index: usize,
        qtype: RecordType,
        healthy: bool,
    ) -> Answer {
        let (backends, _) = self.client.all(cluster, healthy);
        let Some(backend) = backends.get(index) else {
            return self.nxdomain(origin);
        };
        match qtype {
            RecordType::A | RecordType::AAAA => self.address_answer(qname, origin, qtype, backend),
            _ => self.no_data(origin),
        }
    }

    /// `_grpclb._tcp.<cluster>` SRV: advertise the management cluster's
    /// endpoints so gRPC clients can bootstrap to the control plane itself.
    fn management_answer(&self, qname: &Name, origin: &Name, qtype: RecordType, healthy: bool) -> Answer {
        if qtype != RecordType::SRV {
            return self.no_data(origin);
        }

        let (backends, _) = self.client.all(&self.management_cluster, healthy);
        if backends.is_empty() {
            return self.no_data(origin);
        }

        let mut answer = Answer::empty(ResponseCode::NoError);
        for (i, backend) in backends.iter().enumerate() {
            let Some(target) = endpoint_name(i, &self.management_cluster, origin) else {
                continue;
            };
            answer.answers.push(Record::from_rdata(
                qname.clone(),
                TTL,
                RData::SRV(SRV::new(SRV_PRIORITY, SRV_WEIGHT, backend.port, target.clone())),
            ));
            answer.additionals.push(address_record(target, backend.addr));
        }
        answer
    }

    // ---- Negative answers ----

    fn nxdomain(&self, origin: &Name) -> Answer {
        Answer {
            rcode: ResponseCode::NXDomain,
            answers: Vec::new(),
            authority: self.soa(origin).into_iter().collect(),
            additionals: Vec::new(),
        }
    }

    fn no_data(&self, origin: &Name) -> Answer {
        Answer {
            rcode: ResponseCode::NoError,
            answers: Vec::new(),
            authority: self.soa(origin).into_iter().collect(),
            additionals: Vec::new(),
        }
    }

    /// Synthesized SOA for the origin; the serial is the current unix time
    /// so secondaries always see it move.
    fn soa(&self, origin: &Name) -> Option<Record> {
        let mname = Name::from_ascii(format!("ns.{}", origin)).ok()?;
        let rname = Name::from_ascii(format!("steerd.{}", origin)).ok()?;
        let serial = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Some(Record::from_rdata(
            origin.clone(),
            TTL,
            RData::SOA(SOA::new(mname, rname, serial, 14400, 3600, 604800, 5)),
        ))
    }
}

/// Labels of `qname` in front of `origin`, lowercased, left to right.
fn subzone_labels(qname: &Name, origin: &Name) -> Vec<String> {
    let skip = qname.num_labels().saturating_sub(origin.num_labels()) as usize;
    qname
        .iter()
        .take(skip)
        .map(|label| String::from_utf8_lossy(label).to_ascii_lowercase())
        .collect()
}

/// Parse the `N` out of an `endpoint-N` label, case-insensitively.
fn endpoint_index(label: &str) -> Option<usize> {
    label.strip_prefix("endpoint-")?.parse().ok()
}

/// The `endpoint-N.<cluster>.<origin>` owner name.
fn endpoint_name(index: usize, cluster: &str, origin: &Name) -> Option<Name> {
    Name::from_ascii(format!("endpoint-{}.{}.{}", index, cluster, origin)).ok()
}

/// An A or AAAA record for `addr`, whichever matches the address family.
fn address_record(name: Name, addr: IpAddr) -> Record {
    let rdata = match addr {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    Record::from_rdata(name, TTL, rdata)
}
