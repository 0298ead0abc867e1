//! DNS server subsystem.
//!
//! This module implements a small DNS server using the
//! [hickory-dns](https://crates.io/crates/hickory-server) library.
//! The server listens on a configurable UDP/TCP socket and answers every
//! query from the currently published registry snapshot:
//!
//! * **Known names** get an A (or AAAA) record with a one-second TTL.
//!   Names in the `lb.<tld>` zone of HTTP endpoints resolve to the
//!   load-balancer address, everything else to the target itself.
//! * **Unknown names** get a TXT record explaining that the name is not
//!   resolvable instead of NXDOMAIN, so the reason shows up in `dig`.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA, TXT};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use hickory_server::ServerFuture;
use log::{debug, error, info};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;

use crate::error::Result;
use crate::registry::{Lookup, Registry, RegistryHandle};

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest character-string a TXT record can carry.
const MAX_CHARACTER_STRING: usize = 255;

/// What a name resolves to in one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Address(IpAddr),
    /// Human-readable reason the name does not resolve.
    Text(String),
}

impl Answer {
    /// The record carrying this answer, if it fits `query_type`.
    pub fn to_record(&self, name: Name, query_type: RecordType, ttl: u32) -> Option<Record> {
        let rdata = match self {
            Answer::Address(IpAddr::V4(ip))
                if matches!(query_type, RecordType::A | RecordType::ANY) =>
            {
                RData::A(A(*ip))
            }
            Answer::Address(IpAddr::V6(ip))
                if matches!(query_type, RecordType::AAAA | RecordType::ANY) =>
            {
                RData::AAAA(AAAA(*ip))
            }
            Answer::Address(_) => return None,
            Answer::Text(text) => RData::TXT(TXT::new(character_strings(text))),
        };
        Some(Record::from_rdata(name, ttl, rdata))
    }
}

/// Split `text` into TXT character-strings, never inside a UTF-8 sequence.
fn character_strings(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > MAX_CHARACTER_STRING {
        let mut end = MAX_CHARACTER_STRING;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk.to_string());
        rest = tail;
    }
    chunks.push(rest.to_string());
    chunks
}

/// Resolve `name` (exact match, trailing dot ignored) against `registry`.
pub fn resolve(registry: &Registry, name: &str, load_balancer: IpAddr) -> Answer {
    let name = name.strip_suffix('.').unwrap_or(name);
    match registry.lookup(name) {
        Lookup::Found(resolution) if resolution.via_load_balancer => Answer::Address(load_balancer),
        Lookup::Found(resolution) => Answer::Address(resolution.effective.ip()),
        Lookup::Retired(retired) => Answer::Text(format!(
            "cntdns: container `{}` behind {} is not running",
            retired.container_name, name
        )),
        Lookup::Missing => Answer::Text(format!("cntdns: name {name} is not resolvable")),
    }
}

/// Request handler answering from the published registry.
#[derive(Clone)]
pub struct CntDns {
    registry: RegistryHandle,
    load_balancer: IpAddr,
    ttl: u32,
}

impl CntDns {
    pub fn new(registry: RegistryHandle, load_balancer: IpAddr, ttl: u32) -> Self {
        Self {
            registry,
            load_balancer,
            ttl,
        }
    }
}

#[async_trait]
impl RequestHandler for CntDns {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        // Keep the case the client used.
        let query = request.query().original();
        let qname = query.name().to_string();
        let qtype = query.query_type();

        let answer = {
            let snapshot = self.registry.current();
            resolve(&snapshot, &qname, self.load_balancer)
        };
        debug!("DNS query {} {:?} -> {:?}", qname, qtype, answer);

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_response_code(ResponseCode::NoError);

        let builder = MessageResponseBuilder::from_message_request(request);
        let records: Vec<Record> = answer
            .to_record(query.name().clone(), qtype, self.ttl)
            .into_iter()
            .collect();
        let response = builder.build(
            header,
            records.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );

        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to send DNS response for {}: {}", qname, e);
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

/// DNS listeners bound to one address.
pub struct DnsServer {
    server: ServerFuture<CntDns>,
    local_addr: SocketAddr,
}

impl DnsServer {
    /// Bind UDP and TCP on `bind_addr`.
    ///
    /// With port 0 the TCP listener takes whatever port UDP was given.
    pub async fn bind(bind_addr: SocketAddr, handler: CntDns) -> Result<Self> {
        let mut server = ServerFuture::new(handler);

        let udp = UdpSocket::bind(bind_addr).await?;
        let local_addr = udp.local_addr()?;
        server.register_socket(udp);

        let tcp = TcpListener::bind(local_addr).await?;
        server.register_listener(tcp, TCP_TIMEOUT);

        info!("DNS server listening on {}", local_addr);
        Ok(Self { server, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the listeners fail.
    pub async fn run(mut self) -> Result<()> {
        self.server.block_until_done().await?;
        Ok(())
    }
}
