// Cluster DNS forwarder run next to dnsmasq on fan bridges
//
// Queries with recursion desired come from the local dnsmasq and are fanned
// out to the forwarders of the other members. Queries without it come from a
// peer forwarder and are answered by the local dnsmasq only, so a lookup never
// bounces between members.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use trust_dns_proto::op::{Message, MessageType, ResponseCode};

use crate::error::{ErrorContext, NetworkError, NetworkResult};
use crate::icc::network::forkdns::{read_servers, FORKDNS_PORT};

const UPSTREAM_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_MESSAGE: usize = 4096;

#[derive(Debug, Clone)]
pub struct Forwarder {
    listen: SocketAddr,
    domain: String,
    servers_path: PathBuf,
    local_dns: SocketAddr,
    peer_port: u16,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(listen: SocketAddr, domain: impl Into<String>, servers_path: impl Into<PathBuf>) -> Self {
        Self {
            listen,
            domain: domain.into(),
            servers_path: servers_path.into(),
            local_dns: SocketAddr::new(listen.ip(), 53),
            peer_port: FORKDNS_PORT,
            timeout: UPSTREAM_TIMEOUT,
        }
    }

    pub fn with_local_dns(mut self, addr: SocketAddr) -> Self {
        self.local_dns = addr;
        self
    }

    pub fn with_peer_port(mut self, port: u16) -> Self {
        self.peer_port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Serves queries on the listen address until the task is cancelled.
    pub async fn run(self) -> NetworkResult<()> {
        let socket = Arc::new(
            UdpSocket::bind(self.listen)
                .await
                .with_context(|| format!("Failed to bind forkdns to {}", self.listen))?,
        );
        tracing::info!(listen = %self.listen, domain = %self.domain, "forkdns listening");

        let forwarder = Arc::new(self);
        let mut buf = vec![0u8; MAX_MESSAGE];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(err = %e, "forkdns: Failed to receive packet");
                    continue;
                }
            };

            let request = match Message::from_vec(&buf[..len]) {
                Ok(request) => request,
                Err(e) => {
                    tracing::debug!(client = %src, err = %e, "forkdns: Failed to parse query");
                    continue;
                }
            };

            let forwarder = forwarder.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let response = forwarder.resolve(&request).await;
                match response.to_vec() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, src).await {
                            tracing::debug!(client = %src, err = %e, "forkdns: Failed sending response");
                        }
                    }
                    Err(e) => tracing::warn!(err = %e, "forkdns: Failed encoding response"),
                }
            });
        }
    }

    /// Answers one query, either from the local dnsmasq or from the peers.
    pub async fn resolve(&self, request: &Message) -> Message {
        if !request.recursion_desired() {
            return match self.exchange(self.local_dns, request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(upstream = %self.local_dns, err = %e, "forkdns: Local query failed");
                    failure(request, ResponseCode::ServFail)
                }
            };
        }

        let servers = match read_servers(&self.servers_path) {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!(path = %self.servers_path.display(), err = %e, "forkdns: Failed to read server list");
                Vec::new()
            }
        };

        let mut forwarded = request.clone();
        forwarded.set_recursion_desired(false);

        for server in servers {
            let Ok(ip) = server.parse::<IpAddr>() else {
                tracing::debug!(server = %server, "forkdns: Skipping invalid server address");
                continue;
            };
            if ip == self.listen.ip() {
                continue;
            }

            match self.exchange(SocketAddr::new(ip, self.peer_port), &forwarded).await {
                Ok(mut response) if response.answer_count() > 0 => {
                    response.set_id(request.id());
                    response.set_recursion_desired(true);
                    return response;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(server = %ip, err = %e, "forkdns: Peer query failed"),
            }
        }

        failure(request, ResponseCode::NXDomain)
    }

    async fn exchange(&self, upstream: SocketAddr, request: &Message) -> NetworkResult<Message> {
        let bind: SocketAddr = match upstream {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(upstream).await?;
        socket.send(&request.to_vec()?).await?;

        let mut buf = vec![0u8; MAX_MESSAGE];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| NetworkError::Dns(format!("timed out waiting for {}", upstream)))??;

        let response = Message::from_vec(&buf[..len])?;
        if response.id() != request.id() {
            return Err(NetworkError::Dns(format!("mismatched response id from {}", upstream)));
        }
        Ok(response)
    }
}

fn failure(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.add_queries(request.queries().to_vec());
    response.set_response_code(code);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icc::network::forkdns::{ensure_servers_file, servers_path, write_servers};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use trust_dns_proto::op::{OpCode, Query};
    use trust_dns_proto::rr::{rdata, Name, RData, Record, RecordType};

    /// Answers every query with one A record and remembers whether recursion was asked for.
    async fn fake_upstream(bind: &str, answer: Ipv4Addr) -> (SocketAddr, Arc<AtomicBool>) {
        let socket = UdpSocket::bind(bind).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let saw_rd = Arc::new(AtomicBool::new(false));
        let flag = saw_rd.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MESSAGE];
            loop {
                let (len, src) = socket.recv_from(&mut buf).await.unwrap();
                let query = Message::from_vec(&buf[..len]).unwrap();
                if query.recursion_desired() {
                    flag.store(true, Ordering::SeqCst);
                }

                let mut response = Message::new();
                response.set_id(query.id());
                response.set_message_type(MessageType::Response);
                response.add_queries(query.queries().to_vec());
                let name = query.queries()[0].name().clone();
                response.add_answer(Record::from_rdata(name, 60, RData::A(rdata::A::from(answer))));
                socket.send_to(&response.to_vec().unwrap(), src).await.unwrap();
            }
        });

        (addr, saw_rd)
    }

    fn query(rd: bool) -> Message {
        let mut msg = Message::new();
        msg.set_id(99);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(rd);
        msg.add_query(Query::query(Name::from_ascii("c1.lxd.").unwrap(), RecordType::A));
        msg
    }

    fn first_a(response: &Message) -> Option<Ipv4Addr> {
        response.answers().iter().find_map(|r| match r.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_non_recursive_query_goes_to_local_dnsmasq() {
        let (local, saw_rd) = fake_upstream("127.0.0.1:0", Ipv4Addr::new(240, 1, 0, 5)).await;
        let dir = tempdir().unwrap();

        let forwarder = Forwarder::new("127.0.0.1:0".parse().unwrap(), "lxd", servers_path(dir.path()))
            .with_local_dns(local);
        let response = forwarder.resolve(&query(false)).await;

        assert_eq!(response.id(), 99);
        assert_eq!(first_a(&response), Some(Ipv4Addr::new(240, 1, 0, 5)));
        assert!(!saw_rd.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_recursive_query_asks_peers_without_recursion() {
        let (peer, saw_rd) = fake_upstream("127.0.0.2:0", Ipv4Addr::new(240, 2, 0, 9)).await;
        let dir = tempdir().unwrap();
        let path = servers_path(dir.path());
        ensure_servers_file(&path).unwrap();
        write_servers(&path, &["bogus".to_string(), "127.0.0.3".to_string(), "127.0.0.2".to_string()])
            .unwrap();

        let forwarder = Forwarder::new("127.0.0.1:0".parse().unwrap(), "lxd", path)
            .with_peer_port(peer.port())
            .with_timeout(Duration::from_millis(200));
        let response = forwarder.resolve(&query(true)).await;

        assert_eq!(response.id(), 99);
        assert!(response.recursion_desired());
        assert_eq!(first_a(&response), Some(Ipv4Addr::new(240, 2, 0, 9)));
        assert!(!saw_rd.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_no_peers_answers_nxdomain() {
        let dir = tempdir().unwrap();
        let forwarder = Forwarder::new("127.0.0.1:0".parse().unwrap(), "lxd", servers_path(dir.path()));

        let response = forwarder.resolve(&query(true)).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(response.id(), 99);
    }
}
