// UDP and TCP listeners for zone transfers, with TSIG verification and signing

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use trust_dns_proto::op::{Message, ResponseCode};
use trust_dns_proto::rr::dnssec::rdata::tsig::TsigAlgorithm;
use trust_dns_proto::rr::dnssec::rdata::DNSSECRData;
use trust_dns_proto::rr::dnssec::tsig::TSigner;
use trust_dns_proto::rr::{Name, RData};

use super::handler::{AxfrHandler, TsigStatus};
use super::ZoneRetriever;
use crate::error::{ErrorContext, NetworkResult};

/// Clock skew tolerated on signed messages, in seconds.
pub const TSIG_FUDGE: u16 = 300;

const MAX_UDP_MESSAGE: usize = 4096;

pub struct DnsServer {
    handler: AxfrHandler,
}

/// Listener tasks of a started server.
pub struct RunningServer {
    pub udp_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl DnsServer {
    pub fn new(retriever: Option<Arc<dyn ZoneRetriever>>) -> Self {
        Self {
            handler: AxfrHandler::new(retriever),
        }
    }

    /// Binds UDP and TCP on `listen` and serves until the returned handle is stopped.
    pub async fn start(self: Arc<Self>, listen: SocketAddr) -> NetworkResult<RunningServer> {
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("Failed to bind DNS server to udp {}", listen))?;
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind DNS server to tcp {}", listen))?;

        let udp_addr = socket.local_addr()?;
        let tcp_addr = listener.local_addr()?;
        tracing::info!(udp = %udp_addr, tcp = %tcp_addr, "DNS server listening");

        let udp_server = self.clone();
        let udp_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_MESSAGE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        if let Some(response) = udp_server.process(&buf[..len], Some(src.ip())).await {
                            if let Err(e) = socket.send_to(&response, src).await {
                                tracing::debug!(client = %src, err = %e, "Failed sending DNS response");
                            }
                        }
                    }
                    Err(e) => tracing::warn!(err = %e, "DNS: Failed to receive packet"),
                }
            }
        });

        let tcp_server = self;
        let tcp_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = tcp_server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_tcp(stream, peer).await {
                                tracing::debug!(client = %peer, err = %e, "DNS connection closed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(err = %e, "DNS: Failed to accept connection"),
                }
            }
        });

        Ok(RunningServer {
            udp_addr,
            tcp_addr,
            tasks: vec![udp_task, tcp_task],
        })
    }

    async fn serve_tcp(&self, mut stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        loop {
            let len = match stream.read_u16().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };

            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;

            let Some(response) = self.process(&buf, Some(peer.ip())).await else {
                continue;
            };
            let len = u16::try_from(response.len())
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "DNS response too large"))?;
            stream.write_u16(len).await?;
            stream.write_all(&response).await?;
        }
    }

    /// Decodes one wire message and returns the encoded response, or `None`
    /// when the input is not a DNS message at all.
    pub async fn process(&self, bytes: &[u8], source: Option<IpAddr>) -> Option<Vec<u8>> {
        let request = match Message::from_vec(bytes) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(err = %e, "DNS: Failed to parse query");
                return None;
            }
        };

        let (status, signer) = self.verify_tsig(bytes, &request).await;
        let mut response = self.handler.handle(&request, source, status.as_ref()).await;

        if let Some(signer) = signer {
            if response.response_code() == ResponseCode::NoError {
                if let Err(e) = response.finalize(&signer, unix_now() as u32) {
                    tracing::warn!(err = %e, "Failed signing zone transfer response");
                    return None;
                }
            }
        }

        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(err = %e, "Failed encoding DNS response");
                None
            }
        }
    }

    /// Checks the request's TSIG against the secret of the zone peer owning
    /// its key name. Returns the signer to use for the response when valid.
    async fn verify_tsig(&self, bytes: &[u8], request: &Message) -> (Option<TsigStatus>, Option<TSigner>) {
        let Some((key_name, algorithm)) = request.signature().iter().find_map(|record| match record.data() {
            Some(RData::DNSSEC(DNSSECRData::TSIG(tsig))) => Some((record.name().clone(), tsig.algorithm().clone())),
            _ => None,
        }) else {
            return (None, None);
        };

        let mut status = TsigStatus {
            key_name: key_name.to_string(),
            valid: false,
        };

        match self.lookup_signer(request, &key_name, algorithm).await {
            Some(signer) => match signer.verify_message_byte(None, bytes, true) {
                Ok((_, window, _)) if window.contains(&unix_now()) => {
                    status.valid = true;
                    (Some(status), Some(signer))
                }
                Ok(_) => {
                    tracing::debug!(key = %key_name, "TSIG outside of allowed time window");
                    (Some(status), None)
                }
                Err(e) => {
                    tracing::debug!(key = %key_name, err = %e, "TSIG verification failed");
                    (Some(status), None)
                }
            },
            None => (Some(status), None),
        }
    }

    async fn lookup_signer(&self, request: &Message, key_name: &Name, algorithm: TsigAlgorithm) -> Option<TSigner> {
        let retriever = self.handler.retriever()?;
        let query = request.queries().first()?;
        let zone_name = query.name().to_string();
        let zone = retriever.zone(zone_name.trim_end_matches('.')).await.ok()?;

        let wanted = key_name.to_string();
        let peer = zone
            .info
            .peers()
            .into_iter()
            .find(|peer| !peer.key.is_empty() && zone.info.peer_key_name(&peer.name).eq_ignore_ascii_case(&wanted))?;

        let secret = match base64::engine::general_purpose::STANDARD.decode(peer.key.trim()) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::warn!(zone = %zone.info.name, peer = %peer.name, err = %e, "Invalid peer TSIG secret");
                return None;
            }
        };

        TSigner::new(secret, algorithm, key_name.clone(), TSIG_FUDGE)
            .map_err(|e| tracing::debug!(key = %key_name, err = %e, "Unsupported TSIG key"))
            .ok()
    }
}
