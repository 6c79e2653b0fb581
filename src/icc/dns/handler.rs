// Zone transfer request handling

use std::net::IpAddr;
use std::sync::Arc;

use trust_dns_proto::op::{Message, MessageType, ResponseCode};
use trust_dns_proto::rr::RecordType;

use super::zone::parse_zone;
use super::{ZoneInfo, ZoneRetriever};

/// Outcome of the transport level TSIG check on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsigStatus {
    pub key_name: String,
    pub valid: bool,
}

/// Answers AXFR requests. Every other query is refused with a coarse response code.
pub struct AxfrHandler {
    retriever: Option<Arc<dyn ZoneRetriever>>,
}

fn reply(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.add_queries(request.queries().to_vec());
    response.set_response_code(code);
    response
}

impl AxfrHandler {
    pub fn new(retriever: Option<Arc<dyn ZoneRetriever>>) -> Self {
        Self { retriever }
    }

    pub fn retriever(&self) -> Option<&Arc<dyn ZoneRetriever>> {
        self.retriever.as_ref()
    }

    /// Builds the response to `request`.
    ///
    /// `source` is `None` when the client address could not be determined.
    /// Missing zones and refused transfers both answer NXDOMAIN so a client
    /// cannot tell them apart.
    pub async fn handle(&self, request: &Message, source: Option<IpAddr>, tsig: Option<&TsigStatus>) -> Message {
        let Some(retriever) = self.retriever.as_ref() else {
            return reply(request, ResponseCode::ServFail);
        };

        if request.queries().len() != 1 {
            return reply(request, ResponseCode::ServFail);
        }

        let query = &request.queries()[0];
        if query.query_type() != RecordType::AXFR {
            return reply(request, ResponseCode::NotImp);
        }

        let Some(source) = source else {
            return reply(request, ResponseCode::ServFail);
        };

        let name = query.name().to_string();
        let name = name.trim_end_matches('.');

        let zone = match retriever.zone(name).await {
            Ok(zone) => zone,
            Err(e) => {
                tracing::debug!(zone = %name, client = %source, err = %e, "Zone lookup failed");
                return reply(request, ResponseCode::NXDomain);
            }
        };

        if !is_allowed(&zone.info, source, tsig) {
            tracing::info!(zone = %name, client = %source, "Refused zone transfer");
            return reply(request, ResponseCode::NXDomain);
        }

        let records = match parse_zone(&zone.content, &zone.info.name) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(zone = %name, err = %e, "Failed parsing zone content");
                return reply(request, ResponseCode::ServFail);
            }
        };

        tracing::debug!(zone = %name, client = %source, records = records.len(), "Serving zone transfer");

        let mut response = reply(request, ResponseCode::NoError);
        response.set_authoritative(true);
        response.add_answers(records);
        response
    }
}

/// Whether any configured peer admits the client.
///
/// A peer matches when its address is unset or equals the client address, and
/// its key is unset or the request carried a valid TSIG under the peer's key
/// name. A peer with neither restriction admits everyone.
pub fn is_allowed(zone: &ZoneInfo, source: IpAddr, tsig: Option<&TsigStatus>) -> bool {
    let source = source.to_canonical();

    for peer in zone.peers() {
        if !peer.address.is_empty() && peer.address.parse::<IpAddr>().ok() != Some(source) {
            continue;
        }

        if !peer.key.is_empty() {
            let key_name = zone.peer_key_name(&peer.name);
            match tsig {
                Some(status) if status.valid && status.key_name.eq_ignore_ascii_case(&key_name) => {}
                _ => continue,
            }
        }

        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NetworkError, NetworkResult};
    use crate::icc::dns::Zone;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use trust_dns_proto::op::{OpCode, Query};
    use trust_dns_proto::rr::Name;

    const CONTENT: &str = "$ORIGIN example.com.\n\
        @ 300 IN SOA ns1 hostmaster 1 120 60 86400 30\n\
        www 300 IN A 192.0.2.1\n\
        @ 300 IN SOA ns1 hostmaster 1 120 60 86400 30\n";

    struct MapRetriever(BTreeMap<String, Zone>);

    #[async_trait]
    impl ZoneRetriever for MapRetriever {
        async fn zone(&self, name: &str) -> NetworkResult<Zone> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| NetworkError::NotFound(format!("zone {}", name)))
        }
    }

    fn zone(config: &[(&str, &str)], content: &str) -> Zone {
        Zone {
            info: ZoneInfo {
                name: "example.com".to_string(),
                config: config
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            content: content.to_string(),
        }
    }

    fn handler(zone: Zone) -> AxfrHandler {
        let mut zones = BTreeMap::new();
        zones.insert(zone.info.name.clone(), zone);
        AxfrHandler::new(Some(Arc::new(MapRetriever(zones))))
    }

    fn request(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(4242);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
        msg
    }

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[tokio::test]
    async fn test_not_ready() {
        let response = AxfrHandler::new(None)
            .handle(&request("example.com.", RecordType::AXFR), ip("10.0.0.5"), None)
            .await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.id(), 4242);
    }

    #[tokio::test]
    async fn test_question_shape() {
        let handler = handler(zone(&[("peers.a.address", "")], CONTENT));

        let mut two = request("example.com.", RecordType::AXFR);
        two.add_query(Query::query(Name::from_ascii("other.com.").unwrap(), RecordType::AXFR));
        let response = handler.handle(&two, ip("10.0.0.5"), None).await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);

        let response = handler
            .handle(&request("example.com.", RecordType::A), ip("10.0.0.5"), None)
            .await;
        assert_eq!(response.response_code(), ResponseCode::NotImp);

        let response = handler
            .handle(&request("example.com.", RecordType::AXFR), None, None)
            .await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn test_missing_zone_and_denied_look_the_same() {
        let handler = handler(zone(&[("peers.a.address", "10.0.0.5")], CONTENT));

        let missing = handler
            .handle(&request("nothere.com.", RecordType::AXFR), ip("10.0.0.5"), None)
            .await;
        let denied = handler
            .handle(&request("example.com.", RecordType::AXFR), ip("10.0.0.9"), None)
            .await;

        assert_eq!(missing.response_code(), ResponseCode::NXDomain);
        assert_eq!(denied.response_code(), ResponseCode::NXDomain);
        assert_eq!(denied.answer_count(), 0);
        assert!(!denied.authoritative());
    }

    #[tokio::test]
    async fn test_unrestricted_peer_gets_full_zone() {
        let handler = handler(zone(&[("peers.open.address", "")], CONTENT));

        let response = handler
            .handle(&request("example.com.", RecordType::AXFR), ip("203.0.113.7"), None)
            .await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.authoritative());
        assert_eq!(response.message_type(), MessageType::Response);

        let types: Vec<RecordType> = response.answers().iter().map(|r| r.record_type()).collect();
        assert_eq!(types, vec![RecordType::SOA, RecordType::A, RecordType::SOA]);
    }

    #[tokio::test]
    async fn test_unparseable_zone() {
        let handler = handler(zone(&[("peers.open.address", "")], "www IN BOGUS x\n"));
        let response = handler
            .handle(&request("example.com.", RecordType::AXFR), ip("10.0.0.5"), None)
            .await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }

    #[test]
    fn test_is_allowed() {
        let keyed = ZoneInfo {
            name: "example.com".to_string(),
            config: [
                ("peers.a.address".to_string(), "10.0.0.5".to_string()),
                ("peers.a.key".to_string(), "c2VjcmV0".to_string()),
            ]
            .into_iter()
            .collect(),
        };
        let good = TsigStatus {
            key_name: "example.com_a.".to_string(),
            valid: true,
        };
        let invalid = TsigStatus {
            valid: false,
            ..good.clone()
        };
        let other_zone = TsigStatus {
            key_name: "other.com_a.".to_string(),
            valid: true,
        };
        let src: IpAddr = "10.0.0.5".parse().unwrap();

        assert!(is_allowed(&keyed, src, Some(&good)));
        assert!(!is_allowed(&keyed, src, None));
        assert!(!is_allowed(&keyed, src, Some(&invalid)));
        assert!(!is_allowed(&keyed, src, Some(&other_zone)));
        assert!(!is_allowed(&keyed, "10.0.0.6".parse().unwrap(), Some(&good)));

        // IPv4 clients seen through a dual stack socket
        assert!(is_allowed(&keyed, "::ffff:10.0.0.5".parse().unwrap(), Some(&good)));

        // Key only peer accepts any address
        let key_only = ZoneInfo {
            name: "example.com".to_string(),
            config: [("peers.b.key".to_string(), "c2VjcmV0".to_string())]
                .into_iter()
                .collect(),
        };
        let b = TsigStatus {
            key_name: "example.com_b.".to_string(),
            valid: true,
        };
        assert!(is_allowed(&key_only, "192.0.2.200".parse().unwrap(), Some(&b)));

        // No peers at all
        assert!(!is_allowed(&ZoneInfo::default(), src, None));
    }
}
