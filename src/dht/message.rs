//! DHT message module
//!
//! KRPC queries and responses used by the crawler, encoded as bencoded
//! dictionaries over UDP.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::trace;

use crate::dht::node::NodeId;
use crate::error::TorrentError;

/// Size of one entry in a compact `nodes` string
pub const COMPACT_NODE_LEN: usize = 26;

/// Size of one compact IPv4 contact
pub const COMPACT_PEER_LEN: usize = 6;

/// Decoded `r` dictionary of a KRPC response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KrpcResponse {
    /// Responding node id
    pub id: Option<NodeId>,
    pub token: Option<Vec<u8>>,
    /// Closer nodes, from `nodes`
    pub nodes: Vec<(NodeId, SocketAddrV4)>,
    /// Peer contacts, from `values`
    pub values: Vec<SocketAddrV4>,
}

/// Random transaction id
pub fn generate_transaction_id() -> Vec<u8> {
    use rand::Rng;
    let id: u16 = rand::thread_rng().gen();
    id.to_be_bytes().to_vec()
}

fn bytes(data: &[u8]) -> Value {
    Value::Bytes(data.to_vec())
}

fn query(transaction_id: &[u8], method: &str, args: HashMap<Vec<u8>, Value>) -> Result<Vec<u8>> {
    let mut dict = HashMap::new();
    dict.insert(b"t".to_vec(), bytes(transaction_id));
    dict.insert(b"y".to_vec(), bytes(b"q"));
    dict.insert(b"q".to_vec(), bytes(method.as_bytes()));
    dict.insert(b"a".to_vec(), Value::Dict(args));
    let encoded = serde_bencode::to_bytes(&Value::Dict(dict)).map_err(TorrentError::from)?;
    Ok(encoded)
}

/// `ping {t, y:"q", q:"ping", a:{id}}`
pub fn ping_query(transaction_id: &[u8], our_id: &NodeId) -> Result<Vec<u8>> {
    let mut args = HashMap::new();
    args.insert(b"id".to_vec(), bytes(our_id.as_bytes()));
    query(transaction_id, "ping", args)
}

/// `get_peers {t, y:"q", q:"get_peers", a:{id, info_hash}}`
pub fn get_peers_query(transaction_id: &[u8], our_id: &NodeId, info_hash: &[u8; 20]) -> Result<Vec<u8>> {
    let mut args = HashMap::new();
    args.insert(b"id".to_vec(), bytes(our_id.as_bytes()));
    args.insert(b"info_hash".to_vec(), bytes(info_hash));
    query(transaction_id, "get_peers", args)
}

/// Decode a KRPC reply to the query sent with `transaction_id`.
///
/// Error replies, foreign transaction ids and malformed compact fields are
/// reported as DHT errors.
pub fn parse_response(data: &[u8], transaction_id: &[u8]) -> Result<KrpcResponse> {
    let value: Value = serde_bencode::from_bytes(data).map_err(TorrentError::from)?;
    let dict = match value {
        Value::Dict(dict) => dict,
        _ => return Err(TorrentError::dht_error("KRPC message is not a dictionary").into()),
    };

    match dict.get(b"t".as_slice()) {
        Some(Value::Bytes(t)) if t.as_slice() == transaction_id => {}
        _ => return Err(TorrentError::dht_error("Transaction id mismatch").into()),
    }

    match dict.get(b"y".as_slice()) {
        Some(Value::Bytes(y)) if y.as_slice() == b"r" => {}
        Some(Value::Bytes(y)) if y.as_slice() == b"e" => {
            return Err(TorrentError::dht_error(format!("Remote error: {}", describe_error(dict.get(b"e".as_slice())))).into());
        }
        _ => return Err(TorrentError::dht_error("KRPC message is not a response").into()),
    }

    let body = match dict.get(b"r".as_slice()) {
        Some(Value::Dict(body)) => body,
        _ => return Err(TorrentError::dht_error("Response has no 'r' dictionary").into()),
    };

    let mut response = KrpcResponse {
        id: match body.get(b"id".as_slice()) {
            Some(Value::Bytes(id)) => NodeId::from_slice(id),
            _ => None,
        },
        ..KrpcResponse::default()
    };

    if let Some(Value::Bytes(token)) = body.get(b"token".as_slice()) {
        response.token = Some(token.clone());
    }
    if let Some(Value::Bytes(nodes)) = body.get(b"nodes".as_slice()) {
        response.nodes = parse_compact_nodes(nodes)?;
    }
    if let Some(Value::List(values)) = body.get(b"values".as_slice()) {
        for value in values {
            match value {
                Value::Bytes(contact) => response.values.extend(parse_compact_peers(contact)?),
                other => trace!("Skipping non-string value entry {:?}", other),
            }
        }
    }

    Ok(response)
}

fn describe_error(error: Option<&Value>) -> String {
    match error {
        Some(Value::List(items)) => items
            .iter()
            .map(|item| match item {
                Value::Int(code) => code.to_string(),
                Value::Bytes(text) => String::from_utf8_lossy(text).to_string(),
                _ => "?".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        _ => "unspecified".to_string(),
    }
}

fn compact_addr(chunk: &[u8]) -> SocketAddrV4 {
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    SocketAddrV4::new(ip, port)
}

/// Parse nodes from compact node format (20 bytes id, 4 bytes IP, 2 bytes port)
pub fn parse_compact_nodes(data: &[u8]) -> Result<Vec<(NodeId, SocketAddrV4)>> {
    if data.len() % COMPACT_NODE_LEN != 0 {
        return Err(TorrentError::dht_error(format!("Invalid compact nodes length {}", data.len())).into());
    }

    Ok(data
        .chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|chunk| NodeId::from_slice(&chunk[..20]).map(|id| (id, compact_addr(&chunk[20..]))))
        .collect())
}

/// Parse peers from compact peer format (4 bytes IP, 2 bytes port)
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<SocketAddrV4>> {
    if data.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::dht_error(format!("Invalid compact peers length {}", data.len())).into());
    }

    Ok(data.chunks_exact(COMPACT_PEER_LEN).map(compact_addr).collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn compact(addr: &SocketAddrV4) -> Vec<u8> {
        let mut out = addr.ip().octets().to_vec();
        out.extend_from_slice(&addr.port().to_be_bytes());
        out
    }

    /// Encode a `r` reply the way a remote node would
    pub(crate) fn encode_response(
        transaction_id: &[u8],
        id: &NodeId,
        nodes: &[(NodeId, SocketAddrV4)],
        values: &[SocketAddrV4],
    ) -> Vec<u8> {
        let mut body = HashMap::new();
        body.insert(b"id".to_vec(), bytes(id.as_bytes()));
        body.insert(b"token".to_vec(), bytes(b"tk"));
        if !nodes.is_empty() {
            let packed: Vec<u8> = nodes
                .iter()
                .flat_map(|(id, addr)| [id.as_bytes().to_vec(), compact(addr)].concat())
                .collect();
            body.insert(b"nodes".to_vec(), Value::Bytes(packed));
        }
        if !values.is_empty() {
            body.insert(b"values".to_vec(), Value::List(values.iter().map(|v| Value::Bytes(compact(v))).collect()));
        }

        let mut dict = HashMap::new();
        dict.insert(b"t".to_vec(), bytes(transaction_id));
        dict.insert(b"y".to_vec(), bytes(b"r"));
        dict.insert(b"r".to_vec(), Value::Dict(body));
        serde_bencode::to_bytes(&Value::Dict(dict)).unwrap()
    }

    /// Pull the transaction id and method out of a query
    pub(crate) fn decode_query(data: &[u8]) -> (Vec<u8>, String, HashMap<Vec<u8>, Value>) {
        let Value::Dict(dict) = serde_bencode::from_bytes::<Value>(data).unwrap() else {
            panic!("query is not a dictionary");
        };
        let field = |key: &[u8]| match dict.get(key) {
            Some(Value::Bytes(b)) => b.clone(),
            other => panic!("unexpected field {:?}", other),
        };
        let args = match dict.get(b"a".as_slice()) {
            Some(Value::Dict(args)) => args.clone(),
            other => panic!("unexpected args {:?}", other),
        };
        assert_eq!(field(b"y"), b"q");
        (field(b"t"), String::from_utf8(field(b"q")).unwrap(), args)
    }

    #[test]
    fn test_ping_query_layout() {
        let id = NodeId::new([1; 20]);
        let encoded = ping_query(b"aa", &id).unwrap();
        assert_eq!(
            encoded,
            [b"d1:ad2:id20:".as_slice(), &[1; 20], b"e1:q4:ping1:t2:aa1:y1:qe"].concat()
        );
    }

    #[test]
    fn test_get_peers_query_fields() {
        let id = NodeId::new([1; 20]);
        let encoded = get_peers_query(b"xy", &id, &[9; 20]).unwrap();
        let (t, method, args) = decode_query(&encoded);
        assert_eq!(t, b"xy");
        assert_eq!(method, "get_peers");
        assert_eq!(args.get(b"info_hash".as_slice()), Some(&Value::Bytes(vec![9; 20])));
        assert_eq!(args.get(b"id".as_slice()), Some(&Value::Bytes(vec![1; 20])));
    }

    #[test]
    fn test_parse_response_nodes_and_values() {
        let node = (NodeId::new([2; 20]), "10.0.0.2:6881".parse().unwrap());
        let peer: SocketAddrV4 = "192.168.1.9:51413".parse().unwrap();
        let data = encode_response(b"aa", &NodeId::new([5; 20]), &[node], &[peer]);

        let response = parse_response(&data, b"aa").unwrap();
        assert_eq!(response.id, Some(NodeId::new([5; 20])));
        assert_eq!(response.token.as_deref(), Some(b"tk".as_slice()));
        assert_eq!(response.nodes, vec![node]);
        assert_eq!(response.values, vec![peer]);
    }

    #[test]
    fn test_parse_response_rejects_foreign_transaction() {
        let data = encode_response(b"aa", &NodeId::new([5; 20]), &[], &[]);
        assert!(parse_response(&data, b"bb").is_err());
    }

    #[test]
    fn test_parse_error_reply() {
        let data = b"d1:eli201e7:Generice1:t2:aa1:y1:ee";
        let err = parse_response(data, b"aa").unwrap_err();
        assert!(err.to_string().contains("201 Generic"));
    }

    #[test]
    fn test_parse_compact_nodes() {
        let mut data = vec![1u8; 20];
        data.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);

        let nodes = parse_compact_nodes(&data).unwrap();
        assert_eq!(nodes, vec![(NodeId::new([1; 20]), "127.0.0.1:6881".parse().unwrap())]);
        assert!(parse_compact_nodes(&data[..25]).is_err());
    }

    #[test]
    fn test_parse_compact_peers() {
        let peers = parse_compact_peers(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 1, 0, 80]).unwrap();
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap(), "10.0.0.1:80".parse().unwrap()]);
        assert!(parse_compact_peers(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_generate_transaction_id() {
        assert_eq!(generate_transaction_id().len(), 2);
    }
}
