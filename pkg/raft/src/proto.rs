//! RPC message types and wire codec (spec.md §4.4, §6).

use bytes::Bytes;

use crate::error::{RaftError, Result};
use crate::mutation::{decode_mutations, encode_mutations, Mutation};
use crate::wire::{WireReader, WireWriter};

pub type Term = u64;
pub type LogIndex = u64;
pub type ClusterId = u32;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(pub String);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        ServerId(s.to_string())
    }
}

/// A config change carried by a log entry: add maps an identity to an
/// address, remove carries no address (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub identity: ServerId,
    pub address: Option<String>,
}

impl ConfigChange {
    pub fn is_add(&self) -> bool {
        self.address.is_some()
    }

    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_str(&self.identity.0)?;
        w.write_option_str(&self.address)
    }

    fn decode(r: &mut WireReader) -> Result<Self> {
        let identity = ServerId(r.read_str()?);
        let address = r.read_option_str()?;
        Ok(ConfigChange { identity, address })
    }
}

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub cluster_id: ClusterId,
    pub sender_id: ServerId,
    pub recipient_id: ServerId,
    pub term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub header: MessageHeader,
    pub leader_timestamp: u32,
    /// Encoded as a signed offset from `leader_timestamp` on the wire.
    pub leader_lease_timeout: Option<u32>,
    pub leader_commit: LogIndex,
    pub prev_log_term: Term,
    pub prev_log_index: LogIndex,
    /// 0 = probe.
    pub log_entry_term: Term,
    pub mutations: Option<Vec<Mutation>>,
    pub config_change: Option<ConfigChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResponse {
    pub header: MessageHeader,
    pub leader_timestamp: u32,
    pub success: bool,
    pub match_index: LogIndex,
    pub last_log_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub header: MessageHeader,
    pub tx_id: u64,
    pub base_term: Term,
    pub base_index: LogIndex,
    pub reads: Option<Vec<u8>>,
    pub mutations: Option<Vec<Mutation>>,
    pub config_change: Option<ConfigChange>,
    /// Forwarded from `Transaction::high_priority` (spec.md §4.6.1 "high
    /// priority transaction"): preserved across the forward so the leader's
    /// conflict resolution still favors this transaction.
    pub high_priority: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResponse {
    pub header: MessageHeader,
    pub tx_id: u64,
    pub success: bool,
    pub commit_term: Term,
    pub commit_index: LogIndex,
    pub leader_lease_timeout: Option<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVote {
    pub header: MessageHeader,
    pub last_log_term: Term,
    pub last_log_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantVote {
    pub header: MessageHeader,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshot {
    pub header: MessageHeader,
    pub snapshot_term: Term,
    pub snapshot_index: LogIndex,
    pub pair_index: u64,
    pub snapshot_config: Vec<ConfigChange>,
    pub data: Vec<(Bytes, Bytes)>,
    pub last_chunk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRequest {
    pub header: MessageHeader,
    pub timestamp: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResponse {
    pub header: MessageHeader,
    pub timestamp: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AppendRequest(AppendRequest),
    AppendResponse(AppendResponse),
    CommitRequest(CommitRequest),
    CommitResponse(CommitResponse),
    RequestVote(RequestVote),
    GrantVote(GrantVote),
    InstallSnapshot(InstallSnapshot),
    PingRequest(PingRequest),
    PingResponse(PingResponse),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::AppendRequest(m) => &m.header,
            Message::AppendResponse(m) => &m.header,
            Message::CommitRequest(m) => &m.header,
            Message::CommitResponse(m) => &m.header,
            Message::RequestVote(m) => &m.header,
            Message::GrantVote(m) => &m.header,
            Message::InstallSnapshot(m) => &m.header,
            Message::PingRequest(m) => &m.header,
            Message::PingResponse(m) => &m.header,
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            Message::AppendRequest(_) => 1,
            Message::AppendResponse(_) => 2,
            Message::CommitRequest(_) => 3,
            Message::CommitResponse(_) => 4,
            Message::RequestVote(_) => 5,
            Message::GrantVote(_) => 6,
            Message::InstallSnapshot(_) => 7,
            Message::PingRequest(_) => 8,
            Message::PingResponse(_) => 9,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut w = WireWriter::new();
        w.write_u8(PROTOCOL_VERSION);
        w.write_u8(self.type_byte());
        encode_header(&mut w, self.header())?;

        match self {
            Message::AppendRequest(m) => {
                w.write_u64(m.leader_timestamp as u64);
                match m.leader_lease_timeout {
                    Some(t) => {
                        w.write_bool(true);
                        w.write_i64(t as i64 - m.leader_timestamp as i64);
                    }
                    None => w.write_bool(false),
                }
                w.write_u64(m.leader_commit);
                w.write_u64(m.prev_log_term);
                w.write_u64(m.prev_log_index);
                w.write_u64(m.log_entry_term);
                match &m.mutations {
                    Some(muts) => {
                        w.write_bool(true);
                        w.write_bytes(&encode_mutations(muts));
                    }
                    None => w.write_bool(false),
                }
                match &m.config_change {
                    Some(cc) => {
                        w.write_bool(true);
                        cc.encode(&mut w)?;
                    }
                    None => w.write_bool(false),
                }
            }
            Message::AppendResponse(m) => {
                w.write_u64(m.leader_timestamp as u64);
                w.write_bool(m.success);
                w.write_u64(m.match_index);
                w.write_u64(m.last_log_index);
            }
            Message::CommitRequest(m) => {
                w.write_u64(m.tx_id);
                w.write_u64(m.base_term);
                w.write_u64(m.base_index);
                match &m.reads {
                    Some(r) => {
                        w.write_bool(true);
                        w.write_bytes(r);
                    }
                    None => w.write_bool(false),
                }
                match &m.mutations {
                    Some(muts) => {
                        w.write_bool(true);
                        w.write_bytes(&encode_mutations(muts));
                    }
                    None => w.write_bool(false),
                }
                match &m.config_change {
                    Some(cc) => {
                        w.write_bool(true);
                        cc.encode(&mut w)?;
                    }
                    None => w.write_bool(false),
                }
                w.write_bool(m.high_priority);
            }
            Message::CommitResponse(m) => {
                w.write_u64(m.tx_id);
                w.write_bool(m.success);
                w.write_u64(m.commit_term);
                w.write_u64(m.commit_index);
                match m.leader_lease_timeout {
                    Some(t) => {
                        w.write_bool(true);
                        w.write_u64(t as u64);
                    }
                    None => w.write_bool(false),
                }
                w.write_option_str(&m.error)?;
            }
            Message::RequestVote(m) => {
                w.write_u64(m.last_log_term);
                w.write_u64(m.last_log_index);
            }
            Message::GrantVote(m) => {
                w.write_bool(m.granted);
            }
            Message::InstallSnapshot(m) => {
                w.write_u64(m.snapshot_term);
                w.write_u64(m.snapshot_index);
                w.write_u64(m.pair_index);
                w.write_u64(m.snapshot_config.len() as u64);
                for cc in &m.snapshot_config {
                    cc.encode(&mut w)?;
                }
                w.write_u64(m.data.len() as u64);
                for (k, v) in &m.data {
                    w.write_bytes(k);
                    w.write_bytes(v);
                }
                w.write_bool(m.last_chunk);
            }
            Message::PingRequest(m) => {
                w.write_u64(m.timestamp as u64);
            }
            Message::PingResponse(m) => {
                w.write_u64(m.timestamp as u64);
            }
        }

        Ok(w.finish())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let version = r.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(RaftError::Codec(format!("unsupported protocol version {version}")));
        }
        let type_byte = r.read_u8()?;
        let header = decode_header(&mut r)?;

        Ok(match type_byte {
            1 => {
                let leader_timestamp = r.read_u64()? as u32;
                let leader_lease_timeout = if r.read_bool()? {
                    let offset = r.read_i64()?;
                    Some((leader_timestamp as i64 + offset) as u32)
                } else {
                    None
                };
                let leader_commit = r.read_u64()?;
                let prev_log_term = r.read_u64()?;
                let prev_log_index = r.read_u64()?;
                let log_entry_term = r.read_u64()?;
                let mutations = if r.read_bool()? { Some(decode_mutations(&r.read_bytes()?)?) } else { None };
                let config_change = if r.read_bool()? { Some(ConfigChange::decode(&mut r)?) } else { None };
                Message::AppendRequest(AppendRequest {
                    header,
                    leader_timestamp,
                    leader_lease_timeout,
                    leader_commit,
                    prev_log_term,
                    prev_log_index,
                    log_entry_term,
                    mutations,
                    config_change,
                })
            }
            2 => Message::AppendResponse(AppendResponse {
                header,
                leader_timestamp: r.read_u64()? as u32,
                success: r.read_bool()?,
                match_index: r.read_u64()?,
                last_log_index: r.read_u64()?,
            }),
            3 => {
                let tx_id = r.read_u64()?;
                let base_term = r.read_u64()?;
                let base_index = r.read_u64()?;
                let reads = if r.read_bool()? { Some(r.read_bytes()?.to_vec()) } else { None };
                let mutations = if r.read_bool()? { Some(decode_mutations(&r.read_bytes()?)?) } else { None };
                let config_change = if r.read_bool()? { Some(ConfigChange::decode(&mut r)?) } else { None };
                let high_priority = r.read_bool()?;
                Message::CommitRequest(CommitRequest { header, tx_id, base_term, base_index, reads, mutations, config_change, high_priority })
            }
            4 => {
                let tx_id = r.read_u64()?;
                let success = r.read_bool()?;
                let commit_term = r.read_u64()?;
                let commit_index = r.read_u64()?;
                let leader_lease_timeout = if r.read_bool()? { Some(r.read_u64()? as u32) } else { None };
                let error = r.read_option_str()?;
                Message::CommitResponse(CommitResponse {
                    header,
                    tx_id,
                    success,
                    commit_term,
                    commit_index,
                    leader_lease_timeout,
                    error,
                })
            }
            5 => Message::RequestVote(RequestVote {
                header,
                last_log_term: r.read_u64()?,
                last_log_index: r.read_u64()?,
            }),
            6 => Message::GrantVote(GrantVote { header, granted: r.read_bool()? }),
            7 => {
                let snapshot_term = r.read_u64()?;
                let snapshot_index = r.read_u64()?;
                let pair_index = r.read_u64()?;
                let config_count = r.read_u64()?;
                let mut snapshot_config = Vec::with_capacity(config_count as usize);
                for _ in 0..config_count {
                    snapshot_config.push(ConfigChange::decode(&mut r)?);
                }
                let pair_count = r.read_u64()?;
                let mut data = Vec::with_capacity(pair_count as usize);
                for _ in 0..pair_count {
                    let k = r.read_bytes()?;
                    let v = r.read_bytes()?;
                    data.push((k, v));
                }
                let last_chunk = r.read_bool()?;
                Message::InstallSnapshot(InstallSnapshot {
                    header,
                    snapshot_term,
                    snapshot_index,
                    pair_index,
                    snapshot_config,
                    data,
                    last_chunk,
                })
            }
            8 => Message::PingRequest(PingRequest { header, timestamp: r.read_u64()? as u32 }),
            9 => Message::PingResponse(PingResponse { header, timestamp: r.read_u64()? as u32 }),
            other => return Err(RaftError::Codec(format!("unknown message type {other}"))),
        })
    }
}

fn encode_header(w: &mut WireWriter, h: &MessageHeader) -> Result<()> {
    w.write_u64(h.cluster_id as u64);
    w.write_str(&h.sender_id.0)?;
    w.write_str(&h.recipient_id.0)?;
    w.write_u64(h.term);
    Ok(())
}

fn decode_header(r: &mut WireReader) -> Result<MessageHeader> {
    let cluster_id = r.read_u64()? as ClusterId;
    let sender_id = ServerId(r.read_str()?);
    let recipient_id = ServerId(r.read_str()?);
    let term = r.read_u64()?;
    Ok(MessageHeader { cluster_id, sender_id, recipient_id, term })
}

/// Validates `clusterId` compatibility as required by spec.md §4.4: a
/// message with `clusterId = 0` is always invalid, and a configured peer
/// rejects messages whose cluster id does not match its own.
pub fn cluster_id_is_acceptable(own_cluster_id: ClusterId, configured: bool, msg_cluster_id: ClusterId) -> bool {
    if msg_cluster_id == 0 {
        return false;
    }
    if configured && msg_cluster_id != own_cluster_id {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> MessageHeader {
        MessageHeader {
            cluster_id: 42,
            sender_id: ServerId::from("A"),
            recipient_id: ServerId::from("B"),
            term: 7,
        }
    }

    #[test]
    fn append_request_round_trips_with_lease_and_mutations() {
        let msg = Message::AppendRequest(AppendRequest {
            header: header(),
            leader_timestamp: 1000,
            leader_lease_timeout: Some(1500),
            leader_commit: 3,
            prev_log_term: 2,
            prev_log_index: 4,
            log_entry_term: 2,
            mutations: Some(vec![Mutation::Put { key: b"k".to_vec(), value: b"v".to_vec() }]),
            config_change: Some(ConfigChange { identity: ServerId::from("C"), address: Some("host:1".into()) }),
        });
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn probe_append_request_round_trips() {
        let msg = Message::AppendRequest(AppendRequest {
            header: header(),
            leader_timestamp: 1000,
            leader_lease_timeout: None,
            leader_commit: 3,
            prev_log_term: 2,
            prev_log_index: 4,
            log_entry_term: 0,
            mutations: None,
            config_change: None,
        });
        let encoded = msg.encode().unwrap();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn install_snapshot_round_trips() {
        let msg = Message::InstallSnapshot(InstallSnapshot {
            header: header(),
            snapshot_term: 5,
            snapshot_index: 100,
            pair_index: 0,
            snapshot_config: vec![ConfigChange { identity: ServerId::from("A"), address: Some("a:1".into()) }],
            data: vec![(Bytes::from_static(b"k1"), Bytes::from_static(b"v1"))],
            last_chunk: false,
        });
        let encoded = msg.encode().unwrap();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn commit_response_round_trips_with_error() {
        let msg = Message::CommitResponse(CommitResponse {
            header: header(),
            tx_id: 99,
            success: false,
            commit_term: 0,
            commit_index: 0,
            leader_lease_timeout: None,
            error: Some("conflict".into()),
        });
        let encoded = msg.encode().unwrap();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn rejects_zero_cluster_id() {
        assert!(!cluster_id_is_acceptable(5, true, 0));
        assert!(!cluster_id_is_acceptable(0, false, 0));
    }

    #[test]
    fn rejects_mismatched_cluster_id_once_configured() {
        assert!(!cluster_id_is_acceptable(5, true, 6));
        assert!(cluster_id_is_acceptable(5, true, 5));
        // Unconfigured peers accept any nonzero cluster id (adopt it).
        assert!(cluster_id_is_acceptable(0, false, 6));
    }
}
