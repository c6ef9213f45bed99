//! Chunked snapshot transfer (spec.md §4.7): a leader with a follower whose
//! `nextIndex` is below its earliest retained log index streams the state
//! machine as a sequence of `InstallSnapshot` messages instead.

use std::collections::HashMap;

use bytes::Bytes;

use crate::mutation::Key;
use crate::proto::{ConfigChange, InstallSnapshot, LogIndex, MessageHeader, ServerId, Term};
use crate::store::Snapshot;

/// Splits a snapshot's contents into chunks no larger than `chunk_size`
/// pairs each, tagged with a strictly increasing `pairIndex` starting at 0
/// and a `lastChunk` flag on the final one.
pub fn chunk_snapshot(snapshot: &dyn Snapshot, chunk_size: usize) -> Vec<(u64, Vec<(Key, Vec<u8>)>, bool)> {
    let all = snapshot.get_range(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded);
    if all.is_empty() {
        return vec![(0, vec![], true)];
    }
    let mut chunks = Vec::new();
    let mut pair_index = 0u64;
    for slice in all.chunks(chunk_size.max(1)) {
        chunks.push((pair_index, slice.to_vec(), false));
        pair_index += 1;
    }
    if let Some(last) = chunks.last_mut() {
        last.2 = true;
    }
    chunks
}

/// Builds the `InstallSnapshot` messages a leader sends to bring one
/// follower up to date with the given chunked snapshot.
#[allow(clippy::too_many_arguments)]
pub fn build_install_messages(
    chunks: &[(u64, Vec<(Key, Vec<u8>)>, bool)],
    cluster_id: crate::proto::ClusterId,
    own_id: &ServerId,
    peer_id: &ServerId,
    current_term: Term,
    snapshot_term: Term,
    snapshot_index: LogIndex,
    config: &HashMap<ServerId, String>,
) -> Vec<InstallSnapshot> {
    let snapshot_config: Vec<ConfigChange> =
        config.iter().map(|(id, addr)| ConfigChange { identity: id.clone(), address: Some(addr.clone()) }).collect();

    chunks
        .iter()
        .map(|(pair_index, data, last_chunk)| InstallSnapshot {
            header: MessageHeader {
                cluster_id,
                sender_id: own_id.clone(),
                recipient_id: peer_id.clone(),
                term: current_term,
            },
            snapshot_term,
            snapshot_index,
            pair_index: *pair_index,
            snapshot_config: snapshot_config.clone(),
            data: data.iter().map(|(k, v)| (Bytes::copy_from_slice(k), Bytes::copy_from_slice(v))).collect(),
            last_chunk: *last_chunk,
        })
        .collect()
}

/// Applies one `InstallSnapshot` chunk to the local store, returning the
/// config map to install as `lastAppliedConfig` once `last_chunk` is true.
pub fn apply_chunk(store: &dyn crate::store::KvStore, msg: &InstallSnapshot) -> crate::error::Result<Option<HashMap<ServerId, String>>> {
    let data: Vec<(Key, Vec<u8>)> = msg.data.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
    store.apply_snapshot_chunk(msg.pair_index, &data, msg.last_chunk)?;
    if msg.last_chunk {
        let config = msg
            .snapshot_config
            .iter()
            .filter_map(|cc| cc.address.clone().map(|addr| (cc.identity.clone(), addr)))
            .collect();
        Ok(Some(config))
    } else {
        Ok(None)
    }
}
