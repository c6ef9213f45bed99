//! The mutation set a transaction buffers and a log entry carries
//! (spec.md §3 "Log entry", §4.5).

use std::ops::Bound;

use crate::wire::{WireReader, WireWriter};
use crate::error::Result;

pub type Key = Vec<u8>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { key: Key, value: Vec<u8> },
    Remove { key: Key },
    RemoveRange { start: Bound<Key>, end: Bound<Key> },
    /// Commutative counter adjustment; conflict rule is the same as a put
    /// (spec.md §4.5).
    AdjustCounter { key: Key, delta: i64 },
}

impl Mutation {
    /// The single key a mutation touches, for conflict checks against
    /// point reads. Range removes have no single key and are handled via
    /// `touches_range` instead.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Mutation::Put { key, .. } => Some(key),
            Mutation::Remove { key } => Some(key),
            Mutation::AdjustCounter { key, .. } => Some(key),
            Mutation::RemoveRange { .. } => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Mutation::Put { .. } => 0,
            Mutation::Remove { .. } => 1,
            Mutation::RemoveRange { .. } => 2,
            Mutation::AdjustCounter { .. } => 3,
        }
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.write_u8(self.tag());
        match self {
            Mutation::Put { key, value } => {
                w.write_bytes(key);
                w.write_bytes(value);
            }
            Mutation::Remove { key } => {
                w.write_bytes(key);
            }
            Mutation::RemoveRange { start, end } => {
                encode_bound(w, start);
                encode_bound(w, end);
            }
            Mutation::AdjustCounter { key, delta } => {
                w.write_bytes(key);
                w.write_i64(*delta);
            }
        }
    }

    pub fn decode(r: &mut WireReader) -> Result<Self> {
        let tag = r.read_u8()?;
        Ok(match tag {
            0 => Mutation::Put { key: r.read_bytes()?.to_vec(), value: r.read_bytes()?.to_vec() },
            1 => Mutation::Remove { key: r.read_bytes()?.to_vec() },
            2 => Mutation::RemoveRange { start: decode_bound(r)?, end: decode_bound(r)? },
            3 => Mutation::AdjustCounter { key: r.read_bytes()?.to_vec(), delta: r.read_i64()? },
            other => return Err(crate::error::RaftError::Codec(format!("unknown mutation tag {other}"))),
        })
    }
}

fn encode_bound(w: &mut WireWriter, b: &Bound<Key>) {
    match b {
        Bound::Unbounded => w.write_u8(0),
        Bound::Included(k) => {
            w.write_u8(1);
            w.write_bytes(k);
        }
        Bound::Excluded(k) => {
            w.write_u8(2);
            w.write_bytes(k);
        }
    }
}

fn decode_bound(r: &mut WireReader) -> Result<Bound<Key>> {
    Ok(match r.read_u8()? {
        0 => Bound::Unbounded,
        1 => Bound::Included(r.read_bytes()?.to_vec()),
        2 => Bound::Excluded(r.read_bytes()?.to_vec()),
        other => return Err(crate::error::RaftError::Codec(format!("unknown bound tag {other}"))),
    })
}

pub fn encode_mutations(muts: &[Mutation]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u64(muts.len() as u64);
    for m in muts {
        m.encode(&mut w);
    }
    w.finish().to_vec()
}

pub fn decode_mutations(buf: &[u8]) -> Result<Vec<Mutation>> {
    let mut r = WireReader::new(buf);
    let count = r.read_u64()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(Mutation::decode(&mut r)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_variants() {
        let muts = vec![
            Mutation::Put { key: b"k1".to_vec(), value: b"v1".to_vec() },
            Mutation::Remove { key: b"k2".to_vec() },
            Mutation::RemoveRange { start: Bound::Included(b"a".to_vec()), end: Bound::Excluded(b"z".to_vec()) },
            Mutation::AdjustCounter { key: b"ctr".to_vec(), delta: -7 },
        ];
        let encoded = encode_mutations(&muts);
        let decoded = decode_mutations(&encoded).unwrap();
        assert_eq!(muts, decoded);
    }
}
