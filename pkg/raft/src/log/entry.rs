//! A single log entry and its on-disk file format (spec.md §3, §6).

use crate::error::Result;
use crate::mutation::{decode_mutations, encode_mutations, Mutation};
use crate::proto::{ConfigChange, LogIndex, Term};
use crate::wire::{WireReader, WireWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub mutations: Vec<Mutation>,
    pub config_change: Option<ConfigChange>,
}

impl LogEntry {
    /// Serializes the entry body as it is written to `log-<index>-<term>.bin`
    /// (spec.md §6 "Log file format": mutations, then a config-change-present
    /// byte and optional identity/address).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_bytes(&encode_mutations(&self.mutations));
        match &self.config_change {
            Some(cc) => {
                w.write_bool(true);
                // Infallible: identities/addresses are validated at the
                // transaction API boundary before a config change is ever
                // proposed.
                w.write_str(&cc.identity.0).expect("identity must not contain NUL");
                match &cc.address {
                    Some(addr) => {
                        w.write_bool(true);
                        w.write_str(addr).expect("address must not contain NUL");
                    }
                    None => w.write_bool(false),
                }
            }
            None => w.write_bool(false),
        }
        w.finish().to_vec()
    }

    pub fn decode_body(term: Term, index: LogIndex, body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let mutations = decode_mutations(&r.read_bytes()?)?;
        let config_change = if r.read_bool()? {
            let identity = crate::proto::ServerId(r.read_str()?);
            let address = if r.read_bool()? { Some(r.read_str()?) } else { None };
            Some(ConfigChange { identity, address })
        } else {
            None
        };
        Ok(LogEntry { term, index, mutations, config_change })
    }

    pub fn file_name(index: LogIndex, term: Term) -> String {
        format!("log-{index:019}-{term:019}.bin")
    }

    /// Parses a `log-<index>-<term>.bin` file name, ignoring anything else
    /// (e.g. leftover `*.tmp` files, which the loader deletes separately).
    pub fn parse_file_name(name: &str) -> Option<(LogIndex, Term)> {
        let rest = name.strip_prefix("log-")?;
        let rest = rest.strip_suffix(".bin")?;
        let mut parts = rest.splitn(2, '-');
        let index: LogIndex = parts.next()?.parse().ok()?;
        let term: Term = parts.next()?.parse().ok()?;
        Some((index, term))
    }
}
