//! Low-level primitives the wire format (spec.md §6) and the log entry file
//! format are both built from: booleans, length-prefixed byte buffers, and
//! modified-UTF-8 NUL-terminated strings, layered on top of the order
//! preserving codecs in [`crate::codec`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{decode_signed_long, decode_unsigned_int, encode_signed_long, encode_unsigned_int};
use crate::error::{RaftError, Result};

pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        WireWriter { buf: BytesMut::new() }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(if v { 1 } else { 0 });
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_slice(&encode_signed_long(v));
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_i64(v as i64);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(&encode_unsigned_int(v.len() as u32));
        self.buf.put_slice(v);
    }

    /// Modified-UTF-8, NUL terminated: since our strings never legitimately
    /// contain embedded NUL bytes (peer identities, addresses), this is a
    /// thin wrapper that also rejects embedded NULs up front.
    pub fn write_str(&mut self, v: &str) -> Result<()> {
        if v.as_bytes().contains(&0u8) {
            return Err(RaftError::Codec("string contains embedded NUL".into()));
        }
        self.buf.put_slice(v.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    pub fn write_option_str(&mut self, v: &Option<String>) -> Result<()> {
        match v {
            Some(s) => {
                self.write_bool(true);
                self.write_str(s)
            }
            None => {
                self.write_bool(false);
                Ok(())
            }
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self.remaining().first().ok_or_else(|| RaftError::Codec("truncated u8".into()))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let (v, len) = decode_signed_long(self.remaining())?;
        self.pos += len;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.read_i64()? as u64)
    }

    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let (len, used) = decode_unsigned_int(self.remaining())?;
        self.pos += used;
        let len = len as usize;
        if self.remaining().len() < len {
            return Err(RaftError::Codec("truncated byte buffer".into()));
        }
        let out = Bytes::copy_from_slice(&self.remaining()[..len]);
        self.pos += len;
        Ok(out)
    }

    pub fn read_str(&mut self) -> Result<String> {
        let nul = self
            .remaining()
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| RaftError::Codec("unterminated string".into()))?;
        let s = String::from_utf8(self.remaining()[..nul].to_vec())
            .map_err(|e| RaftError::Codec(format!("invalid utf8 string: {e}")))?;
        self.pos += nul + 1;
        Ok(s)
    }

    pub fn read_option_str(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            Ok(Some(self.read_str()?))
        } else {
            Ok(None)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}
