use bincode::Options;
use primitive_types::H256;

use crate::errors::Error;

fn opts() -> impl Options {
    bincode::DefaultOptions::new()
}

pub(crate) fn put_u64(out: &mut Vec<u8>, val: u64) {
    out.extend(opts().serialize(&val).expect("varint encoding is infallible"));
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, val: &[u8]) {
    put_u64(out, val.len() as u64);
    out.extend_from_slice(val);
}

pub(crate) fn put_hash(out: &mut Vec<u8>, val: &H256) {
    out.extend_from_slice(val.as_bytes());
}

/// Sequential decoder over an encoded blob. Varints are read with the same
/// canonical encoding `put_u64` produces.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn u64(&mut self) -> Result<u64, Error> {
        let mut rd = self.buf;
        let val: u64 = opts().deserialize_from(&mut rd)?;
        self.buf = rd;
        Ok(val)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.u64()? as usize;
        if self.buf.len() < len {
            return Err(Error::Corrupted("byte string overruns input".into()));
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head.to_vec())
    }

    /// Fixed-width little-endian u64, for non-varint wire fields.
    pub fn fixed_u64(&mut self) -> Result<u64, Error> {
        if self.buf.len() < 8 {
            return Err(Error::Corrupted("u64 overruns input".into()));
        }
        let (head, rest) = self.buf.split_at(8);
        self.buf = rest;
        Ok(u64::from_le_bytes(head.try_into().expect("length checked")))
    }

    pub fn hash(&mut self) -> Result<H256, Error> {
        if self.buf.len() < 32 {
            return Err(Error::Corrupted("hash overruns input".into()));
        }
        let (head, rest) = self.buf.split_at(32);
        self.buf = rest;
        Ok(H256::from_slice(head))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn u64_round_trip() {
        let mut buf = Vec::new();
        let vals = [0u64, 1, 250, 251, 0xffff, 0x10000, u64::MAX];
        for v in vals {
            put_u64(&mut buf, v);
        }
        let mut cur = Cursor::new(&buf);
        for v in vals {
            assert_eq!(cur.u64().unwrap(), v);
        }
        assert!(cur.is_empty());
    }

    #[test]
    fn bytes_and_hash() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"");
        put_bytes(&mut buf, b"loam");
        put_hash(&mut buf, &H256::repeat_byte(0xaa));
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.bytes().unwrap(), b"");
        assert_eq!(cur.bytes().unwrap(), b"loam");
        assert_eq!(cur.hash().unwrap(), H256::repeat_byte(0xaa));
        assert!(cur.is_empty());
    }

    #[test]
    fn truncated_input() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"truncated");
        let mut cur = Cursor::new(&buf[..4]);
        assert!(cur.bytes().is_err());
    }
}
