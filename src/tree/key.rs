use crate::encoding::{get_varint, put_varint, unzigzag, zigzag};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Key family a tree instance is fixed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    Numeric,
    Textual,
}

/// Key of a [`TermTree`](super::TermTree)
pub trait TreeKey: Clone + Ord + Debug + Send + Sync + 'static {
    const KIND: KeyKind;

    fn encode(&self, out: &mut Vec<u8>);

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self>;
}

impl TreeKey for i64 {
    const KIND: KeyKind = KeyKind::Numeric;

    fn encode(&self, out: &mut Vec<u8>) {
        put_varint(out, zigzag(*self));
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        Ok(unzigzag(get_varint(buf, pos)?))
    }
}

impl TreeKey for Vec<u8> {
    const KIND: KeyKind = KeyKind::Textual;

    fn encode(&self, out: &mut Vec<u8>) {
        put_varint(out, self.len() as u64);
        out.extend_from_slice(self);
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let len = get_varint(buf, pos)? as usize;
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                StorageError::Corruption(format!(
                    "Textual key of {} bytes runs past its node ({} bytes)",
                    len,
                    buf.len()
                ))
            })?;
        let key = buf[*pos..end].to_vec();
        *pos = end;
        Ok(key)
    }
}
