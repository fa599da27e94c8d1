//! Document Metadata and Tokenizers
//!
//! A document enters the engine as an opaque byte payload plus a typed
//! metadata record: `{id, size, tokens}`. The payload is stored verbatim in
//! the docs file; the metadata drives indexing.
//!
//! ## Wire format
//!
//! A docs block payload is a concatenation of `u32 len || doc_bytes` records.
//! A meta block payload mirrors it one-to-one with `u32 len || meta_record`
//! entries, where a meta record is:
//!
//! ```text
//! mid          u64 le
//! rid          u64 le
//! size         u32 le        (raw document size in bytes)
//! token_count  u32 le
//! repeated:    field_len u32 le, field, val_len u32 le, val
//! ```
//!
//! ## Tokenizers
//!
//! Tokens are produced per-field by tokenizers:
//!
//! - **keyword**: the whole value as a single token;
//! - **text**: split on non-alphanumeric runs, overlong tokens dropped;
//! - **path**: hierarchical prefixes, so `/one/two/three` also matches the
//!   queries `/one` and `/one/two`;
//! - **exists**: a `_exists_` marker token per indexed field.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::ids::{Mid, SeqId};
use crate::varint::Decoder;

/// Field name under which per-field existence markers are indexed.
pub const EXISTS_FIELD: &[u8] = b"_exists_";

/// Default cap on a single token's byte length.
pub const DEFAULT_MAX_TOKEN_SIZE: usize = 72;

/// A single `(field, value)` index token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    pub field: Vec<u8>,
    pub value: Vec<u8>,
}

impl Token {
    pub fn new(field: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Token {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Typed metadata of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaData {
    pub id: SeqId,
    pub size: u32,
    pub tokens: Vec<Token>,
}

impl MetaData {
    /// Append this record to a meta block payload, including the length prefix.
    pub fn encode(&self, buf: &mut BytesMut) {
        let len_pos = buf.len();
        buf.put_u32_le(0); // patched below

        buf.put_u64_le(self.id.mid);
        buf.put_u64_le(self.id.rid);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.tokens.len() as u32);
        for token in &self.tokens {
            buf.put_u32_le(token.field.len() as u32);
            buf.put_slice(&token.field);
            buf.put_u32_le(token.value.len() as u32);
            buf.put_slice(&token.value);
        }

        let record_len = (buf.len() - len_pos - 4) as u32;
        buf[len_pos..len_pos + 4].copy_from_slice(&record_len.to_le_bytes());
    }

    fn decode_record(dec: &mut Decoder<'_>) -> Result<MetaData> {
        let mid = dec.get_u64_le()?;
        let rid = dec.get_u64_le()?;
        let size = dec.get_u32_le()?;
        let token_count = dec.get_u32_le()?;

        let mut tokens = Vec::with_capacity(token_count as usize);
        for _ in 0..token_count {
            let field = dec.get_binary()?.to_vec();
            let value = dec.get_binary()?.to_vec();
            tokens.push(Token { field, value });
        }

        Ok(MetaData {
            id: SeqId::new(mid, rid),
            size,
            tokens,
        })
    }
}

/// Decode a whole meta block payload into records.
pub fn decode_meta_block(payload: &[u8]) -> Result<Vec<MetaData>> {
    let mut dec = Decoder::new(payload);
    let mut metas = Vec::new();
    while !dec.is_empty() {
        let record = dec.get_binary()?;
        let mut rec_dec = Decoder::new(record);
        let meta = MetaData::decode_record(&mut rec_dec)?;
        if !rec_dec.is_empty() {
            return Err(Error::corrupted("trailing bytes in meta record"));
        }
        metas.push(meta);
    }
    Ok(metas)
}

/// Build a docs block payload from raw document bodies.
pub fn encode_docs_payload(docs: &[&[u8]]) -> BytesMut {
    let mut buf = BytesMut::new();
    for doc in docs {
        buf.put_u32_le(doc.len() as u32);
        buf.put_slice(doc);
    }
    buf
}

/// Extract the document starting at `offset` inside a decompressed docs
/// block payload.
pub fn doc_at_offset(payload: &[u8], offset: usize) -> Result<&[u8]> {
    if offset + 4 > payload.len() {
        return Err(Error::corrupted("doc offset out of block bounds"));
    }
    let len = u32::from_le_bytes([
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ]) as usize;
    let start = offset + 4;
    if start + len > payload.len() {
        return Err(Error::corrupted("doc length out of block bounds"));
    }
    Ok(&payload[start..start + len])
}

/// Clamp a document MID against allowed clock drift: timestamps older than
/// `past_drift_ms` or further ahead than `future_drift_ms` are rewritten to
/// `now`.
pub fn clamp_mid(mid: Mid, now: Mid, past_drift_ms: u64, future_drift_ms: u64) -> Mid {
    if mid + past_drift_ms < now || mid > now + future_drift_ms {
        return now;
    }
    mid
}

/// Per-field tokenizer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    Keyword,
    Text,
    Path,
    Exists,
}

/// Field tokenizer: turns one `(field, value)` pair into index tokens.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    kind: TokenizerKind,
    max_token_size: usize,
    case_sensitive: bool,
}

impl Tokenizer {
    pub fn new(kind: TokenizerKind, max_token_size: usize, case_sensitive: bool) -> Self {
        Tokenizer {
            kind,
            max_token_size,
            case_sensitive,
        }
    }

    pub fn keyword() -> Self {
        Self::new(TokenizerKind::Keyword, DEFAULT_MAX_TOKEN_SIZE, false)
    }

    pub fn text() -> Self {
        Self::new(TokenizerKind::Text, DEFAULT_MAX_TOKEN_SIZE, false)
    }

    pub fn path() -> Self {
        Self::new(TokenizerKind::Path, DEFAULT_MAX_TOKEN_SIZE, false)
    }

    pub fn exists() -> Self {
        Self::new(TokenizerKind::Exists, DEFAULT_MAX_TOKEN_SIZE, true)
    }

    fn normalize(&self, value: &[u8]) -> Vec<u8> {
        if self.case_sensitive {
            value.to_vec()
        } else {
            value.to_ascii_lowercase()
        }
    }

    /// Tokenize `value` for `field`, pushing tokens into `out`. Every
    /// tokenizer except `exists` also emits the existence marker for the
    /// field.
    pub fn tokenize(&self, field: &[u8], value: &[u8], out: &mut Vec<Token>) {
        match self.kind {
            TokenizerKind::Keyword => {
                let v = self.normalize(value);
                if v.len() <= self.max_token_size {
                    out.push(Token::new(field, v));
                }
                out.push(Token::new(EXISTS_FIELD, field));
            }
            TokenizerKind::Text => {
                let v = self.normalize(value);
                for part in v.split(|b: &u8| !b.is_ascii_alphanumeric()) {
                    if part.is_empty() || part.len() > self.max_token_size {
                        continue;
                    }
                    out.push(Token::new(field, part));
                }
                out.push(Token::new(EXISTS_FIELD, field));
            }
            TokenizerKind::Path => {
                let v = self.normalize(value);
                // every hierarchical prefix is a token: /a/b/c -> /a, /a/b, /a/b/c
                for (i, &b) in v.iter().enumerate() {
                    if b == b'/' && i > 0 {
                        let prefix = &v[..i];
                        if prefix.len() <= self.max_token_size {
                            out.push(Token::new(field, prefix));
                        }
                    }
                }
                if !v.is_empty() && v.len() <= self.max_token_size {
                    out.push(Token::new(field, v));
                }
                out.push(Token::new(EXISTS_FIELD, field));
            }
            TokenizerKind::Exists => {
                out.push(Token::new(EXISTS_FIELD, field));
            }
        }
    }
}
