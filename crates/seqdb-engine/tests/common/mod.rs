//! Shared helpers for the engine integration tests: document builders that
//! produce the same pre-compressed `(docs, meta)` block pairs the bulk
//! ingestor sends, and a manager factory with test-friendly sizing.

// not every test binary uses every helper
#![allow(dead_code)]

use std::sync::Arc;

use bytes::BytesMut;

use seqdb_core::doc::{encode_docs_payload, MetaData, Token, Tokenizer};
use seqdb_core::SeqId;
use seqdb_engine::config::EngineConfig;
use seqdb_engine::manager::FracManager;
use seqdb_storage::block;

pub struct TestDoc {
    pub id: SeqId,
    pub body: Vec<u8>,
    pub tokens: Vec<Token>,
}

/// A log document with keyword-tokenized fields.
pub fn keyword_doc(mid: u64, rid: u64, fields: &[(&str, &str)]) -> TestDoc {
    let body = render_body(fields);
    let mut tokens = Vec::new();
    let tokenizer = Tokenizer::keyword();
    for &(field, value) in fields {
        tokenizer.tokenize(field.as_bytes(), value.as_bytes(), &mut tokens);
    }
    TestDoc {
        id: SeqId::new(mid, rid),
        body,
        tokens,
    }
}

/// Same, with one path-tokenized field appended.
pub fn path_doc(mid: u64, rid: u64, field: &str, value: &str) -> TestDoc {
    let body = render_body(&[(field, value)]);
    let mut tokens = Vec::new();
    Tokenizer::path().tokenize(field.as_bytes(), value.as_bytes(), &mut tokens);
    TestDoc {
        id: SeqId::new(mid, rid),
        body,
        tokens,
    }
}

fn render_body(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = String::from("{");
    for (i, (field, value)) in fields.iter().enumerate() {
        if i > 0 {
            body.push(',');
        }
        body.push_str(&format!("\"{field}\":\"{value}\""));
    }
    body.push('}');
    body.into_bytes()
}

/// Build the `(docs_block, meta_block)` pair for one bulk of documents.
pub fn build_blocks(docs: &[TestDoc]) -> (Vec<u8>, Vec<u8>) {
    let bodies: Vec<&[u8]> = docs.iter().map(|d| d.body.as_slice()).collect();
    let docs_payload = encode_docs_payload(&bodies);
    let docs_block =
        block::compress_block(&docs_payload, 1, docs_payload.len() as u64, 0).unwrap();

    let mut meta_payload = BytesMut::new();
    for doc in docs {
        let meta = MetaData {
            id: doc.id,
            size: doc.body.len() as u32,
            tokens: doc.tokens.clone(),
        };
        meta.encode(&mut meta_payload);
    }
    let meta_block = block::compress_block(&meta_payload, 1, 0, 0).unwrap();
    (docs_block, meta_block)
}

pub fn test_config(data_dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::new(data_dir);
    config.maintenance_delay = std::time::Duration::from_millis(50);
    config.cache_gc_delay = std::time::Duration::from_millis(50);
    config.indexer_workers = 2;
    config.reader_workers = 8;
    config.skip_fsync = true;
    config
}

pub async fn start_manager(config: EngineConfig) -> Arc<FracManager> {
    let manager = FracManager::new(config, None);
    manager.load().await.unwrap();
    manager
}

/// Append docs in bulks of `bulk_size` and wait for indexing to drain.
pub async fn ingest(manager: &Arc<FracManager>, docs: &[TestDoc], bulk_size: usize) {
    for bulk in docs.chunks(bulk_size) {
        let (docs_block, meta_block) = build_blocks(bulk);
        manager.append(docs_block, meta_block).await.unwrap();
    }
    manager.wait_idle().await;
}
