//! External RediSearch vector sink.
//!
//! One logical index per file (`FT.CREATE ... PREFIX <file_name>:`), one
//! hash per chunk keyed `<file_name>:<paragraph_id>:<chunk_idx>`. Writes go
//! through a single pipelined `HSET` batch; `HSET` on an existing key is the
//! upsert that makes retries safe. Dedup scans every key under the file's
//! prefix, which is O(n) over the file's chunks. That is acceptable for
//! moderate per-file paragraph counts and a scaling assumption to validate
//! before pointing this at very large documents.

use super::{ScoredChunk, SearchQuery, VectorSink};
use crate::paragraph::ParagraphVector;
use crate::registry::FileRecord;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Value;
use std::collections::{HashMap, HashSet};

/// RediSearch-backed [`VectorSink`].
///
/// Cheap to clone; the [`ConnectionManager`] multiplexes and reconnects
/// under the hood.
#[derive(Clone)]
pub struct RedisVectorSink {
    conn: ConnectionManager,
}

impl RedisVectorSink {
    /// Connect to the Redis server at `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        tracing::info!("Connected to Redis vector sink");
        Ok(Self { conn })
    }

    fn key_prefix(file: &FileRecord) -> String {
        format!("{}:", file.file_name)
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Value> = redis::cmd("FT.INFO")
            .arg(index)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string().to_lowercase();
                if message.contains("unknown index") || message.contains("no such index") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

fn embedding_bytes(embedding: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice::<f32, u8>(embedding).to_vec()
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Double(d) => Some(d.to_string()),
        _ => None,
    }
}

/// Parse a raw `FT.SEARCH` reply:
/// `[total, key1, [field, value, ...], key2, [...], ...]`.
fn parse_search_reply(reply: &Value, prefix: &str) -> Vec<ScoredChunk> {
    let Value::Array(items) = reply else {
        return Vec::new();
    };

    let mut chunks = Vec::new();
    let mut i = 1;
    while i + 1 < items.len() {
        let Some(key) = value_as_string(&items[i]) else {
            i += 2;
            continue;
        };
        let Value::Array(field_items) = &items[i + 1] else {
            i += 2;
            continue;
        };

        let mut fields: HashMap<String, String> = HashMap::new();
        for pair in field_items.chunks(2) {
            if let [name, value] = pair {
                if let (Some(name), Some(value)) = (value_as_string(name), value_as_string(value))
                {
                    fields.insert(name, value);
                }
            }
        }

        let suffix = key.strip_prefix(prefix).unwrap_or(&key);
        let (paragraph_id, chunk_idx) = match suffix.rsplit_once(':') {
            Some((id, idx)) => (id.to_string(), idx.parse().unwrap_or(0)),
            None => (suffix.to_string(), 0),
        };

        chunks.push(ScoredChunk {
            paragraph_id,
            chunk_idx,
            text: fields.get("text").cloned().unwrap_or_default(),
            score: fields
                .get("score")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            page_n: fields.get("page_n").and_then(|s| s.parse().ok()),
        });
        i += 2;
    }
    chunks
}

#[async_trait]
impl VectorSink for RedisVectorSink {
    async fn existing_paragraph_ids(&self, file: &FileRecord) -> Result<HashSet<String>> {
        let prefix = Self::key_prefix(file);
        let pattern = format!("{prefix}*");
        let mut conn = self.conn.clone();

        let mut ids = HashSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(512)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                if let Some(suffix) = key.strip_prefix(&prefix) {
                    let id = suffix.rsplit_once(':').map(|(id, _)| id).unwrap_or(suffix);
                    ids.insert(id.to_string());
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(ids)
    }

    async fn ensure_collection(&self, file: &FileRecord, dimension: usize) -> Result<String> {
        let index = file.file_name.clone();
        if self.index_exists(&index).await? {
            return Ok(index);
        }

        let prefix = Self::key_prefix(file);
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Value> = redis::cmd("FT.CREATE")
            .arg(&index)
            .arg("ON")
            .arg("HASH")
            .arg("PREFIX")
            .arg(1)
            .arg(&prefix)
            .arg("SCHEMA")
            .arg("vector")
            .arg("VECTOR")
            .arg("FLAT")
            .arg(6)
            .arg("TYPE")
            .arg("FLOAT32")
            .arg("DIM")
            .arg(dimension)
            .arg("DISTANCE_METRIC")
            .arg("COSINE")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                tracing::info!("Created vector index {index} (dimension {dimension})");
                Ok(index)
            }
            // A concurrent creator is fine; the index is there either way
            Err(e) if e.to_string().to_lowercase().contains("index already exists") => Ok(index),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_vectors(&self, file: &FileRecord, vectors: &[ParagraphVector]) -> Result<()> {
        let prefix = Self::key_prefix(file);
        let mut pipe = redis::pipe();
        let mut written = 0usize;

        for vector in vectors {
            let embedding = vector
                .embedding
                .as_ref()
                .ok_or_else(|| anyhow!("Vector for {} has no embedding", vector.paragraph_id))?;

            let key = format!("{prefix}{}:{}", vector.paragraph_id, vector.chunk_idx);
            pipe.cmd("HSET")
                .arg(&key)
                .arg("vector")
                .arg(embedding_bytes(embedding))
                .arg("text")
                .arg(&vector.text)
                .arg("page_n")
                .arg(vector.page_n)
                .arg("idx")
                .arg(vector.chunk_idx)
                .arg("paragraph_box")
                .arg(serde_json::to_string(&vector.paragraph_box)?)
                .arg("file_name")
                .arg(&file.file_name)
                .arg("file_name_orig")
                .arg(&file.file_name_orig)
                .ignore();
            written += 1;
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        tracing::debug!("Pipelined {written} vectors under prefix {prefix}");
        Ok(())
    }

    async fn search(
        &self,
        file: &FileRecord,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let vector = query
            .vector
            .as_ref()
            .ok_or_else(|| anyhow!("Redis searches require a query vector"))?;

        let index = &file.file_name;
        if !self.index_exists(index).await? {
            return Ok(Vec::new());
        }

        let knn = format!("*=>[KNN {limit} @vector $query_vec AS score]");
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("FT.SEARCH")
            .arg(index)
            .arg(&knn)
            .arg("PARAMS")
            .arg(2)
            .arg("query_vec")
            .arg(embedding_bytes(vector))
            .arg("SORTBY")
            .arg("score")
            .arg("ASC")
            .arg("DIALECT")
            .arg(2)
            .query_async(&mut conn)
            .await?;

        Ok(parse_search_reply(&reply, &Self::key_prefix(file)))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
