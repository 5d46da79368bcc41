//! `StorageBackend` implementation over libsql/Turso, with brute-force
//! cosine similarity standing in for an ANN index (spec.md §9's own
//! "sequential fallback" design note; SPEC_FULL.md §3, §9).

use crate::codec::{decode_embedding, decode_json, encode_embedding, encode_json};
use crate::migrations;
use crate::pool::{ConnectionPool, PoolConfig};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use libsql::{params, Builder, Database, Rows};
use memfuse_core::embeddings::cosine_similarity;
use memfuse_core::error::{Error, Result};
use memfuse_core::storage::{ScoredMatch, StorageBackend};
use memfuse_core::types::{Chunk, Fact, FactRelations, FactType, Lesson, LessonStatus, Speaker, Turn, Workflow, WorkflowStep};
use std::sync::Arc;
use uuid::Uuid;

/// A libsql-backed store. Owns a bounded [`ConnectionPool`] and checks a
/// connection out for each call rather than holding one long-lived.
pub struct TursoStorage {
    pool: ConnectionPool,
}

impl TursoStorage {
    /// Open (creating if absent) a local libsql database file and run
    /// migrations.
    pub async fn open_local(path: impl AsRef<std::path::Path>, pool_size: usize) -> Result<Self> {
        let db: Database = Builder::new_local(path.as_ref())
            .build()
            .await
            .map_err(|e| Error::Storage(format!("failed to open database: {e}")))?;

        let config = PoolConfig { max_connections: pool_size.max(1), ..PoolConfig::default() };
        let pool = ConnectionPool::new(Arc::new(db), config).await?;

        let conn = pool.get().await?.into_inner()?;
        migrations::run(&conn).await?;

        Ok(Self { pool })
    }
}

fn timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn speaker_str(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::User => "user",
        Speaker::Assistant => "assistant",
    }
}

fn parse_speaker(raw: &str) -> Result<Speaker> {
    match raw {
        "user" => Ok(Speaker::User),
        "assistant" => Ok(Speaker::Assistant),
        other => Err(Error::Storage(format!("unknown speaker: {other}"))),
    }
}

fn fact_type_str(fact_type: FactType) -> &'static str {
    match fact_type {
        FactType::Fact => "fact",
        FactType::Decision => "decision",
        FactType::Assumption => "assumption",
        FactType::UserPreference => "user_preference",
    }
}

fn parse_fact_type(raw: &str) -> Result<FactType> {
    match raw {
        "fact" => Ok(FactType::Fact),
        "decision" => Ok(FactType::Decision),
        "assumption" => Ok(FactType::Assumption),
        "user_preference" => Ok(FactType::UserPreference),
        other => Err(Error::Storage(format!("unknown fact type: {other}"))),
    }
}

fn lesson_status_str(status: LessonStatus) -> &'static str {
    match status {
        LessonStatus::Success => "success",
        LessonStatus::Fail => "fail",
    }
}

async fn collect_chunk_rows(mut rows: Rows) -> Result<Vec<Chunk>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(|e| Error::Storage(e.to_string()))? {
        let embedding_bytes: Vec<u8> = row.get(3).map_err(|e| Error::Storage(e.to_string()))?;
        out.push(Chunk {
            chunk_id: Uuid::parse_str(&row.get::<String>(0).map_err(|e| Error::Storage(e.to_string()))?)
                .map_err(|e| Error::Storage(e.to_string()))?,
            document_source: row.get(1).map_err(|e| Error::Storage(e.to_string()))?,
            content: row.get(2).map_err(|e| Error::Storage(e.to_string()))?,
            embedding: decode_embedding(&embedding_bytes)?,
            content_hash: row.get(4).map_err(|e| Error::Storage(e.to_string()))?,
        });
    }
    Ok(out)
}

async fn collect_fact_rows(mut rows: Rows) -> Result<Vec<Fact>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(|e| Error::Storage(e.to_string()))? {
        let embedding_bytes: Vec<u8> = row.get(7).map_err(|e| Error::Storage(e.to_string()))?;
        let relations_raw: String = row.get(4).map_err(|e| Error::Storage(e.to_string()))?;
        let metadata_raw: String = row.get(5).map_err(|e| Error::Storage(e.to_string()))?;
        let fact_type_raw: String = row.get(3).map_err(|e| Error::Storage(e.to_string()))?;
        out.push(Fact {
            fact_id: Uuid::parse_str(&row.get::<String>(0).map_err(|e| Error::Storage(e.to_string()))?)
                .map_err(|e| Error::Storage(e.to_string()))?,
            session_id: Uuid::parse_str(&row.get::<String>(1).map_err(|e| Error::Storage(e.to_string()))?)
                .map_err(|e| Error::Storage(e.to_string()))?,
            source_round_id: row.get(2).map_err(|e| Error::Storage(e.to_string()))?,
            fact_type: parse_fact_type(&fact_type_raw)?,
            content: row.get(6).map_err(|e| Error::Storage(e.to_string()))?,
            relations: decode_json::<FactRelations>(&relations_raw)?,
            metadata: decode_json(&metadata_raw)?,
            embedding: decode_embedding(&embedding_bytes)?,
            created_at: from_timestamp(row.get(8).map_err(|e| Error::Storage(e.to_string()))?),
        });
    }
    Ok(out)
}

#[async_trait]
impl StorageBackend for TursoStorage {
    async fn get_or_create_session(&self, session_key: &str) -> Result<Uuid> {
        let conn = self.pool.get().await?.into_inner()?;

        let mut rows = conn
            .query("SELECT session_id FROM sessions WHERE session_key = ?1", params![session_key])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        if let Some(row) = rows.next().await.map_err(|e| Error::Storage(e.to_string()))? {
            let id: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
            return Uuid::parse_str(&id).map_err(|e| Error::Storage(e.to_string()));
        }

        let new_id = Uuid::new_v4();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id, session_key) VALUES (?1, ?2)",
            params![new_id.to_string(), session_key],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let mut rows = conn
            .query("SELECT session_id FROM sessions WHERE session_key = ?1", params![session_key])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?
            .ok_or_else(|| Error::Storage("session insert did not persist".to_string()))?;
        let id: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
        Uuid::parse_str(&id).map_err(|e| Error::Storage(e.to_string()))
    }

    async fn next_round_id(&self, session_id: Uuid) -> Result<i64> {
        let conn = self.pool.get().await?.into_inner()?;
        let mut rows = conn
            .query(
                "SELECT COALESCE(MAX(round_id), -1) FROM turns WHERE session_id = ?1",
                params![session_id.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        let row = rows.next().await.map_err(|e| Error::Storage(e.to_string()))?;
        let max: i64 = row.map_or(Ok(-1), |r| r.get(0)).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(max + 1)
    }

    async fn insert_turn(&self, turn: &Turn) -> Result<()> {
        let conn = self.pool.get().await?.into_inner()?;
        conn.execute(
            "INSERT INTO turns (session_id, round_id, speaker, content, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                turn.session_id.to_string(),
                turn.round_id,
                speaker_str(turn.speaker),
                turn.content.clone(),
                timestamp(turn.timestamp)
            ],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn recent_turns(&self, session_id: Uuid, limit: usize) -> Result<Vec<Turn>> {
        let conn = self.pool.get().await?.into_inner()?;
        let mut rows = conn
            .query(
                "SELECT session_id, round_id, speaker, content, timestamp FROM turns \
                 WHERE session_id = ?1 ORDER BY round_id DESC LIMIT ?2",
                params![session_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| Error::Storage(e.to_string()))? {
            let speaker_raw: String = row.get(2).map_err(|e| Error::Storage(e.to_string()))?;
            out.push(Turn {
                session_id: Uuid::parse_str(&row.get::<String>(0).map_err(|e| Error::Storage(e.to_string()))?)
                    .map_err(|e| Error::Storage(e.to_string()))?,
                round_id: row.get(1).map_err(|e| Error::Storage(e.to_string()))?,
                speaker: parse_speaker(&speaker_raw)?,
                content: row.get(3).map_err(|e| Error::Storage(e.to_string()))?,
                timestamp: from_timestamp(row.get(4).map_err(|e| Error::Storage(e.to_string()))?),
            });
        }
        Ok(out)
    }

    async fn upsert_chunk(&self, chunk: &Chunk) -> Result<bool> {
        let conn = self.pool.get().await?.into_inner()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO document_chunks (chunk_id, document_source, content, embedding, content_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    chunk.chunk_id.to_string(),
                    chunk.document_source.clone(),
                    chunk.content.clone(),
                    encode_embedding(&chunk.embedding),
                    chunk.content_hash.clone()
                ],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn search_chunks(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        document_source: Option<&str>,
        _sequential: bool,
    ) -> Result<Vec<ScoredMatch<Chunk>>> {
        let conn = self.pool.get().await?.into_inner()?;
        let rows = if let Some(source) = document_source {
            conn.query(
                "SELECT chunk_id, document_source, content, embedding, content_hash \
                 FROM document_chunks WHERE document_source = ?1",
                params![source],
            )
            .await
        } else {
            conn.query(
                "SELECT chunk_id, document_source, content, embedding, content_hash FROM document_chunks",
                (),
            )
            .await
        }
        .map_err(|e| Error::Storage(e.to_string()))?;

        let chunks = collect_chunk_rows(rows).await?;
        Ok(top_k_by_similarity(chunks, query_embedding, top_k, |c| &c.embedding))
    }

    async fn insert_fact(&self, fact: &Fact) -> Result<Option<Uuid>> {
        let conn = self.pool.get().await?.into_inner()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO structured_memory \
                 (fact_id, session_id, source_round_id, type, content, relations, metadata, embedding, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    fact.fact_id.to_string(),
                    fact.session_id.to_string(),
                    fact.source_round_id,
                    fact_type_str(fact.fact_type),
                    fact.content.clone(),
                    encode_json(&fact.relations)?,
                    encode_json(&fact.metadata)?,
                    encode_embedding(&fact.embedding),
                    timestamp(fact.created_at)
                ],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok((changed > 0).then_some(fact.fact_id))
    }

    async fn search_facts(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        session_id: Option<Uuid>,
        fact_type: Option<FactType>,
    ) -> Result<Vec<ScoredMatch<Fact>>> {
        let conn = self.pool.get().await?.into_inner()?;
        let base = "SELECT fact_id, session_id, source_round_id, type, relations, metadata, content, embedding, created_at FROM structured_memory";

        let rows = match (session_id, fact_type) {
            (Some(session_id), Some(fact_type)) => {
                conn.query(
                    &format!("{base} WHERE session_id = ?1 AND type = ?2"),
                    params![session_id.to_string(), fact_type_str(fact_type)],
                )
                .await
            }
            (Some(session_id), None) => {
                conn.query(&format!("{base} WHERE session_id = ?1"), params![session_id.to_string()]).await
            }
            (None, Some(fact_type)) => {
                conn.query(&format!("{base} WHERE type = ?1"), params![fact_type_str(fact_type)]).await
            }
            (None, None) => conn.query(base, ()).await,
        }
        .map_err(|e| Error::Storage(e.to_string()))?;

        let facts = collect_fact_rows(rows).await?;
        Ok(top_k_by_similarity(facts, query_embedding, top_k, |f| &f.embedding))
    }

    async fn keyword_search_facts(
        &self,
        tokens: &[String],
        top_k: usize,
        session_id: Option<Uuid>,
    ) -> Result<Vec<ScoredMatch<Fact>>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.pool.get().await?.into_inner()?;
        let base = "SELECT fact_id, session_id, source_round_id, type, relations, metadata, content, embedding, created_at FROM structured_memory";
        let rows = match session_id {
            Some(session_id) => {
                conn.query(&format!("{base} WHERE session_id = ?1"), params![session_id.to_string()]).await
            }
            None => conn.query(base, ()).await,
        }
        .map_err(|e| Error::Storage(e.to_string()))?;

        let facts = collect_fact_rows(rows).await?;
        let lowered_tokens: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();

        let mut scored: Vec<ScoredMatch<Fact>> = facts
            .into_iter()
            .filter_map(|fact| {
                let content_lower = fact.content.to_lowercase();
                let hits = lowered_tokens.iter().filter(|token| content_lower.contains(token.as_str())).count();
                if hits == 0 {
                    return None;
                }
                let score = hits as f32 / lowered_tokens.len() as f32;
                Some(ScoredMatch { item: fact, score })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn facts_by_session_and_type(&self, session_id: Uuid, fact_type: FactType) -> Result<Vec<Fact>> {
        let conn = self.pool.get().await?.into_inner()?;
        let rows = conn
            .query(
                "SELECT fact_id, session_id, source_round_id, type, relations, metadata, content, embedding, created_at \
                 FROM structured_memory WHERE session_id = ?1 AND type = ?2",
                params![session_id.to_string(), fact_type_str(fact_type)],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        collect_fact_rows(rows).await
    }

    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let conn = self.pool.get().await?.into_inner()?;
        conn.execute(
            "INSERT INTO procedural_memory \
             (workflow_id, trigger_embedding, trigger_pattern, successful_workflow, usage_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(workflow_id) DO UPDATE SET \
             successful_workflow = excluded.successful_workflow, \
             usage_count = excluded.usage_count, \
             updated_at = excluded.updated_at",
            params![
                workflow.workflow_id.to_string(),
                encode_embedding(&workflow.trigger_embedding),
                workflow.trigger_pattern.clone(),
                encode_json(&workflow.successful_workflow)?,
                workflow.usage_count as i64,
                timestamp(workflow.created_at),
                timestamp(workflow.updated_at)
            ],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn search_workflows(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<ScoredMatch<Workflow>>> {
        let conn = self.pool.get().await?.into_inner()?;
        let mut rows = conn
            .query(
                "SELECT workflow_id, trigger_embedding, trigger_pattern, successful_workflow, usage_count, created_at, updated_at \
                 FROM procedural_memory",
                (),
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut workflows = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| Error::Storage(e.to_string()))? {
            let embedding_bytes: Vec<u8> = row.get(1).map_err(|e| Error::Storage(e.to_string()))?;
            let steps_raw: String = row.get(3).map_err(|e| Error::Storage(e.to_string()))?;
            workflows.push(Workflow {
                workflow_id: Uuid::parse_str(&row.get::<String>(0).map_err(|e| Error::Storage(e.to_string()))?)
                    .map_err(|e| Error::Storage(e.to_string()))?,
                trigger_embedding: decode_embedding(&embedding_bytes)?,
                trigger_pattern: row.get(2).map_err(|e| Error::Storage(e.to_string()))?,
                successful_workflow: decode_json::<Vec<WorkflowStep>>(&steps_raw)?,
                usage_count: row.get::<i64>(4).map_err(|e| Error::Storage(e.to_string()))? as u64,
                created_at: from_timestamp(row.get(5).map_err(|e| Error::Storage(e.to_string()))?),
                updated_at: from_timestamp(row.get(6).map_err(|e| Error::Storage(e.to_string()))?),
            });
        }

        Ok(top_k_by_similarity(workflows, query_embedding, top_k, |w| &w.trigger_embedding))
    }

    async fn record_workflow_reuse(&self, workflow_id: Uuid) -> Result<()> {
        let conn = self.pool.get().await?.into_inner()?;
        conn.execute(
            "UPDATE procedural_memory SET usage_count = usage_count + 1, updated_at = ?2 WHERE workflow_id = ?1",
            params![workflow_id.to_string(), Utc::now().timestamp()],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> Result<()> {
        let conn = self.pool.get().await?.into_inner()?;
        conn.execute(
            "INSERT INTO procedural_lessons \
             (lesson_id, trigger_embedding, goal_text, agent, status, error, fix_summary, working_params, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                lesson.lesson_id.to_string(),
                encode_embedding(&lesson.trigger_embedding),
                lesson.goal_text.clone(),
                lesson.agent.clone(),
                lesson_status_str(lesson.status),
                lesson.error.clone(),
                lesson.fix_summary.clone(),
                lesson.working_params.as_ref().map(encode_json).transpose()?,
                timestamp(lesson.created_at)
            ],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn last_extracted_round(&self, session_id: Uuid) -> Result<Option<i64>> {
        let conn = self.pool.get().await?.into_inner()?;
        let mut rows = conn
            .query(
                "SELECT last_extracted_round_id FROM extraction_markers WHERE session_id = ?1",
                params![session_id.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await.map_err(|e| Error::Storage(e.to_string()))? {
            Some(row) => Ok(Some(row.get(0).map_err(|e| Error::Storage(e.to_string()))?)),
            None => Ok(None),
        }
    }

    async fn set_last_extracted_round(&self, session_id: Uuid, round_id: i64) -> Result<()> {
        let conn = self.pool.get().await?.into_inner()?;
        conn.execute(
            "INSERT INTO extraction_markers (session_id, last_extracted_round_id) VALUES (?1, ?2) \
             ON CONFLICT(session_id) DO UPDATE SET last_extracted_round_id = excluded.last_extracted_round_id",
            params![session_id.to_string(), round_id],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn enqueue_extraction(&self, session_id: Uuid, round_id: i64) -> Result<()> {
        let conn = self.pool.get().await?.into_inner()?;
        conn.execute(
            "INSERT OR IGNORE INTO extraction_queue (session_id, round_id) VALUES (?1, ?2)",
            params![session_id.to_string(), round_id],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn pending_extractions(&self, limit: usize) -> Result<Vec<(Uuid, i64)>> {
        let conn = self.pool.get().await?.into_inner()?;
        let mut rows = conn
            .query(
                "SELECT session_id, round_id FROM extraction_queue WHERE status = 'pending' \
                 ORDER BY enqueued_at ASC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| Error::Storage(e.to_string()))? {
            let session_id: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
            let round_id: i64 = row.get(1).map_err(|e| Error::Storage(e.to_string()))?;
            out.push((Uuid::parse_str(&session_id).map_err(|e| Error::Storage(e.to_string()))?, round_id));
        }
        Ok(out)
    }

    async fn complete_extraction(&self, session_id: Uuid, round_id: i64, succeeded: bool) -> Result<()> {
        let conn = self.pool.get().await?.into_inner()?;
        let status = if succeeded { "succeeded" } else { "failed" };
        conn.execute(
            "UPDATE extraction_queue SET status = ?3, attempts = attempts + 1 \
             WHERE session_id = ?1 AND round_id = ?2",
            params![session_id.to_string(), round_id, status],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn chunks_since(&self, since: DateTime<Utc>) -> Result<Vec<Chunk>> {
        let conn = self.pool.get().await?.into_inner()?;
        let rows = conn
            .query(
                "SELECT chunk_id, document_source, content, embedding, content_hash \
                 FROM document_chunks WHERE created_at >= ?1",
                params![timestamp(since)],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        collect_chunk_rows(rows).await
    }
}

fn top_k_by_similarity<T>(
    items: Vec<T>,
    query_embedding: &[f32],
    top_k: usize,
    embedding_of: impl Fn(&T) -> &Vec<f32>,
) -> Vec<ScoredMatch<T>> {
    let mut scored: Vec<ScoredMatch<T>> = items
        .into_iter()
        .map(|item| {
            let score = cosine_similarity(query_embedding, embedding_of(&item));
            ScoredMatch { item, score }
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    scored
}
