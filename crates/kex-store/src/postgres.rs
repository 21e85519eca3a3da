//! PostgreSQL store
//!
//! Graph and evidence rows are append-only: ids are deterministic and every
//! insert is `ON CONFLICT (id) DO NOTHING`, so re-running an activity is a
//! no-op. Status and batch-state changes are compare-and-set updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kex_core::{
    content_hash, Activity, ActivityRecord, ActivityStatus, Batch, BatchEvent, BatchItem,
    BatchState, BulletEvidence, DatabaseConfig, Document, DocumentVersion, Entity,
    EvidenceFilter, EvidenceKind, EvidenceQuery, EvidenceSpan, KexError, KnowledgeGraph,
    MaterializedDocument, Relation, RelationObject, Result, SignalRecord, SourceDocument,
    StatusPatch, WorkflowExecution, WorkflowStatus, validate_span,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    check_graph, sort_spans, BatchRepository, DocumentRepository, EvidenceRepository, ItemPatch,
    NewExecution, PersistReport, WorkflowRepository,
};

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> KexError {
    move |e| KexError::Database(format!("{context}: {e}"))
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a pool of `max_connections`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_error("PostgreSQL connection failed"))?;
        Ok(Self { pool })
    }

    /// Connect using `database.postgres_url`
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .postgres_url
            .as_deref()
            .ok_or_else(|| KexError::Config("database.postgres_url is not set".to_string()))?;
        Self::connect(url, config.postgres_pool_size).await
    }

    /// Create from an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| KexError::Database(format!("Migration failed: {e}")))?;
        info!("Database migrations applied");
        Ok(())
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: Uuid,
    organization_id: Uuid,
    provider_account_id: String,
    source_id: String,
    created_at: DateTime<Utc>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: row.id,
            organization_id: row.organization_id,
            provider_account_id: row.provider_account_id,
            source_id: row.source_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct VersionRow {
    id: Uuid,
    document_id: Uuid,
    organization_id: Uuid,
    version_number: i32,
    content_hash: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl From<VersionRow> for DocumentVersion {
    fn from(row: VersionRow) -> Self {
        DocumentVersion {
            id: row.id,
            document_id: row.document_id,
            organization_id: row.organization_id,
            version_number: row.version_number,
            content_hash: row.content_hash,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

const VERSION_COLUMNS: &str =
    "id, document_id, organization_id, version_number, content_hash, content, created_at";

#[derive(Debug, FromRow)]
struct EntityRow {
    id: Uuid,
    chunk_index: i32,
    mention_ids: Vec<Uuid>,
    name: String,
    types: Vec<String>,
    attributes: serde_json::Value,
    confidence: f32,
    grounding_confidence: Option<f32>,
}

impl TryFrom<EntityRow> for Entity {
    type Error = KexError;

    fn try_from(row: EntityRow) -> Result<Self> {
        Ok(Entity {
            id: row.id,
            chunk_index: row.chunk_index as usize,
            mention_ids: row.mention_ids,
            name: row.name,
            types: row.types,
            attributes: serde_json::from_value(row.attributes)?,
            confidence: row.confidence,
            grounding_confidence: row.grounding_confidence,
        })
    }
}

#[derive(Debug, FromRow)]
struct RelationRow {
    id: Uuid,
    chunk_index: i32,
    subject_id: Uuid,
    predicate: String,
    object_entity_id: Option<Uuid>,
    object_literal: Option<String>,
    confidence: f32,
    start_char: i64,
    end_char: i64,
    text: String,
    grounding_similarity: Option<f32>,
    source: String,
}

impl TryFrom<RelationRow> for Relation {
    type Error = KexError;

    fn try_from(row: RelationRow) -> Result<Self> {
        let object = match (row.object_entity_id, row.object_literal) {
            (Some(id), None) => RelationObject::Entity(id),
            (None, Some(literal)) => RelationObject::Literal(literal),
            _ => {
                return Err(KexError::Database(format!(
                    "relation {} must have exactly one object",
                    row.id
                )))
            }
        };
        Ok(Relation {
            id: row.id,
            chunk_index: row.chunk_index as usize,
            subject_id: row.subject_id,
            predicate: row.predicate,
            object,
            confidence: row.confidence,
            start: row.start_char as usize,
            end: row.end_char as usize,
            text: row.text,
            grounding_similarity: row.grounding_similarity,
            source: row.source,
        })
    }
}

#[derive(Debug, FromRow)]
struct EvidenceRow {
    kind: String,
    document_id: Uuid,
    document_version_id: Uuid,
    start_char: i64,
    end_char: i64,
    text: String,
    confidence: Option<f32>,
    source: String,
}

impl TryFrom<EvidenceRow> for EvidenceSpan {
    type Error = KexError;

    fn try_from(row: EvidenceRow) -> Result<Self> {
        let kind = match row.kind.as_str() {
            "mention" => EvidenceKind::Mention,
            "relation" => EvidenceKind::Relation,
            "bullet" => EvidenceKind::Bullet,
            other => return Err(KexError::Database(format!("unknown evidence kind: {other}"))),
        };
        Ok(EvidenceSpan {
            document_id: row.document_id,
            document_version_id: row.document_version_id,
            start_char: row.start_char as usize,
            end_char: row.end_char as usize,
            text: row.text,
            confidence: row.confidence,
            kind,
            source: row.source,
        })
    }
}

#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: Uuid,
    organization_id: Uuid,
    workflow_type: String,
    version: i32,
    status: String,
    current_activity: Option<i32>,
    checkpoint: Option<serde_json::Value>,
    input: serde_json::Value,
    output: Option<serde_json::Value>,
    error: Option<String>,
    dedupe_key: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

const EXECUTION_COLUMNS: &str = "id, organization_id, workflow_type, version, status, \
     current_activity, checkpoint, input, output, error, dedupe_key, started_at, completed_at, \
     created_at, updated_at";

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = KexError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let current_activity = match row.current_activity {
            Some(seq) => Some(Activity::from_sequence(seq).ok_or_else(|| {
                KexError::Database(format!("invalid activity sequence {seq}"))
            })?),
            None => None,
        };
        Ok(WorkflowExecution {
            id: row.id,
            organization_id: row.organization_id,
            workflow_type: row.workflow_type,
            version: row.version,
            status: row.status.parse()?,
            current_activity,
            checkpoint: row.checkpoint,
            input: row.input,
            output: row.output,
            error: row.error,
            dedupe_key: row.dedupe_key,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ActivityRow {
    id: Uuid,
    workflow_execution_id: Uuid,
    activity_name: String,
    status: String,
    attempt_number: i32,
    input: serde_json::Value,
    output: Option<serde_json::Value>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ActivityRow> for ActivityRecord {
    type Error = KexError;

    fn try_from(row: ActivityRow) -> Result<Self> {
        Ok(ActivityRecord {
            id: row.id,
            workflow_execution_id: row.workflow_execution_id,
            activity: row.activity_name.parse()?,
            status: row.status.parse()?,
            attempt_number: row.attempt_number,
            input: row.input,
            output: row.output,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SignalRow {
    id: Uuid,
    workflow_execution_id: Uuid,
    signal_name: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<SignalRow> for SignalRecord {
    fn from(row: SignalRow) -> Self {
        SignalRecord {
            id: row.id,
            workflow_execution_id: row.workflow_execution_id,
            signal_name: row.signal_name,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct BatchRow {
    id: Uuid,
    organization_id: Uuid,
    ontology_id: String,
    ontology_hash: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: Uuid,
    batch_id: Uuid,
    document_id: Uuid,
    document_version_id: Uuid,
    workflow_execution_id: Option<Uuid>,
    state: String,
    attempts: i32,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

const ITEM_COLUMNS: &str = "id, batch_id, document_id, document_version_id, \
     workflow_execution_id, state, attempts, last_error, updated_at";

impl TryFrom<ItemRow> for BatchItem {
    type Error = KexError;

    fn try_from(row: ItemRow) -> Result<Self> {
        Ok(BatchItem {
            id: row.id,
            batch_id: row.batch_id,
            document_id: row.document_id,
            document_version_id: row.document_version_id,
            workflow_execution_id: row.workflow_execution_id,
            state: row.state.parse()?,
            attempts: row.attempts,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

// ============================================================================
// Documents
// ============================================================================

#[async_trait]
impl DocumentRepository for PgStore {
    async fn materialize(&self, source: &SourceDocument) -> Result<MaterializedDocument> {
        let key = &source.key;
        let hash = content_hash(&source.content);
        let mut tx = self.pool.begin().await.map_err(db_error("Failed to begin transaction"))?;

        let inserted: Option<DocumentRow> = sqlx::query_as(
            r#"
            INSERT INTO documents (id, organization_id, provider_account_id, source_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (organization_id, provider_account_id, source_id) DO NOTHING
            RETURNING id, organization_id, provider_account_id, source_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.organization_id)
        .bind(&key.provider_account_id)
        .bind(&key.source_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to insert document"))?;
        let created_document = inserted.is_some();

        // Lock the document row so concurrent materializations number versions serially
        let document: DocumentRow = sqlx::query_as(
            r#"
            SELECT id, organization_id, provider_account_id, source_id, created_at
            FROM documents
            WHERE organization_id = $1 AND provider_account_id = $2 AND source_id = $3
            FOR UPDATE
            "#,
        )
        .bind(key.organization_id)
        .bind(&key.provider_account_id)
        .bind(&key.source_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to load document"))?;

        let latest: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM document_versions \
             WHERE document_id = $1 ORDER BY version_number DESC LIMIT 1"
        ))
        .bind(document.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to load latest version"))?;

        let (version, created_version) = match latest {
            Some(row) if row.content_hash == hash => (DocumentVersion::from(row), false),
            latest => {
                let number = latest.map_or(1, |v| v.version_number + 1);
                let row: VersionRow = sqlx::query_as(&format!(
                    "INSERT INTO document_versions \
                     (id, document_id, organization_id, version_number, content_hash, content) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING {VERSION_COLUMNS}"
                ))
                .bind(Uuid::new_v4())
                .bind(document.id)
                .bind(document.organization_id)
                .bind(number)
                .bind(&hash)
                .bind(&source.content)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error("Failed to insert document version"))?;
                (DocumentVersion::from(row), true)
            }
        };

        tx.commit().await.map_err(db_error("Failed to commit materialization"))?;
        debug!(
            document = %document.id,
            version = version.version_number,
            created_document,
            created_version,
            "Materialized document"
        );

        Ok(MaterializedDocument {
            document: document.into(),
            version,
            created_document,
            created_version,
        })
    }

    async fn get_version(
        &self,
        organization_id: Uuid,
        document_version_id: Uuid,
    ) -> Result<Option<DocumentVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM document_versions WHERE id = $1 AND organization_id = $2"
        ))
        .bind(document_version_id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get document version"))?;
        Ok(row.map(DocumentVersion::from))
    }

    async fn count_documents(&self, organization_id: Uuid) -> Result<(usize, usize)> {
        let (documents, versions): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM documents WHERE organization_id = $1),
                (SELECT COUNT(*) FROM document_versions WHERE organization_id = $1)
            "#,
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to count documents"))?;
        Ok((documents as usize, versions as usize))
    }
}

// ============================================================================
// Evidence
// ============================================================================

#[async_trait]
impl EvidenceRepository for PgStore {
    async fn persist_graph(&self, graph: &KnowledgeGraph) -> Result<PersistReport> {
        let mut tx = self.pool.begin().await.map_err(db_error("Failed to begin transaction"))?;

        let version: VersionRow = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM document_versions WHERE id = $1"
        ))
        .bind(graph.document_version_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to load document version"))?
        .ok_or_else(|| {
            KexError::NotFound(format!("document version {}", graph.document_version_id))
        })?;
        check_graph(graph, &DocumentVersion::from(version))?;

        let org = graph.organization_id;
        let version_id = graph.document_version_id;
        let mut report = PersistReport::default();

        for m in &graph.mentions {
            let result = sqlx::query(
                r#"
                INSERT INTO mentions (id, organization_id, document_version_id, chunk_index, text,
                                      start_char, end_char, candidate_types, confidence, source)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(m.id)
            .bind(org)
            .bind(version_id)
            .bind(m.chunk_index as i32)
            .bind(&m.text)
            .bind(m.start as i64)
            .bind(m.end as i64)
            .bind(&m.candidate_types)
            .bind(m.confidence)
            .bind(&m.source)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert mention"))?;
            report.mentions += result.rows_affected() as usize;
        }

        for e in &graph.entities {
            let attributes = serde_json::to_value(&e.attributes)?;
            let result = sqlx::query(
                r#"
                INSERT INTO entities (id, organization_id, document_version_id, chunk_index,
                                      mention_ids, name, types, attributes, confidence,
                                      grounding_confidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(e.id)
            .bind(org)
            .bind(version_id)
            .bind(e.chunk_index as i32)
            .bind(&e.mention_ids)
            .bind(&e.name)
            .bind(&e.types)
            .bind(attributes)
            .bind(e.confidence)
            .bind(e.grounding_confidence)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert entity"))?;
            report.entities += result.rows_affected() as usize;
        }

        for r in &graph.relations {
            let (object_entity_id, object_literal) = match &r.object {
                RelationObject::Entity(id) => (Some(*id), None),
                RelationObject::Literal(value) => (None, Some(value.as_str())),
            };
            let result = sqlx::query(
                r#"
                INSERT INTO relations (id, organization_id, document_version_id, chunk_index,
                                       subject_id, predicate, object_entity_id, object_literal,
                                       confidence, start_char, end_char, text,
                                       grounding_similarity, source)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(r.id)
            .bind(org)
            .bind(version_id)
            .bind(r.chunk_index as i32)
            .bind(r.subject_id)
            .bind(&r.predicate)
            .bind(object_entity_id)
            .bind(object_literal)
            .bind(r.confidence)
            .bind(r.start as i64)
            .bind(r.end as i64)
            .bind(&r.text)
            .bind(r.grounding_similarity)
            .bind(&r.source)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert relation"))?;
            report.relations += result.rows_affected() as usize;
        }

        for row in &graph.mention_evidence {
            let result = sqlx::query(
                r#"
                INSERT INTO mention_evidence (id, organization_id, entity_id, mention_id,
                                              document_id, document_version_id, start_char,
                                              end_char, text, confidence, extraction_id, source)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(row.organization_id)
            .bind(row.entity_id)
            .bind(row.mention_id)
            .bind(row.document_id)
            .bind(row.document_version_id)
            .bind(row.start_char as i64)
            .bind(row.end_char as i64)
            .bind(&row.text)
            .bind(row.confidence)
            .bind(row.extraction_id)
            .bind(&row.source)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert mention evidence"))?;
            report.mention_evidence += result.rows_affected() as usize;
        }

        for row in &graph.relation_evidence {
            let result = sqlx::query(
                r#"
                INSERT INTO relation_evidence (id, organization_id, relation_id, document_id,
                                               document_version_id, start_char, end_char, text,
                                               confidence, extraction_id, source)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(row.organization_id)
            .bind(row.relation_id)
            .bind(row.document_id)
            .bind(row.document_version_id)
            .bind(row.start_char as i64)
            .bind(row.end_char as i64)
            .bind(&row.text)
            .bind(row.confidence)
            .bind(row.extraction_id)
            .bind(&row.source)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert relation evidence"))?;
            report.relation_evidence += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(db_error("Failed to commit graph"))?;
        Ok(report)
    }

    async fn record_bullet_evidence(&self, rows: &[BulletEvidence]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error("Failed to begin transaction"))?;
        for row in rows {
            let version: VersionRow = sqlx::query_as(&format!(
                "SELECT {VERSION_COLUMNS} FROM document_versions \
                 WHERE id = $1 AND organization_id = $2 AND document_id = $3"
            ))
            .bind(row.document_version_id)
            .bind(row.organization_id)
            .bind(row.document_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("Failed to load document version"))?
            .ok_or_else(|| {
                KexError::NotFound(format!("document version {}", row.document_version_id))
            })?;
            validate_span(&version.content, row.start_char, row.end_char, &row.text)?;

            sqlx::query(
                r#"
                INSERT INTO bullet_evidence (id, organization_id, bullet_id, document_id,
                                             document_version_id, start_char, end_char, text,
                                             confidence, source)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(row.organization_id)
            .bind(row.bullet_id)
            .bind(row.document_id)
            .bind(row.document_version_id)
            .bind(row.start_char as i64)
            .bind(row.end_char as i64)
            .bind(&row.text)
            .bind(row.confidence)
            .bind(&row.source)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert bullet evidence"))?;
        }
        tx.commit().await.map_err(db_error("Failed to commit bullet evidence"))?;
        Ok(())
    }

    async fn list_evidence(&self, query: &EvidenceQuery) -> Result<Vec<EvidenceSpan>> {
        const COLUMNS: &str =
            "document_id, document_version_id, start_char, end_char, text, confidence, source";

        // One direct lookup per filter kind; every table carries its own document columns
        let (sql, id) = match query.filter {
            EvidenceFilter::EntityId(id) => (
                format!(
                    "SELECT 'mention' AS kind, {COLUMNS} FROM mention_evidence \
                     WHERE organization_id = $1 AND entity_id = $2"
                ),
                id,
            ),
            EvidenceFilter::RelationId(id) => (
                format!(
                    "SELECT 'relation' AS kind, {COLUMNS} FROM relation_evidence \
                     WHERE organization_id = $1 AND relation_id = $2"
                ),
                id,
            ),
            EvidenceFilter::MeetingPrepBulletId(id) => (
                format!(
                    "SELECT 'bullet' AS kind, {COLUMNS} FROM bullet_evidence \
                     WHERE organization_id = $1 AND bullet_id = $2"
                ),
                id,
            ),
            EvidenceFilter::DocumentId(id) => (
                format!(
                    "SELECT 'mention' AS kind, {COLUMNS} FROM mention_evidence \
                     WHERE organization_id = $1 AND document_id = $2 \
                     UNION ALL \
                     SELECT 'relation' AS kind, {COLUMNS} FROM relation_evidence \
                     WHERE organization_id = $1 AND document_id = $2 \
                     UNION ALL \
                     SELECT 'bullet' AS kind, {COLUMNS} FROM bullet_evidence \
                     WHERE organization_id = $1 AND document_id = $2"
                ),
                id,
            ),
        };

        let rows: Vec<EvidenceRow> = sqlx::query_as(&sql)
            .bind(query.organization_id)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list evidence"))?;

        let mut spans = rows
            .into_iter()
            .map(EvidenceSpan::try_from)
            .collect::<Result<Vec<_>>>()?;
        sort_spans(&mut spans);
        Ok(spans)
    }

    async fn list_entities(
        &self,
        organization_id: Uuid,
        document_version_id: Uuid,
    ) -> Result<Vec<Entity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            r#"
            SELECT id, chunk_index, mention_ids, name, types, attributes, confidence,
                   grounding_confidence
            FROM entities
            WHERE organization_id = $1 AND document_version_id = $2
            ORDER BY seq
            "#,
        )
        .bind(organization_id)
        .bind(document_version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list entities"))?;
        rows.into_iter().map(Entity::try_from).collect()
    }

    async fn list_relations(
        &self,
        organization_id: Uuid,
        document_version_id: Uuid,
    ) -> Result<Vec<Relation>> {
        let rows: Vec<RelationRow> = sqlx::query_as(
            r#"
            SELECT id, chunk_index, subject_id, predicate, object_entity_id, object_literal,
                   confidence, start_char, end_char, text, grounding_similarity, source
            FROM relations
            WHERE organization_id = $1 AND document_version_id = $2
            ORDER BY seq
            "#,
        )
        .bind(organization_id)
        .bind(document_version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list relations"))?;
        rows.into_iter().map(Relation::try_from).collect()
    }
}

// ============================================================================
// Workflows
// ============================================================================

#[async_trait]
impl WorkflowRepository for PgStore {
    async fn create_execution(&self, new: NewExecution) -> Result<(WorkflowExecution, bool)> {
        let inserted: Option<ExecutionRow> = sqlx::query_as(&format!(
            "INSERT INTO workflow_execution \
             (id, organization_id, workflow_type, version, status, input, dedupe_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (dedupe_key) DO NOTHING \
             RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(new.organization_id)
        .bind(&new.workflow_type)
        .bind(new.version)
        .bind(WorkflowStatus::Queued.as_str())
        .bind(&new.input)
        .bind(&new.dedupe_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to create workflow execution"))?;

        if let Some(row) = inserted {
            return Ok((row.try_into()?, true));
        }

        let existing: ExecutionRow = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_execution WHERE dedupe_key = $1"
        ))
        .bind(&new.dedupe_key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to load workflow execution"))?;
        Ok((existing.try_into()?, false))
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_execution WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get workflow execution"))?;
        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn list_executions(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowExecution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_execution \
             WHERE $1::text IS NULL OR status = $1 \
             ORDER BY created_at, id"
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list workflow executions"))?;
        rows.into_iter().map(WorkflowExecution::try_from).collect()
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
        patch: StatusPatch,
    ) -> Result<WorkflowExecution> {
        from.validate_transition(to)?;
        let clear_or_set_error = patch.error.is_some();
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "UPDATE workflow_execution SET \
                 status = $3, \
                 output = COALESCE($4, output), \
                 error = CASE WHEN $5 THEN $6 ELSE error END, \
                 started_at = CASE WHEN $7 THEN COALESCE(started_at, now()) ELSE started_at END, \
                 completed_at = CASE WHEN $8 THEN now() ELSE completed_at END, \
                 updated_at = now() \
             WHERE id = $1 AND status = $2 \
             RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(patch.output)
        .bind(clear_or_set_error)
        .bind(patch.error.flatten())
        .bind(patch.mark_started)
        .bind(patch.mark_completed)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update workflow status"))?;

        match row {
            Some(row) => row.try_into(),
            None => match self.get_execution(id).await? {
                Some(current) => Err(KexError::InvalidTransition {
                    machine: "workflow",
                    from: current.status.to_string(),
                    event: to.to_string(),
                }),
                None => Err(KexError::NotFound(format!("workflow execution {id}"))),
            },
        }
    }

    async fn complete_activity(
        &self,
        id: Uuid,
        activity: Activity,
        checkpoint: serde_json::Value,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_execution
            SET current_activity = $2, checkpoint = $3, updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND (current_activity IS NULL OR current_activity < $2)
            "#,
        )
        .bind(id)
        .bind(activity.sequence())
        .bind(&checkpoint)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to store checkpoint"))?;

        if result.rows_affected() == 0 {
            return match self.get_execution(id).await? {
                Some(current) => Err(KexError::Validation(format!(
                    "checkpoint for {activity} rejected: execution is {} at {}",
                    current.status,
                    current.current_activity.map_or("none", |a| a.as_str())
                ))),
                None => Err(KexError::NotFound(format!("workflow execution {id}"))),
            };
        }
        Ok(())
    }

    async fn start_activity(
        &self,
        execution_id: Uuid,
        activity: Activity,
        attempt_number: i32,
        input: serde_json::Value,
    ) -> Result<ActivityRecord> {
        let row: ActivityRow = sqlx::query_as(
            r#"
            INSERT INTO workflow_activity (id, workflow_execution_id, activity_name, status,
                                           attempt_number, input, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            RETURNING id, workflow_execution_id, activity_name, status, attempt_number,
                      input, output, error, started_at, completed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(execution_id)
        .bind(activity.as_str())
        .bind(ActivityStatus::Running.as_str())
        .bind(attempt_number)
        .bind(&input)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to record activity start"))?;
        row.try_into()
    }

    async fn finish_activity(
        &self,
        record_id: Uuid,
        status: ActivityStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_activity
            SET status = $2, output = $3, error = $4, completed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to record activity finish"))?;

        if result.rows_affected() == 0 {
            return Err(KexError::NotFound(format!("activity record {record_id}")));
        }
        Ok(())
    }

    async fn list_activities(&self, execution_id: Uuid) -> Result<Vec<ActivityRecord>> {
        let rows: Vec<ActivityRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_execution_id, activity_name, status, attempt_number,
                   input, output, error, started_at, completed_at
            FROM workflow_activity
            WHERE workflow_execution_id = $1
            ORDER BY seq
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list activities"))?;
        rows.into_iter().map(ActivityRecord::try_from).collect()
    }

    async fn record_signal(
        &self,
        execution_id: Uuid,
        signal_name: &str,
        payload: serde_json::Value,
    ) -> Result<SignalRecord> {
        let row: SignalRow = sqlx::query_as(
            r#"
            INSERT INTO workflow_signal (id, workflow_execution_id, signal_name, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING id, workflow_execution_id, signal_name, payload, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(execution_id)
        .bind(signal_name)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to record signal"))?;
        Ok(row.into())
    }

    async fn list_signals(&self, execution_id: Uuid) -> Result<Vec<SignalRecord>> {
        let rows: Vec<SignalRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_execution_id, signal_name, payload, created_at
            FROM workflow_signal
            WHERE workflow_execution_id = $1
            ORDER BY seq
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list signals"))?;
        Ok(rows.into_iter().map(SignalRecord::from).collect())
    }
}

// ============================================================================
// Batches
// ============================================================================

#[async_trait]
impl BatchRepository for PgStore {
    async fn create_batch(&self, batch: &Batch, items: &[BatchItem]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error("Failed to begin transaction"))?;
        sqlx::query(
            r#"
            INSERT INTO batches (id, organization_id, ontology_id, ontology_hash, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(batch.id)
        .bind(batch.organization_id)
        .bind(&batch.ontology_id)
        .bind(&batch.ontology_hash)
        .bind(batch.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to create batch"))?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO batch_items (id, batch_id, document_id, document_version_id,
                                         workflow_execution_id, state, attempts, last_error,
                                         updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(item.id)
            .bind(item.batch_id)
            .bind(item.document_id)
            .bind(item.document_version_id)
            .bind(item.workflow_execution_id)
            .bind(item.state.as_str())
            .bind(item.attempts)
            .bind(&item.last_error)
            .bind(item.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to create batch item"))?;
        }

        tx.commit().await.map_err(db_error("Failed to commit batch"))?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        let row: Option<BatchRow> = sqlx::query_as(
            "SELECT id, organization_id, ontology_id, ontology_hash, created_at FROM batches WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get batch"))?;
        Ok(row.map(|r| Batch {
            id: r.id,
            organization_id: r.organization_id,
            ontology_id: r.ontology_id,
            ontology_hash: r.ontology_hash,
            created_at: r.created_at,
        }))
    }

    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM batch_items WHERE batch_id = $1 ORDER BY seq"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list batch items"))?;
        rows.into_iter().map(BatchItem::try_from).collect()
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<BatchItem>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM batch_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get batch item"))?;
        row.map(BatchItem::try_from).transpose()
    }

    async fn transition_item(&self, id: Uuid, event: BatchEvent, patch: ItemPatch) -> Result<BatchItem> {
        let current = self
            .get_item(id)
            .await?
            .ok_or_else(|| KexError::NotFound(format!("batch item {id}")))?;
        let next = current.state.apply(event)?;
        let attempts_delta = i32::from(next == BatchState::Processing);

        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "UPDATE batch_items SET \
                 state = $3, \
                 attempts = attempts + $4, \
                 workflow_execution_id = COALESCE($5, workflow_execution_id), \
                 last_error = CASE WHEN $6 THEN $7 ELSE last_error END, \
                 updated_at = now() \
             WHERE id = $1 AND state = $2 \
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(id)
        .bind(current.state.as_str())
        .bind(next.as_str())
        .bind(attempts_delta)
        .bind(patch.workflow_execution_id)
        .bind(patch.error.is_some())
        .bind(patch.error.flatten())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update batch item"))?;

        match row {
            Some(row) => row.try_into(),
            // Another writer moved the item first
            None => Err(KexError::InvalidTransition {
                machine: "batch",
                from: current.state.to_string(),
                event: event.to_string(),
            }),
        }
    }
}
