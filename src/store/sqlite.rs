//! SQLite-backed [`DocumentStore`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{HashMap, HashSet};

use super::{source_key, DocumentStore, KeyedLocks, Page, Vocabulary, VocabularyField};
use crate::error::StoreError;
use crate::models::{
    content_preview, Document, DocumentFilter, DocumentType, NewDocument, UpsertOutcome,
    UpsertStatus, UNKNOWN_AUTHOR,
};

const DOCUMENT_COLUMNS: &str = "id, title, author, year, doc_type, tags_json, source_file, \
     page_number, content, content_preview, content_hash, created_at, updated_at";

/// Keep `IN (...)` lists well under SQLite's bound-parameter limit.
const MAX_IN_PARAMS: usize = 500;

pub struct SqliteDocumentStore {
    pool: SqlitePool,
    preview_chars: usize,
    locks: KeyedLocks,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool, preview_chars: usize) -> Self {
        Self {
            pool,
            preview_chars,
            locks: KeyedLocks::new(),
        }
    }

    /// Close the pool. Subsequent calls report [`StoreError::Unavailable`].
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// SHA-256 of the document body, lowercase hex.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize(mut doc: NewDocument) -> Result<NewDocument, StoreError> {
    doc.title = doc.title.trim().to_string();
    if doc.title.is_empty() {
        return Err(StoreError::Invalid("title must not be empty".to_string()));
    }
    if doc.source_file.trim().is_empty() {
        return Err(StoreError::Invalid(
            "source_file must not be empty".to_string(),
        ));
    }
    doc.author = doc
        .author
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());
    doc.year = doc.year.filter(|y| *y != 0);

    let mut tags: Vec<String> = doc
        .tags
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    doc.tags = tags;
    Ok(doc)
}

fn row_to_document(row: &SqliteRow) -> Result<Document, StoreError> {
    let tags_json: String = row.try_get("tags_json")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|e| StoreError::Invalid(format!("tags_json: {}", e)))?;
    let doc_type: String = row.try_get("doc_type")?;

    Ok(Document {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        author: row
            .try_get::<Option<String>, _>("author")?
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
        year: row.try_get("year")?,
        doc_type: doc_type.parse().unwrap_or(DocumentType::Unknown),
        tags,
        source_file: row.try_get("source_file")?,
        page_number: row.try_get("page_number")?,
        content: row.try_get("content")?,
        content_preview: row.try_get("content_preview")?,
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Appends `WHERE`-compatible filter predicates (each prefixed by `AND`).
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &DocumentFilter) {
    if let Some(doc_type) = filter.doc_type {
        qb.push(" AND doc_type = ").push_bind(doc_type.as_str());
    }
    if let Some(year) = filter.year {
        qb.push(" AND year = ").push_bind(year);
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, id: i64) -> Result<Document, StoreError> {
        let sql = format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        row_to_document(&row)
    }

    async fn get_many(&self, ids: &[i64]) -> Result<HashMap<i64, Document>, StoreError> {
        let mut docs = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(MAX_IN_PARAMS) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {} FROM documents WHERE id IN (",
                DOCUMENT_COLUMNS
            ));
            let mut separated = qb.separated(", ");
            for id in batch {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in &rows {
                let doc = row_to_document(row)?;
                docs.insert(doc.id, doc);
            }
        }
        Ok(docs)
    }

    async fn list(
        &self,
        limit: usize,
        offset: usize,
        filter: &DocumentFilter,
    ) -> Result<Page, StoreError> {
        let mut count_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM documents WHERE 1 = 1");
        push_filter(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM documents WHERE 1 = 1",
            DOCUMENT_COLUMNS
        ));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id ASC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let documents = rows
            .iter()
            .map(row_to_document)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page { documents, total })
    }

    async fn scan(&self, after_id: i64, limit: usize) -> Result<Vec<Document>, StoreError> {
        let sql = format!(
            "SELECT {} FROM documents WHERE id > ? ORDER BY id ASC LIMIT ?",
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(after_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn search_lexical(
        &self,
        term: &str,
        limit: usize,
        filter: &DocumentFilter,
    ) -> Result<Vec<Document>, StoreError> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM documents WHERE (instr(lower(title), ",
            DOCUMENT_COLUMNS
        ));
        qb.push_bind(needle.clone())
            .push(") > 0 OR instr(lower(author), ")
            .push_bind(needle.clone())
            .push(") > 0 OR instr(lower(content), ")
            .push_bind(needle)
            .push(") > 0)");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id ASC LIMIT ").push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn upsert(&self, doc: NewDocument) -> Result<UpsertOutcome, StoreError> {
        let doc = normalize(doc)?;
        let _guard = self
            .locks
            .lock(&source_key(&doc.source_file, doc.page_number))
            .await;

        let hash = content_hash(&doc.content);
        let preview = content_preview(&doc.content, self.preview_chars);
        let tags_json = serde_json::to_string(&doc.tags)
            .map_err(|e| StoreError::Invalid(format!("tags: {}", e)))?;
        let author = doc.author.as_deref();
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, content_hash FROM documents WHERE source_file = ? AND page_number IS ?",
        )
        .bind(&doc.source_file)
        .bind(doc.page_number)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some((id, existing_hash)) if existing_hash == hash => {
                sqlx::query(
                    "UPDATE documents SET title = ?, author = ?, year = ?, doc_type = ?, \
                     tags_json = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&doc.title)
                .bind(author)
                .bind(doc.year)
                .bind(doc.doc_type.as_str())
                .bind(&tags_json)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome {
                    id,
                    status: UpsertStatus::Unchanged,
                    previous_id: None,
                }
            }
            existing => {
                let previous_id = existing.map(|(id, _)| id);
                if let Some(old) = previous_id {
                    sqlx::query("DELETE FROM documents WHERE id = ?")
                        .bind(old)
                        .execute(&mut *tx)
                        .await?;
                }
                let result = sqlx::query(
                    r#"
                    INSERT INTO documents (title, author, year, doc_type, tags_json, source_file,
                        page_number, content, content_preview, content_hash, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&doc.title)
                .bind(author)
                .bind(doc.year)
                .bind(doc.doc_type.as_str())
                .bind(&tags_json)
                .bind(&doc.source_file)
                .bind(doc.page_number)
                .bind(&doc.content)
                .bind(&preview)
                .bind(&hash)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome {
                    id: result.last_insert_rowid(),
                    status: if previous_id.is_some() {
                        UpsertStatus::Replaced
                    } else {
                        UpsertStatus::Inserted
                    },
                    previous_id,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn purge(&self, id: i64) -> Result<bool, StoreError> {
        let key: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT source_file, page_number FROM documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((source_file, page_number)) = key else {
            return Ok(false);
        };

        let _guard = self.locks.lock(&source_key(&source_file, page_number)).await;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn distinct(&self, field: VocabularyField) -> Result<Vocabulary, StoreError> {
        match field {
            VocabularyField::Type => {
                let values: Vec<String> = sqlx::query_scalar(
                    "SELECT DISTINCT doc_type FROM documents WHERE doc_type != 'unknown' ORDER BY doc_type",
                )
                .fetch_all(&self.pool)
                .await?;
                let types = values
                    .iter()
                    .filter_map(|v| v.parse::<DocumentType>().ok())
                    .filter(|t| *t != DocumentType::Unknown)
                    .collect();
                Ok(Vocabulary::Types(types))
            }
            VocabularyField::Year => {
                let years: Vec<i32> = sqlx::query_scalar(
                    "SELECT DISTINCT year FROM documents WHERE year IS NOT NULL AND year != 0 ORDER BY year DESC",
                )
                .fetch_all(&self.pool)
                .await?;
                Ok(Vocabulary::Years(years))
            }
            VocabularyField::Author => {
                let authors: Vec<String> = sqlx::query_scalar(
                    "SELECT DISTINCT IFNULL(author, ?) FROM documents ORDER BY 1",
                )
                .bind(UNKNOWN_AUTHOR)
                .fetch_all(&self.pool)
                .await?;
                Ok(Vocabulary::Authors(authors))
            }
        }
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    async fn ids(&self) -> Result<HashSet<i64>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM documents")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }
}
