use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // AUTOINCREMENT: retired ids are never reused. A NULL author reads back as "Unknown".
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            author TEXT,
            year INTEGER,
            doc_type TEXT NOT NULL DEFAULT 'unknown',
            tags_json TEXT NOT NULL DEFAULT '[]',
            source_file TEXT NOT NULL,
            page_number INTEGER,
            content TEXT NOT NULL,
            content_preview TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per (source_file, page); NULL pages collapse to a single slot.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_source_page \
         ON documents(source_file, IFNULL(page_number, -1))",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_doc_type ON documents(doc_type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_year ON documents(year)")
        .execute(pool)
        .await?;

    Ok(())
}
