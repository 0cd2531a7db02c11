//! Document browsing commands: `get`, `list`, `vocab`, `purge`.

use anyhow::Result;

use crate::engine::Engine;
use crate::error::StoreError;
use crate::models::DocumentFilter;
use crate::stats::format_ts_iso;
use crate::store::{Vocabulary, VocabularyField};

pub async fn run_get(engine: &Engine, id: i64) -> Result<()> {
    let doc = match engine.store.get(id).await {
        Ok(d) => d,
        Err(StoreError::NotFound(_)) => {
            eprintln!("Error: document not found: {}", id);
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("title:        {}", doc.title);
    println!("author:       {}", doc.author);
    if let Some(year) = doc.year {
        println!("year:         {}", year);
    }
    println!("type:         {}", doc.doc_type);
    if !doc.tags.is_empty() {
        println!("tags:         {}", doc.tags.join(", "));
    }
    println!("source_file:  {}", doc.source_file);
    if let Some(page) = doc.page_number {
        println!("page:         {}", page);
    }
    println!("content_hash: {}", doc.content_hash);
    println!("created_at:   {}", format_ts_iso(doc.created_at));
    println!("updated_at:   {}", format_ts_iso(doc.updated_at));
    println!();

    println!("--- Content ---");
    println!("{}", doc.content);
    Ok(())
}

pub async fn run_list(engine: &Engine, limit: usize, offset: usize, filter: DocumentFilter) -> Result<()> {
    let page = engine.store.list(limit, offset, &filter).await?;
    if page.documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    for doc in &page.documents {
        println!("{:>6}  {}", doc.id, doc.heading());
        println!("        type: {}  source: {}", doc.doc_type, doc.source_file);
    }
    println!();
    println!(
        "showing {}-{} of {}",
        offset + 1,
        offset + page.documents.len(),
        page.total
    );
    Ok(())
}

pub async fn run_vocab(engine: &Engine, field: VocabularyField) -> Result<()> {
    let values = engine.store.distinct(field).await?;
    if values.is_empty() {
        println!("No values.");
        return Ok(());
    }
    match values {
        Vocabulary::Types(types) => types.iter().for_each(|t| println!("{}", t)),
        Vocabulary::Years(years) => years.iter().for_each(|y| println!("{}", y)),
        Vocabulary::Authors(authors) => authors.iter().for_each(|a| println!("{}", a)),
    }
    Ok(())
}

pub async fn run_purge(engine: &Engine, id: i64) -> Result<()> {
    if engine.reindexer.purge(id).await? {
        println!("Purged document {}.", id);
        println!("  index vectors: {}", engine.index.size());
    } else {
        eprintln!("Error: document not found: {}", id);
        std::process::exit(1);
    }
    Ok(())
}
