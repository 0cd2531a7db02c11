//! `annals search` and `annals ask`.
//!
//! Both go through the engine exactly as the HTTP handlers do: search prints
//! the ranked [`Retrieval`](crate::retrieval::Retrieval), ask drains the
//! frame stream to stdout as deltas arrive and lists the sources at the end.

use anyhow::{bail, Result};
use futures::StreamExt;
use std::io::Write;

use crate::chat::ChatFrame;
use crate::engine::Engine;
use crate::models::{ChatMessage, Query, SourceRef};
use crate::retrieval::RetrievalPath;

pub async fn run_search(engine: &Engine, query: Query) -> Result<()> {
    if query.text.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let retrieval = engine.retriever.retrieve(&query).await?;
    if let Some(ref reason) = retrieval.degraded {
        eprintln!("note: semantic search unavailable ({}), showing lexical matches", reason);
    }
    if retrieval.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for result in &retrieval.results {
        let doc = &result.document;
        let score = match result.similarity {
            Some(s) => format!("{:.2}", s),
            None => "--".to_string(),
        };
        println!("{}. [{}] {}", result.rank, score, doc.title);
        match doc.year {
            Some(year) => println!("    {} ({}) / {}", doc.author, year, doc.doc_type),
            None => println!("    {} / {}", doc.author, doc.doc_type),
        }
        println!("    source: {}", doc.source_file);
        println!(
            "    excerpt: \"{}\"",
            doc.content_preview.replace('\n', " ").trim()
        );
        println!("    id: {}", doc.id);
        println!();
    }
    if retrieval.path != RetrievalPath::Semantic {
        println!("({} results via {} search)", retrieval.results.len(), path_label(retrieval.path));
    }
    Ok(())
}

fn path_label(path: RetrievalPath) -> &'static str {
    match path {
        RetrievalPath::Semantic => "semantic",
        RetrievalPath::Lexical => "lexical",
        RetrievalPath::Hybrid => "hybrid",
    }
}

pub async fn run_ask(engine: &Engine, question: &str, use_documents: bool) -> Result<()> {
    if question.trim().is_empty() {
        bail!("question must not be empty");
    }

    let mut stream = engine
        .chat
        .answer(vec![ChatMessage::user(question)], use_documents);
    let mut stdout = std::io::stdout();
    let mut sources: Vec<SourceRef> = Vec::new();

    while let Some(frame) = stream.next().await {
        match frame {
            ChatFrame::Delta(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            ChatFrame::Sources(refs) => sources = refs,
            ChatFrame::Error(message) => {
                writeln!(stdout)?;
                bail!("generation failed: {}", message);
            }
        }
    }
    writeln!(stdout)?;

    if !sources.is_empty() {
        println!();
        println!("Sources:");
        for (i, source) in sources.iter().enumerate() {
            let year = source.year.map(|y| format!(", {}", y)).unwrap_or_default();
            match source.similarity {
                Some(s) => println!("  {}. {} ({}{}) [{:.2}]", i + 1, source.title, source.author, year, s),
                None => println!("  {}. {} ({}{})", i + 1, source.title, source.author, year),
            }
        }
    }
    Ok(())
}
