//! Corpus and index overview for `annals stats`.

use anyhow::Result;

use crate::engine::Engine;

pub async fn run_stats(engine: &Engine) -> Result<()> {
    let stats = engine.stats().await?;
    let db_size = std::fs::metadata(&engine.config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let index = engine.index.load();

    println!("Annals — Corpus Stats");
    println!("=====================");
    println!();
    println!("  Database:    {}", engine.config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents_count);
    match index {
        Some(ref index) => {
            println!(
                "  Indexed:     {} / {} documents ({} vectors)",
                index.document_count(),
                stats.documents_count,
                index.size()
            );
            println!("  Model:       {} ({} dims, {:?})", index.model(), index.dims(), index.metric());
        }
        None => println!("  Indexed:     no index loaded (run `annals reindex`)"),
    }
    println!("  Embedder:    {}", engine.embedder.model_name());
    println!("  Generator:   {}", engine.chat.model_name());
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn timestamps_render_as_utc() {
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
    }
}
