//! Database statistics and health overview.
//!
//! Summarizes what the graph and the dedup pipeline currently hold: block
//! counts, blocks awaiting downstream reprocessing, concepts, candidates by
//! status, and dirty-block queue depth. Used by `vsync stats`.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::queue::sqlite::queue_depth;

/// Blocks grouped by the tier directory their source file lives in.
struct TierBlocks {
    tier: String,
    blocks: i64,
    pending: i64,
    last_updated: Option<i64>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_blocks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks")
        .fetch_one(&pool)
        .await?;

    let needs_reprocessing: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM blocks WHERE needs_reprocessing = 1")
            .fetch_one(&pool)
            .await?;

    let total_concepts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM concepts")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("vsync database stats");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Blocks:      {}", total_blocks);
    println!("  Reprocess:   {}", needs_reprocessing);
    println!("  Concepts:    {}", total_concepts);

    let candidate_rows =
        sqlx::query("SELECT status, COUNT(*) AS n FROM concept_candidates GROUP BY status ORDER BY status")
            .fetch_all(&pool)
            .await?;
    if !candidate_rows.is_empty() {
        println!();
        println!("  Candidates:");
        for row in &candidate_rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            println!("    {:<10} {:>8}", status, n);
        }
    }

    let depth = queue_depth(&pool, &config.consumer.queue).await?;
    println!();
    println!(
        "  Queue '{}': {} ready, {} in flight, {} dead",
        config.consumer.queue, depth.ready, depth.inflight, depth.dead
    );

    // Per-tier breakdown, keyed by the first path component of source_file
    let tier_rows = sqlx::query(
        r#"
        SELECT
            CASE WHEN instr(source_file, '/') > 0
                 THEN substr(source_file, 1, instr(source_file, '/') - 1)
                 ELSE '' END AS tier,
            COUNT(*) AS blocks,
            SUM(needs_reprocessing) AS pending,
            MAX(last_updated) AS last_updated
        FROM blocks
        GROUP BY tier
        ORDER BY tier
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let tiers: Vec<TierBlocks> = tier_rows
        .iter()
        .map(|row| TierBlocks {
            tier: row.get("tier"),
            blocks: row.get("blocks"),
            pending: row.get::<Option<i64>, _>("pending").unwrap_or(0),
            last_updated: row.get("last_updated"),
        })
        .collect();

    if !tiers.is_empty() {
        println!();
        println!("  By tier:");
        println!(
            "  {:<16} {:>8} {:>10}   {}",
            "TIER", "BLOCKS", "REPROCESS", "LAST UPDATE"
        );
        println!("  {}", "-".repeat(60));

        for t in &tiers {
            let updated = match t.last_updated {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            let name = if t.tier.is_empty() { "(root)" } else { t.tier.as_str() };
            println!(
                "  {:<16} {:>8} {:>10}   {}",
                name, t.blocks, t.pending, updated
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
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

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{} min{} ago", delta / 60, plural(delta / 60)),
        3600..=86_399 => format!("{} hour{} ago", delta / 3600, plural(delta / 3600)),
        d if d < 86_400 * 30 => format!("{} day{} ago", d / 86_400, plural(d / 86_400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert!(format_ts_relative(now - 86_400 * 90).contains('-'));
    }
}
