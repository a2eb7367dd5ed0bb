use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use jiff::Timestamp;

mod cache;
mod config;
mod gui;
mod sched;
mod source;
mod table;
mod visibility;

#[derive(Parser, Debug)]
#[command(
    name = "pvgrid",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("APP_GIT_HASH"), ")"),
    about = "Browse image-analysis result tables with lazy, off-thread previews"
)]
struct Args {
    /// Table directories (with a table.json manifest) or plain image directories
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Merge all given tables into one grid with a Table column
    #[arg(long)]
    merge: bool,

    /// Preview edge length in pixels (overrides the config file)
    #[arg(long)]
    preview_size: Option<u32>,

    /// Initial sort order: name | name-desc | date | date-desc
    #[arg(long, default_value = "name")]
    sort: String,

    /// Worker threads for preview rendering (default: CPU count, capped at 8)
    #[arg(long)]
    workers: Option<usize>,
}

// --- Helper: Relative Time ---

/// Compact relative age, "34s" / "12m" / "5h" / "3d" / "1.5y".
pub fn format_relative_time(ts: Timestamp) -> String {
    let now = Timestamp::now();
    let total_secs = now
        .since(ts)
        .map(|span| span.total(jiff::Unit::Second).unwrap_or(0.0))
        .unwrap_or(0.0)
        .abs();

    if total_secs < 60.0 {
        return format!("{total_secs:.0}s");
    }
    let mins = total_secs / 60.0;
    if mins < 60.0 {
        return format!("{mins:.0}m");
    }
    let hours = mins / 60.0;
    if hours < 24.0 {
        return format!("{hours:.0}h");
    }
    let days = hours / 24.0;
    if days < 365.0 {
        return format!("{days:.0}d");
    }
    format!("{:.1}y", days / 365.0)
}

pub fn modified_text(modified: &DateTime<Utc>) -> String {
    match Timestamp::from_millisecond(modified.timestamp_millis()) {
        Ok(ts) => format_relative_time(ts),
        Err(_) => "-".to_string(),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let app = gui::app::GuiApp::new(
        args.paths,
        args.merge,
        &args.sort,
        args.preview_size,
        args.workers,
    )?;
    app.run().map_err(|e| anyhow::anyhow!("gui failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_time_picks_sane_units() {
        let now = Timestamp::now();
        assert!(format_relative_time(now).ends_with('s'));

        let five_hours_ago = now.checked_sub(jiff::Span::new().hours(5)).unwrap();
        assert_eq!(format_relative_time(five_hours_ago), "5h");

        let three_days_ago = now.checked_sub(jiff::Span::new().hours(72)).unwrap();
        assert_eq!(format_relative_time(three_days_ago), "3d");
    }
}
