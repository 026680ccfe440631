use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use log::info;
use tokio::io::{self, AsyncBufReadExt, BufReader};

use ratebox::{Category, RatingWidget, SqliteStore, WidgetConfig, WidgetEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let db_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("ratebox.sqlite3"));

    let store = Arc::new(SqliteStore::open(db_path)?);
    let widget = RatingWidget::new(store, WidgetConfig::default());
    widget.activate().await?;

    let mut events = widget.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let WidgetEvent::CountsChanged { counts } = event {
                let line = counts
                    .iter()
                    .map(|(category, count)| format!("{} {category} {count}", category.glyph()))
                    .collect::<Vec<_>>()
                    .join("  ");
                info!("{line}");
            }
        }
    });

    let ids = Category::ALL
        .iter()
        .map(|category| category.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    println!("type a category ({ids}) and press enter to vote; ctrl-d quits");

    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Category::from_id(line.trim()) {
            Some(category) => widget.vote(category).await?,
            None => eprintln!("unknown category '{}'", line.trim()),
        }
    }

    widget.deactivate().await?;
    Ok(())
}
