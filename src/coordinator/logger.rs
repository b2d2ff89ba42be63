//! CSV log of expired triggers, one row per trigger.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

use super::graph::FinishedTrigger;

pub const LOGGER_CHANNEL_SIZE: usize = 1000;

pub const CSV_HEADER: &str = "t,queue,total_agents,dissemination_time_ms";

pub struct CsvLogger {
    writer: BufWriter<File>,
    begin: Instant,
    rx: mpsc::Receiver<Vec<FinishedTrigger>>,
}

impl CsvLogger {
    /// Creates (truncating) the file and writes the header. Rows are written
    /// from batches sent on the returned channel.
    pub async fn create(path: &Path) -> Result<(Self, mpsc::Sender<Vec<FinishedTrigger>>)> {
        let file = File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(format!("{CSV_HEADER}\n").as_bytes())
            .await
            .context("writing csv header")?;

        let (tx, rx) = mpsc::channel(LOGGER_CHANNEL_SIZE);
        let logger = Self {
            writer,
            begin: Instant::now(),
            rx,
        };
        Ok((logger, tx))
    }

    /// Writes rows until every sender is dropped, then flushes and closes
    /// the file.
    pub async fn run(mut self) -> Result<()> {
        while let Some(finished) = self.rx.recv().await {
            let elapsed = self.begin.elapsed().as_secs_f64();
            let mut rows = String::new();
            for trigger in &finished {
                rows.push_str(&format_row(elapsed, trigger));
            }
            self.writer
                .write_all(rows.as_bytes())
                .await
                .context("writing csv rows")?;
        }

        self.writer.flush().await.context("flushing csv log")?;
        self.writer
            .into_inner()
            .sync_all()
            .await
            .context("closing csv log")?;
        info!("dissemination log complete");
        Ok(())
    }
}

pub fn format_row(elapsed_secs: f64, trigger: &FinishedTrigger) -> String {
    format!(
        "{:.0},{},{},{}\n",
        elapsed_secs,
        trigger.queue_id,
        trigger.total_agents,
        trigger.dissemination_time.as_millis(),
    )
}
