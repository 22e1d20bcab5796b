// File sink: appends one CSV row per event. The header is written when the
// file is new or empty. Writes run on the blocking pool, one at a time.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{OutputSink, SinkKind, delivery_error};
use crate::error::CoreError;
use crate::event::DecodedEvent;

pub const HEADER: [&str; 5] = ["eventType", "channel", "data", "timestamp", "source"];

pub struct FileSink {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: &DecodedEvent) -> Result<(), CoreError> {
        let message = event.to_message();
        let row = [
            message.event_type.to_owned(),
            message.channel.to_owned(),
            message.data.to_string(),
            message.timestamp,
            message.source.to_owned(),
        ];

        let path = self.path.clone();
        let lock = Arc::clone(&self.write_lock);
        tokio::task::spawn_blocking(move || append_row(&path, &lock, &row))
            .await
            .map_err(|e| delivery_error(SinkKind::File, e))?
            .map_err(|e| delivery_error(SinkKind::File, e))
    }
}

#[async_trait]
impl OutputSink for FileSink {
    fn kind(&self) -> SinkKind {
        SinkKind::File
    }

    async fn deliver(&self, event: &DecodedEvent) -> bool {
        match self.append(event).await {
            Ok(()) => {
                debug!(path = %self.path.display(), channel = %event.channel, "event appended");
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "file delivery failed");
                false
            }
        }
    }
}

fn append_row(path: &Path, lock: &Mutex<()>, row: &[String; 5]) -> Result<(), csv::Error> {
    let _guard = lock.lock().expect("file sink lock poisoned");

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_new = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(HEADER)?;
    }
    writer.write_record(row)?;
    writer.flush()?;
    Ok(())
}
