use std::path::PathBuf;
use std::sync::Arc;

use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

/// Append-only error event log. One tab-separated line per event:
/// timestamp, correlation id, status, message.
#[derive(Clone)]
pub struct EventLog {
    path: Arc<PathBuf>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
        }
    }

    /// Best effort: a failing log write must never fail the request.
    pub async fn append(&self, event_id: Uuid, status: u16, message: &str) {
        if let Err(e) = self.try_append(event_id, status, message).await {
            warn!(error = %e, path = %self.path.display(), "event log append failed");
        }
    }

    async fn try_append(&self, event_id: Uuid, status: u16, message: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let line = format!("{ts}\t{event_id}\t{status}\t{message}\n");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_ref())
            .await?;
        file.write_all(line.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_tab_separated_lines() {
        let path = std::env::temp_dir().join(format!("taskman-events-{}.log", Uuid::new_v4()));
        let log = EventLog::new(&path);

        log.append(Uuid::new_v4(), 401, "You are not logged in!").await;
        log.append(Uuid::new_v4(), 500, "boom").await;

        let content = tokio::fs::read_to_string(&path).await.expect("log readable");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("401\tYou are not logged in!"));
        assert!(lines[1].contains("500\tboom"));
        assert_eq!(lines[0].split('\t').count(), 4);

        tokio::fs::remove_file(&path).await.ok();
    }
}
