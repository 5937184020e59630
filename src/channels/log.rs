//! Local notification log. Stands in for SMS or Slack when they are not
//! configured. Every notification becomes one appended line.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use super::channel::{ChannelKind, Delivery, Notification, NotificationChannel};
use crate::error::DispatchError;

pub struct LogChannel {
    path: PathBuf,
    kind: ChannelKind,
    name: String,
    /// Serializes appends so lines never interleave.
    write_lock: Mutex<()>,
}

impl LogChannel {
    pub fn new(path: impl Into<PathBuf>, kind: ChannelKind) -> Self {
        Self {
            path: path.into(),
            kind,
            name: format!("log-{kind}"),
            write_lock: Mutex::new(()),
        }
    }

    fn format_entry(notification: &Notification) -> String {
        format!(
            "[{}] {:?}: {} | Severity: {} | Audience: {} | Reporter: {} | Location: {}\n",
            Utc::now().to_rfc3339(),
            notification.kind,
            notification.content.title,
            notification.severity,
            notification.audience,
            notification.content.reporter,
            notification.content.location.as_deref().unwrap_or("N/A"),
        )
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, notification: &Notification) -> Result<Delivery, DispatchError> {
        let entry = Self::format_entry(notification);
        let io_err = |e: std::io::Error| DispatchError::retriable(self.name.clone(), e.to_string());

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(entry.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        info!(channel = %self.name, entry = %entry.trim_end(), "Local notification logged");
        Ok(Delivery::single(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::channels::channel::{Audience, MessageContent, NotificationKind};
    use crate::classifier::Severity;

    fn notification(title: &str) -> Notification {
        Notification {
            report_id: Uuid::new_v4(),
            audience: Audience::Group("responders".into()),
            severity: Severity::Medium,
            urgent: false,
            kind: NotificationKind::EmergencyAlert,
            content: MessageContent {
                title: title.into(),
                location: None,
                reported_at: Utc::now(),
                description: "Tree blocking road".into(),
                reporter: "u2".into(),
                category: "weather".into(),
                analysis: None,
                status: None,
            },
        }
    }

    #[tokio::test]
    async fn appends_one_line_per_notification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notifications.log");
        let channel = LogChannel::new(&path, ChannelKind::Broadcast);

        channel.send(&notification("first")).await.unwrap();
        channel.send(&notification("second")).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("first"));
        assert!(lines[1].contains("Audience: #responders"));
    }

    #[test]
    fn name_reflects_kind() {
        let channel = LogChannel::new("x.log", ChannelKind::Direct);
        assert_eq!(channel.name(), "log-direct");
        assert_eq!(channel.kind(), ChannelKind::Direct);
    }
}
