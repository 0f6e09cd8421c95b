//! Events — every non-trivial state transition is reported to an Eventer.
//!
//! Three variants: file (JSON lines, also standing in for journald hosts
//! without a journal), memory (ring buffer plus broadcast, used by tests and
//! in-process consumers), and null.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Container,
    Pod,
    Volume,
    Network,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Create,
    Init,
    Start,
    Restart,
    Pause,
    Unpause,
    Stop,
    Kill,
    Died,
    Cleanup,
    Remove,
    Rename,
    Update,
    Mount,
    Unmount,
    Connect,
    Disconnect,
    Exec,
    ExecDied,
    Refresh,
    Renumber,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub kind: EventKind,
    pub status: EventStatus,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, status: EventStatus, id: &str, name: &str) -> Self {
        Event {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            status,
            time: Utc::now(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

#[async_trait]
pub trait Eventer: Send + Sync {
    async fn write(&self, event: Event) -> Result<(), EngineError>;
}

/// Appends events as JSON lines to a log file.
pub struct FileEventer {
    path: PathBuf,
    // Serializes appends so concurrent writers cannot interleave lines.
    write_lock: Mutex<()>,
}

impl FileEventer {
    pub fn new(path: PathBuf) -> Self {
        FileEventer {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Eventer for FileEventer {
    async fn write(&self, event: Event) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let _w = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}

/// Keeps events in memory and fans them out over a broadcast channel.
pub struct MemoryEventer {
    events: parking_lot::Mutex<Vec<Event>>,
    sender: broadcast::Sender<Event>,
}

impl MemoryEventer {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        MemoryEventer {
            events: parking_lot::Mutex::new(Vec::new()),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Live event stream for in-process consumers. A lagging receiver skips
    /// the dropped events and keeps going; the stream ends when the eventer
    /// is dropped.
    pub fn stream(&self) -> Pin<Box<dyn Stream<Item = Result<Event, EngineError>> + Send>> {
        let mut receiver = self.sender.subscribe();
        let stream = async_stream::try_stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "event stream fell behind; continuing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl Default for MemoryEventer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Eventer for MemoryEventer {
    async fn write(&self, event: Event) -> Result<(), EngineError> {
        self.events.lock().push(event.clone());
        // No receivers is fine; events are still recorded.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Swallows everything.
pub struct NullEventer;

#[async_trait]
impl Eventer for NullEventer {
    async fn write(&self, _event: Event) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Construct the eventer named by the configuration. "journald" falls back
/// to the file eventer when no journal integration is available.
pub fn eventer_for(backend: &str, log_path: PathBuf) -> Box<dyn Eventer> {
    match backend {
        "memory" => Box::new(MemoryEventer::new()),
        "none" => Box::new(NullEventer),
        "file" | "journald" => Box::new(FileEventer::new(log_path)),
        other => {
            tracing::warn!("unknown events backend \"{}\", using file", other);
            Box::new(FileEventer::new(log_path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_eventer_records_and_broadcasts() {
        let eventer = MemoryEventer::new();
        let mut rx = eventer.subscribe();

        let event = Event::new(EventKind::Container, EventStatus::Start, "abc", "web");
        eventer.write(event).await.unwrap();

        assert_eq!(eventer.events().len(), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "abc");
        assert_eq!(received.status, EventStatus::Start);
    }

    #[tokio::test]
    async fn test_event_stream() {
        use tokio_stream::StreamExt;

        let eventer = MemoryEventer::new();
        let mut stream = eventer.stream();
        eventer
            .write(Event::new(EventKind::Pod, EventStatus::Create, "p1", "mypod"))
            .await
            .unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.name, "mypod");
        assert_eq!(received.kind, EventKind::Pod);
    }

    #[tokio::test]
    async fn test_file_eventer_appends_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.log");
        let eventer = FileEventer::new(path.clone());

        eventer
            .write(Event::new(EventKind::Volume, EventStatus::Create, "v1", "v1"))
            .await
            .unwrap();
        eventer
            .write(
                Event::new(EventKind::Container, EventStatus::Died, "abc", "web")
                    .with_error("exit 1".to_string()),
            )
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Event = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("exit 1"));
    }
}
