//! Live log streaming from a watcher to an encoder.

use bollard::Docker;
use bollard::container::LogOutput;
use bollard::query_parameters::LogsOptionsBuilder;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::BerthError;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LogEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Push-based producer of log events.
///
/// `next_event` must be cancel-safe: dropping its future before completion
/// must not lose an event.
pub trait LogWatcher: Send {
    /// Next event in emission order, `None` once the watcher is closed.
    fn next_event(&mut self) -> impl Future<Output = Option<LogEvent>> + Send;

    /// Releases the subscription. Producers stop after this.
    fn close(&mut self);
}

/// Serializes batches of events to an external sink.
pub trait LogEncoder: Send {
    fn encode(&mut self, events: &[LogEvent]) -> std::io::Result<()>;
}

/// Producer side of a `ChannelWatcher`.
#[derive(Clone)]
pub struct LogSender {
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl LogSender {
    /// Returns false once the watcher has been closed.
    pub fn send(&self, event: LogEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct ChannelWatcher {
    rx: mpsc::UnboundedReceiver<LogEvent>,
}

impl ChannelWatcher {
    pub fn channel() -> (LogSender, ChannelWatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LogSender { tx }, ChannelWatcher { rx })
    }
}

impl LogWatcher for ChannelWatcher {
    async fn next_event(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

/// Follows a container's output through the docker API.
pub struct DockerLogWatcher {
    watcher: ChannelWatcher,
    task: JoinHandle<()>,
}

impl DockerLogWatcher {
    pub fn new(docker: Docker, id: &str, follow: bool) -> Self {
        let (sender, watcher) = ChannelWatcher::channel();
        let id = id.to_string();
        let task = tokio::spawn(async move {
            let options = LogsOptionsBuilder::new()
                .stdout(true)
                .stderr(true)
                .follow(follow)
                .build();
            let mut stream = docker.logs(&id, Some(options));
            while let Some(chunk) = stream.next().await {
                let event = match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        LogEvent::new(String::from_utf8_lossy(&message)).with_source("stdout")
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        LogEvent::new(String::from_utf8_lossy(&message)).with_source("stderr")
                    }
                    Ok(LogOutput::Console { message }) => {
                        LogEvent::new(String::from_utf8_lossy(&message))
                    }
                    Ok(LogOutput::StdIn { .. }) => continue,
                    Err(e) => {
                        warn!("log stream of {id} failed: {e}");
                        break;
                    }
                };
                if !sender.send(event) {
                    break;
                }
            }
            debug!("log stream of {id} finished");
        });
        Self { watcher, task }
    }
}

impl LogWatcher for DockerLogWatcher {
    async fn next_event(&mut self) -> Option<LogEvent> {
        self.watcher.next_event().await
    }

    fn close(&mut self) {
        self.task.abort();
        self.watcher.close();
    }
}

/// Writes each batch as one JSON array per line and flushes.
pub struct JsonEncoder<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> LogEncoder for JsonEncoder<W> {
    fn encode(&mut self, events: &[LogEvent]) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, events)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Closes the watcher when dropped, whichever way streaming ends.
struct Subscription<W: LogWatcher>(W);

impl<W: LogWatcher> Drop for Subscription<W> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Streams events from `watcher` into `encoder`, flushing after every event,
/// until `cancel` turns true (Ok), the watcher closes (Ok) or encoding fails
/// (Err). The watcher is closed exactly once on every exit path, including
/// when this future is dropped.
///
/// An encode in progress always completes before cancellation is observed.
/// Events still queued in the watcher at cancellation are not delivered.
/// If the cancel sender is dropped, streaming continues until the watcher
/// closes.
pub async fn follow_logs<W: LogWatcher, E: LogEncoder>(
    mut cancel: watch::Receiver<bool>,
    id: &str,
    watcher: W,
    encoder: &mut E,
) -> Result<(), BerthError> {
    let mut subscription = Subscription(watcher);
    let mut pending = Vec::new();
    let mut cancellable = true;
    loop {
        if *cancel.borrow_and_update() {
            debug!("log stream of {id} cancelled");
            return Ok(());
        }
        tokio::select! {
            biased;
            changed = cancel.changed(), if cancellable => {
                if changed.is_err() {
                    cancellable = false;
                }
            }
            event = subscription.0.next_event() => match event {
                Some(event) => {
                    pending.push(event);
                    encoder.encode(&pending).map_err(BerthError::Encode)?;
                    pending.clear();
                }
                None => {
                    debug!("log watcher of {id} closed");
                    return Ok(());
                }
            },
        }
    }
}
