//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Filesystem mailbox.
//!
//! Layout: `<base>/<node>/inbox` and `<base>/<node>/outbox`. Sending stages
//! the serialized message in the sender's outbox and renames it into the
//! recipient's inbox, so readers never observe a partial file. Files are
//! named after the enqueue time, which keeps directory order equal to send
//! order.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hsp_common::FileProtocolConfig;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{FallbackError, FallbackMessage, FallbackProtocol, InboundSink, ProtocolCore, ProtocolStats, ProtocolStatus};

const NAME: &str = "file";
const INBOX: &str = "inbox";
const OUTBOX: &str = "outbox";

struct Listener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Disk-backed mailbox shared by processes on one host.
pub struct FileMailboxProtocol {
    node_id: String,
    base_path: PathBuf,
    poll_interval: Duration,
    core: Arc<ProtocolCore>,
    listener: Mutex<Option<Listener>>,
}

impl FileMailboxProtocol {
    /// Mailbox for `node_id` rooted at `base_path`.
    pub fn new(node_id: impl Into<String>, base_path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            base_path: base_path.into(),
            poll_interval,
            core: Arc::new(ProtocolCore::new(NAME)),
            listener: Mutex::new(None),
        }
    }

    /// Build from the `[fallback.file]` section.
    pub fn from_config(node_id: impl Into<String>, config: &FileProtocolConfig) -> Self {
        Self::new(node_id, config.base_path.clone(), config.poll_interval)
    }

    /// Inbox directory of `node_id`.
    pub fn inbox_of(&self, node_id: &str) -> PathBuf {
        self.base_path.join(node_id).join(INBOX)
    }

    fn outbox(&self) -> PathBuf {
        self.base_path.join(&self.node_id).join(OUTBOX)
    }

    async fn recipients(&self, message: &FallbackMessage) -> io::Result<Vec<String>> {
        if !message.is_broadcast() {
            let inbox = self.inbox_of(&message.recipient_id);
            return Ok(if is_dir(&inbox).await {
                vec![message.recipient_id.clone()]
            } else {
                Vec::new()
            });
        }
        let mut recipients = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(node) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if node != self.node_id && is_dir(&self.inbox_of(&node)).await {
                recipients.push(node);
            }
        }
        recipients.sort();
        Ok(recipients)
    }

    async fn deposit(&self, message: &FallbackMessage, recipients: &[String]) -> Result<(), FallbackError> {
        let body = serde_json::to_vec(message)?;
        let file_name = mailbox_file_name(message);
        let outbox = self.outbox();
        for recipient in recipients {
            let staged = outbox.join(format!("{}.{}", sanitize(recipient), file_name));
            tokio::fs::write(&staged, &body).await?;
            let delivered = self.inbox_of(recipient).join(&file_name);
            if let Err(err) = tokio::fs::rename(&staged, &delivered).await {
                if let Err(cleanup) = tokio::fs::remove_file(&staged).await {
                    warn!(
                        protocol = NAME,
                        path = %staged.display(),
                        error = %cleanup,
                        "could not remove staged mailbox file"
                    );
                }
                return Err(err.into());
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileMailboxProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMailboxProtocol")
            .field("node_id", &self.node_id)
            .field("base_path", &self.base_path)
            .field("status", &self.core.status())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FallbackProtocol for FileMailboxProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn initialize(&self, sink: InboundSink) -> Result<(), FallbackError> {
        let node_dir = self.base_path.join(&self.node_id);
        for dir in [node_dir.join(INBOX), node_dir.join(OUTBOX)] {
            if let Err(err) = tokio::fs::create_dir_all(&dir).await {
                self.core.set_status(ProtocolStatus::Failed);
                return Err(err.into());
            }
        }
        self.core.attach(sink);
        info!(
            protocol = NAME,
            node_id = %self.node_id,
            base_path = %self.base_path.display(),
            "fallback protocol initialized"
        );
        Ok(())
    }

    async fn send(&self, message: &FallbackMessage) -> Result<(), FallbackError> {
        if !self.core.is_initialized() {
            return Err(FallbackError::NotInitialized(NAME));
        }
        let recipients = match self.recipients(message).await {
            Ok(recipients) => recipients,
            Err(err) => {
                self.core.record_error();
                return Err(err.into());
            }
        };
        if recipients.is_empty() {
            return Err(FallbackError::PeerUnreachable {
                protocol: NAME,
                recipient: message.recipient_id.clone(),
            });
        }
        if let Err(err) = self.deposit(message, &recipients).await {
            self.core.record_error();
            return Err(err);
        }
        debug!(
            protocol = NAME,
            message_id = %message.id,
            recipients = recipients.len(),
            "deposited fallback message"
        );
        self.core.record_sent();
        Ok(())
    }

    async fn start_listening(&self) -> Result<(), FallbackError> {
        if !self.core.is_initialized() {
            return Err(FallbackError::NotInitialized(NAME));
        }
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Ok(());
        }
        let (stop, mut stopped) = oneshot::channel();
        let inbox = self.inbox_of(&self.node_id);
        let core = Arc::clone(&self.core);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if let Err(err) = drain_inbox(&inbox, &core).await {
                            warn!(protocol = NAME, error = %err, "mailbox poll failed");
                            core.record_error();
                        }
                    }
                }
            }
        });
        *listener = Some(Listener { stop, task });
        Ok(())
    }

    async fn stop_listening(&self) {
        let listener = self.listener.lock().take();
        if let Some(Listener { stop, task }) = listener {
            let _ = stop.send(());
            let _ = task.await;
        }
    }

    async fn health_check(&self) -> bool {
        if !self.core.is_initialized() {
            return false;
        }
        let healthy = is_dir(&self.inbox_of(&self.node_id)).await && is_dir(&self.outbox()).await;
        match (healthy, self.core.status()) {
            (false, _) => self.core.set_status(ProtocolStatus::Failed),
            (true, ProtocolStatus::Failed) => self.core.set_status(ProtocolStatus::Active),
            _ => {}
        }
        healthy
    }

    fn status(&self) -> ProtocolStatus {
        self.core.status()
    }

    fn stats(&self) -> ProtocolStats {
        self.core.stats()
    }

    async fn shutdown(&self) {
        self.stop_listening().await;
        self.core.detach();
    }
}

/// Hand every readable file in `inbox` to the sink, oldest first, and delete it.
async fn drain_inbox(inbox: &Path, core: &ProtocolCore) -> io::Result<usize> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(inbox).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();

    let mut delivered = 0;
    for path in files {
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        match serde_json::from_slice::<FallbackMessage>(&bytes) {
            Ok(message) => {
                if core.deliver(message) {
                    delivered += 1;
                }
            }
            Err(err) => {
                warn!(
                    protocol = NAME,
                    path = %path.display(),
                    error = %err,
                    "discarding unreadable mailbox file"
                );
                core.record_error();
            }
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(delivered)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

fn mailbox_file_name(message: &FallbackMessage) -> String {
    format!(
        "{}_{}.json",
        message.enqueued_at.format("%Y%m%dT%H%M%S%.9fZ"),
        sanitize(&message.id)
    )
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
