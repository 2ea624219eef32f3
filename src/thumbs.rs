use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Downsizes one image. The algorithm lives outside this crate; the broker
/// only owns the request/response plumbing.
#[async_trait]
pub trait ThumbnailWorker: Send + Sync {
    async fn downsize(&self, image: &[u8]) -> Result<Vec<u8>, WorkerFailure>;
}

#[derive(Debug, Clone)]
pub enum WorkerFailure {
    /// This image could not be thumbnailed; the worker stays usable.
    Request(String),
    /// The worker itself is broken and must not be used again.
    Fatal(String),
}

/// Reply message matched back to a pending request by its key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    Success { id: String, payload: Vec<u8> },
    Error { id: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The worker reported a failure for this request.
    Worker(String),
    /// The request was abandoned: broker shut down or worker went away.
    Canceled(String),
    /// The supplied image could not be decoded into bytes.
    Decode(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Worker(message) => write!(f, "thumbnail worker failed: {message}"),
            BrokerError::Canceled(message) => write!(f, "thumbnail request canceled: {message}"),
            BrokerError::Decode(message) => write!(f, "thumbnail input rejected: {message}"),
        }
    }
}

impl std::error::Error for BrokerError {}

struct ThumbnailJob {
    request_key: String,
    image: Vec<u8>,
}

type PendingReply = oneshot::Sender<Result<Option<Vec<u8>>, BrokerError>>;
type PendingMap = Arc<Mutex<HashMap<String, PendingReply>>>;

/// Request/response bridge to the background thumbnailing worker. Each
/// request registers a waiter under a unique key; the worker loop settles the
/// waiter exactly once. After a fatal worker error, in-flight requests are
/// rejected and later requests resolve to "no thumbnail" instead of failing
/// the caller again.
pub struct ThumbnailBroker {
    jobs: mpsc::UnboundedSender<ThumbnailJob>,
    pending: PendingMap,
    fatal: Arc<Mutex<Option<String>>>,
    closed: AtomicBool,
    request_timeout: Option<Duration>,
    worker_task: JoinHandle<()>,
}

impl ThumbnailBroker {
    /// Starts the worker loop. Must be called from within a tokio runtime.
    pub fn spawn(worker: Arc<dyn ThumbnailWorker>) -> Self {
        Self::spawn_with_timeout(worker, None)
    }

    /// Same as `spawn`, but abandons any request the worker has not answered
    /// within `request_timeout`. A late reply for a timed-out request is
    /// logged and dropped.
    pub fn spawn_with_timeout(
        worker: Arc<dyn ThumbnailWorker>,
        request_timeout: Option<Duration>,
    ) -> Self {
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<ThumbnailJob>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let fatal = Arc::new(Mutex::new(None::<String>));

        let loop_pending = pending.clone();
        let loop_fatal = fatal.clone();
        let worker_task = tokio::spawn(async move {
            while let Some(job) = jobs_rx.recv().await {
                let reply = match worker.downsize(&job.image).await {
                    Ok(payload) => WorkerReply::Success {
                        id: job.request_key,
                        payload,
                    },
                    Err(WorkerFailure::Request(error)) => WorkerReply::Error {
                        id: job.request_key,
                        error,
                    },
                    Err(WorkerFailure::Fatal(message)) => {
                        if let Ok(mut latch) = loop_fatal.lock() {
                            *latch = Some(message.clone());
                        }
                        reject_all(&loop_pending, BrokerError::Worker(message));
                        break;
                    }
                };
                settle(&loop_pending, reply);
            }
        });

        Self {
            jobs: jobs_tx,
            pending,
            fatal,
            closed: AtomicBool::new(false),
            request_timeout,
            worker_task,
        }
    }

    /// Requests a thumbnail for `image_id`. Resolves with the thumbnail
    /// bytes, `None` when the worker already failed fatally, or an error for
    /// this request alone.
    pub async fn request(
        &self,
        image_id: &str,
        image: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Canceled(
                "thumbnail broker shut down".to_string(),
            ));
        }
        if self.fatal_message().is_some() {
            return Ok(None);
        }

        let request_key = format!("{image_id}-{}", Uuid::new_v4());
        let (reply_tx, reply_rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_key.clone(), reply_tx);
        } else {
            return Err(BrokerError::Canceled(
                "pending request table poisoned".to_string(),
            ));
        }

        if self
            .jobs
            .send(ThumbnailJob {
                request_key: request_key.clone(),
                image,
            })
            .is_err()
        {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&request_key);
            }
            return Err(BrokerError::Canceled(
                "thumbnail worker is not running".to_string(),
            ));
        }

        let reply = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(received) => received,
                Err(_) => {
                    if let Ok(mut pending) = self.pending.lock() {
                        pending.remove(&request_key);
                    }
                    return Err(BrokerError::Canceled(
                        "thumbnail request timed out".to_string(),
                    ));
                }
            },
            None => reply_rx.await,
        };

        match reply {
            Ok(outcome) => outcome,
            Err(_) => Err(BrokerError::Canceled(
                "thumbnail request dropped without a reply".to_string(),
            )),
        }
    }

    /// Like `request`, but accepts the image library's `data:` URL form.
    pub async fn request_from_data_url(
        &self,
        image_id: &str,
        data_url: &str,
    ) -> Result<Option<Vec<u8>>, BrokerError> {
        let image = decode_image_data_url(data_url).ok_or_else(|| {
            BrokerError::Decode("expected a base64 data URL".to_string())
        })?;
        self.request(image_id, image).await
    }

    /// Message recorded by the fatal-error latch, if the worker has died.
    pub fn fatal_message(&self) -> Option<String> {
        self.fatal
            .lock()
            .map(|latch| latch.clone())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Rejects every outstanding request and stops the worker loop.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        reject_all(
            &self.pending,
            BrokerError::Canceled("thumbnail broker shut down".to_string()),
        );
        self.worker_task.abort();
    }
}

impl Drop for ThumbnailBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn settle(pending: &PendingMap, reply: WorkerReply) {
    let (request_key, outcome) = match reply {
        WorkerReply::Success { id, payload } => (id, Ok(Some(payload))),
        WorkerReply::Error { id, error } => (id, Err(BrokerError::Worker(error))),
    };

    let waiter = pending
        .lock()
        .ok()
        .and_then(|mut pending| pending.remove(&request_key));
    match waiter {
        Some(reply_tx) => {
            // The requester may have gone away; that is not an error.
            let _ = reply_tx.send(outcome);
        }
        None => {
            tracing::warn!(%request_key, "dropping thumbnail reply with no pending request");
        }
    }
}

fn reject_all(pending: &PendingMap, error: BrokerError) {
    let waiters: Vec<PendingReply> = match pending.lock() {
        Ok(mut pending) => pending.drain().map(|(_, reply_tx)| reply_tx).collect(),
        Err(_) => return,
    };
    for reply_tx in waiters {
        let _ = reply_tx.send(Err(error.clone()));
    }
}

/// Extracts raw bytes from a `data:<mime>;base64,<payload>` URL.
pub fn decode_image_data_url(value: &str) -> Option<Vec<u8>> {
    let trimmed = value.trim();
    let (prefix, data) = trimmed.split_once(',')?;
    if !prefix.to_ascii_lowercase().contains("base64") {
        return None;
    }
    general_purpose::STANDARD.decode(data.trim().as_bytes()).ok()
}
