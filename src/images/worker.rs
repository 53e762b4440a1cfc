//! Offloads CPU-bound transcoding to a dedicated task.
//!
//! Jobs travel through a bounded queue tagged with a correlation id. A full
//! or closed queue, a reply for another id, a worker error or a timeout all
//! make the caller transcode inline instead; callers never see the worker
//! fail. Inline work still runs on the blocking pool, never on the async
//! executor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::images::tools::{convert_image, ImageProxyError};
use crate::images::types::{ImageFormat, TransformSpec};

pub type TranscodeResult = Result<(Vec<u8>, ImageFormat), ImageProxyError>;

/// Pure transcoding function run by the worker.
pub type TranscodeFn = fn(&[u8], &TransformSpec) -> TranscodeResult;

struct TranscodeJob {
    id: u64,
    data: Arc<Vec<u8>>,
    spec: TransformSpec,
    reply: oneshot::Sender<TranscodeReply>,
}

struct TranscodeReply {
    id: u64,
    // None when the transcode task itself died.
    result: Option<TranscodeResult>,
}

pub struct TranscodeWorker {
    sender: mpsc::Sender<TranscodeJob>,
    next_id: AtomicU64,
    timeout: Duration,
    handle: JoinHandle<()>,
}

impl TranscodeWorker {
    pub fn spawn(queue_size: usize, timeout: Duration) -> Self {
        Self::spawn_with(queue_size, timeout, convert_image)
    }

    pub fn spawn_with(queue_size: usize, timeout: Duration, transcode: TranscodeFn) -> Self {
        let (sender, mut receiver) = mpsc::channel::<TranscodeJob>(queue_size.max(1));

        let handle = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let TranscodeJob { id, data, spec, reply } = job;
                let result = match tokio::task::spawn_blocking(move || transcode(&data, &spec)).await {
                    Ok(result) => Some(result),
                    Err(e) => {
                        warn!("Transcode job {} failed: {}", id, e);
                        None
                    }
                };
                // The caller may have timed out and gone away.
                let _ = reply.send(TranscodeReply { id, result });
            }
            debug!("Transcode worker stopped");
        });

        Self {
            sender,
            next_id: AtomicU64::new(1),
            timeout,
            handle,
        }
    }

    /// Transcodes on the worker, falling back to inline work on any worker
    /// failure. Errors from the transcode itself are returned as is.
    pub async fn transcode(&self, data: Vec<u8>, spec: &TransformSpec) -> TranscodeResult {
        let data = Arc::new(data);
        match self.offload(data.clone(), spec).await {
            Some(result) => result,
            None => transcode_blocking(convert_image, data, spec).await,
        }
    }

    async fn offload(&self, data: Arc<Vec<u8>>, spec: &TransformSpec) -> Option<TranscodeResult> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        let job = TranscodeJob {
            id,
            data,
            spec: spec.clone(),
            reply,
        };

        if let Err(e) = self.sender.try_send(job) {
            warn!("Transcode worker unavailable ({}), transcoding inline", e);
            return None;
        }

        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(TranscodeReply { id: reply_id, result })) if reply_id == id => {
                if result.is_none() {
                    warn!("Transcode job {} crashed, transcoding inline", id);
                }
                result
            }
            Ok(Ok(TranscodeReply { id: reply_id, .. })) => {
                warn!("Transcode reply {} does not match job {}, transcoding inline", reply_id, id);
                None
            }
            Ok(Err(_)) => {
                warn!("Transcode worker dropped job {}, transcoding inline", id);
                None
            }
            Err(_) => {
                warn!("Transcode job {} timed out after {:?}, transcoding inline", id, self.timeout);
                None
            }
        }
    }
}

/// Runs `transcode` on the blocking pool. A panicking transcode is reported
/// as a conversion error.
pub async fn transcode_blocking(transcode: TranscodeFn, data: Arc<Vec<u8>>, spec: &TransformSpec) -> TranscodeResult {
    let spec = spec.clone();
    tokio::task::spawn_blocking(move || transcode(&data, &spec))
        .await
        .map_err(|e| ImageProxyError::ConversionError(format!("Transcode task failed: {}", e)))?
}

impl Drop for TranscodeWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
