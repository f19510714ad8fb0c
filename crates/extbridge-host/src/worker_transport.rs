//! Extension transport over a worker process's stdio.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, SendError, Sender};
use extbridge_core::envelope::ExtensionRestRequest;
use extbridge_core::ipc::{DEFAULT_MAX_FRAME_BYTES, ExtensionFrame, read_frame, write_frame};
use extbridge_core::transport::{
    DiscoveryExtension, ExecutorHint, ExtensionTransport, ReplyHandler, TransportError,
};
use serde_json::value::RawValue;
use thiserror::Error;

/// Worker process configuration.
#[derive(Clone, Debug)]
pub struct WorkerTransportConfig {
    /// Worker binary.
    pub command: String,
    /// Worker args.
    pub args: Vec<String>,
    /// Max allowed frame size.
    pub max_frame_bytes: usize,
}

impl Default for WorkerTransportConfig {
    fn default() -> Self {
        Self {
            command: "extbridge-hello".to_owned(),
            args: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Errors while starting the worker process.
#[derive(Debug, Error)]
pub enum WorkerTransportInitError {
    /// Spawn failure.
    #[error("failed to spawn extension worker `{command}`: {source}")]
    Spawn {
        /// Command that failed.
        command: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Worker missing stdio pipes.
    #[error("worker stdio pipe missing")]
    MissingPipe,
    /// Reader or delivery thread could not start.
    #[error("failed to start transport thread: {0}")]
    Thread(std::io::Error),
}

type PendingHandlers = Mutex<HashMap<u64, Box<dyn ReplyHandler>>>;

/// Reply callback queued for the delivery thread.
type Delivery = Box<dyn FnOnce() + Send>;

/// State shared with the reply reader thread.
struct Shared {
    extension_id: String,
    pending: PendingHandlers,
    connected: AtomicBool,
    delivery: Sender<Delivery>,
}

impl Shared {
    fn take_pending(&self, request_id: u64) -> Option<Box<dyn ReplyHandler>> {
        self.pending.lock().ok()?.remove(&request_id)
    }

    fn deliver(&self, handler: Box<dyn ReplyHandler>, reply: Result<Box<RawValue>, TransportError>) {
        let hint = handler.executor();
        let complete = move || match reply.and_then(|raw| handler.decode(raw.get().as_bytes())) {
            Ok(decoded) => handler.on_success(decoded),
            Err(err) => handler.on_failure(err),
        };
        if hint == ExecutorHint::Same {
            complete();
            return;
        }
        if let Err(SendError(complete)) = self.delivery.send(Box::new(complete)) {
            // Delivery thread is gone; finish on the reader.
            complete();
        }
    }

    fn fail_all_pending(&self) {
        let drained: Vec<Box<dyn ReplyHandler>> = match self.pending.lock() {
            Ok(mut guard) => guard.drain().map(|(_, handler)| handler).collect(),
            Err(_) => Vec::new(),
        };
        for handler in drained {
            handler.on_failure(TransportError::Disconnected(self.extension_id.clone()));
        }
    }
}

/// Transport to one extension running as a child process.
///
/// Requests are written as [`ExtensionFrame::Request`] frames on the
/// worker's stdin; a reader thread matches reply frames on stdout to the
/// pending handler by request id. Replies for ids nobody waits on any more
/// are discarded.
pub struct WorkerTransport {
    shared: Arc<Shared>,
    stdin: Mutex<BufWriter<ChildStdin>>,
    child: Mutex<Child>,
    next_request_id: AtomicU64,
}

impl WorkerTransport {
    /// Starts the worker and its reply reader.
    ///
    /// `Generic` reply handlers run on a delivery thread owned by the
    /// transport, never on a pool shared with callers waiting for replies.
    /// `Same` handlers run on the reader thread.
    pub fn spawn(
        extension_id: impl Into<String>,
        cfg: &WorkerTransportConfig,
    ) -> Result<Self, WorkerTransportInitError> {
        let extension_id = extension_id.into();
        let (delivery, deliveries) = crossbeam_channel::unbounded();
        std::thread::Builder::new()
            .name(format!("extbridge-delivery-{extension_id}"))
            .spawn(move || run_deliveries(&deliveries))
            .map_err(WorkerTransportInitError::Thread)?;

        let mut cmd = Command::new(&cfg.command);
        cmd.args(&cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|source| WorkerTransportInitError::Spawn {
            command: cfg.command.clone(),
            source,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or(WorkerTransportInitError::MissingPipe)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerTransportInitError::MissingPipe)?;

        let shared = Arc::new(Shared {
            extension_id: extension_id.clone(),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            delivery,
        });
        let reader_shared = Arc::clone(&shared);
        let max_frame_bytes = cfg.max_frame_bytes;
        if let Err(err) = std::thread::Builder::new()
            .name(format!("extbridge-reader-{extension_id}"))
            .spawn(move || read_replies(&reader_shared, BufReader::new(stdout), max_frame_bytes))
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(WorkerTransportInitError::Thread(err));
        }

        tracing::info!(
            extension = %extension_id,
            command = %cfg.command,
            pid = child.id(),
            "started extension worker"
        );
        Ok(Self {
            shared,
            stdin: Mutex::new(BufWriter::new(stdin)),
            child: Mutex::new(child),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Whether the worker's reply stream is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().map_or(0, |guard| guard.len())
    }

    fn disconnected(&self, target: &DiscoveryExtension) -> TransportError {
        TransportError::Disconnected(target.id.clone())
    }
}

impl ExtensionTransport for WorkerTransport {
    fn send(
        &self,
        target: &DiscoveryExtension,
        action: &str,
        request: ExtensionRestRequest,
        handler: Box<dyn ReplyHandler>,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(self.disconnected(target));
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .pending
            .lock()
            .map_err(|_| TransportError::Send("pending map poisoned".to_owned()))?
            .insert(request_id, handler);
        // The reader may have drained pending handlers between the check and
        // the insert; reclaim ours if so.
        if !self.is_connected() && self.shared.take_pending(request_id).is_some() {
            return Err(self.disconnected(target));
        }

        let frame = ExtensionFrame::Request {
            request_id,
            action: action.to_owned(),
            request,
        };
        let written = self
            .stdin
            .lock()
            .map_err(|_| TransportError::Send("worker stdin mutex poisoned".to_owned()))
            .and_then(|mut stdin| {
                write_frame(&mut *stdin, &frame).map_err(|e| TransportError::Send(e.to_string()))
            });
        if let Err(err) = written {
            self.shared.take_pending(request_id);
            return Err(err);
        }
        tracing::debug!(extension = %target.id, request_id, action, "sent request to worker");
        Ok(())
    }
}

impl Drop for WorkerTransport {
    fn drop(&mut self) {
        if let Ok(child) = self.child.get_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Runs queued reply callbacks until every sender is gone.
fn run_deliveries(deliveries: &Receiver<Delivery>) {
    for complete in deliveries {
        complete();
    }
}

fn read_replies(shared: &Shared, mut stdout: BufReader<ChildStdout>, max_frame_bytes: usize) {
    loop {
        let (request_id, reply) = match read_frame::<ExtensionFrame>(&mut stdout, max_frame_bytes) {
            Ok(ExtensionFrame::Response {
                request_id,
                response,
            }) => (request_id, Ok(response)),
            Ok(ExtensionFrame::Error {
                request_id,
                message,
            }) => (request_id, Err(TransportError::Remote(message))),
            Ok(ExtensionFrame::Request { request_id, .. }) => {
                tracing::warn!(
                    extension = %shared.extension_id,
                    request_id,
                    "ignoring request frame sent by worker"
                );
                continue;
            }
            Err(err) => {
                if err.is_eof() {
                    tracing::info!(
                        extension = %shared.extension_id,
                        "extension worker closed its output"
                    );
                } else {
                    tracing::warn!(
                        extension = %shared.extension_id,
                        error = %err,
                        "extension worker reply stream failed"
                    );
                }
                break;
            }
        };
        match shared.take_pending(request_id) {
            Some(handler) => shared.deliver(handler, reply),
            None => tracing::debug!(
                extension = %shared.extension_id,
                request_id,
                "dropping reply for unknown request"
            ),
        }
    }
    shared.connected.store(false, Ordering::Release);
    shared.fail_all_pending();
}
