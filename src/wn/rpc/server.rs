//! Line-delimited JSON-RPC server.
//!
//! The server reads NDJSON from any buffered async reader and writes
//! responses and notifications to any async writer — stdin/stdout in
//! production, an in-memory duplex in tests.  Dispatch is initiated strictly
//! in arrival order; each request's response is written when its handler
//! completes, so responses appear in completion order.  Handlers signal an
//! unknown method with [`HandlerError::MethodNotFound`], which maps to
//! −32601 with the method name embedded; every other handler failure maps to
//! −32603 carrying the underlying diagnostic.
//!
//! Notification handler failures are converted into an outbound
//! `log`-level-`warn` notification and never terminate the read loop.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

use crate::wn::rpc::protocol::{
    decode, error_line, notification_line, success_line, Incoming, INTERNAL_ERROR,
    INVALID_PARAMS, METHOD_NOT_FOUND,
};

/// How a request handler failed.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// No such method; the server answers −32601 with the name embedded.
    MethodNotFound(String),
    /// Parameters failed validation; the server answers −32602.
    InvalidParams(String),
    /// Anything else; the server answers −32603 with the message.
    Internal(String),
}

impl HandlerError {
    fn message(&self) -> String {
        match self {
            HandlerError::MethodNotFound(name) => format!("Method not found: {}", name),
            HandlerError::InvalidParams(message) => message.clone(),
            HandlerError::Internal(message) => message.clone(),
        }
    }
}

/// Request/notification dispatch target.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle one method call.  For notifications the return value is
    /// ignored (errors still surface as warn logs).
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, HandlerError>;
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>;

/// Clonable handle for writing server-initiated notifications.
///
/// Writes are serialized through the same writer the server uses, so
/// notification ordering matches the call order at each site.
#[derive(Clone)]
pub struct RpcNotifier {
    writer: SharedWriter,
}

impl RpcNotifier {
    /// Wrap a writer for line output.
    ///
    /// Build the notifier first when a dispatch handler needs it at
    /// construction time, then hand the same notifier to
    /// [`RpcServer::new`] so responses and notifications share one writer.
    pub fn new(writer: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        RpcNotifier {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write a notification line immediately.
    pub async fn notify(&self, method: &str, params: Option<Value>) {
        self.write_line(notification_line(method, params)).await;
    }

    async fn write_line(&self, line: String) {
        let mut writer = self.writer.lock().await;
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if let Err(err) = writer.write_all(&bytes).await {
            if log::log_enabled!(log::Level::Error) {
                log::error!("RpcNotifier: write failed: {}", err);
            }
            return;
        }
        let _ = writer.flush().await;
    }
}

/// Clonable handle that makes [`RpcServer::start`] return.
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    /// Stop the server; any pending read is abandoned.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Line-delimited JSON-RPC 2.0 server over a generic transport.
pub struct RpcServer<R> {
    reader: R,
    writer: SharedWriter,
    handler: Arc<dyn RpcHandler>,
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl<R> RpcServer<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    /// Create a server over a buffered reader and an output notifier.
    pub fn new(reader: R, notifier: RpcNotifier, handler: Arc<dyn RpcHandler>) -> Self {
        RpcServer {
            reader,
            writer: notifier.writer,
            handler,
            stopped: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A handle for writing notifications from outside the dispatch path.
    pub fn notifier(&self) -> RpcNotifier {
        RpcNotifier {
            writer: self.writer.clone(),
        }
    }

    /// A handle that makes [`start`](RpcServer::start) return.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: self.stopped.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Read lines until the input ends or [`StopHandle::stop`] is called.
    ///
    /// May be called again after a stop; the stopped flag is reset on entry.
    pub async fn start(&mut self) {
        self.stopped.store(false, Ordering::SeqCst);
        let notifier = RpcNotifier {
            writer: self.writer.clone(),
        };
        let notify = self.notify.clone();

        let mut line = String::new();
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            line.clear();
            let read = tokio::select! {
                _ = notify.notified() => break,
                read = self.reader.read_line(&mut line) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    self.dispatch_line(trimmed, &notifier).await;
                }
                Err(err) => {
                    if log::log_enabled!(log::Level::Error) {
                        log::error!("RpcServer: read failed: {}", err);
                    }
                    break;
                }
            }
        }
    }

    async fn dispatch_line(&self, line: &str, notifier: &RpcNotifier) {
        match decode(line) {
            Err(err) => {
                notifier
                    .write_line(error_line(&Value::Null, err.code, &err.message, None))
                    .await;
            }
            Ok(Incoming::Request { id, method, params }) => {
                // Dispatch initiation stays in arrival order; the response is
                // written whenever the handler completes.
                let handler = self.handler.clone();
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    let line = match handler.handle(&method, params).await {
                        Ok(result) => success_line(&id, result),
                        Err(err @ HandlerError::MethodNotFound(_)) => {
                            error_line(&id, METHOD_NOT_FOUND, &err.message(), None)
                        }
                        Err(err @ HandlerError::InvalidParams(_)) => {
                            error_line(&id, INVALID_PARAMS, &err.message(), None)
                        }
                        Err(err @ HandlerError::Internal(_)) => {
                            error_line(&id, INTERNAL_ERROR, &err.message(), None)
                        }
                    };
                    notifier.write_line(line).await;
                });
            }
            Ok(Incoming::Notification { method, params }) => {
                let handler = self.handler.clone();
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    if let Err(err) = handler.handle(&method, params).await {
                        let message = err.message();
                        notifier
                            .notify(
                                "log",
                                Some(serde_json::json!({
                                    "level": "warn",
                                    "message": message,
                                })),
                            )
                            .await;
                    }
                });
            }
            Ok(Incoming::Response) => {
                // This core is a server; inbound responses have no consumer.
            }
        }
    }
}
