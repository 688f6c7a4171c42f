//! Device sessions with a single owner per instrument.
//!
//! SCPI instruments have no transactional framing: if two logical commands
//! interleave their bytes on one link, both are corrupted. Every session is
//! therefore owned by one task ([`DeviceSession`]) that receives work over a
//! queue and runs it to completion before taking the next item. Callers hold
//! cheap, cloneable [`SessionHandle`]s.
//!
//! - Single round trips go through [`SessionHandle::query`] / [`SessionHandle::write`].
//! - Multi-step sequences that must not be split (operation-complete polling,
//!   ramp confirmation) are submitted whole with [`SessionHandle::transaction`].
//!
//! The transport is closed exactly once: on an explicit [`SessionHandle::close`],
//! or when the last handle is dropped.

mod transport;

pub use transport::{LineOptions, LineTransport, Transport};

use crate::error::{AppResult, DaqError, Device};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queue depth per session before callers wait.
const SESSION_QUEUE_DEPTH: usize = 32;

/// Unit of work run against the transport while the session is held.
type TransportJob =
    Box<dyn for<'a> FnOnce(&'a mut (dyn Transport + 'static)) -> BoxFuture<'a, ()> + Send>;

enum SessionRequest {
    Run(TransportJob),
    Close(oneshot::Sender<AppResult<()>>),
}

fn boxed_job<F>(job: F) -> TransportJob
where
    F: for<'a> FnOnce(&'a mut (dyn Transport + 'static)) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(job)
}

/// Owner task of one instrument link.
pub struct DeviceSession {
    device: Device,
    transport: Box<dyn Transport>,
    requests: mpsc::Receiver<SessionRequest>,
}

impl DeviceSession {
    /// Spawn the owner task and return a handle plus its join handle.
    pub fn spawn(device: Device, transport: Box<dyn Transport>) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let session = DeviceSession {
            device,
            transport,
            requests: rx,
        };
        let task = tokio::spawn(session.run());
        (SessionHandle { device, tx }, task)
    }

    async fn run(mut self) {
        debug!(device = %self.device, "Session task started");

        while let Some(request) = self.requests.recv().await {
            match request {
                SessionRequest::Run(job) => job(self.transport.as_mut()).await,
                SessionRequest::Close(reply) => {
                    let result = self.transport.close().await;
                    info!(device = %self.device, ok = result.is_ok(), "Session closed");
                    let _ = reply.send(result);
                    return;
                }
            }
        }

        // Every handle dropped without an explicit close.
        match self.transport.close().await {
            Ok(()) => info!(device = %self.device, "Session released"),
            Err(e) => warn!(device = %self.device, error = %e, "Session release failed"),
        }
    }
}

/// Cloneable reference to a [`DeviceSession`].
#[derive(Clone)]
pub struct SessionHandle {
    device: Device,
    tx: mpsc::Sender<SessionRequest>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("device", &self.device)
            .field("open", &!self.tx.is_closed())
            .finish()
    }
}

impl SessionHandle {
    pub fn device(&self) -> Device {
        self.device
    }

    fn closed(&self) -> DaqError {
        DaqError::SessionClosed {
            device: self.device,
        }
    }

    /// Run `f` with exclusive use of the transport.
    ///
    /// No other request on this session starts until the returned future of
    /// `f` completes, so everything inside is one critical section.
    ///
    /// ```ignore
    /// let idn = handle
    ///     .transaction(|io| Box::pin(async move {
    ///         io.send("*IDN?").await?;
    ///         io.recv().await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut (dyn Transport + 'static)) -> BoxFuture<'a, AppResult<T>>
            + Send
            + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = boxed_job(move |io| {
            Box::pin(async move {
                let _ = reply_tx.send(f(io).await);
            })
        });

        self.tx
            .send(SessionRequest::Run(job))
            .await
            .map_err(|_| self.closed())?;

        reply_rx.await.map_err(|_| self.closed())?
    }

    /// One command/response round trip.
    pub async fn query(&self, command: &str) -> AppResult<String> {
        let command = command.to_string();
        self.transaction(move |io| {
            Box::pin(async move {
                io.send(&command).await?;
                io.recv().await
            })
        })
        .await
    }

    /// One command with no response.
    pub async fn write(&self, command: &str) -> AppResult<()> {
        let command = command.to_string();
        self.transaction(move |io| Box::pin(async move { io.send(&command).await }))
            .await
    }

    /// Close the transport. Requests queued behind the close fail with `SessionClosed`.
    pub async fn close(&self) -> AppResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Close(reply_tx))
            .await
            .map_err(|_| self.closed())?;
        reply_rx.await.map_err(|_| self.closed())?
    }

    /// False once the owner task has exited.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
