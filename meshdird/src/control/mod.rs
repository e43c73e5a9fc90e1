//! Control socket: accepts clients and forwards their requests to the
//! directory loop.

mod connection;
mod listener;

use anyhow::{Context, Result};
use shared::protocol::{Request, Response};
use tokio::sync::{mpsc, oneshot};

pub use self::listener::{bind, run};

/// A decoded request waiting for the directory loop.
pub struct ControlRequest {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Handle used by connections to reach the directory loop
#[derive(Clone)]
pub struct DirectoryHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl DirectoryHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ControlRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn execute(&self, request: Request) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest { request, reply })
            .await
            .map_err(|_| anyhow::anyhow!("Directory loop closed"))?;
        rx.await.context("Directory loop dropped request")
    }
}
