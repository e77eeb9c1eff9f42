//! Single-shot connection handoff slot

use crate::conn::HttpConnection;
use crate::pool::ConnectionPool;
use std::sync::Weak;
use tokio::sync::oneshot;

/// Payload a releaser publishes to a waiter.
///
/// `Some` hands over a live connection; `None` signals freed capacity and
/// tells the waiter to re-run acquisition. If the payload is never
/// received (the waiter was cancelled between publish and receive), the
/// drop guard routes the connection back to its pool so the slot is not
/// leaked.
#[derive(Debug)]
pub(crate) struct Handoff {
    pool: Weak<ConnectionPool>,
    conn: Option<HttpConnection>,
}

impl Handoff {
    pub fn capacity(pool: Weak<ConnectionPool>) -> Self {
        Handoff { pool, conn: None }
    }

    pub fn connection(pool: Weak<ConnectionPool>, conn: HttpConnection) -> Self {
        Handoff {
            pool,
            conn: Some(conn),
        }
    }

    pub fn take(mut self) -> Option<HttpConnection> {
        self.conn.take()
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.release(conn);
            }
        }
    }
}

/// Producer half of a queued waiter. Completion is single-use; a waiter
/// whose consumer went away reports cancelled and hands the payload back.
pub(crate) struct Waiter {
    tx: oneshot::Sender<Handoff>,
}

impl Waiter {
    pub fn new() -> (Waiter, oneshot::Receiver<Handoff>) {
        let (tx, rx) = oneshot::channel();
        (Waiter { tx }, rx)
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Publish the payload. Returns it when the waiter is already cancelled.
    pub fn complete(self, handoff: Handoff) -> Result<(), Handoff> {
        self.tx.send(handoff)
    }
}
