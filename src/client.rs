//! Client facade
//!
//! Behaviors compose as an explicit chain of `RequestHandler`s, each layer
//! owning the next; the pool manager sits at the tail. The facade owns the
//! manager and disposes it (and with it every pool) on drop.

use crate::config::Options;
use crate::conn::{Request, Response};
use crate::pool::PoolManager;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The send capability each layer of the handler chain implements
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response>;
}

#[async_trait]
impl RequestHandler for PoolManager {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        PoolManager::send(self, request, cancel).await
    }
}

#[async_trait]
impl<T: RequestHandler + ?Sized> RequestHandler for Arc<T> {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        (**self).send(request, cancel).await
    }
}

/// HTTP/1.1 client dispatching over pooled connections
pub struct Client {
    manager: Arc<PoolManager>,
}

impl Client {
    pub fn new(options: Options) -> Result<Self> {
        Ok(Client {
            manager: PoolManager::new(options)?,
        })
    }

    pub fn manager(&self) -> &Arc<PoolManager> {
        &self.manager
    }

    pub async fn send(&self, request: Request) -> Result<Response> {
        self.manager.send(request, &CancellationToken::new()).await
    }

    pub async fn send_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.manager.send(request, cancel).await
    }

    /// Dispose every pool. Subsequent sends fail with `Disposed`.
    pub fn close(&self) {
        self.manager.dispose();
    }
}

#[async_trait]
impl RequestHandler for Client {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        self.manager.send(request, cancel).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.manager.dispose();
    }
}
