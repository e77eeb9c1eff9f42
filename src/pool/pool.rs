//! Per-endpoint connection pool
//!
//! One pool exists per endpoint key. It owns the idle LIFO stack, the FIFO
//! waiter queue, and the live-connection counter, and it arbitrates every
//! acquisition: reuse an idle connection, dial a new one while the cap
//! allows, or queue the caller as a waiter. All state mutation is
//! serialized by one lock; no I/O happens while it is held (the poll-read
//! probe never blocks).

use crate::auth;
use crate::common::net::encode_host_header;
use crate::config::Options;
use crate::conn::{Body, BodyFraming, ConnStream, HttpConnection, Request, Response, ResponseHead};
use crate::connect::{self, ConnectOutcome};
use crate::pool::key::{PoolKey, PoolKind};
use crate::pool::manager::PoolManager;
use crate::pool::waiter::{Handoff, Waiter};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// TLS material specialized for one pool: the shared client config cloned
/// with ALPN pinned to http/1.1, plus the SNI/validation name, which always
/// wins over whatever the shared options carried.
pub(crate) struct PoolTls {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: String,
}

/// An idle connection plus the time it was returned
pub(crate) struct CachedConnection {
    conn: HttpConnection,
    returned_at: Instant,
}

impl CachedConnection {
    fn new(conn: HttpConnection) -> Self {
        CachedConnection {
            conn,
            returned_at: Instant::now(),
        }
    }

    fn idle_expired(&self, idle_timeout: Option<Duration>) -> bool {
        match idle_timeout {
            Some(limit) => self.returned_at.elapsed() >= limit,
            None => false,
        }
    }

    fn into_conn(self) -> HttpConnection {
        self.conn
    }

    /// Full usability check used by the reaper sweep.
    fn is_usable(&mut self, lifetime: Option<Duration>, idle_timeout: Option<Duration>) -> bool {
        !self.idle_expired(idle_timeout)
            && !self.conn.lifetime_expired(lifetime)
            && self.conn.poll_is_clean()
    }
}

struct PoolState {
    /// LIFO: the most recently returned connection is reused first, so warm
    /// connections stay warm and cold ones age into the reaper.
    idle: Vec<CachedConnection>,
    /// FIFO handoff queue, populated only while the cap is saturated.
    waiters: VecDeque<Waiter>,
    /// Live connections either idle here or checked out to a requester.
    associated_count: usize,
    disposed: bool,
    used_since_cleanup: bool,
}

/// Counts observed under the pool lock at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub associated: usize,
    pub idle: usize,
    pub waiters: usize,
    pub disposed: bool,
}

/// Result of an acquisition attempt
pub(crate) enum Acquired {
    Leased { lease: Leased, reused: bool },
    /// The proxy refused the CONNECT; its response stands in for the
    /// origin's.
    TunnelRejected(Response),
}

impl fmt::Debug for Acquired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acquired::Leased { lease, reused } => f
                .debug_struct("Leased")
                .field("lease", lease)
                .field("reused", reused)
                .finish(),
            Acquired::TunnelRejected(resp) => {
                f.debug_tuple("TunnelRejected").field(resp).finish()
            }
        }
    }
}

/// A checked-out connection tied to its pool.
///
/// Dropping the lease without taking the connection disposes it and frees
/// the slot, so abandoned futures cannot strand the counter.
pub(crate) struct Leased {
    pool: Arc<ConnectionPool>,
    conn: Option<HttpConnection>,
}

impl fmt::Debug for Leased {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leased").field("conn", &self.conn).finish()
    }
}

impl Leased {
    fn new(pool: Arc<ConnectionPool>, conn: HttpConnection) -> Self {
        Leased {
            pool,
            conn: Some(conn),
        }
    }

    pub fn conn_mut(&mut self) -> &mut HttpConnection {
        self.conn.as_mut().expect("lease already consumed")
    }

    /// Hand the connection to a new owner (the response body); the slot
    /// stays accounted until that owner releases or disposes it.
    pub fn take(mut self) -> HttpConnection {
        self.conn.take().expect("lease already consumed")
    }

    /// Promote the connection into a raw transport (tunnel takeover),
    /// freeing its slot.
    pub fn detach_stream(mut self) -> ConnStream {
        let conn = self.conn.take().expect("lease already consumed");
        self.pool.detach(conn)
    }

    pub fn dispose(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.dispose_checked_out(conn);
        }
    }
}

impl Drop for Leased {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.dispose_checked_out(conn);
        }
    }
}

/// Per-endpoint pool state and arbitration
pub struct ConnectionPool {
    key: PoolKey,
    options: Arc<Options>,
    manager: Weak<PoolManager>,
    self_weak: Weak<ConnectionPool>,
    /// Pre-encoded Host header value for origin endpoints.
    host_header: Option<String>,
    tls: Option<PoolTls>,
    /// Set once Basic auth has succeeded against this endpoint.
    preauth: AtomicBool,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub(crate) fn new(
        key: PoolKey,
        options: Arc<Options>,
        manager: Weak<PoolManager>,
    ) -> Arc<Self> {
        let host_header = match (&key.host, key.port) {
            (Some(host), Some(port)) => Some(encode_host_header(host, port, key.is_secure())),
            _ => None,
        };
        let tls = key.ssl_host.as_ref().map(|ssl_host| {
            let mut config = options
                .ssl
                .as_ref()
                .map(|shared| (**shared).clone())
                .unwrap_or_else(connect::default_tls_client_config);
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            PoolTls {
                config: Arc::new(config),
                server_name: ssl_host.clone(),
            }
        });
        Arc::new_cyclic(|self_weak| ConnectionPool {
            key,
            options,
            manager,
            self_weak: self_weak.clone(),
            host_header,
            tls,
            preauth: AtomicBool::new(false),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                waiters: VecDeque::new(),
                associated_count: 0,
                disposed: false,
                used_since_cleanup: true,
            }),
        })
    }

    pub(crate) fn key(&self) -> &PoolKey {
        &self.key
    }

    pub(crate) fn options(&self) -> &Arc<Options> {
        &self.options
    }

    pub(crate) fn tls(&self) -> Option<&PoolTls> {
        self.tls.as_ref()
    }

    pub(crate) fn manager(&self) -> Option<Arc<PoolManager>> {
        self.manager.upgrade()
    }

    /// Strong handle to this pool. Pools are only ever constructed inside
    /// an `Arc` (`new_cyclic`), so the upgrade cannot fail while `&self`
    /// is alive.
    fn shared(&self) -> Arc<ConnectionPool> {
        self.self_weak.upgrade().expect("pool outside its Arc")
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let st = self.state.lock();
        PoolSnapshot {
            associated: st.associated_count,
            idle: st.idle.len(),
            waiters: st.waiters.len(),
            disposed: st.disposed,
        }
    }

    pub(crate) fn preauth_hit(&self) -> bool {
        self.options.pre_authenticate && self.preauth.load(Ordering::Relaxed)
    }

    pub(crate) fn record_preauth(&self) {
        if self.options.pre_authenticate {
            self.preauth.store(true, Ordering::Relaxed);
        }
    }

    /// Sole entry point for higher layers: request auth, then proxy auth,
    /// then the retry loop.
    pub async fn send(
        &self,
        req: Request,
        do_request_auth: bool,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        if do_request_auth && self.options.credentials.is_some() {
            return auth::send_with_request_auth(self, req, cancel).await;
        }
        self.send_with_proxy_auth(req, cancel).await
    }

    pub(crate) async fn send_with_proxy_auth(
        &self,
        req: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        if matches!(self.key.kind, PoolKind::Proxy | PoolKind::ProxyConnect) {
            if let Some(proxy) = &self.key.proxy {
                if let Some(creds) = auth::proxy_credentials(proxy, &self.options) {
                    return auth::send_with_proxy_creds(self, req, creds, cancel).await;
                }
            }
        }
        self.send_with_retry(req, cancel).await
    }

    /// Acquire + exchange, re-acquiring when a reused connection turns out
    /// to be stale under us. Fresh-connection failures never retry.
    pub(crate) async fn send_with_retry(
        &self,
        req: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        loop {
            let (lease, reused) = match self.acquire(cancel).await? {
                Acquired::Leased { lease, reused } => (lease, reused),
                Acquired::TunnelRejected(response) => return Ok(response),
            };
            match self.exchange(lease, &req, cancel).await {
                Ok(response) => return Ok(response),
                Err(e) if reused && e.is_retryable() => {
                    debug!("Retrying on a fresh connection for {}: {}", self.key, e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request/response exchange on a leased connection.
    async fn exchange(
        &self,
        mut lease: Leased,
        req: &Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let host_header = self.host_header_for(req);
        let absolute_form = self.key.kind == PoolKind::Proxy;
        let head = tokio::select! {
            head = lease.conn_mut().send_request(req, &host_header, absolute_form) => head?,
            _ = cancel.cancelled() => {
                // The write may be half done; the lease drop disposes.
                return Err(Error::Cancelled);
            }
        };

        let ResponseHead {
            status,
            version,
            headers,
            framing,
        } = head;
        let body = match framing {
            BodyFraming::Empty => {
                self.release(lease.take());
                Body::empty()
            }
            framing => Body::streaming(lease.take(), self.shared(), framing),
        };
        Ok(Response::new(status, version, headers, body))
    }

    /// The acquisition algorithm: pop idle (LIFO), else dial under the cap,
    /// else queue a waiter. A waiter completing with the capacity signal
    /// loops back to the top.
    pub(crate) async fn acquire(&self, cancel: &CancellationToken) -> Result<Acquired> {
        enum Decision {
            Idle(CachedConnection),
            Connect,
            Wait(oneshot::Receiver<Handoff>),
        }

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let decision = {
                let mut st = self.state.lock();
                if st.disposed {
                    return Err(Error::Disposed);
                }
                st.used_since_cleanup = true;
                if let Some(cached) = st.idle.pop() {
                    Decision::Idle(cached)
                } else if st.associated_count < self.options.max_connections_per_server {
                    st.associated_count += 1;
                    Decision::Connect
                } else {
                    let (waiter, rx) = Waiter::new();
                    st.waiters.push_back(waiter);
                    Decision::Wait(rx)
                }
            };

            match decision {
                Decision::Idle(cached) => {
                    let idle_ok = !cached.idle_expired(self.options.pooled_connection_idle_timeout);
                    let mut conn = cached.into_conn();
                    if idle_ok
                        && !conn.lifetime_expired(self.options.pooled_connection_lifetime)
                        && conn.poll_is_clean()
                    {
                        trace!("Reusing pooled connection for {}", self.key);
                        return Ok(Acquired::Leased {
                            lease: Leased::new(self.shared(), conn),
                            reused: true,
                        });
                    }
                    debug!("Evicting unusable idle connection for {}", self.key);
                    self.drop_slot();
                    continue;
                }
                Decision::Connect => {
                    debug!("Dialing new connection for {}", self.key);
                    let outcome = tokio::select! {
                        outcome = connect::establish(self) => outcome,
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                    };
                    match outcome {
                        Ok(ConnectOutcome::Conn(conn)) => {
                            return Ok(Acquired::Leased {
                                lease: Leased::new(self.shared(), conn),
                                reused: false,
                            });
                        }
                        Ok(ConnectOutcome::Rejected(response)) => {
                            self.drop_slot();
                            return Ok(Acquired::TunnelRejected(response));
                        }
                        Err(e) => {
                            self.drop_slot();
                            return Err(e);
                        }
                    }
                }
                Decision::Wait(rx) => {
                    trace!("Connection cap reached for {}, queueing waiter", self.key);
                    let received = tokio::select! {
                        received = rx => received,
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    };
                    match received {
                        Ok(handoff) => match handoff.take() {
                            Some(conn) => {
                                trace!("Waiter handed pooled connection for {}", self.key);
                                return Ok(Acquired::Leased {
                                    lease: Leased::new(self.shared(), conn),
                                    reused: true,
                                });
                            }
                            // Capacity freed without a connection in hand.
                            None => continue,
                        },
                        Err(_) => return Err(Error::Disposed),
                    }
                }
            }
        }
    }

    /// Return a connection once its response body has been fully read.
    ///
    /// Idempotent against a disposed pool: the connection is dropped and
    /// only the counter moves.
    pub(crate) fn release(&self, mut conn: HttpConnection) {
        let lifetime_ok = !conn.lifetime_expired(self.options.pooled_connection_lifetime);
        let clean = lifetime_ok && conn.is_reusable() && conn.poll_is_clean();

        let mut st = self.state.lock();
        if clean && !st.disposed {
            let mut pending = Some(conn);
            while let Some(waiter) = st.waiters.pop_front() {
                let payload = match pending.take() {
                    Some(c) => c,
                    None => break,
                };
                match waiter.complete(Handoff::connection(self.self_weak.clone(), payload)) {
                    Ok(()) => {
                        trace!("Handed returned connection to waiter for {}", self.key);
                        return;
                    }
                    Err(back) => pending = back.take(),
                }
            }
            conn = match pending {
                Some(c) => c,
                None => return,
            };

            let dispose_on_return =
                matches!(self.options.pooled_connection_idle_timeout, Some(d) if d.is_zero());
            if !dispose_on_return {
                st.idle.push(CachedConnection::new(conn));
                trace!("Pooled connection for {} ({} idle)", self.key, st.idle.len());
                return;
            }
        }

        st.associated_count -= 1;
        Self::signal_capacity(&mut st, &self.self_weak);
        drop(st);
        debug!("Disposing returned connection for {}", self.key);
    }

    /// Drop a checked-out connection, freeing its slot.
    pub(crate) fn dispose_checked_out(&self, conn: HttpConnection) {
        self.drop_slot();
        drop(conn);
    }

    /// Surrender a checked-out connection's transport (tunnel takeover).
    /// The slot frees: the stream now belongs to another pool's connection.
    pub(crate) fn detach(&self, conn: HttpConnection) -> ConnStream {
        self.drop_slot();
        conn.into_stream()
    }

    fn drop_slot(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.associated_count > 0);
        st.associated_count = st.associated_count.saturating_sub(1);
        Self::signal_capacity(&mut st, &self.self_weak);
    }

    /// Wake exactly one pending waiter with the capacity signal, discarding
    /// cancelled ones along the way.
    fn signal_capacity(st: &mut PoolState, self_weak: &Weak<ConnectionPool>) {
        while let Some(waiter) = st.waiters.pop_front() {
            if waiter.complete(Handoff::capacity(self_weak.clone())).is_ok() {
                break;
            }
        }
    }

    /// Dispose the pool: idle connections die now, checked-out ones on
    /// their eventual return.
    pub fn dispose(&self) {
        let (idle, waiters) = {
            let mut st = self.state.lock();
            if st.disposed {
                return;
            }
            st.disposed = true;
            st.associated_count -= st.idle.len();
            (
                std::mem::take(&mut st.idle),
                std::mem::take(&mut st.waiters),
            )
        };
        if !idle.is_empty() || !waiters.is_empty() {
            debug!(
                "Disposing pool {} ({} idle, {} waiting)",
                self.key,
                idle.len(),
                waiters.len()
            );
        }
        // Dropped outside the lock: waiter receivers observe closure and
        // fail their acquisitions with Disposed.
        drop(idle);
        drop(waiters);
    }

    /// Reaper entry point: sweep the idle stack in place, then retire the
    /// pool if it is empty, unreferenced, and untouched since the last
    /// sweep. Returns true when the manager should unmap it.
    pub(crate) fn clean_cache_and_dispose_if_unused(&self) -> bool {
        let lifetime = self.options.pooled_connection_lifetime;
        let idle_timeout = self.options.pooled_connection_idle_timeout;

        let mut st = self.state.lock();
        if st.disposed {
            return true;
        }
        let before = st.idle.len();
        st.idle.retain_mut(|cached| cached.is_usable(lifetime, idle_timeout));
        let evicted = before - st.idle.len();
        st.associated_count -= evicted;
        if evicted > 0 {
            debug!("Reaper evicted {} idle connections for {}", evicted, self.key);
        }

        if st.idle.is_empty() && st.associated_count == 0 && !st.used_since_cleanup {
            st.disposed = true;
            debug!("Retiring unused pool {}", self.key);
            return true;
        }
        st.used_since_cleanup = false;
        false
    }

    fn host_header_for(&self, req: &Request) -> String {
        if let Some(cached) = &self.host_header {
            return cached.clone();
        }
        // Raw proxy kind: the target varies per request.
        let host = req.uri().host().unwrap_or_default();
        let port = req.uri().port_u16().unwrap_or(80);
        encode_host_header(host, port, false)
    }

    #[cfg(test)]
    pub(crate) fn adopt_for_test(&self, conn: HttpConnection) -> Leased {
        self.state.lock().associated_count += 1;
        Leased::new(self.shared(), conn)
    }
}
