//! Client SDK.
//!
//! A [`Client`] keeps a best guess of the current leader and the full member
//! list. Every call goes to the cached leader first, then to each member in
//! order; a non-leader's redirect gets exactly one extra hop. After a full
//! pass without success the client sleeps `retry_sleep` and starts over, up
//! to `max_sync_rounds` passes.
//!
//! Each client owns a session (a random id) kept alive by a background task,
//! so locks it takes are released by the cluster if the process disappears.
//! Dropping the [`Client`] stops the keepalive and every outstanding watch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::SdkError;
use crate::rpc::{
    CleanBinlogRequest, ClusterNodeInfo, DeleteRequest, GetRequest, KeepAliveRequest,
    LockRequest, PutRequest, Request, Response, ScanRequest, UnLockRequest, WatchRequest,
};
use crate::stats::OpStatistics;
use crate::transport::{ClusterTransport, TcpTransport};

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn ClusterTransport>,
    leader: Mutex<Option<String>>,
    session_id: String,
    stop: CancellationToken,
}

enum Attempt {
    Done(Response),
    Redirect(Option<String>),
    Busy,
    Failed,
}

pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects over TCP; member ids are socket addresses.
    pub fn connect(config: ClientConfig) -> Self {
        let transport = Arc::new(TcpTransport::new(config.rpc_timeout));
        Self::with_transport(config, transport)
    }

    /// Builds a client on any transport and starts its keepalive task.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn ClusterTransport>) -> Self {
        let inner = Arc::new(ClientInner {
            config,
            transport,
            leader: Mutex::new(None),
            session_id: nanoid::nanoid!(),
            stop: CancellationToken::new(),
        });
        debug!(session = %inner.session_id, "client session created");
        tokio::spawn(run_keepalive(Arc::clone(&inner)));
        Self { inner }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Last member that answered as leader.
    pub fn cached_leader(&self) -> Option<String> {
        self.inner.leader.lock().clone()
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), SdkError> {
        let request = Request::Put(PutRequest {
            user: self.inner.config.namespace.clone(),
            key: key.to_string(),
            value: value.to_string(),
        });
        self.inner.route_sync(request).await.map(|_| ())
    }

    pub async fn get(&self, key: &str) -> Result<String, SdkError> {
        let request = Request::Get(GetRequest {
            user: self.inner.config.namespace.clone(),
            key: key.to_string(),
            stale_ok: self.inner.config.stale_reads,
        });
        match self.inner.route_sync(request).await? {
            Response::Get(resp) if resp.hit => Ok(resp.value),
            Response::Get(_) => Err(SdkError::NoSuchKey),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), SdkError> {
        let request = Request::Delete(DeleteRequest {
            user: self.inner.config.namespace.clone(),
            key: key.to_string(),
        });
        self.inner.route_sync(request).await.map(|_| ())
    }

    /// Range over `[start, end)`; an empty `end` is unbounded. Pages are
    /// fetched lazily as the result is consumed.
    pub fn scan(&self, start: &str, end: &str) -> ScanResult {
        ScanResult {
            inner: Arc::clone(&self.inner),
            next_start: start.to_string(),
            end: end.to_string(),
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    /// One attempt at the lock. Fails with [`SdkError::LockFail`] if another
    /// live session holds it.
    pub async fn try_lock(&self, key: &str) -> Result<(), SdkError> {
        let request = Request::Lock(LockRequest {
            user: self.inner.config.namespace.clone(),
            key: key.to_string(),
            session_id: self.inner.session_id.clone(),
        });
        match self.inner.route_sync(request).await? {
            Response::Lock(resp) if resp.acquired => Ok(()),
            Response::Lock(_) => Err(SdkError::LockFail),
            other => Err(unexpected(other)),
        }
    }

    /// Retries [`Client::try_lock`] every `lock_retry_backoff` until it
    /// succeeds or the client is dropped.
    pub async fn lock(&self, key: &str) -> Result<(), SdkError> {
        loop {
            match self.try_lock(key).await {
                Ok(()) => return Ok(()),
                Err(SdkError::LockFail | SdkError::Busy) => {}
                Err(err) => return Err(err),
            }
            tokio::select! {
                _ = self.inner.stop.cancelled() => return Err(SdkError::LockFail),
                _ = sleep(self.inner.config.lock_retry_backoff) => {}
            }
        }
    }

    /// [`Client::lock`] bounded by `limit`.
    pub async fn lock_timeout(&self, key: &str, limit: Duration) -> Result<(), SdkError> {
        tokio::time::timeout(limit, self.lock(key))
            .await
            .map_err(|_| SdkError::Timeout)?
    }

    pub async fn unlock(&self, key: &str) -> Result<(), SdkError> {
        let request = Request::UnLock(UnLockRequest {
            user: self.inner.config.namespace.clone(),
            key: key.to_string(),
            session_id: self.inner.session_id.clone(),
        });
        self.inner.route_sync(request).await.map(|_| ())
    }

    /// Watches `key` for the next change of value or existence.
    ///
    /// The returned handle resolves exactly once: on a change, when the
    /// cluster stays unreachable for `watch_error_limit` attempts, or when
    /// the watch is canceled.
    pub fn watch(&self, key: &str) -> WatchHandle {
        let (tx, rx) = oneshot::channel();
        let cancel = self.inner.stop.child_token();
        tokio::spawn(run_watch(
            Arc::clone(&self.inner),
            key.to_string(),
            cancel.clone(),
            tx,
        ));
        WatchHandle { event: rx, cancel }
    }

    /// Status of every member that answers.
    pub async fn show_cluster(&self) -> Vec<ClusterNodeInfo> {
        let mut nodes = Vec::new();
        for member in &self.inner.config.members {
            match self.inner.transport.call(member, Request::ShowStatus).await {
                Ok(Response::ShowStatus(info)) => nodes.push(info),
                Ok(other) => warn!(member = %member, response = ?other, "unexpected status response"),
                Err(err) => debug!(member = %member, error = %err, "status unavailable"),
            }
        }
        nodes
    }

    /// Throughput counters of the leader (or the first member that answers).
    pub async fn show_statistics(&self) -> Result<Vec<OpStatistics>, SdkError> {
        match self.inner.route_sync(Request::ShowStatistics).await? {
            Response::ShowStatistics(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    /// Removes log slots below `end_index` on every member.
    pub async fn clean_binlog(&self, end_index: i64) -> Result<(), SdkError> {
        let mut cleaned = true;
        for member in &self.inner.config.members {
            let request = Request::CleanBinlog(CleanBinlogRequest { end_index });
            match self.inner.transport.call(member, request).await {
                Ok(Response::CleanBinlog(ack)) if ack.success => {}
                Ok(_) => cleaned = false,
                Err(err) => {
                    warn!(member = %member, error = %err, "clean binlog unreachable");
                    cleaned = false;
                }
            }
        }
        if cleaned {
            Ok(())
        } else {
            Err(SdkError::CleanBinlogFail)
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

fn unexpected(response: Response) -> SdkError {
    warn!(response = ?response, "unexpected response type");
    SdkError::ClusterDown
}

/// Whether a request must be answered by the leader to count.
fn leader_only(request: &Request) -> bool {
    match request {
        Request::Get(req) => !req.stale_ok,
        Request::Scan(req) => !req.stale_ok,
        Request::Watch(_) | Request::ShowStatus | Request::ShowStatistics => false,
        _ => true,
    }
}

impl ClientInner {
    async fn route_sync(&self, request: Request) -> Result<Response, SdkError> {
        self.route(request, self.config.rpc_timeout, self.config.max_sync_rounds)
            .await
    }

    async fn route(
        &self,
        request: Request,
        deadline: Duration,
        rounds: usize,
    ) -> Result<Response, SdkError> {
        let mut saw_busy = false;
        for round in 0..rounds.max(1) {
            if round > 0 {
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = sleep(self.config.retry_sleep) => {}
                }
            }
            for member in self.candidates() {
                match self.attempt(&member, &request, deadline).await {
                    Attempt::Done(response) => return Ok(response),
                    Attempt::Busy => saw_busy = true,
                    Attempt::Redirect(Some(leader)) if leader != member => {
                        match self.attempt(&leader, &request, deadline).await {
                            Attempt::Done(response) => return Ok(response),
                            Attempt::Busy => saw_busy = true,
                            Attempt::Redirect(_) | Attempt::Failed => {}
                        }
                    }
                    Attempt::Redirect(_) | Attempt::Failed => {}
                }
            }
            debug!(op = request.name(), round, "no member accepted the request");
        }
        if saw_busy {
            Err(SdkError::Busy)
        } else {
            Err(SdkError::ClusterDown)
        }
    }

    async fn attempt(&self, member: &str, request: &Request, deadline: Duration) -> Attempt {
        let response = match self
            .transport
            .call_with_timeout(member, request.clone(), deadline)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                debug!(member, error = %err, op = request.name(), "rpc failed");
                return Attempt::Failed;
            }
        };
        let Some(ack) = response.ack() else {
            return Attempt::Done(response);
        };
        if ack.success {
            if leader_only(request) {
                self.remember_leader(member);
            }
            return Attempt::Done(response);
        }
        if ack.busy {
            return Attempt::Busy;
        }
        Attempt::Redirect(ack.leader_id.clone())
    }

    fn remember_leader(&self, member: &str) {
        let mut leader = self.leader.lock();
        if leader.as_deref() != Some(member) {
            info!(leader = member, "leader discovered");
            *leader = Some(member.to_string());
        }
    }

    /// Cached leader first, then every other member in configured order.
    fn candidates(&self) -> Vec<String> {
        let leader = self.leader.lock().clone();
        let mut order = Vec::with_capacity(self.config.members.len());
        if let Some(leader) = leader {
            order.push(leader);
        }
        for member in &self.config.members {
            if !order.contains(member) {
                order.push(member.clone());
            }
        }
        order
    }
}

async fn run_keepalive(inner: Arc<ClientInner>) {
    loop {
        let request = Request::KeepAlive(KeepAliveRequest {
            session_id: inner.session_id.clone(),
        });
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            result = inner.route(request, inner.config.rpc_timeout, 1) => {
                if let Err(err) = result {
                    warn!(session = %inner.session_id, error = %err, "keepalive failed");
                }
            }
        }
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = sleep(inner.config.keepalive_interval) => {}
        }
    }
    debug!(session = %inner.session_id, "keepalive stopped");
}

/// What ended a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The key's value or existence changed (or a child key changed).
    Changed,
    /// The cluster kept failing; the watch gave up.
    ClusterDown,
    /// Canceled by the caller, by dropping the client, or by a newer watch
    /// on the same key from this client.
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchEventKind,
    /// The new value; `None` if the key no longer exists.
    pub value: Option<String>,
}

/// Pending watch. Resolves exactly once.
pub struct WatchHandle {
    event: oneshot::Receiver<WatchEvent>,
    cancel: CancellationToken,
}

impl WatchHandle {
    /// Stops watching; the handle then resolves with [`WatchEventKind::Canceled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> WatchEvent {
        let WatchHandle { event, cancel } = self;
        match event.await {
            Ok(event) => event,
            // The watch task only disappears without reporting on runtime shutdown.
            Err(_) => {
                cancel.cancel();
                WatchEvent {
                    key: String::new(),
                    kind: WatchEventKind::Canceled,
                    value: None,
                }
            }
        }
    }
}

async fn run_watch(
    inner: Arc<ClientInner>,
    key: String,
    cancel: CancellationToken,
    done: oneshot::Sender<WatchEvent>,
) {
    let event = watch_until_event(&inner, &key, &cancel).await;
    debug!(key = %key, kind = ?event.kind, "watch finished");
    let _ = done.send(event);
}

async fn watch_until_event(
    inner: &ClientInner,
    key: &str,
    cancel: &CancellationToken,
) -> WatchEvent {
    let event = |kind, value| WatchEvent {
        key: key.to_string(),
        kind,
        value,
    };
    let mut errors = 0usize;
    let mut seen: Option<Option<String>> = None;

    loop {
        if errors >= inner.config.watch_error_limit.max(1) {
            return event(WatchEventKind::ClusterDown, None);
        }

        let request = match &seen {
            None => Request::Get(GetRequest {
                user: inner.config.namespace.clone(),
                key: key.to_string(),
                stale_ok: inner.config.stale_reads,
            }),
            Some(value) => Request::Watch(WatchRequest {
                user: inner.config.namespace.clone(),
                key: key.to_string(),
                old_value: value.clone().unwrap_or_default(),
                key_exists: value.is_some(),
                session_id: inner.session_id.clone(),
            }),
        };
        let deadline = match &seen {
            None => inner.config.rpc_timeout,
            Some(_) => inner.config.watch_timeout,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return event(WatchEventKind::Canceled, None),
            result = inner.route(request, deadline, 1) => result,
        };

        match result {
            Ok(Response::Get(resp)) => {
                seen = Some(resp.hit.then_some(resp.value));
                errors = 0;
            }
            Ok(Response::Watch(resp)) if resp.canceled => {
                return event(WatchEventKind::Canceled, None);
            }
            Ok(Response::Watch(resp)) if resp.changed => {
                let value = resp.exists.then_some(resp.value);
                return event(WatchEventKind::Changed, value);
            }
            Ok(Response::Watch(_)) => errors = 0,
            Ok(other) => {
                warn!(response = ?other, "unexpected watch response");
                errors += 1;
            }
            Err(err) => {
                debug!(key, error = %err, errors, "watch round failed");
                errors += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return event(WatchEventKind::Canceled, None),
                    _ = sleep(inner.config.retry_sleep) => {}
                }
            }
        }
    }
}

/// Lazily paginated range read returned by [`Client::scan`].
pub struct ScanResult {
    inner: Arc<ClientInner>,
    next_start: String,
    end: String,
    page: VecDeque<(String, String)>,
    exhausted: bool,
}

impl ScanResult {
    /// Next pair in key order, fetching another page when needed.
    pub async fn next(&mut self) -> Result<Option<(String, String)>, SdkError> {
        if self.page.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.page.pop_front())
    }

    /// Drains the remaining pairs.
    pub async fn collect(mut self) -> Result<Vec<(String, String)>, SdkError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    async fn fetch_page(&mut self) -> Result<(), SdkError> {
        let request = Request::Scan(ScanRequest {
            user: self.inner.config.namespace.clone(),
            start_key: self.next_start.clone(),
            end_key: self.end.clone(),
            size_limit: self.inner.config.scan_page_size.max(1),
            stale_ok: self.inner.config.stale_reads,
        });
        let resp = match self.inner.route_sync(request).await? {
            Response::Scan(resp) => resp,
            other => return Err(unexpected(other)),
        };
        match resp.items.last() {
            // The smallest key strictly after `last`, so nested keys like
            // `last/child` are still visited.
            Some((last, _)) => {
                self.next_start = format!("{last}\0");
                self.exhausted = !resp.has_more;
            }
            None => self.exhausted = true,
        }
        self.page.extend(resp.items);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;

    fn client(members: &[&str]) -> Client {
        let network = MemoryNetwork::new();
        let config = ClientConfig {
            retry_sleep: Duration::from_millis(10),
            max_sync_rounds: 2,
            ..ClientConfig::new(members.iter().map(|m| m.to_string()).collect())
        };
        Client::with_transport(config, Arc::new(network.client_transport(Duration::from_millis(50))))
    }

    #[test]
    fn stale_reads_and_watches_do_not_pin_the_leader() {
        let get = |stale_ok| {
            Request::Get(GetRequest {
                user: String::new(),
                key: "k".into(),
                stale_ok,
            })
        };
        assert!(leader_only(&get(false)));
        assert!(!leader_only(&get(true)));
        assert!(!leader_only(&Request::ShowStatus));
        assert!(leader_only(&Request::CleanBinlog(CleanBinlogRequest { end_index: 0 })));
    }

    #[tokio::test]
    async fn cached_leader_is_tried_first() {
        let client = client(&["a", "b", "c"]);
        assert_eq!(client.inner.candidates(), ["a", "b", "c"]);
        client.inner.remember_leader("c");
        assert_eq!(client.inner.candidates(), ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn unreachable_cluster_is_reported() {
        let client = client(&["a", "b"]);
        assert_eq!(client.put("k", "v").await, Err(SdkError::ClusterDown));
        let watch = client.watch("k");
        let event = watch.wait().await;
        assert_eq!(event.kind, WatchEventKind::ClusterDown);
    }
}
