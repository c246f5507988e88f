//! Handle registry and managed boundary.
//!
//! [`Bridge`] tracks every connection it opened, keyed by [`ConnectionId`],
//! and runs host queries on a [`BlockingPool`]. It exposes the operations two
//! ways: as typed async methods through [`HostApi`], and as a tagged-term
//! function table through [`Bridge::invoke`].
//!
//! Connections opened through [`HostApi::connect`] are owned by the registry
//! until released. Connections opened through `invoke` are owned by the
//! [`Handle`] terms handed to the caller and are finalized when the last of
//! them is dropped. Disconnected ids are remembered, up to
//! [`CLOSED_HANDLE_HISTORY`] of them, so later calls observe
//! [`BridgeError::ClosedConnection`].

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use virtbridge_core::term::OK;
use virtbridge_core::{
    reply, BridgeError, ConnectionId, DomainSummary, Handle, HostInfo, NodeInfo, Term,
};

use crate::config::{BridgeConfig, ConfigError};
use crate::dispatch::BlockingPool;
use crate::{ops, Connection, VirtBackend};

/// Number of disconnected ids remembered as closed. Older ones are forgotten
/// and then behave like ids that were never issued.
pub const CLOSED_HANDLE_HISTORY: usize = 256;

/// Public description of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub uri: String,
    pub opened_at: DateTime<Utc>,
    pub closed: bool,
}

impl<B: VirtBackend> From<&Connection<B>> for ConnectionInfo {
    fn from(conn: &Connection<B>) -> Self {
        Self {
            id: conn.id(),
            uri: conn.uri().to_owned(),
            opened_at: conn.opened_at(),
            closed: conn.is_closed(),
        }
    }
}

/// Host operations as seen by an embedding surface.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Open a connection and register its handle.
    ///
    /// Uses the configured default URI when `uri` is `None`.
    ///
    /// # Errors
    /// Returns [`BridgeError::BadArgument`] for a malformed URI and
    /// [`BridgeError::Connection`] if the host cannot be reached.
    async fn connect(&self, uri: Option<&str>) -> Result<ConnectionInfo, BridgeError>;

    /// Close a handle. Later calls on it observe
    /// [`BridgeError::ClosedConnection`] until it is released.
    ///
    /// Disconnecting a closed, released or unknown handle does nothing.
    ///
    /// # Errors
    /// Never fails today.
    async fn disconnect(&self, id: ConnectionId) -> Result<(), BridgeError>;

    /// Forget a handle, closing the host connection if it is still open.
    /// Returns `false` for handles the registry does not know.
    async fn release(&self, id: ConnectionId) -> bool;

    /// # Errors
    /// See [`ops::list_domains`]; unknown handles are [`BridgeError::BadArgument`].
    async fn list_domains(&self, id: ConnectionId) -> Result<Vec<Option<DomainSummary>>, BridgeError>;

    /// # Errors
    /// See [`ops::get_host_info`]; unknown handles are [`BridgeError::BadArgument`].
    async fn get_host_info(&self, id: ConnectionId) -> Result<HostInfo, BridgeError>;

    /// # Errors
    /// See [`ops::get_node_info`]; unknown handles are [`BridgeError::BadArgument`].
    async fn get_node_info(&self, id: ConnectionId) -> Result<NodeInfo, BridgeError>;

    /// Describe a registered handle, open or closed.
    fn describe(&self, id: ConnectionId) -> Option<ConnectionInfo>;
}

/// Who keeps a registered connection alive.
enum Slot<B: VirtBackend> {
    /// The registry, until the handle is disconnected or released.
    Pinned(Arc<Connection<B>>),
    /// The caller's handle terms.
    Lent(Weak<Connection<B>>),
}

impl<B: VirtBackend> Slot<B> {
    fn get(&self) -> Option<Arc<Connection<B>>> {
        match self {
            Slot::Pinned(conn) => Some(Arc::clone(conn)),
            Slot::Lent(conn) => conn.upgrade(),
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Slot::Pinned(_) => true,
            Slot::Lent(conn) => conn.strong_count() > 0,
        }
    }
}

struct Registry<B: VirtBackend> {
    open: BTreeMap<ConnectionId, Slot<B>>,
    /// Disconnected handles, oldest first.
    closed: IndexMap<ConnectionId, ConnectionInfo>,
}

impl<B: VirtBackend> Registry<B> {
    fn new() -> Self {
        Self { open: BTreeMap::new(), closed: IndexMap::new() }
    }

    fn insert(&mut self, id: ConnectionId, slot: Slot<B>) {
        self.open.retain(|_, existing| existing.is_live());
        self.open.insert(id, slot);
    }

    fn remember_closed(&mut self, info: ConnectionInfo) {
        self.closed.insert(info.id, info);
        while self.closed.len() > CLOSED_HANDLE_HISTORY {
            self.closed.shift_remove_index(0);
        }
    }
}

/// Registry of connection handles over one backend.
pub struct Bridge<B: VirtBackend> {
    backend: Arc<B>,
    config: BridgeConfig,
    pool: BlockingPool,
    registry: RwLock<Registry<B>>,
}

impl<B: VirtBackend> Bridge<B> {
    /// Create a bridge over `backend`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(backend: B, config: BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            backend: Arc::new(backend),
            pool: BlockingPool::new(config.max_blocking_calls),
            config,
            registry: RwLock::new(Registry::new()),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Number of handles the registry answers for: live ones plus the
    /// remembered closed ones.
    pub fn handle_count(&self) -> usize {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.open.values().filter(|slot| slot.is_live()).count() + registry.closed.len()
    }

    /// Number of registered handles whose host connection is still open.
    pub fn open_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .values()
            .filter_map(Slot::get)
            .filter(|c| !c.is_closed())
            .count()
    }

    fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection<B>>, BridgeError> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = registry.open.get(&id).and_then(Slot::get) {
            return Ok(conn);
        }
        if registry.closed.contains_key(&id) || registry.open.contains_key(&id) {
            return Err(BridgeError::ClosedConnection);
        }
        Err(BridgeError::BadArgument(format!("unknown connection handle {id}")))
    }

    async fn on_connection<T, F>(&self, id: ConnectionId, op: F) -> Result<T, BridgeError>
    where
        F: FnOnce(&Connection<B>) -> Result<T, BridgeError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.lookup(id)?;
        self.pool.run(move || op(&conn)).await
    }

    async fn open(&self, uri: Option<&str>) -> Result<Arc<Connection<B>>, BridgeError> {
        let uri = uri.unwrap_or(&self.config.default_uri).to_owned();
        let backend = Arc::clone(&self.backend);
        let conn = self.pool.run(move || Connection::open(backend, &uri)).await?;
        Ok(Arc::new(conn))
    }

    fn register(&self, conn: &Arc<Connection<B>>, slot: Slot<B>) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id(), slot);
    }

    /// Close `conn` on the pool. The final drop of `conn` happens there too,
    /// since it may be the last reference.
    async fn close_on_pool(&self, conn: Arc<Connection<B>>) {
        // `close` never fails, and a panicking backend is already logged.
        let _ = self.pool.run(move || conn.close()).await;
    }

    /// Call a boundary function by name with caller terms.
    ///
    /// Function table (every function takes one argument):
    ///
    /// | function        | argument     | reply                              |
    /// |-----------------|--------------|------------------------------------|
    /// | `connect`       | URI string   | `{ok, Handle}` / `{error, Reason}` |
    /// | `disconnect`    | handle       | `ok`                               |
    /// | `list_domains`  | handle       | `{ok, [Domain \| nil]}`            |
    /// | `get_host_info` | handle       | `{ok, HostInfo}`                   |
    /// | `get_node_info` | handle       | `{ok, NodeInfo}`                   |
    /// | `release`       | handle       | `ok`                               |
    ///
    /// The handle returned by `connect` owns its connection; dropping every
    /// copy of it closes the connection.
    ///
    /// An unknown function, wrong arity, wrong argument type or unknown
    /// handle answers `{error, "bad argument"}`. `disconnect` answers `ok`
    /// for any handle. A panicking backend answers `{error, "internal
    /// error"}`. Every reply is a tagged term.
    pub async fn invoke(&self, function: &str, args: Vec<Term>) -> Term {
        let Ok([arg]) = <[Term; 1]>::try_from(args) else {
            return bad_argument(format!("{function} takes exactly one argument"));
        };

        if function == "connect" {
            let uri = match arg {
                Term::Str(uri) => uri,
                other => return bad_argument(format!("connect expects a URI string, got {other:?}")),
            };
            return match self.open(Some(&uri)).await {
                Ok(conn) => {
                    self.register(&conn, Slot::Lent(Arc::downgrade(&conn)));
                    let id = conn.id();
                    Term::ok(Term::Handle(Handle::owning(id, conn)))
                }
                Err(e) => reply::<Term>(Err(e)),
            };
        }

        let Some(id) = arg.as_handle() else {
            return bad_argument(format!("{function} expects a connection handle"));
        };

        match function {
            "disconnect" => match self.disconnect(id).await {
                Ok(()) => Term::atom(OK),
                Err(e) => reply::<Term>(Err(e)),
            },
            "release" => {
                self.release(id).await;
                Term::atom(OK)
            }
            "list_domains" => reply(self.list_domains(id).await),
            "get_host_info" => reply(self.get_host_info(id).await),
            "get_node_info" => reply(self.get_node_info(id).await),
            other => bad_argument(format!("unknown function {other}")),
        }
    }
}

#[async_trait]
impl<B: VirtBackend> HostApi for Bridge<B> {
    async fn connect(&self, uri: Option<&str>) -> Result<ConnectionInfo, BridgeError> {
        let conn = self.open(uri).await?;
        let info = ConnectionInfo::from(conn.as_ref());
        self.register(&conn, Slot::Pinned(Arc::clone(&conn)));
        Ok(info)
    }

    async fn disconnect(&self, id: ConnectionId) -> Result<(), BridgeError> {
        let conn = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let Some(conn) = registry.open.remove(&id).as_ref().and_then(Slot::get) else {
                return Ok(());
            };
            registry.remember_closed(ConnectionInfo {
                id,
                uri: conn.uri().to_owned(),
                opened_at: conn.opened_at(),
                closed: true,
            });
            conn
        };
        tracing::debug!(conn_id = %id, "handle disconnected");
        self.close_on_pool(conn).await;
        Ok(())
    }

    async fn release(&self, id: ConnectionId) -> bool {
        let (slot, was_closed) = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            (registry.open.remove(&id), registry.closed.shift_remove(&id).is_some())
        };
        let conn = slot.as_ref().and_then(Slot::get);
        drop(slot);

        if let Some(conn) = conn {
            tracing::debug!(conn_id = %id, "releasing connection handle");
            self.close_on_pool(conn).await;
            return true;
        }
        was_closed
    }

    async fn list_domains(&self, id: ConnectionId) -> Result<Vec<Option<DomainSummary>>, BridgeError> {
        self.on_connection(id, ops::list_domains).await
    }

    async fn get_host_info(&self, id: ConnectionId) -> Result<HostInfo, BridgeError> {
        self.on_connection(id, ops::get_host_info).await
    }

    async fn get_node_info(&self, id: ConnectionId) -> Result<NodeInfo, BridgeError> {
        self.on_connection(id, ops::get_node_info).await
    }

    fn describe(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = registry.open.get(&id).and_then(Slot::get) {
            return Some(ConnectionInfo::from(conn.as_ref()));
        }
        registry.closed.get(&id).cloned()
    }
}

fn bad_argument(detail: String) -> Term {
    tracing::debug!(%detail, "rejected boundary call");
    reply::<Term>(Err(BridgeError::BadArgument(detail)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockDomain, MockHost};

    fn bridge(host: MockHost) -> Bridge<MockBackend> {
        let config = BridgeConfig::default().with_default_uri("mock:///default");
        match Bridge::new(MockBackend::new(host), config) {
            Ok(b) => b,
            Err(e) => panic!("bridge construction failed: {e}"),
        }
    }

    async fn connect_handle(bridge: &Bridge<MockBackend>) -> Term {
        let reply = bridge.invoke("connect", vec![Term::str("mock:///default")]).await;
        match reply.as_tagged() {
            Some(("ok", Some(handle))) => handle.clone(),
            other => panic!("connect failed: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_uses_default_uri() {
        let bridge = bridge(MockHost::new());
        let info = match bridge.connect(None).await {
            Ok(i) => i,
            Err(e) => panic!("connect failed: {e}"),
        };
        assert_eq!(info.uri, "mock:///default");
        assert!(!info.closed);
        assert_eq!(bridge.open_count(), 1);
    }

    #[tokio::test]
    async fn invoke_connect_unreachable_is_tagged_error() {
        let bridge = bridge(MockHost::new());
        let reply = bridge.invoke("connect", vec![Term::str("qemu+tcp://10.255.0.1/system")]).await;
        assert_eq!(reply, Term::error("failed to connect to hypervisor"));
        assert_eq!(bridge.handle_count(), 0, "failed connect must not register a handle");
    }

    #[tokio::test]
    async fn invoke_rejects_bad_arguments() {
        let bridge = bridge(MockHost::new());
        let bad = Term::error("bad argument");
        assert_eq!(bridge.invoke("connect", vec![]).await, bad);
        assert_eq!(bridge.invoke("connect", vec![Term::UInt(1)]).await, bad);
        assert_eq!(bridge.invoke("list_domains", vec![Term::str("x")]).await, bad);
        assert_eq!(bridge.invoke("list_domains", vec![Term::Handle(Handle::detached(ConnectionId::new()))]).await, bad);

        let handle = connect_handle(&bridge).await;
        assert_eq!(bridge.invoke("list_domains", vec![handle.clone(), handle.clone()]).await, bad);
        assert_eq!(bridge.invoke("reboot", vec![handle]).await, bad);
    }

    #[tokio::test]
    async fn invoke_disconnect_twice_is_ok_and_releases_once() {
        let bridge = bridge(MockHost::demo());
        let handle = connect_handle(&bridge).await;

        assert_eq!(bridge.invoke("disconnect", vec![handle.clone()]).await, Term::atom("ok"));
        assert_eq!(bridge.invoke("disconnect", vec![handle.clone()]).await, Term::atom("ok"));
        assert_eq!(
            bridge.invoke("list_domains", vec![handle.clone()]).await,
            Term::error("connection closed")
        );
        assert_eq!(
            bridge.invoke("get_host_info", vec![handle.clone()]).await,
            Term::error("connection closed")
        );

        assert_eq!(bridge.invoke("release", vec![handle]).await, Term::atom("ok"));
        assert_eq!(bridge.handle_count(), 0);
        assert_eq!(bridge.backend().counters().closes(), 1);
    }

    #[tokio::test]
    async fn release_without_disconnect_finalizes_connection() {
        let bridge = bridge(MockHost::demo());
        let info = match bridge.connect(None).await {
            Ok(i) => i,
            Err(e) => panic!("connect failed: {e}"),
        };
        assert!(bridge.release(info.id).await);
        assert!(!bridge.release(info.id).await, "second release must find nothing");
        assert_eq!(bridge.backend().counters().closes(), 1);
    }

    #[tokio::test]
    async fn invoke_list_domains_marks_vanished_entry_nil() {
        let host = MockHost::new()
            .with_domain(MockDomain::running(1, "a"))
            .with_domain(MockDomain::running(2, "b").vanished());
        let bridge = bridge(host);
        let handle = connect_handle(&bridge).await;

        let reply = bridge.invoke("list_domains", vec![handle]).await;
        let Some(("ok", Some(list))) = reply.as_tagged() else {
            panic!("expected ok reply, got {reply:?}");
        };
        let items = list.as_list().unwrap_or_default();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].get("name"), Some(&Term::str("a")));
        assert!(items[1].is_nil());
    }

    #[tokio::test]
    async fn invoke_get_host_info_shapes_cpu_time() {
        let bridge = bridge(MockHost::demo());
        let handle = connect_handle(&bridge).await;
        let reply = bridge.invoke("get_host_info", vec![handle]).await;
        let Some(("ok", Some(info))) = reply.as_tagged() else {
            panic!("expected ok reply, got {reply:?}");
        };
        assert_eq!(info.get("cpus"), Some(&Term::UInt(2)));
        let first = info.get("time").and_then(Term::as_list).and_then(|t| t.first());
        assert_eq!(first.and_then(|t| t.get("total")), Some(&Term::UInt(10_000)));
    }

    #[tokio::test]
    async fn dropping_bridge_releases_pinned_connections() {
        let bridge = bridge(MockHost::demo());
        let _ = bridge.connect(None).await;
        let _ = bridge.connect(None).await;
        assert_eq!(bridge.open_count(), 2);
        let closes = {
            let backend = Arc::clone(&bridge.backend);
            drop(bridge);
            backend.counters().closes()
        };
        assert_eq!(closes, 2);
    }

    #[tokio::test]
    async fn dropping_last_handle_copy_closes_connection() {
        let bridge = bridge(MockHost::demo());
        let handle = connect_handle(&bridge).await;
        let copy = handle.clone();
        assert_eq!(bridge.open_count(), 1);

        drop(handle);
        assert_eq!(bridge.backend().counters().closes(), 0, "a live copy keeps the connection open");
        assert_eq!(bridge.invoke("get_node_info", vec![copy.clone()]).await.as_tagged().map(|t| t.0), Some("ok"));

        drop(copy);
        assert_eq!(bridge.backend().counters().closes(), 1);
        assert_eq!(bridge.open_count(), 0);
        assert_eq!(bridge.handle_count(), 0);
    }

    #[tokio::test]
    async fn connect_disconnect_cycles_keep_registry_bounded() {
        let bridge = bridge(MockHost::new());
        for _ in 0..CLOSED_HANDLE_HISTORY + 100 {
            let handle = connect_handle(&bridge).await;
            assert_eq!(bridge.invoke("disconnect", vec![handle]).await, Term::atom("ok"));
        }
        assert_eq!(bridge.open_count(), 0);
        assert_eq!(bridge.handle_count(), CLOSED_HANDLE_HISTORY);
        assert_eq!(bridge.backend().counters().closes(), CLOSED_HANDLE_HISTORY + 100);
    }

    #[tokio::test]
    async fn disconnect_answers_ok_for_released_and_unknown_handles() {
        let bridge = bridge(MockHost::demo());
        let handle = connect_handle(&bridge).await;

        assert_eq!(bridge.invoke("release", vec![handle.clone()]).await, Term::atom("ok"));
        assert_eq!(bridge.invoke("disconnect", vec![handle.clone()]).await, Term::atom("ok"));
        let unknown = Term::Handle(Handle::detached(ConnectionId::new()));
        assert_eq!(bridge.invoke("disconnect", vec![unknown]).await, Term::atom("ok"));

        assert_eq!(bridge.backend().counters().closes(), 1);
        assert_eq!(
            bridge.invoke("list_domains", vec![handle]).await,
            Term::error("bad argument"),
            "a released handle is forgotten"
        );
    }

    #[tokio::test]
    async fn typed_disconnect_remembers_closed_handle() {
        let bridge = bridge(MockHost::demo());
        let info = match bridge.connect(None).await {
            Ok(i) => i,
            Err(e) => panic!("connect failed: {e}"),
        };
        assert!(bridge.disconnect(info.id).await.is_ok());
        assert!(bridge.describe(info.id).is_some_and(|d| d.closed));
        assert!(matches!(bridge.get_node_info(info.id).await, Err(BridgeError::ClosedConnection)));
        assert_eq!(bridge.open_count(), 0);
        assert_eq!(bridge.handle_count(), 1);
    }
}
