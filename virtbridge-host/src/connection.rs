//! Connection handle owning one live connection to a virtualization host.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use virtbridge_core::{BridgeError, ConnectionId};

use crate::VirtBackend;

/// A handle to one open host connection.
///
/// The foreign connection is released exactly once: either by
/// [`Connection::close`] or, if the handle is dropped while still open, by
/// its `Drop` impl. Both paths take the connection out of the handle before
/// releasing it, so a second attempt finds nothing to release.
///
/// Once closed, every operation on the handle fails with
/// [`BridgeError::ClosedConnection`].
pub struct Connection<B: VirtBackend> {
    id: ConnectionId,
    uri: String,
    opened_at: DateTime<Utc>,
    backend: Arc<B>,
    conn: Mutex<Option<B::Conn>>,
}

impl<B: VirtBackend> Connection<B> {
    /// Connect to the host at `uri`.
    ///
    /// # Errors
    /// Returns [`BridgeError::BadArgument`] if `uri` is empty or contains a
    /// NUL byte, and [`BridgeError::Connection`] if the host refuses or cannot
    /// be reached.
    pub fn open(backend: Arc<B>, uri: &str) -> Result<Self, BridgeError> {
        validate_uri(uri)?;

        let conn = backend.connect(uri).map_err(|e| {
            tracing::warn!(%uri, error = %e, "hypervisor connection failed");
            BridgeError::Connection { uri: uri.to_owned(), detail: e.to_string() }
        })?;

        let id = ConnectionId::new();
        tracing::info!(conn_id = %id, %uri, "connected to hypervisor");

        Ok(Self {
            id,
            uri: uri.to_owned(),
            opened_at: Utc::now(),
            backend,
            conn: Mutex::new(Some(conn)),
        })
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Close the connection. Closing an already closed handle is a no-op.
    ///
    /// # Errors
    /// Never fails today. A failure reported by the host while closing is
    /// logged and the handle is still marked closed.
    pub fn close(&self) -> Result<(), BridgeError> {
        self.release("close");
        Ok(())
    }

    /// Run `f` against the live connection.
    ///
    /// The handle stays locked for the duration of `f`, so a concurrent
    /// [`Connection::close`] waits for the query to finish.
    ///
    /// # Errors
    /// Returns [`BridgeError::ClosedConnection`] if the handle is closed,
    /// otherwise whatever `f` returns.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&B, &B::Conn) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(BridgeError::ClosedConnection)?;
        f(&self.backend, conn)
    }

    // A poisoned lock still holds a valid `Option`; keep using it.
    fn lock(&self) -> MutexGuard<'_, Option<B::Conn>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, path: &'static str) {
        let Some(conn) = self.lock().take() else {
            return;
        };
        match self.backend.close(conn) {
            Ok(()) => tracing::info!(conn_id = %self.id, path, "hypervisor connection closed"),
            Err(e) => tracing::warn!(
                conn_id = %self.id,
                path,
                error = %e,
                "hypervisor reported an error while closing"
            ),
        }
    }
}

impl<B: VirtBackend> Drop for Connection<B> {
    fn drop(&mut self) {
        self.release("finalizer");
    }
}

impl<B: VirtBackend> fmt::Debug for Connection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("opened_at", &self.opened_at)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn validate_uri(uri: &str) -> Result<(), BridgeError> {
    if uri.is_empty() {
        return Err(BridgeError::BadArgument("empty connection URI".to_owned()));
    }
    if uri.contains('\0') {
        return Err(BridgeError::BadArgument("connection URI contains a NUL byte".to_owned()));
    }
    Ok(())
}
