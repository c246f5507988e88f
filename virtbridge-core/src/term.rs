//! Caller-side value representation and tagged replies.
//!
//! A [`Term`] is the shape a managed caller receives: atoms, integers,
//! strings, sequences, ordered maps, tuples, and opaque connection handles.
//! Every boundary call answers with a tagged term: `{ok, Value}`, the bare
//! atom `ok`, or `{error, "reason"}`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::{BridgeError, ConnectionId, CpuTime, DomainSummary, HostInfo, NodeInfo};

/// Atom standing in for an entry that could not be populated.
pub const NIL: &str = "nil";
pub const OK: &str = "ok";
pub const ERROR: &str = "error";

/// Caller-held reference to a connection.
///
/// A handle issued by `connect` owns a share of its connection: when the last
/// clone is dropped the connection is finalized, whether or not the caller
/// ever disconnected it. A detached handle only carries the identifier.
///
/// Handles compare equal when they name the same connection.
#[derive(Clone)]
pub struct Handle {
    id: ConnectionId,
    resource: Option<Arc<dyn Any + Send + Sync>>,
}

impl Handle {
    /// A handle that keeps `resource` alive for as long as it is held.
    #[must_use]
    pub fn owning(id: ConnectionId, resource: Arc<dyn Any + Send + Sync>) -> Self {
        Self { id, resource: Some(resource) }
    }

    #[must_use]
    pub fn detached(id: ConnectionId) -> Self {
        Self { id, resource: None }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn is_owning(&self) -> bool {
        self.resource.is_some()
    }
}

impl From<ConnectionId> for Handle {
    fn from(id: ConnectionId) -> Self {
        Self::detached(id)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("owning", &self.is_owning())
            .finish()
    }
}

/// A value in the caller's native data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Atom(String),
    Int(i64),
    UInt(u64),
    Str(String),
    List(Vec<Term>),
    /// Map that keeps keys in insertion order.
    Map(IndexMap<String, Term>),
    Tuple(Vec<Term>),
    Handle(Handle),
}

impl Term {
    pub fn atom(name: impl Into<String>) -> Self {
        Term::Atom(name.into())
    }

    #[must_use]
    pub fn nil() -> Self {
        Term::atom(NIL)
    }

    pub fn str(s: impl Into<String>) -> Self {
        Term::Str(s.into())
    }

    /// Build an ordered map from `(key, value)` pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Term)>) -> Self {
        Term::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// `{ok, value}`
    #[must_use]
    pub fn ok(value: Term) -> Self {
        Term::Tuple(vec![Term::atom(OK), value])
    }

    /// `{error, "reason"}`
    pub fn error(reason: impl Into<String>) -> Self {
        Term::Tuple(vec![Term::atom(ERROR), Term::str(reason)])
    }

    #[must_use]
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(a) => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_handle(&self) -> Option<ConnectionId> {
        match self {
            Term::Handle(handle) => Some(handle.id()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a key when this term is a map.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Term> {
        match self {
            Term::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.as_atom() == Some(NIL)
    }

    /// Split a tagged reply into its tag and payload.
    ///
    /// `ok` yields `("ok", None)`; `{ok, V}` and `{error, R}` yield the tag
    /// and a reference to the payload. Anything else yields `None`.
    #[must_use]
    pub fn as_tagged(&self) -> Option<(&str, Option<&Term>)> {
        match self {
            Term::Atom(tag) if tag == OK => Some((OK, None)),
            Term::Tuple(items) => match items.as_slice() {
                [Term::Atom(tag), payload] if tag == OK || tag == ERROR => {
                    Some((tag.as_str(), Some(payload)))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

impl Serialize for Term {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Term::Atom(a) if a == NIL => serializer.serialize_none(),
            Term::Atom(a) | Term::Str(a) => serializer.serialize_str(a),
            Term::Int(n) => serializer.serialize_i64(*n),
            Term::UInt(n) => serializer.serialize_u64(*n),
            Term::List(items) | Term::Tuple(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Term::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Term::Handle(handle) => serializer.collect_str(&handle.id()),
        }
    }
}

/// Conversion of host-side values into caller terms.
pub trait ToTerm {
    fn to_term(&self) -> Term;
}

impl ToTerm for Term {
    fn to_term(&self) -> Term {
        self.clone()
    }
}

impl ToTerm for ConnectionId {
    fn to_term(&self) -> Term {
        Term::Handle(Handle::detached(*self))
    }
}

impl<T: ToTerm> ToTerm for Option<T> {
    fn to_term(&self) -> Term {
        self.as_ref().map_or_else(Term::nil, ToTerm::to_term)
    }
}

impl<T: ToTerm> ToTerm for Vec<T> {
    fn to_term(&self) -> Term {
        Term::List(self.iter().map(ToTerm::to_term).collect())
    }
}

impl ToTerm for DomainSummary {
    fn to_term(&self) -> Term {
        Term::map([
            ("id", Term::UInt(u64::from(self.id))),
            ("name", Term::str(self.name.clone())),
            ("cpu_time", Term::UInt(self.cpu_time)),
            ("memory", Term::UInt(self.memory)),
            ("state", Term::UInt(u64::from(self.state.as_raw()))),
        ])
    }
}

impl ToTerm for CpuTime {
    fn to_term(&self) -> Term {
        Term::map([
            ("total", Term::UInt(self.total)),
            ("idle", Term::UInt(self.idle)),
            ("user", Term::UInt(self.user)),
            ("kernel", Term::UInt(self.kernel)),
        ])
    }
}

impl ToTerm for HostInfo {
    fn to_term(&self) -> Term {
        Term::map([
            ("time", self.time.to_term()),
            ("cpus", Term::UInt(u64::from(self.cpus))),
        ])
    }
}

impl ToTerm for NodeInfo {
    fn to_term(&self) -> Term {
        Term::map([
            ("model", Term::str(self.model.clone())),
            ("memory", Term::UInt(self.memory)),
            ("cpus", Term::UInt(u64::from(self.cpus))),
            ("mhz", Term::UInt(u64::from(self.mhz))),
            ("nodes", Term::UInt(u64::from(self.nodes))),
            ("sockets", Term::UInt(u64::from(self.sockets))),
            ("cores", Term::UInt(u64::from(self.cores))),
            ("threads", Term::UInt(u64::from(self.threads))),
        ])
    }
}

/// Turn an operation result into `{ok, Value}` or `{error, "reason"}`.
pub fn reply<T: ToTerm>(result: Result<T, BridgeError>) -> Term {
    match result {
        Ok(value) => Term::ok(value.to_term()),
        Err(e) => Term::error(e.to_string()),
    }
}
