//! Error taxonomy shared by the table store, the cluster command surface and
//! the migration coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slot::Slot;
use crate::table::ClusterId;

/// Result alias for shard-group operations.
pub type ShardResult<T> = Result<T, ShardError>;

/// Errors returned by shard-group operations.
///
/// Only [`ShardError::TransientUnavailable`] and [`ShardError::ConfigConflict`]
/// are retried automatically (by the coordinator/generator and by
/// [`crate::operator::reconfigure`] respectively). The coordinator also
/// replays a relocation batch after [`ShardError::Indeterminate`], since
/// batches are idempotent. Everything else propagates.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardError {
    /// A REPLACE carried a term older than the one stored for `cluster_id`.
    #[error(
        "shard group config conflict for cluster {cluster_id}: stored term {stored_term}, offered term {offered_term}"
    )]
    ConfigConflict {
        cluster_id: ClusterId,
        stored_term: u64,
        offered_term: u64,
    },

    /// The request was not applied (leader change, unreachable cluster, keys
    /// locked by a relocation). Safe to retry unchanged.
    #[error("transient unavailability: {0}")]
    TransientUnavailable(String),

    /// The request may or may not have been applied (reply lost).
    #[error("indeterminate outcome: {0}")]
    Indeterminate(String),

    /// An operator or coordinator bug: invalid table, wrong migration state.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// The slot is served elsewhere; the request was not applied.
    #[error("{0}")]
    Redirect(Redirect),
}

impl ShardError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShardError::TransientUnavailable(_))
    }

    /// True when the request is known not to have taken effect.
    pub fn is_definite(&self) -> bool {
        !matches!(self, ShardError::Indeterminate(_))
    }
}

/// Kind of cluster redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedirectKind {
    /// Slot ownership moved; refresh routing and retry.
    Moved,
    /// Slot is migrating and the key is gone from the source; retry this one
    /// request against the importing cluster with ASKING.
    Ask,
}

/// Redirect reply naming the slot and where to go.
///
/// `location` is a cluster id for in-process clusters and a `host:port`
/// replica address for RESP clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: Slot,
    pub location: String,
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RedirectKind::Moved => "MOVED",
            RedirectKind::Ask => "ASK",
        };
        write!(f, "{kind} {} {}", self.slot, self.location)
    }
}
