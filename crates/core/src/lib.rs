//! dotkv-core: replication and reconciliation engine.
//!
//! Provides: the dotted-version-vector causal object, the per-partition
//! vnode worker, quorum get/put coordinator FSMs, and the Merkle-tree
//! anti-entropy exchange. Entities communicate only by message passing;
//! the [`cluster::Cluster`] handle is the client-facing surface.

pub mod cluster;
pub mod codec;
pub mod dvv;
pub mod error;
pub mod exchange;
pub mod get_fsm;
pub mod hashtree;
pub mod msg;
pub mod put_fsm;
pub mod vnode;
