//! Shuffle-side primitives for adaptive stage execution.
//!
//! Architecture role:
//! - [`MapOutputStatistics`] is the per-reducer byte/row record every
//!   adaptive decision is driven by;
//! - the partition range model describes post-shuffle reads as contiguous
//!   reducer ranges crossed with contiguous mapper ranges;
//! - [`ShuffleStore`] keeps Arrow IPC-encoded map outputs in process and
//!   serves range reads plus the preferred-location contract.

pub mod partition;
pub mod rows;
pub mod stats;
pub mod store;
pub mod writer;

pub use partition::{adaptive_read, coalesced_read, local_read, ShuffleReadPartition};
pub use rows::{BroadcastPayload, RowSet, ShuffledRowSet};
pub use stats::MapOutputStatistics;
pub use store::{MapPartitionPayload, ShuffleHandle, ShuffleStore};
pub use writer::{decode_ipc_bytes, encode_ipc_bytes, partition_batches};
