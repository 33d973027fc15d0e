//! # Riffle Shuffle - Stream Operators
//!
//! The shuffle and sort core: every operator is a plain async function
//! over byte-stream readers and writers, so the local task executor and
//! the remote agent run exactly the same code paths.
//!
//! ## Available Operators
//!
//! - **local_sort**: in-memory stable sort of one shard
//! - **merge_sorted_to**: k-way merge of locally sorted shards
//! - **scatter_partitions / collect_partitions**: hash-partitioned
//!   fan-out and ordered fan-in
//! - **local_group_by_key**: adjacent grouping of a key-sorted shard
//! - **join_partitioned_sorted / co_group_partitioned_sorted**: merge
//!   join and cogroup of partitioned-sorted inputs
//!
//! Operators write their own EOF message on every output stream before
//! returning; closing the writers stays with the task that owns them.

mod join;
mod partition;
mod sort;

pub use join::{
    co_group_partitioned_sorted, join_partitioned_sorted, local_group_by_key, JoinType,
};
pub use partition::{collect_partitions, scatter_partitions};
pub use sort::{local_sort, merge_sorted_to, DecodeErrorPolicy};
