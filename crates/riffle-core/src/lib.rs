//! # Riffle Core - Dataflow Primitives
//!
//! This crate provides the foundational pieces shared by every riffle
//! component: the row codec, the bounded byte pipe connecting shard tasks,
//! the priority queue backing merge operators, and the hash that every
//! participant in a flow must agree on.
//!
//! ## Key Components
//!
//! - **Row codec**: length-prefixed, self-describing MessagePack tuples,
//!   key extraction, and a single total order shared by sort, merge, join
//! - **Pipe**: one-reader/one-writer bounded byte channel with explicit
//!   close, EOF propagation, and backpressure
//! - **Priority queue**: min-heap with a caller comparator and provenance
//!   tags, FIFO on ties
//! - **Hash**: pinned FNV-1a/32 for partitioning and flow identity

use std::io::ErrorKind;

pub mod hash;
pub mod pipe;
pub mod pq;
pub mod row;
pub mod tsv;

pub use pipe::{pipe, PipeReader, PipeWriter, DEFAULT_PIPE_BUFFER};
pub use pq::PriorityQueue;
pub use row::{Order, OrderBy, Row, Value};

/// Error conditions surfaced by flow execution.
///
/// The first fatal error observed by a runner becomes the flow's exit
/// status; everything else drains through EOF propagation.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// A message could not be decoded into a row.
    #[error("decode error: {0}")]
    Decode(String),

    /// The reading end of a pipe went away while writing.
    ///
    /// Producers treat this as a stop signal, not as data corruption.
    #[error("broken pipe")]
    BrokenPipe,

    /// The byte stream ended inside a message frame.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A child process carrying user logic exited non-zero.
    #[error("child process exited with status {0}")]
    ChildExit(i32),

    /// The placement oracle produced no location for a shard.
    #[error("no placement for shard {0}")]
    Placement(String),

    /// The flow graph is malformed (cycle, missing input, bad shard math).
    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic error wrapper for driver-side user closures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// True when the error means "the consumer went away" rather than a
    /// genuine failure. Producers stop quietly on these.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            FlowError::BrokenPipe => true,
            FlowError::Io(e) => e.kind() == ErrorKind::BrokenPipe,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
