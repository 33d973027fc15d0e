//! # Riffle Flow - DAG Builder and Runner
//!
//! A [`Flow`] owns the DAG of datasets and steps; [`Dataset`] handles
//! carry the fluent builder surface. Builder calls only append steps -
//! nothing executes until [`Flow::run`], which snapshots the graph,
//! materializes the shard pipes, and spawns one task per shard binding.
//!
//! ```no_run
//! use riffle_flow::Flow;
//!
//! # async fn example() -> riffle_core::Result<()> {
//! let flow = Flow::new();
//! let rows = flow
//!     .strings(vec!["the cat".into(), "the dog".into()])
//!     .flat_map("tr ' ' '\\n'")
//!     .sort(&[1])
//!     .output_rows();
//! flow.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod graph;
pub mod task;

mod dataset;
mod exec;
mod flow;
mod output;
mod runner;
mod source;

pub use flow::{Dataset, Flow};
pub use graph::{
    DatasetId, DatasetMeta, FlowGraph, OutputFn, ShardRef, SourceFn, StepDescription,
    StepFunction, StepId, StepLayout, StepMeta,
};
pub use runner::{LocalRunner, Runner};
pub use task::{plan_tasks, TaskPlan};

pub use riffle_core::row::{ascending_on, Order, OrderBy, Row, Value};
pub use riffle_shuffle::{DecodeErrorPolicy, JoinType};
