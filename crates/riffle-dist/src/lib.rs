//! # Riffle Dist - Distributed Planning
//!
//! Turns a flow DAG into per-shard instructions addressed by
//! `(host, port)` endpoints. Placement comes from an injected oracle;
//! execution on an agent reuses exactly the stream operators the local
//! runner uses, over TCP sockets carrying the same framed row format.
//!
//! Driver-side steps (sources and outputs) never become instructions;
//! they run in the flow-building process and connect to the remote
//! endpoints directly.

pub mod agent;
pub mod instruction;
pub mod plan;

pub use instruction::{shard_name, Instruction, InstructionSet, Location, ShardLocation};
pub use plan::{plan, DistributedPlan, PlacementOracle};
