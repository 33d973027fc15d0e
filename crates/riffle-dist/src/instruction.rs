//! Per-shard instruction descriptors.
//!
//! An [`Instruction`] is a tagged union with exactly one operation set,
//! carrying its input and output shard endpoints. The serialized form is
//! the unit shipped to agents; its framing on the wire is left to the
//! transport.

use std::fmt;

use serde::{Deserialize, Serialize};

use riffle_core::hash::fnv1a32;
use riffle_core::row::OrderBy;
use riffle_shuffle::{DecodeErrorPolicy, JoinType};

/// A network endpoint assigned by the placement oracle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub host: String,
    pub port: u16,
}

impl Location {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Location { host: host.into(), port }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The stable, log-friendly name of one shard.
pub fn shard_name(flow_hash: u32, dataset: usize, shard: usize) -> String {
    format!("f{}-d{}-s{}", flow_hash, dataset, shard)
}

/// A named shard endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLocation {
    pub name: String,
    pub location: Location,
}

/// One per-shard operation with its endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Instruction {
    Script {
        command: String,
        input_is_pipe: bool,
        output_is_pipe: bool,
        input: ShardLocation,
        output: ShardLocation,
    },
    LocalSort {
        order_bys: Vec<OrderBy>,
        on_error: DecodeErrorPolicy,
        input: ShardLocation,
        output: ShardLocation,
    },
    PipeAsArgs {
        command: String,
        input_is_pipe: bool,
        input: ShardLocation,
        output: ShardLocation,
    },
    MergeSortedTo {
        order_bys: Vec<OrderBy>,
        inputs: Vec<ShardLocation>,
        output: ShardLocation,
    },
    ScatterPartitions {
        indexes: Vec<usize>,
        input: ShardLocation,
        outputs: Vec<ShardLocation>,
    },
    CollectPartitions {
        inputs: Vec<ShardLocation>,
        output: ShardLocation,
    },
    LocalGroupByKey {
        order_bys: Vec<OrderBy>,
        input: ShardLocation,
        output: ShardLocation,
    },
    JoinPartitionedSorted {
        order_bys: Vec<OrderBy>,
        join_type: JoinType,
        left: ShardLocation,
        right: ShardLocation,
        output: ShardLocation,
    },
    CoGroupPartitionedSorted {
        order_bys: Vec<OrderBy>,
        left: ShardLocation,
        right: ShardLocation,
        output: ShardLocation,
    },
}

impl Instruction {
    /// The operation name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::Script { .. } => "Script",
            Instruction::LocalSort { .. } => "LocalSort",
            Instruction::PipeAsArgs { .. } => "PipeAsArgs",
            Instruction::MergeSortedTo { .. } => "MergeSortedTo",
            Instruction::ScatterPartitions { .. } => "ScatterPartitions",
            Instruction::CollectPartitions { .. } => "CollectPartitions",
            Instruction::LocalGroupByKey { .. } => "LocalGroupByKey",
            Instruction::JoinPartitionedSorted { .. } => "JoinPartitionedSorted",
            Instruction::CoGroupPartitionedSorted { .. } => "CoGroupPartitionedSorted",
        }
    }

    /// Input endpoints in reading order.
    pub fn input_locations(&self) -> Vec<&ShardLocation> {
        match self {
            Instruction::Script { input, .. }
            | Instruction::LocalSort { input, .. }
            | Instruction::PipeAsArgs { input, .. }
            | Instruction::ScatterPartitions { input, .. }
            | Instruction::LocalGroupByKey { input, .. } => vec![input],
            Instruction::MergeSortedTo { inputs, .. }
            | Instruction::CollectPartitions { inputs, .. } => inputs.iter().collect(),
            Instruction::JoinPartitionedSorted { left, right, .. }
            | Instruction::CoGroupPartitionedSorted { left, right, .. } => vec![left, right],
        }
    }

    /// Output endpoints in writing order.
    pub fn output_locations(&self) -> Vec<&ShardLocation> {
        match self {
            Instruction::Script { output, .. }
            | Instruction::LocalSort { output, .. }
            | Instruction::PipeAsArgs { output, .. }
            | Instruction::MergeSortedTo { output, .. }
            | Instruction::CollectPartitions { output, .. }
            | Instruction::LocalGroupByKey { output, .. }
            | Instruction::JoinPartitionedSorted { output, .. }
            | Instruction::CoGroupPartitionedSorted { output, .. } => vec![output],
            Instruction::ScatterPartitions { outputs, .. } => outputs.iter().collect(),
        }
    }
}

/// The ordered instructions whose output shards are colocated on one
/// agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionSet {
    /// The agent host this set is addressed to.
    pub host: String,
    pub instructions: Vec<Instruction>,
}

impl InstructionSet {
    /// A stable identifier over the serialized form.
    pub fn hash_code(&self) -> u32 {
        let serialized = serde_json::to_vec(self).expect("instruction set serializes to JSON");
        fnv1a32(&serialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, port: u16) -> ShardLocation {
        ShardLocation {
            name: name.to_string(),
            location: Location::new("10.0.0.1", port),
        }
    }

    #[test]
    fn shard_names_are_stable() {
        assert_eq!(shard_name(7, 2, 0), "f7-d2-s0");
    }

    #[test]
    fn locations_follow_the_variant_shape() {
        let merge = Instruction::MergeSortedTo {
            order_bys: vec![OrderBy::asc(1)],
            inputs: vec![endpoint("f1-d0-s0", 7001), endpoint("f1-d0-s1", 7002)],
            output: endpoint("f1-d1-s0", 7003),
        };
        assert_eq!(merge.input_locations().len(), 2);
        assert_eq!(merge.output_locations().len(), 1);

        let scatter = Instruction::ScatterPartitions {
            indexes: vec![1],
            input: endpoint("f1-d0-s0", 7001),
            outputs: vec![endpoint("f1-d1-s0", 7004), endpoint("f1-d1-s1", 7005)],
        };
        assert_eq!(scatter.input_locations().len(), 1);
        assert_eq!(scatter.output_locations().len(), 2);
    }

    #[test]
    fn serde_round_trip_preserves_the_instruction() {
        let original = Instruction::JoinPartitionedSorted {
            order_bys: vec![OrderBy::asc(1)],
            join_type: JoinType::LeftOuter,
            left: endpoint("f1-d2-s0", 7001),
            right: endpoint("f1-d3-s0", 7002),
            output: endpoint("f1-d4-s0", 7003),
        };
        let json = serde_json::to_string(&original).expect("serialize");
        let parsed: Instruction = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, original);
    }

    #[test]
    fn hash_code_tracks_content() {
        let a = InstructionSet {
            host: "10.0.0.1".into(),
            instructions: vec![Instruction::CollectPartitions {
                inputs: vec![endpoint("f1-d1-s0", 7001)],
                output: endpoint("f1-d2-s0", 7002),
            }],
        };
        let mut b = a.clone();
        assert_eq!(a.hash_code(), b.hash_code());
        b.host = "10.0.0.2".into();
        assert_ne!(a.hash_code(), b.hash_code());
    }
}
