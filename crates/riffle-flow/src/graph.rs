//! The in-memory DAG.
//!
//! Datasets, steps, and shards are arena-allocated and name each other by
//! integer id, so the back-references between them are structural rather
//! than ownership edges. The graph is single-writer while a flow is being
//! built and immutable once a runner snapshots it.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use riffle_core::hash::fnv1a32;
use riffle_core::row::OrderBy;
use riffle_core::{FlowError, PipeReader, PipeWriter, Result};
use riffle_shuffle::{DecodeErrorPolicy, JoinType};

pub type DatasetId = usize;
pub type StepId = usize;

/// Driver-side producer body: receives the shard ordinal and the shard's
/// writer, writes row messages, and hands the writer back. EOF framing
/// and close are appended by the executor.
pub type SourceFn =
    Arc<dyn Fn(usize, PipeWriter) -> BoxFuture<'static, Result<PipeWriter>> + Send + Sync>;

/// Driver-side consumer body: invoked once per input shard, in shard
/// order, and expected to read its reader to EOF.
pub type OutputFn = Arc<dyn Fn(PipeReader) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The per-task body of a step, with its parameters.
#[derive(Clone)]
pub enum StepFunction {
    /// Driver-side producer.
    Source(SourceFn),
    /// Driver-side terminal consumer.
    Output(OutputFn),
    /// User transform: one child process per task, rows as TSV lines.
    Script { command: String },
    /// Raw byte child process; the output dataset becomes a pipe.
    Command { command: String },
    /// One shell invocation per input row, `$1`..`$N` substituted.
    CommandPerRow { command: String },
    LocalSort { order_bys: Vec<OrderBy>, on_error: DecodeErrorPolicy },
    MergeSortedTo { order_bys: Vec<OrderBy> },
    ScatterPartitions { indexes: Vec<usize>, partition_count: usize },
    CollectPartitions,
    LocalGroupByKey { order_bys: Vec<OrderBy> },
    JoinPartitionedSorted { order_bys: Vec<OrderBy>, join_type: JoinType },
    CoGroupPartitionedSorted { order_bys: Vec<OrderBy> },
}

/// The serializable face of a step function: its kind and parameters,
/// used for the flow hash code and for instruction planning.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum StepDescription {
    Source,
    Output,
    Script { command: String },
    Command { command: String },
    CommandPerRow { command: String },
    LocalSort { order_bys: Vec<OrderBy>, on_error: DecodeErrorPolicy },
    MergeSortedTo { order_bys: Vec<OrderBy> },
    ScatterPartitions { indexes: Vec<usize>, partition_count: usize },
    CollectPartitions,
    LocalGroupByKey { order_bys: Vec<OrderBy> },
    JoinPartitionedSorted { order_bys: Vec<OrderBy>, join_type: JoinType },
    CoGroupPartitionedSorted { order_bys: Vec<OrderBy> },
}

impl StepFunction {
    pub fn describe(&self) -> StepDescription {
        match self {
            StepFunction::Source(_) => StepDescription::Source,
            StepFunction::Output(_) => StepDescription::Output,
            StepFunction::Script { command } => {
                StepDescription::Script { command: command.clone() }
            }
            StepFunction::Command { command } => {
                StepDescription::Command { command: command.clone() }
            }
            StepFunction::CommandPerRow { command } => {
                StepDescription::CommandPerRow { command: command.clone() }
            }
            StepFunction::LocalSort { order_bys, on_error } => StepDescription::LocalSort {
                order_bys: order_bys.clone(),
                on_error: *on_error,
            },
            StepFunction::MergeSortedTo { order_bys } => {
                StepDescription::MergeSortedTo { order_bys: order_bys.clone() }
            }
            StepFunction::ScatterPartitions { indexes, partition_count } => {
                StepDescription::ScatterPartitions {
                    indexes: indexes.clone(),
                    partition_count: *partition_count,
                }
            }
            StepFunction::CollectPartitions => StepDescription::CollectPartitions,
            StepFunction::LocalGroupByKey { order_bys } => {
                StepDescription::LocalGroupByKey { order_bys: order_bys.clone() }
            }
            StepFunction::JoinPartitionedSorted { order_bys, join_type } => {
                StepDescription::JoinPartitionedSorted {
                    order_bys: order_bys.clone(),
                    join_type: *join_type,
                }
            }
            StepFunction::CoGroupPartitionedSorted { order_bys } => {
                StepDescription::CoGroupPartitionedSorted { order_bys: order_bys.clone() }
            }
        }
    }

    /// True for child-process steps whose output is a raw byte stream.
    pub fn is_pipe(&self) -> bool {
        matches!(self, StepFunction::Command { .. } | StepFunction::CommandPerRow { .. })
    }
}

impl fmt::Debug for StepFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.describe())
    }
}

/// How a step's tasks bind input shards to output shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepLayout {
    /// Output shard `i` consumes input shard `i`. Also covers sources,
    /// which have no input at all.
    OneToOne,
    /// One task consumes every input shard.
    AllToOne,
    /// Output shard `i` consumes the `every_n` consecutive input shards
    /// starting at `i * every_n`.
    LinkedNToOne { every_n: usize },
    /// One task per input shard, owning `fan_out` consecutive output
    /// shards. The scatter side of a partition exchange.
    OneToEveryN { fan_out: usize },
    /// Output shard `j` consumes input shards `j, j+stride, j+2*stride…`.
    /// The collect side of a partition exchange.
    StrideToOne { stride: usize },
    /// Output shard `j` consumes shard `j` of both inputs.
    Pairwise,
}

/// One partition of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardRef {
    pub dataset: DatasetId,
    pub shard: usize,
}

#[derive(Debug, Clone)]
pub struct DatasetMeta {
    pub id: DatasetId,
    pub shard_count: usize,
    pub produced_by: StepId,
    /// The OrderBys every shard is sorted by, when known.
    pub local_sorted: Option<Vec<OrderBy>>,
    /// The key columns the dataset is hash-partitioned by, when known.
    pub partitioned_by: Option<Vec<usize>>,
    /// True when shards carry raw child-process bytes instead of framed
    /// row messages.
    pub is_pipe: bool,
}

#[derive(Debug, Clone)]
pub struct StepMeta {
    pub id: StepId,
    pub name: String,
    pub inputs: Vec<DatasetId>,
    pub output: Option<DatasetId>,
    pub layout: StepLayout,
    pub is_on_driver_side: bool,
    pub function: StepFunction,
}

/// The arena owning every dataset and step of one flow.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    pub datasets: Vec<DatasetMeta>,
    pub steps: Vec<StepMeta>,
}

#[derive(Serialize)]
struct StepRecord<'a> {
    name: &'a str,
    inputs: &'a [DatasetId],
    output: Option<DatasetId>,
    shards: Option<usize>,
    function: StepDescription,
}

impl FlowGraph {
    /// Appends a step and, unless it is terminal, its output dataset.
    /// Returns the step id and the output dataset id.
    pub fn add_step(
        &mut self,
        name: impl Into<String>,
        inputs: Vec<DatasetId>,
        output_shards: Option<usize>,
        layout: StepLayout,
        is_on_driver_side: bool,
        function: StepFunction,
    ) -> (StepId, Option<DatasetId>) {
        let step_id = self.steps.len();
        let is_pipe = function.is_pipe();
        let output = output_shards.map(|shard_count| {
            let dataset_id = self.datasets.len();
            self.datasets.push(DatasetMeta {
                id: dataset_id,
                shard_count,
                produced_by: step_id,
                local_sorted: None,
                partitioned_by: None,
                is_pipe,
            });
            dataset_id
        });
        self.steps.push(StepMeta {
            id: step_id,
            name: name.into(),
            inputs,
            output,
            layout,
            is_on_driver_side,
            function,
        });
        (step_id, output)
    }

    pub fn dataset(&self, id: DatasetId) -> &DatasetMeta {
        &self.datasets[id]
    }

    pub fn dataset_mut(&mut self, id: DatasetId) -> &mut DatasetMeta {
        &mut self.datasets[id]
    }

    /// A stable identifier derived from the DAG structure.
    pub fn hash_code(&self) -> u32 {
        let records: Vec<StepRecord<'_>> = self
            .steps
            .iter()
            .map(|s| StepRecord {
                name: &s.name,
                inputs: &s.inputs,
                output: s.output,
                shards: s.output.map(|d| self.datasets[d].shard_count),
                function: s.function.describe(),
            })
            .collect();
        let serialized =
            serde_json::to_vec(&records).expect("step records serialize to JSON");
        fnv1a32(&serialized)
    }

    /// Steps in dependency order.
    pub fn step_order(&self) -> Result<Vec<StepId>> {
        let mut graph: DiGraph<StepId, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = self.steps.iter().map(|s| graph.add_node(s.id)).collect();
        for step in &self.steps {
            for &input in &step.inputs {
                let producer = self.datasets[input].produced_by;
                graph.add_edge(nodes[producer], nodes[step.id], ());
            }
        }
        let order = toposort(&graph, None)
            .map_err(|_| FlowError::InvalidFlow("step graph has a cycle".into()))?;
        Ok(order.into_iter().map(|n| graph[n]).collect())
    }

    /// Checks the structural invariants before execution.
    pub fn validate(&self) -> Result<()> {
        for step in &self.steps {
            for &input in &step.inputs {
                if input >= self.datasets.len() {
                    return Err(FlowError::InvalidFlow(format!(
                        "step {} reads unknown dataset {}",
                        step.name, input
                    )));
                }
            }
            match step.layout {
                StepLayout::Pairwise => {
                    if step.inputs.len() != 2 {
                        return Err(FlowError::InvalidFlow(format!(
                            "step {} is pairwise but has {} inputs",
                            step.name,
                            step.inputs.len()
                        )));
                    }
                    let left = self.datasets[step.inputs[0]].shard_count;
                    let right = self.datasets[step.inputs[1]].shard_count;
                    if left != right {
                        return Err(FlowError::InvalidFlow(format!(
                            "step {} joins {} shards against {}",
                            step.name, left, right
                        )));
                    }
                }
                StepLayout::OneToEveryN { fan_out } => {
                    let input = self.datasets[step.inputs[0]].shard_count;
                    let output = step.output.map(|d| self.datasets[d].shard_count);
                    if output != Some(input * fan_out) {
                        return Err(FlowError::InvalidFlow(format!(
                            "step {} scatters {} shards into {:?}",
                            step.name, input, output
                        )));
                    }
                }
                StepLayout::StrideToOne { stride } => {
                    let input = self.datasets[step.inputs[0]].shard_count;
                    if stride == 0 || input % stride != 0 {
                        return Err(FlowError::InvalidFlow(format!(
                            "step {} collects {} shards with stride {}",
                            step.name, input, stride
                        )));
                    }
                }
                _ => {}
            }
        }
        // Surfaces cycles.
        self.step_order().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_source() -> StepFunction {
        StepFunction::Source(Arc::new(|_, w| Box::pin(async move { Ok(w) })))
    }

    fn build_linear() -> FlowGraph {
        let mut g = FlowGraph::default();
        let (_, src) = g.add_step("Source", vec![], Some(1), StepLayout::OneToOne, true, noop_source());
        let (_, sorted) = g.add_step(
            "LocalSort",
            vec![src.expect("dataset")],
            Some(1),
            StepLayout::OneToOne,
            false,
            StepFunction::LocalSort {
                order_bys: vec![OrderBy::asc(1)],
                on_error: DecodeErrorPolicy::Fail,
            },
        );
        assert!(sorted.is_some());
        g
    }

    #[test]
    fn hash_code_is_stable_and_structure_sensitive() {
        let a = build_linear();
        let b = build_linear();
        assert_eq!(a.hash_code(), b.hash_code());

        let mut c = build_linear();
        c.add_step(
            "Script",
            vec![1],
            Some(1),
            StepLayout::OneToOne,
            false,
            StepFunction::Script { command: "cat".into() },
        );
        assert_ne!(a.hash_code(), c.hash_code());
    }

    #[test]
    fn step_order_respects_dependencies() {
        let g = build_linear();
        assert_eq!(g.step_order().expect("order"), vec![0, 1]);
        g.validate().expect("valid");
    }

    #[test]
    fn mismatched_pairwise_inputs_fail_validation() {
        let mut g = FlowGraph::default();
        let (_, a) = g.add_step("Source", vec![], Some(2), StepLayout::OneToOne, true, noop_source());
        let (_, b) = g.add_step("Source", vec![], Some(3), StepLayout::OneToOne, true, noop_source());
        g.add_step(
            "Join",
            vec![a.expect("a"), b.expect("b")],
            Some(2),
            StepLayout::Pairwise,
            false,
            StepFunction::JoinPartitionedSorted {
                order_bys: vec![OrderBy::asc(1)],
                join_type: JoinType::Inner,
            },
        );
        assert!(g.validate().is_err());
    }
}
