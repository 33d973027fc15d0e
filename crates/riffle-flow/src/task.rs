//! Task planning: binding input shards to output shards per step layout.

use riffle_core::{FlowError, Result};

use crate::graph::{FlowGraph, ShardRef, StepId, StepLayout, StepMeta};

/// One runtime instance of a step, with its ordered input shards and the
/// output shards it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPlan {
    pub step: StepId,
    pub ordinal: usize,
    pub inputs: Vec<ShardRef>,
    pub outputs: Vec<ShardRef>,
}

impl TaskPlan {
    /// A log-friendly task name.
    pub fn name(&self, graph: &FlowGraph) -> String {
        format!("{}[{}]", graph.steps[self.step].name, self.ordinal)
    }
}

fn shards_of(graph: &FlowGraph, dataset: usize) -> impl Iterator<Item = ShardRef> + '_ {
    (0..graph.dataset(dataset).shard_count).map(move |shard| ShardRef { dataset, shard })
}

/// Materializes the tasks of one step.
pub fn plan_tasks(graph: &FlowGraph, step: &StepMeta) -> Result<Vec<TaskPlan>> {
    let output = step.output.map(|d| graph.dataset(d));
    let plans = match step.layout {
        StepLayout::OneToOne => {
            let count = output.map(|d| d.shard_count).unwrap_or(1);
            if let Some(&input) = step.inputs.first() {
                let input_shards = graph.dataset(input).shard_count;
                if input_shards != count {
                    return Err(FlowError::InvalidFlow(format!(
                        "step {} maps {} input shards onto {} output shards",
                        step.name, input_shards, count
                    )));
                }
            }
            (0..count)
                .map(|i| TaskPlan {
                    step: step.id,
                    ordinal: i,
                    inputs: step
                        .inputs
                        .first()
                        .map(|&d| vec![ShardRef { dataset: d, shard: i }])
                        .unwrap_or_default(),
                    outputs: output
                        .map(|d| vec![ShardRef { dataset: d.id, shard: i }])
                        .unwrap_or_default(),
                })
                .collect()
        }
        StepLayout::AllToOne => {
            let inputs = step
                .inputs
                .iter()
                .flat_map(|&d| shards_of(graph, d))
                .collect();
            vec![TaskPlan {
                step: step.id,
                ordinal: 0,
                inputs,
                outputs: output.map(|d| shards_of(graph, d.id).collect()).unwrap_or_default(),
            }]
        }
        StepLayout::LinkedNToOne { every_n } => {
            let out = output.ok_or_else(|| {
                FlowError::InvalidFlow(format!("step {} has no output dataset", step.name))
            })?;
            let input = step.inputs[0];
            let input_shards = graph.dataset(input).shard_count;
            (0..out.shard_count)
                .map(|i| {
                    let lo = i * every_n;
                    let hi = ((i + 1) * every_n).min(input_shards);
                    TaskPlan {
                        step: step.id,
                        ordinal: i,
                        inputs: (lo..hi).map(|s| ShardRef { dataset: input, shard: s }).collect(),
                        outputs: vec![ShardRef { dataset: out.id, shard: i }],
                    }
                })
                .collect()
        }
        StepLayout::OneToEveryN { fan_out } => {
            let out = output.ok_or_else(|| {
                FlowError::InvalidFlow(format!("step {} has no output dataset", step.name))
            })?;
            let input = step.inputs[0];
            (0..graph.dataset(input).shard_count)
                .map(|i| TaskPlan {
                    step: step.id,
                    ordinal: i,
                    inputs: vec![ShardRef { dataset: input, shard: i }],
                    outputs: (i * fan_out..(i + 1) * fan_out)
                        .map(|s| ShardRef { dataset: out.id, shard: s })
                        .collect(),
                })
                .collect()
        }
        StepLayout::StrideToOne { stride } => {
            let out = output.ok_or_else(|| {
                FlowError::InvalidFlow(format!("step {} has no output dataset", step.name))
            })?;
            let input = step.inputs[0];
            let upstream = graph.dataset(input).shard_count / stride;
            (0..out.shard_count)
                .map(|j| TaskPlan {
                    step: step.id,
                    ordinal: j,
                    inputs: (0..upstream)
                        .map(|i| ShardRef { dataset: input, shard: i * stride + j })
                        .collect(),
                    outputs: vec![ShardRef { dataset: out.id, shard: j }],
                })
                .collect()
        }
        StepLayout::Pairwise => {
            let out = output.ok_or_else(|| {
                FlowError::InvalidFlow(format!("step {} has no output dataset", step.name))
            })?;
            let (left, right) = (step.inputs[0], step.inputs[1]);
            (0..out.shard_count)
                .map(|j| TaskPlan {
                    step: step.id,
                    ordinal: j,
                    inputs: vec![
                        ShardRef { dataset: left, shard: j },
                        ShardRef { dataset: right, shard: j },
                    ],
                    outputs: vec![ShardRef { dataset: out.id, shard: j }],
                })
                .collect()
        }
    };
    Ok(plans)
}
