//! Driver-side planning: DAG to instruction sets.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use riffle_core::{FlowError, Result};
use riffle_flow::{plan_tasks, FlowGraph, ShardRef, StepFunction, StepId, TaskPlan};

use crate::instruction::{shard_name, Instruction, InstructionSet, Location, ShardLocation};

/// The external placement oracle: where each shard is served.
///
/// Implementations must be idempotent within one flow and must hand out
/// distinct ports to colocated shards.
pub trait PlacementOracle: Send + Sync {
    fn place(&self, shard: ShardRef) -> Option<Location>;
}

/// A memoizing oracle spreading shards round-robin over a host list,
/// with sequentially assigned ports. Enough for tests and single-rack
/// deployments; real clusters inject their own.
pub struct RoundRobinOracle {
    hosts: Vec<String>,
    base_port: u16,
    assigned: Mutex<HashMap<ShardRef, Location>>,
}

impl RoundRobinOracle {
    pub fn new(hosts: Vec<String>, base_port: u16) -> Self {
        assert!(!hosts.is_empty(), "an oracle needs at least one host");
        RoundRobinOracle { hosts, base_port, assigned: Mutex::new(HashMap::new()) }
    }
}

impl PlacementOracle for RoundRobinOracle {
    fn place(&self, shard: ShardRef) -> Option<Location> {
        let mut assigned = self.assigned.lock().expect("placement lock poisoned");
        let next = assigned.len();
        Some(
            assigned
                .entry(shard)
                .or_insert_with(|| {
                    let host = self.hosts[next % self.hosts.len()].clone();
                    Location::new(host, self.base_port + next as u16)
                })
                .clone(),
        )
    }
}

/// The result of planning one flow for remote execution.
#[derive(Debug, Clone)]
pub struct DistributedPlan {
    pub flow_hash: u32,
    /// One set per agent host, instructions in dependency order.
    pub instruction_sets: Vec<InstructionSet>,
    /// Steps that stay in the driver process (sources and outputs).
    pub driver_steps: Vec<StepId>,
}

struct Placer<'a> {
    flow_hash: u32,
    oracle: &'a dyn PlacementOracle,
    assigned: HashMap<ShardRef, Location>,
}

impl<'a> Placer<'a> {
    fn locate(&mut self, shard: ShardRef) -> Result<ShardLocation> {
        let name = shard_name(self.flow_hash, shard.dataset, shard.shard);
        let location = match self.assigned.get(&shard) {
            Some(location) => location.clone(),
            None => {
                let location = self
                    .oracle
                    .place(shard)
                    .ok_or_else(|| FlowError::Placement(name.clone()))?;
                self.assigned.insert(shard, location.clone());
                location
            }
        };
        Ok(ShardLocation { name, location })
    }

    fn locate_all(&mut self, shards: &[ShardRef]) -> Result<Vec<ShardLocation>> {
        shards.iter().map(|&s| self.locate(s)).collect()
    }
}

fn instruction_for(
    graph: &FlowGraph,
    step_id: StepId,
    task: &TaskPlan,
    placer: &mut Placer<'_>,
) -> Result<Instruction> {
    let step = &graph.steps[step_id];
    let input_is_pipe = step
        .inputs
        .first()
        .map(|&d| graph.dataset(d).is_pipe)
        .unwrap_or(false);

    let instruction = match &step.function {
        StepFunction::Script { command } => Instruction::Script {
            command: command.clone(),
            input_is_pipe,
            output_is_pipe: false,
            input: placer.locate(task.inputs[0])?,
            output: placer.locate(task.outputs[0])?,
        },
        StepFunction::Command { command } => Instruction::Script {
            command: command.clone(),
            input_is_pipe,
            output_is_pipe: true,
            input: placer.locate(task.inputs[0])?,
            output: placer.locate(task.outputs[0])?,
        },
        StepFunction::CommandPerRow { command } => Instruction::PipeAsArgs {
            command: command.clone(),
            input_is_pipe,
            input: placer.locate(task.inputs[0])?,
            output: placer.locate(task.outputs[0])?,
        },
        StepFunction::LocalSort { order_bys, on_error } => Instruction::LocalSort {
            order_bys: order_bys.clone(),
            on_error: *on_error,
            input: placer.locate(task.inputs[0])?,
            output: placer.locate(task.outputs[0])?,
        },
        StepFunction::MergeSortedTo { order_bys } => Instruction::MergeSortedTo {
            order_bys: order_bys.clone(),
            inputs: placer.locate_all(&task.inputs)?,
            output: placer.locate(task.outputs[0])?,
        },
        StepFunction::ScatterPartitions { indexes, .. } => Instruction::ScatterPartitions {
            indexes: indexes.clone(),
            input: placer.locate(task.inputs[0])?,
            outputs: placer.locate_all(&task.outputs)?,
        },
        StepFunction::CollectPartitions => Instruction::CollectPartitions {
            inputs: placer.locate_all(&task.inputs)?,
            output: placer.locate(task.outputs[0])?,
        },
        StepFunction::LocalGroupByKey { order_bys } => Instruction::LocalGroupByKey {
            order_bys: order_bys.clone(),
            input: placer.locate(task.inputs[0])?,
            output: placer.locate(task.outputs[0])?,
        },
        StepFunction::JoinPartitionedSorted { order_bys, join_type } => {
            Instruction::JoinPartitionedSorted {
                order_bys: order_bys.clone(),
                join_type: *join_type,
                left: placer.locate(task.inputs[0])?,
                right: placer.locate(task.inputs[1])?,
                output: placer.locate(task.outputs[0])?,
            }
        }
        StepFunction::CoGroupPartitionedSorted { order_bys } => {
            Instruction::CoGroupPartitionedSorted {
                order_bys: order_bys.clone(),
                left: placer.locate(task.inputs[0])?,
                right: placer.locate(task.inputs[1])?,
                output: placer.locate(task.outputs[0])?,
            }
        }
        StepFunction::Source(_) | StepFunction::Output(_) => {
            return Err(FlowError::InvalidFlow(format!(
                "driver-side step {} cannot become an instruction",
                step.name
            )))
        }
    };
    Ok(instruction)
}

/// Plans every non-driver task of the flow onto agents.
///
/// Placement failures surface before anything executes.
pub fn plan(graph: &FlowGraph, oracle: &dyn PlacementOracle) -> Result<DistributedPlan> {
    graph.validate()?;
    let flow_hash = graph.hash_code();
    let mut placer = Placer { flow_hash, oracle, assigned: HashMap::new() };

    let mut instruction_sets: Vec<InstructionSet> = Vec::new();
    let mut driver_steps = Vec::new();

    for step_id in graph.step_order()? {
        let step = &graph.steps[step_id];
        if step.is_on_driver_side {
            driver_steps.push(step_id);
            // Driver-served shards still need endpoints for remote
            // consumers to dial.
            if let Some(output) = step.output {
                for shard in 0..graph.dataset(output).shard_count {
                    placer.locate(ShardRef { dataset: output, shard })?;
                }
            }
            continue;
        }

        for task in plan_tasks(graph, step)? {
            let instruction = instruction_for(graph, step_id, &task, &mut placer)?;
            let host = instruction.output_locations()[0].location.host.clone();
            debug!(kind = instruction.kind(), host = %host, "planned instruction");
            match instruction_sets.iter_mut().find(|set| set.host == host) {
                Some(set) => set.instructions.push(instruction),
                None => instruction_sets.push(InstructionSet { host, instructions: vec![instruction] }),
            }
        }
    }

    Ok(DistributedPlan { flow_hash, instruction_sets, driver_steps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use riffle_flow::Flow;

    fn partitioned_sort_flow() -> Flow {
        let flow = Flow::new();
        flow.strings(vec!["b".into(), "a".into(), "c".into()])
            .partition_by_key(2, &[1])
            .sort(&[1])
            .pipe_out(tokio::io::sink());
        flow
    }

    #[test]
    fn plans_every_non_driver_task_in_dependency_order() {
        let flow = partitioned_sort_flow();
        let graph = flow.snapshot();
        let oracle = RoundRobinOracle::new(vec!["agent-1".into()], 7000);
        let plan = plan(&graph, &oracle).expect("plan");

        assert_eq!(plan.flow_hash, graph.hash_code());
        // Source and PipeOut stay on the driver.
        assert_eq!(plan.driver_steps.len(), 2);
        assert_eq!(plan.instruction_sets.len(), 1);

        let kinds: Vec<&str> = plan.instruction_sets[0]
            .instructions
            .iter()
            .map(|i| i.kind())
            .collect();
        // Scatter (1 input shard), collect (2 partitions), local sort
        // per partition, merge to one.
        assert_eq!(
            kinds,
            vec![
                "ScatterPartitions",
                "CollectPartitions",
                "CollectPartitions",
                "LocalSort",
                "LocalSort",
                "MergeSortedTo",
            ]
        );
    }

    #[test]
    fn instructions_group_by_output_host() {
        let flow = partitioned_sort_flow();
        let graph = flow.snapshot();
        let oracle = RoundRobinOracle::new(vec!["agent-1".into(), "agent-2".into()], 7000);
        let plan = plan(&graph, &oracle).expect("plan");

        assert!(plan.instruction_sets.len() > 1);
        let total: usize = plan.instruction_sets.iter().map(|s| s.instructions.len()).sum();
        assert_eq!(total, 6);
        for set in &plan.instruction_sets {
            for instruction in &set.instructions {
                assert_eq!(instruction.output_locations()[0].location.host, set.host);
            }
        }
    }

    #[test]
    fn colocated_shards_get_distinct_ports() {
        let flow = partitioned_sort_flow();
        let graph = flow.snapshot();
        let oracle = RoundRobinOracle::new(vec!["agent-1".into()], 7000);
        let plan = plan(&graph, &oracle).expect("plan");

        let mut ports: Vec<u16> = plan.instruction_sets[0]
            .instructions
            .iter()
            .flat_map(|i| i.output_locations())
            .map(|l| l.location.port)
            .collect();
        ports.sort_unstable();
        let before = ports.len();
        ports.dedup();
        assert_eq!(ports.len(), before, "output ports must not collide");
    }

    #[test]
    fn placement_failure_aborts_planning() {
        struct NoPlacement;
        impl PlacementOracle for NoPlacement {
            fn place(&self, _shard: ShardRef) -> Option<Location> {
                None
            }
        }

        let flow = partitioned_sort_flow();
        let graph = flow.snapshot();
        let err = plan(&graph, &NoPlacement).expect_err("placement must fail");
        assert!(matches!(err, FlowError::Placement(_)));
    }
}
