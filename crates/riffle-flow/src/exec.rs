//! The per-task executor.
//!
//! A task receives its connected input readers and output writers,
//! dispatches on the step function, and guarantees on return that every
//! writer it owns has been shut down. Row-stream outputs carry their EOF
//! message before the close; pipe outputs close bare.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use riffle_core::row::write_eof_message;
use riffle_core::{pipe, FlowError, PipeReader, PipeWriter, Result};
use riffle_shuffle as shuffle;

use crate::graph::{FlowGraph, StepFunction, StepId};

/// Wraps a raw pipe stream so row operators can consume it: each text
/// line becomes a row of string fields.
fn rowify(reader: PipeReader, buffer: usize) -> PipeReader {
    let (r, mut w) = pipe(buffer);
    tokio::spawn(async move {
        match riffle_io::text::read_tsv_as_rows(reader, &mut w).await {
            Ok(()) => {
                let _ = write_eof_message(&mut w).await;
                let _ = w.close().await;
            }
            Err(e) if e.is_broken_pipe() => {}
            Err(e) => warn!(error = %e, "pipe-to-row conversion failed"),
        }
    });
    r
}

/// Converts the task's inputs to row streams where the upstream dataset
/// is a pipe. `input_datasets[i]` names the dataset input `i` reads.
fn rowify_inputs(
    graph: &FlowGraph,
    input_datasets: &[usize],
    inputs: Vec<PipeReader>,
    buffer: usize,
) -> Vec<PipeReader> {
    inputs
        .into_iter()
        .zip(input_datasets.iter())
        .map(|(r, &d)| {
            if graph.dataset(d).is_pipe {
                rowify(r, buffer)
            } else {
                r
            }
        })
        .collect()
}

pub(crate) async fn execute_task(
    graph: Arc<FlowGraph>,
    step_id: StepId,
    ordinal: usize,
    inputs: Vec<PipeReader>,
    mut outputs: Vec<PipeWriter>,
    buffer: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let step = &graph.steps[step_id];
    debug!(step = %step.name, ordinal, "task starting");

    // Per-input dataset ids: pairwise steps read two datasets, everything
    // else reads shards of its single input.
    let input_datasets: Vec<usize> = match step.function {
        StepFunction::JoinPartitionedSorted { .. } | StepFunction::CoGroupPartitionedSorted { .. } => {
            step.inputs.clone()
        }
        _ => step.inputs.first().map(|&d| vec![d; inputs.len()]).unwrap_or_default(),
    };
    let input_is_pipe = step
        .inputs
        .first()
        .map(|&d| graph.dataset(d).is_pipe)
        .unwrap_or(false);

    match &step.function {
        StepFunction::Source(f) => {
            let w = outputs.pop().expect("source task owns exactly one shard");
            let body = f(ordinal, w);
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the body drops the writer; EOF propagates.
                    debug!(step = %step.name, ordinal, "source cancelled");
                    return Ok(());
                }
                produced = body => {
                    let mut w = produced?;
                    write_eof_message(&mut w).await?;
                    w.close().await?;
                    return Ok(());
                }
            }
        }
        StepFunction::Output(f) => {
            for r in inputs {
                f(r).await?;
            }
        }
        StepFunction::Script { command } => {
            let mut inputs = inputs;
            let r = take_single(&mut inputs, step_id)?;
            riffle_io::run_command(command, r, &mut outputs[0], input_is_pipe, false).await?;
        }
        StepFunction::Command { command } => {
            let mut inputs = inputs;
            let r = take_single(&mut inputs, step_id)?;
            riffle_io::run_command(command, r, &mut outputs[0], input_is_pipe, true).await?;
        }
        StepFunction::CommandPerRow { command } => {
            let mut inputs = inputs;
            let r = take_single(&mut inputs, step_id)?;
            riffle_io::run_command_per_row(command, r, &mut outputs[0], input_is_pipe, true)
                .await?;
        }
        StepFunction::LocalSort { order_bys, on_error } => {
            let mut inputs = rowify_inputs(&graph, &input_datasets, inputs, buffer);
            let mut r = take_single(&mut inputs, step_id)?;
            shuffle::local_sort(&mut r, &mut outputs[0], order_bys, *on_error).await?;
        }
        StepFunction::MergeSortedTo { order_bys } => {
            let inputs = rowify_inputs(&graph, &input_datasets, inputs, buffer);
            shuffle::merge_sorted_to(inputs, &mut outputs[0], order_bys).await?;
        }
        StepFunction::ScatterPartitions { indexes, .. } => {
            let mut inputs = rowify_inputs(&graph, &input_datasets, inputs, buffer);
            let mut r = take_single(&mut inputs, step_id)?;
            shuffle::scatter_partitions(&mut r, &mut outputs, indexes).await?;
        }
        StepFunction::CollectPartitions => {
            let inputs = rowify_inputs(&graph, &input_datasets, inputs, buffer);
            shuffle::collect_partitions(inputs, &mut outputs[0]).await?;
        }
        StepFunction::LocalGroupByKey { order_bys } => {
            let mut inputs = rowify_inputs(&graph, &input_datasets, inputs, buffer);
            let r = take_single(&mut inputs, step_id)?;
            shuffle::local_group_by_key(r, &mut outputs[0], order_bys).await?;
        }
        StepFunction::JoinPartitionedSorted { order_bys, join_type } => {
            let mut inputs = rowify_inputs(&graph, &input_datasets, inputs, buffer);
            let right = inputs.pop().expect("pairwise task has two inputs");
            let left = inputs.pop().expect("pairwise task has two inputs");
            shuffle::join_partitioned_sorted(left, right, &mut outputs[0], order_bys, *join_type)
                .await?;
        }
        StepFunction::CoGroupPartitionedSorted { order_bys } => {
            let mut inputs = rowify_inputs(&graph, &input_datasets, inputs, buffer);
            let right = inputs.pop().expect("pairwise task has two inputs");
            let left = inputs.pop().expect("pairwise task has two inputs");
            shuffle::co_group_partitioned_sorted(left, right, &mut outputs[0], order_bys).await?;
        }
    }

    for w in outputs {
        w.close().await?;
    }
    debug!(step = %graph.steps[step_id].name, ordinal, "task finished");
    Ok(())
}

fn take_single(inputs: &mut Vec<PipeReader>, step: StepId) -> Result<PipeReader> {
    if inputs.len() != 1 {
        return Err(FlowError::InvalidFlow(format!(
            "step {} expected one input shard, got {}",
            step,
            inputs.len()
        )));
    }
    Ok(inputs.pop().expect("one input"))
}
