//! The local runner.
//!
//! Everything is spawned up front: one fan-out pump per shard and one
//! tokio task per task plan. Blocking on pipe I/O is the only
//! coordination, so dependency order falls out of EOF propagation rather
//! than a scheduler.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use riffle_core::{pipe, FlowError, PipeReader, PipeWriter, Result};

use crate::exec::execute_task;
use crate::flow::Flow;
use crate::graph::ShardRef;
use crate::task::plan_tasks;

/// The capability to execute a flow.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run_flow(&self, flow: &Flow) -> Result<()>;
}

/// Runs every task of a flow inside the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRunner;

/// Copies one shard's byte stream to every consuming task.
///
/// A consumer that goes away only loses its own copy; the pump keeps
/// feeding the others and keeps draining the producer either way, so an
/// upstream task never wedges on a failed downstream.
async fn pump(mut incoming: PipeReader, consumers: Vec<PipeWriter>) -> Result<()> {
    let mut slots: Vec<Option<PipeWriter>> = consumers.into_iter().map(Some).collect();
    let mut buf = [0u8; 8192];
    loop {
        let n = incoming.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for slot in slots.iter_mut() {
            if let Some(w) = slot {
                if let Err(e) = w.write_all(&buf[..n]).await {
                    if e.kind() == ErrorKind::BrokenPipe {
                        *slot = None;
                    } else {
                        return Err(e.into());
                    }
                }
            }
        }
    }
    for slot in slots.into_iter().flatten() {
        let _ = slot.close().await;
    }
    Ok(())
}

#[async_trait]
impl Runner for LocalRunner {
    async fn run_flow(&self, flow: &Flow) -> Result<()> {
        let graph = Arc::new(flow.snapshot());
        graph.validate()?;
        let buffer = flow.pipe_buffer();
        info!(
            flow = graph.hash_code(),
            steps = graph.steps.len(),
            datasets = graph.datasets.len(),
            "running flow"
        );

        let mut plans = Vec::new();
        for step in &graph.steps {
            plans.extend(plan_tasks(&graph, step)?);
        }

        // One incoming pipe per shard; the writer goes to the producing
        // task, the reader to that shard's fan-out pump.
        let mut incoming_readers: HashMap<ShardRef, PipeReader> = HashMap::new();
        let mut incoming_writers: HashMap<ShardRef, PipeWriter> = HashMap::new();
        for dataset in &graph.datasets {
            for shard in 0..dataset.shard_count {
                let key = ShardRef { dataset: dataset.id, shard };
                let (r, w) = pipe(buffer);
                incoming_readers.insert(key, r);
                incoming_writers.insert(key, w);
            }
        }

        // One outgoing pipe per (shard, consuming input slot), assembled
        // in deterministic plan order.
        let mut fanout: HashMap<ShardRef, Vec<PipeWriter>> = HashMap::new();
        let mut handles: Vec<(String, JoinHandle<Result<()>>)> = Vec::new();
        for plan in &plans {
            let mut inputs = Vec::with_capacity(plan.inputs.len());
            for shard_ref in &plan.inputs {
                let (r, w) = pipe(buffer);
                fanout.entry(*shard_ref).or_default().push(w);
                inputs.push(r);
            }
            let outputs: Vec<PipeWriter> = plan
                .outputs
                .iter()
                .map(|shard_ref| {
                    incoming_writers
                        .remove(shard_ref)
                        .expect("every shard has exactly one producer")
                })
                .collect();

            let name = plan.name(&graph);
            debug!(task = %name, inputs = inputs.len(), outputs = outputs.len(), "spawning task");
            let handle = tokio::spawn(execute_task(
                graph.clone(),
                plan.step,
                plan.ordinal,
                inputs,
                outputs,
                buffer,
                flow.cancellation_token().child_token(),
            ));
            handles.push((name, handle));
        }

        for (shard_ref, reader) in incoming_readers {
            let consumers = fanout.remove(&shard_ref).unwrap_or_default();
            let name = format!("pump d{}-s{}", shard_ref.dataset, shard_ref.shard);
            handles.push((name, tokio::spawn(pump(reader, consumers))));
        }

        // Wait for everything; the flow fails with the most meaningful
        // fatal error. Broken pipes and truncated input streams are
        // downstream symptoms, so a real error from any task outranks
        // them.
        let mut first_error: Option<FlowError> = None;
        let mut first_symptom: Option<FlowError> = None;
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(FlowError::Other(anyhow::anyhow!(
                    "task {} panicked: {}",
                    name,
                    join_error
                ))),
            };
            if let Err(e) = outcome {
                error!(task = %name, error = %e, "task failed");
                if e.is_broken_pipe() || matches!(e, FlowError::UnexpectedEof) {
                    first_symptom.get_or_insert(e);
                } else {
                    first_error.get_or_insert(e);
                }
            }
        }

        // Cancellation tears streams down mid-frame; the broken pipes
        // and truncations it leaves behind are the mechanism working.
        let symptom = if flow.cancellation_token().is_cancelled() {
            None
        } else {
            first_symptom
        };
        match first_error.or(symptom) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
