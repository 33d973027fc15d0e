//! The flow context and dataset handles.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use riffle_core::{Result, DEFAULT_PIPE_BUFFER};

use crate::graph::{DatasetId, DatasetMeta, FlowGraph};
use crate::runner::{LocalRunner, Runner};

/// Owns one dataflow DAG and the capability to run it.
///
/// Single-writer while building; runners snapshot the graph into an
/// immutable copy before execution, so builder handles never observe a
/// running flow.
#[derive(Clone)]
pub struct Flow {
    graph: Arc<Mutex<FlowGraph>>,
    cancel: CancellationToken,
    pipe_buffer: usize,
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}

impl Flow {
    pub fn new() -> Self {
        Flow {
            graph: Arc::new(Mutex::new(FlowGraph::default())),
            cancel: CancellationToken::new(),
            pipe_buffer: DEFAULT_PIPE_BUFFER,
        }
    }

    /// Overrides the per-pipe buffer size for this flow.
    pub fn with_pipe_buffer(mut self, bytes: usize) -> Self {
        self.pipe_buffer = bytes;
        self
    }

    pub fn pipe_buffer(&self) -> usize {
        self.pipe_buffer
    }

    /// Cancels the flow: sources stop producing and EOF drains the DAG.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// An immutable copy of the DAG for planning or execution.
    pub fn snapshot(&self) -> FlowGraph {
        self.lock().clone()
    }

    /// Stable identifier derived from the DAG structure.
    pub fn hash_code(&self) -> u32 {
        self.lock().hash_code()
    }

    /// Runs the flow on the local runner.
    pub async fn run(&self) -> Result<()> {
        self.run_with(&LocalRunner::default()).await
    }

    /// Runs the flow on the given runner capability.
    pub async fn run_with(&self, runner: &dyn Runner) -> Result<()> {
        runner.run_flow(self).await
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FlowGraph> {
        self.graph.lock().expect("flow graph lock poisoned")
    }

    pub(crate) fn handle(&self, id: DatasetId) -> Dataset {
        Dataset { graph: self.graph.clone(), id }
    }
}

/// A handle onto one dataset in a flow's DAG.
///
/// Handles are cheap to clone; every builder method appends steps to the
/// owning flow and returns the handle of the new terminal dataset.
#[derive(Clone)]
pub struct Dataset {
    pub(crate) graph: Arc<Mutex<FlowGraph>>,
    pub(crate) id: DatasetId,
}

impl Dataset {
    pub fn id(&self) -> DatasetId {
        self.id
    }

    /// A copy of the dataset's attributes.
    pub fn meta(&self) -> DatasetMeta {
        self.lock().dataset(self.id).clone()
    }

    pub fn shard_count(&self) -> usize {
        self.lock().dataset(self.id).shard_count
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FlowGraph> {
        self.graph.lock().expect("flow graph lock poisoned")
    }

    pub(crate) fn sibling(&self, id: DatasetId) -> Dataset {
        Dataset { graph: self.graph.clone(), id }
    }
}
