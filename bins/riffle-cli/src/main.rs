//! # Riffle CLI - Flow Runner
//!
//! Executes a dataflow described in a YAML flow file: one source, a
//! chain of transformations, one output. User transforms are shell
//! commands over tab-separated lines, per the engine's child-process
//! contract.
//!
//! ```bash
//! # Run a flow
//! riffle-cli --flow flows/wordcount.yml
//!
//! # Tune the inter-task pipe buffers
//! riffle-cli --flow my-flow.yml --pipe-buffer 65536
//!
//! # Enable debug logging
//! RUST_LOG=debug riffle-cli --flow my-flow.yml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use riffle_core::DEFAULT_PIPE_BUFFER;
use riffle_flow::{Dataset, Flow};

/// Command-line arguments for the riffle flow runner.
#[derive(Parser, Debug)]
#[command(name = "riffle-cli")]
#[command(about = "Dataflow runner over partitioned row streams")]
struct Args {
    /// Path to the YAML flow file.
    #[arg(short, long)]
    flow: PathBuf,

    /// Buffer size in bytes for the pipes between tasks.
    ///
    /// Smaller buffers tighten backpressure; larger ones smooth bursts.
    #[arg(long, default_value_t = DEFAULT_PIPE_BUFFER)]
    pipe_buffer: usize,
}

/// A complete flow description loaded from YAML.
///
/// # Example
///
/// ```yaml
/// name: wordcount
/// source:
///   type: text_file
///   path: input.txt
/// ops:
///   - type: flat_map
///     command: "tr ' ' '\n'"
///   - type: map
///     command: "awk '{ print $1 \"\t1\" }'"
///   - type: reduce_by_key
///     command: "awk -F'\t' '...'"
/// output:
///   type: stdout
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlowFile {
    name: String,
    source: SourceSpec,
    #[serde(default)]
    ops: Vec<OpSpec>,
    output: OutputSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum SourceSpec {
    #[serde(rename = "text_file")]
    TextFile { path: String },
    #[serde(rename = "text_files")]
    TextFiles { pattern: String },
    #[serde(rename = "stdin")]
    Stdin,
    #[serde(rename = "strings")]
    Strings { lines: Vec<String> },
    #[serde(rename = "listen")]
    Listen { address: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum OpSpec {
    #[serde(rename = "map")]
    Map { command: String },
    #[serde(rename = "flat_map")]
    FlatMap { command: String },
    #[serde(rename = "filter")]
    Filter { command: String },
    #[serde(rename = "pipe")]
    Pipe { command: String },
    #[serde(rename = "pipe_as_args")]
    PipeAsArgs { command: String },
    #[serde(rename = "sort")]
    Sort {
        #[serde(default)]
        indexes: Vec<usize>,
    },
    #[serde(rename = "partition_by_key")]
    PartitionByKey {
        partitions: usize,
        #[serde(default)]
        indexes: Vec<usize>,
    },
    #[serde(rename = "reduce_by_key")]
    ReduceByKey {
        command: String,
        #[serde(default)]
        indexes: Vec<usize>,
    },
    #[serde(rename = "group_by_key")]
    GroupByKey {
        #[serde(default)]
        indexes: Vec<usize>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum OutputSpec {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stdout_fprintf")]
    StdoutFprintf { format: String },
    #[serde(rename = "file")]
    File { path: String },
}

fn build_source(flow: &Flow, spec: &SourceSpec) -> Dataset {
    match spec {
        SourceSpec::TextFile { path } => flow.text_file(path),
        SourceSpec::TextFiles { pattern } => flow.text_files(pattern),
        SourceSpec::Stdin => flow.read(tokio::io::stdin()),
        SourceSpec::Strings { lines } => flow.strings(lines.clone()),
        SourceSpec::Listen { address } => flow.listen(address),
    }
}

fn apply_op(dataset: Dataset, op: &OpSpec) -> Dataset {
    match op {
        OpSpec::Map { command } => dataset.map(command),
        OpSpec::FlatMap { command } => dataset.flat_map(command),
        OpSpec::Filter { command } => dataset.filter(command),
        OpSpec::Pipe { command } => dataset.pipe(command),
        OpSpec::PipeAsArgs { command } => dataset.pipe_as_args(command),
        OpSpec::Sort { indexes } => dataset.sort(indexes),
        OpSpec::PartitionByKey { partitions, indexes } => {
            dataset.partition_by_key(*partitions, indexes)
        }
        OpSpec::ReduceByKey { command, indexes } => dataset.reduce_by_key(command, indexes),
        OpSpec::GroupByKey { indexes } => dataset.group_by_key(indexes),
    }
}

async fn attach_output(dataset: Dataset, spec: &OutputSpec) -> Result<()> {
    match spec {
        OutputSpec::Stdout => dataset.pipe_out(tokio::io::stdout()),
        OutputSpec::StdoutFprintf { format } => dataset.fprintf(tokio::io::stdout(), format),
        OutputSpec::File { path } => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("create {}", path))?;
            dataset.pipe_out(file);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let spec: FlowFile = {
        let y = std::fs::read_to_string(&args.flow)
            .with_context(|| format!("read {}", args.flow.display()))?;
        serde_yaml::from_str(&y).context("parse flow file")?
    };
    tracing::info!(flow = %spec.name, "building flow");

    let flow = Flow::new().with_pipe_buffer(args.pipe_buffer);
    let mut dataset = build_source(&flow, &spec.source);
    for op in &spec.ops {
        dataset = apply_op(dataset, op);
    }
    attach_output(dataset, &spec.output).await?;

    let mut runner = {
        let flow = flow.clone();
        tokio::spawn(async move { flow.run().await })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            eprintln!("\nReceived Ctrl-C, shutting down...");
            flow.cancel();
            runner.await??;
        }
        outcome = &mut runner => {
            outcome??;
        }
    }
    Ok(())
}
