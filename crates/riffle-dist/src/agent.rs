//! A minimal agent: executes instructions over TCP endpoints.
//!
//! For every output shard the executing instruction listens on the
//! shard's port and serves one consumer; every input shard is dialed at
//! the location its producer serves it from. The sockets carry exactly
//! the framed row format local pipes carry, EOF message included, so the
//! operator bodies are the same functions the local runner uses.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use riffle_core::{FlowError, Result};
use riffle_shuffle as shuffle;

use crate::instruction::{Instruction, InstructionSet, Location};

const DIAL_ATTEMPTS: usize = 50;
const DIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Dials an input shard, waiting out the window where its producer has
/// not bound its listener yet.
async fn dial(location: &Location) -> Result<TcpStream> {
    let address = location.to_string();
    let mut attempts = 0;
    loop {
        match TcpStream::connect(&address).await {
            Ok(stream) => return Ok(stream),
            Err(_) if attempts < DIAL_ATTEMPTS => {
                attempts += 1;
                tokio::time::sleep(DIAL_BACKOFF).await;
            }
            Err(e) => {
                return Err(FlowError::Other(anyhow::anyhow!("dial {}: {}", address, e)))
            }
        }
    }
}

/// Runs one instruction: binds its outputs, dials its inputs, serves one
/// consumer per output, and runs the operator body over the sockets.
pub async fn execute_instruction(instruction: &Instruction) -> Result<()> {
    debug!(kind = instruction.kind(), "executing instruction");

    // Outputs first, so consumers can start dialing while inputs settle.
    let mut listeners = Vec::new();
    for output in instruction.output_locations() {
        let listener = TcpListener::bind(("0.0.0.0", output.location.port))
            .await
            .map_err(|e| {
                FlowError::Other(anyhow::anyhow!("listen for {}: {}", output.name, e))
            })?;
        listeners.push(listener);
    }

    let mut inputs = Vec::new();
    for input in instruction.input_locations() {
        inputs.push(dial(&input.location).await?);
    }

    let mut outputs = Vec::new();
    for listener in &listeners {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "consumer connected");
        outputs.push(stream);
    }

    match instruction {
        Instruction::Script { command, input_is_pipe, output_is_pipe, .. } => {
            let input = inputs.pop().expect("script has one input");
            riffle_io::run_command(command, input, &mut outputs[0], *input_is_pipe, *output_is_pipe)
                .await?;
        }
        Instruction::PipeAsArgs { command, input_is_pipe, .. } => {
            let input = inputs.pop().expect("pipe-as-args has one input");
            riffle_io::run_command_per_row(command, input, &mut outputs[0], *input_is_pipe, true)
                .await?;
        }
        Instruction::LocalSort { order_bys, on_error, .. } => {
            let mut input = inputs.pop().expect("sort has one input");
            shuffle::local_sort(&mut input, &mut outputs[0], order_bys, *on_error).await?;
        }
        Instruction::MergeSortedTo { order_bys, .. } => {
            shuffle::merge_sorted_to(inputs, &mut outputs[0], order_bys).await?;
        }
        Instruction::ScatterPartitions { indexes, .. } => {
            let mut input = inputs.pop().expect("scatter has one input");
            shuffle::scatter_partitions(&mut input, &mut outputs, indexes).await?;
        }
        Instruction::CollectPartitions { .. } => {
            shuffle::collect_partitions(inputs, &mut outputs[0]).await?;
        }
        Instruction::LocalGroupByKey { order_bys, .. } => {
            let input = inputs.pop().expect("group has one input");
            shuffle::local_group_by_key(input, &mut outputs[0], order_bys).await?;
        }
        Instruction::JoinPartitionedSorted { order_bys, join_type, .. } => {
            let right = inputs.pop().expect("join has two inputs");
            let left = inputs.pop().expect("join has two inputs");
            shuffle::join_partitioned_sorted(left, right, &mut outputs[0], order_bys, *join_type)
                .await?;
        }
        Instruction::CoGroupPartitionedSorted { order_bys, .. } => {
            let right = inputs.pop().expect("cogroup has two inputs");
            let left = inputs.pop().expect("cogroup has two inputs");
            shuffle::co_group_partitioned_sorted(left, right, &mut outputs[0], order_bys).await?;
        }
    }

    for mut output in outputs {
        output.shutdown().await?;
    }
    Ok(())
}

/// Runs every instruction of a set concurrently and reports the first
/// meaningful failure, matching the local runner's policy.
pub async fn execute_instruction_set(set: InstructionSet) -> Result<()> {
    info!(host = %set.host, instructions = set.instructions.len(), "executing instruction set");
    let mut handles = Vec::new();
    for instruction in set.instructions {
        handles.push((
            instruction.kind(),
            tokio::spawn(async move { execute_instruction(&instruction).await }),
        ));
    }

    let mut first_error: Option<FlowError> = None;
    let mut first_broken_pipe: Option<FlowError> = None;
    for (kind, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(FlowError::Other(anyhow::anyhow!(
                "instruction {} panicked: {}",
                kind,
                join_error
            ))),
        };
        if let Err(e) = outcome {
            if e.is_broken_pipe() {
                first_broken_pipe.get_or_insert(e);
            } else {
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error.or(first_broken_pipe) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::ShardLocation;
    use riffle_core::row::{
        decode_row, read_message, write_eof_message, write_row, OrderBy, Row, Value,
    };
    use riffle_shuffle::DecodeErrorPolicy;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    }

    fn endpoint(name: &str, port: u16) -> ShardLocation {
        ShardLocation { name: name.into(), location: Location::new("127.0.0.1", port) }
    }

    async fn serve_rows(port: u16, rows: Vec<Row>) {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("bind");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            for row in rows {
                write_row(&mut stream, &row).await.expect("write");
            }
            write_eof_message(&mut stream).await.expect("eof");
            stream.shutdown().await.expect("shutdown");
        });
    }

    async fn read_rows(location: &Location) -> Vec<Row> {
        let mut stream = dial(location).await.expect("dial");
        let mut rows = Vec::new();
        while let Some(payload) = read_message(&mut stream).await.expect("read") {
            rows.push(decode_row(&payload).expect("decode"));
        }
        rows
    }

    #[tokio::test]
    async fn sort_instruction_over_loopback_sockets() {
        let input_port = free_port().await;
        let output_port = free_port().await;

        serve_rows(
            input_port,
            vec![
                vec![Value::from("b")],
                vec![Value::from("a")],
                vec![Value::from("c")],
            ],
        )
        .await;

        let instruction = Instruction::LocalSort {
            order_bys: vec![OrderBy::asc(1)],
            on_error: DecodeErrorPolicy::Fail,
            input: endpoint("f1-d0-s0", input_port),
            output: endpoint("f1-d1-s0", output_port),
        };
        let agent = tokio::spawn(async move { execute_instruction(&instruction).await });

        let rows = read_rows(&Location::new("127.0.0.1", output_port)).await;
        agent.await.expect("join").expect("instruction");

        assert_eq!(
            rows,
            vec![
                vec![Value::from("a")],
                vec![Value::from("b")],
                vec![Value::from("c")],
            ]
        );
    }

    #[tokio::test]
    async fn chained_instructions_stream_between_sockets() {
        let source_port = free_port().await;
        let sorted_port = free_port().await;
        let final_port = free_port().await;

        serve_rows(
            source_port,
            vec![
                vec![Value::from("dog"), Value::from(1i64)],
                vec![Value::from("ant"), Value::from(2i64)],
            ],
        )
        .await;

        let set = InstructionSet {
            host: "127.0.0.1".into(),
            instructions: vec![
                Instruction::LocalSort {
                    order_bys: vec![OrderBy::asc(1)],
                    on_error: DecodeErrorPolicy::Fail,
                    input: endpoint("f1-d0-s0", source_port),
                    output: endpoint("f1-d1-s0", sorted_port),
                },
                Instruction::Script {
                    command: "cat".into(),
                    input_is_pipe: false,
                    output_is_pipe: false,
                    input: endpoint("f1-d1-s0", sorted_port),
                    output: endpoint("f1-d2-s0", final_port),
                },
            ],
        };
        let agent = tokio::spawn(execute_instruction_set(set));

        let rows = read_rows(&Location::new("127.0.0.1", final_port)).await;
        agent.await.expect("join").expect("set");

        assert_eq!(
            rows,
            vec![
                vec![Value::from("ant"), Value::from("2")],
                vec![Value::from("dog"), Value::from("1")],
            ]
        );
    }
}
