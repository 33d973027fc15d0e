//! Child processes carrying user logic.
//!
//! The contract: input rows arrive on the child's stdin either as raw
//! bytes (when the upstream dataset is a pipe) or as tab-separated lines;
//! output is read back symmetrically. stderr stays inherited so user
//! commands can complain to the operator's terminal.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use riffle_core::row::{decode_row, read_message, write_eof_message, write_row, Value};
use riffle_core::tsv::value_to_text;
use riffle_core::{FlowError, Result};

fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

fn exit_error(status: std::process::ExitStatus) -> FlowError {
    FlowError::ChildExit(status.code().unwrap_or(-1))
}

/// Renders one decoded row as a tab-separated line.
fn row_to_line(fields: &[Value]) -> String {
    let rendered: Vec<String> = fields.iter().map(value_to_text).collect();
    let mut line = rendered.join("\t");
    line.push('\n');
    line
}

/// Feeds the child's stdin from the task input.
///
/// A broken pipe here means the child stopped reading; that alone is not
/// a failure (the exit status decides), so the feeder just stops.
async fn feed_stdin<R>(mut input: R, mut stdin: tokio::process::ChildStdin, raw: bool) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let outcome: Result<()> = async {
        if raw {
            tokio::io::copy(&mut input, &mut stdin).await?;
        } else {
            while let Some(payload) = read_message(&mut input).await? {
                let fields = decode_row(&payload)?;
                stdin.write_all(row_to_line(&fields).as_bytes()).await?;
            }
        }
        stdin.shutdown().await?;
        Ok(())
    }
    .await;

    match outcome {
        Err(e) if e.is_broken_pipe() => {
            debug!("child stopped reading stdin early");
            Ok(())
        }
        other => other,
    }
}

/// Forwards the child's stdout to the task output.
async fn collect_stdout<W>(
    stdout: tokio::process::ChildStdout,
    output: &mut W,
    raw: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if raw {
        let mut stdout = stdout;
        tokio::io::copy(&mut stdout, output).await?;
    } else {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let fields: Vec<Value> = line.split('\t').map(Value::from).collect();
            write_row(output, &fields).await?;
        }
        write_eof_message(output).await?;
    }
    Ok(())
}

/// Runs one shell command as the body of a step: stdin fed from `input`,
/// stdout forwarded to `output`. A non-zero exit fails the step.
pub async fn run_command<R, W>(
    command: &str,
    input: R,
    output: &mut W,
    input_is_pipe: bool,
    output_is_pipe: bool,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    debug!(command, "spawning step command");
    let mut child = shell(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let stdin = child.stdin.take().expect("child stdin is piped");
    let stdout = child.stdout.take().expect("child stdout is piped");

    let feeder = tokio::spawn(feed_stdin(input, stdin, input_is_pipe));
    collect_stdout(stdout, output, output_is_pipe).await?;

    feeder.await.map_err(|e| FlowError::Other(e.into()))??;

    let status = child.wait().await?;
    if !status.success() {
        warn!(command, %status, "step command failed");
        return Err(exit_error(status));
    }
    Ok(())
}

/// Substitutes `$1`…`$N` with the row's rendered fields. Highest index
/// first so `$12` is not clobbered by `$1`. Shell-safe quoting is the
/// caller's responsibility.
fn substitute_args(command: &str, fields: &[String]) -> String {
    let mut line = command.to_string();
    for (i, field) in fields.iter().enumerate().rev() {
        line = line.replace(&format!("${}", i + 1), field);
    }
    line
}

/// Invokes a shell once per input row, with the row's fields substituted
/// into the command line. Output from every invocation is concatenated
/// onto the task output in row order.
pub async fn run_command_per_row<R, W>(
    command: &str,
    input: R,
    output: &mut W,
    input_is_pipe: bool,
    output_is_pipe: bool,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = input;
    let mut rows: Vec<Vec<String>> = Vec::new();
    if input_is_pipe {
        let mut lines = BufReader::new(&mut input).lines();
        while let Some(line) = lines.next_line().await? {
            rows.push(line.split('\t').map(str::to_owned).collect());
        }
    } else {
        while let Some(payload) = read_message(&mut input).await? {
            let fields = decode_row(&payload)?;
            rows.push(fields.iter().map(value_to_text).collect());
        }
    }

    for fields in rows {
        let line = substitute_args(command, &fields);
        debug!(command = %line, "spawning per-row command");
        let mut child = shell(&line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdout = child.stdout.take().expect("child stdout is piped");

        if output_is_pipe {
            let mut stdout = stdout;
            tokio::io::copy(&mut stdout, output).await?;
        } else {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(out_line) = lines.next_line().await? {
                let out_fields: Vec<Value> = out_line.split('\t').map(Value::from).collect();
                write_row(output, &out_fields).await?;
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            warn!(command = %line, %status, "per-row command failed");
            return Err(exit_error(status));
        }
    }

    if !output_is_pipe {
        write_eof_message(output).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use riffle_core::row::Row;
    use riffle_core::{pipe, PipeReader, DEFAULT_PIPE_BUFFER};

    async fn feed_rows(rows: Vec<Row>) -> PipeReader {
        let (r, mut w) = pipe(DEFAULT_PIPE_BUFFER);
        tokio::spawn(async move {
            for row in rows {
                // Consumers may stop reading early (e.g. `head`).
                if write_row(&mut w, &row).await.is_err() {
                    return;
                }
            }
            let _ = write_eof_message(&mut w).await;
            let _ = w.close().await;
        });
        r
    }

    async fn drain_rows(r: &mut PipeReader) -> Vec<Row> {
        let mut rows = Vec::new();
        while let Some(payload) = read_message(r).await.expect("read") {
            rows.push(decode_row(&payload).expect("decode"));
        }
        rows
    }

    #[test]
    fn argument_substitution_is_highest_index_first() {
        let fields: Vec<String> = (1..=12).map(|i| format!("v{}", i)).collect();
        assert_eq!(substitute_args("echo $1 $12", &fields), "echo v1 v12");
    }

    #[tokio::test]
    async fn cat_passes_rows_through_as_tsv() {
        let input = feed_rows(vec![
            vec![Value::from("ab"), Value::from(1i64)],
            vec![Value::from("cd"), Value::from(2i64)],
        ])
        .await;
        let (mut out_r, mut out_w) = pipe(DEFAULT_PIPE_BUFFER);

        run_command("cat", input, &mut out_w, false, false).await.expect("cat");
        out_w.close().await.expect("close");

        assert_eq!(
            drain_rows(&mut out_r).await,
            vec![
                vec![Value::from("ab"), Value::from("1")],
                vec![Value::from("cd"), Value::from("2")],
            ]
        );
    }

    #[tokio::test]
    async fn raw_output_mode_forwards_child_bytes() {
        let input = feed_rows(vec![vec![Value::from("ab")], vec![Value::from("cd")]]).await;
        let (mut out_r, mut out_w) = pipe(DEFAULT_PIPE_BUFFER);

        run_command("cat", input, &mut out_w, false, true).await.expect("cat");
        out_w.close().await.expect("close");

        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut out_r, &mut bytes).await.expect("read");
        assert_eq!(bytes, b"ab\ncd\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_fatal() {
        let input = feed_rows(vec![vec![Value::from("x")]]).await;
        let (_out_r, mut out_w) = pipe(DEFAULT_PIPE_BUFFER);

        let err = run_command("false", input, &mut out_w, false, false)
            .await
            .expect_err("false must fail the step");
        assert!(matches!(err, FlowError::ChildExit(code) if code != 0));
    }

    #[tokio::test]
    async fn early_exiting_child_is_fine_when_status_is_zero() {
        let many: Vec<Row> = (0..2000)
            .map(|i| vec![Value::from(format!("line-{:04}", i))])
            .collect();
        let input = feed_rows(many).await;
        let (mut out_r, mut out_w) = pipe(DEFAULT_PIPE_BUFFER);

        run_command("head -n 1", input, &mut out_w, false, false)
            .await
            .expect("head");
        out_w.close().await.expect("close");

        assert_eq!(drain_rows(&mut out_r).await, vec![vec![Value::from("line-0000")]]);
    }

    #[tokio::test]
    async fn per_row_command_substitutes_fields() {
        let input = feed_rows(vec![
            vec![Value::from("hello"), Value::from("1")],
            vec![Value::from("world"), Value::from("2")],
        ])
        .await;
        let (mut out_r, mut out_w) = pipe(DEFAULT_PIPE_BUFFER);

        run_command_per_row("echo $2:$1", input, &mut out_w, false, false)
            .await
            .expect("echo");
        out_w.close().await.expect("close");

        assert_eq!(
            drain_rows(&mut out_r).await,
            vec![vec![Value::from("1:hello")], vec![Value::from("2:world")]]
        );
    }
}
