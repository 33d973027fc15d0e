//! Driver-side text ingestion.
//!
//! Each helper turns a textual byte source into framed row messages, one
//! single-field string row per line. EOF framing and writer close stay
//! with the task that owns the output.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

use riffle_core::row::{write_row, Value};
use riffle_core::{FlowError, Result};

/// Writes each line of `reader` as a one-field string row.
pub async fn read_lines_as_rows<R, W>(reader: R, w: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        write_row(w, &[Value::from(line)]).await?;
    }
    Ok(())
}

/// Writes each tab-separated line of `reader` as a row of string fields.
pub async fn read_tsv_as_rows<R, W>(reader: R, w: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let fields: Vec<Value> = line.split('\t').map(Value::from).collect();
        write_row(w, &fields).await?;
    }
    Ok(())
}

/// Writes the lines of one file as rows.
pub async fn read_file_as_rows<W>(path: &str, w: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| FlowError::Other(anyhow::anyhow!("open {}: {}", path, e)))?;
    read_lines_as_rows(file, w).await
}

/// Expands a glob pattern and writes the lines of every matched file, in
/// pattern order.
pub async fn read_glob_as_rows<W>(pattern: &str, w: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut matched = 0usize;
    for entry in glob::glob(pattern).map_err(|e| FlowError::Other(e.into()))? {
        match entry {
            Ok(path) => {
                matched += 1;
                read_file_as_rows(&path.display().to_string(), w).await?;
            }
            Err(e) => warn!(error = %e, "skipping unreadable glob entry"),
        }
    }
    if matched == 0 {
        return Err(FlowError::Other(anyhow::anyhow!("no files matched: {}", pattern)));
    }
    Ok(())
}

/// Accepts one TCP connection and ingests its tab-separated lines as
/// rows of string fields.
pub async fn listen_text_as_rows<W>(address: &str, w: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| FlowError::Other(anyhow::anyhow!("listen on {}: {}", address, e)))?;
    info!(address, "waiting for one text connection");
    let (conn, peer) = listener.accept().await?;
    info!(%peer, "ingesting text stream");
    read_tsv_as_rows(conn, w).await
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use riffle_core::row::{decode_row, read_message, write_eof_message, Row};
    use riffle_core::{pipe, PipeReader, DEFAULT_PIPE_BUFFER};

    async fn drain_rows(r: &mut PipeReader) -> Vec<Row> {
        let mut rows = Vec::new();
        while let Some(payload) = read_message(r).await.expect("read") {
            rows.push(decode_row(&payload).expect("decode"));
        }
        rows
    }

    #[tokio::test]
    async fn file_lines_become_string_rows() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "the cat").expect("write");
        writeln!(file, "the dog").expect("write");

        let (mut r, mut w) = pipe(DEFAULT_PIPE_BUFFER);
        read_file_as_rows(&file.path().display().to_string(), &mut w)
            .await
            .expect("read file");
        write_eof_message(&mut w).await.expect("eof");
        w.close().await.expect("close");

        assert_eq!(
            drain_rows(&mut r).await,
            vec![vec![Value::from("the cat")], vec![Value::from("the dog")]]
        );
    }

    #[tokio::test]
    async fn tsv_lines_become_multi_field_rows() {
        let input = b"a\t1\nb\t2\n".to_vec();
        let (mut r, mut w) = pipe(DEFAULT_PIPE_BUFFER);
        read_tsv_as_rows(&input[..], &mut w).await.expect("read tsv");
        write_eof_message(&mut w).await.expect("eof");
        w.close().await.expect("close");

        assert_eq!(
            drain_rows(&mut r).await,
            vec![
                vec![Value::from("a"), Value::from("1")],
                vec![Value::from("b"), Value::from("2")],
            ]
        );
    }

    #[tokio::test]
    async fn missing_glob_is_an_error() {
        let (_r, mut w) = pipe(DEFAULT_PIPE_BUFFER);
        assert!(read_glob_as_rows("/nonexistent/riffle-*.txt", &mut w).await.is_err());
    }
}
