//! Driver-side terminal outputs.
//!
//! Output steps register an all-to-one driver-side consumer and return
//! immediately; nothing runs until [`Flow::run`](crate::Flow::run).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};

use riffle_core::row::{decode_row, read_message, Row, Value};
use riffle_core::tsv;

use crate::flow::Dataset;
use crate::graph::{OutputFn, StepFunction, StepLayout};

impl Dataset {
    fn add_output(&self, name: &str, f: OutputFn) {
        let mut g = self.lock();
        g.add_step(
            name,
            vec![self.id],
            None,
            StepLayout::AllToOne,
            true,
            StepFunction::Output(f),
        );
    }

    /// A raw terminal consumer: invoked once per input shard, in shard
    /// order, and expected to read each reader to EOF.
    pub fn output(&self, f: OutputFn) {
        self.add_output("Output", f)
    }

    /// Writes the dataset to `writer`: raw bytes when the dataset is a
    /// pipe, tab-separated lines otherwise.
    pub fn pipe_out<W>(&self, writer: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let is_pipe = self.meta().is_pipe;
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let f: OutputFn = Arc::new(move |mut r| {
            let writer = writer.clone();
            Box::pin(async move {
                let mut w = writer.lock().await;
                if is_pipe {
                    tokio::io::copy(&mut r, &mut *w).await?;
                } else {
                    tsv::fprint_rows(&mut r, &mut *w, "\t", "\n").await?;
                }
                Ok(())
            })
        });
        self.add_output("PipeOut", f);
    }

    /// Formats every row with one `%s` verb per field and writes the
    /// result to `writer`.
    pub fn fprintf<W>(&self, writer: W, format: &str)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let is_pipe = self.meta().is_pipe;
        let format = format.to_string();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let f: OutputFn = Arc::new(move |mut r| {
            let writer = writer.clone();
            let format = format.clone();
            Box::pin(async move {
                let mut w = writer.lock().await;
                if is_pipe {
                    tsv::tsv_printf(&mut r, &mut *w, &format).await?;
                } else {
                    tsv::fprintf(&mut r, &mut *w, &format).await?;
                }
                Ok(())
            })
        });
        self.add_output("Fprintf", f);
    }

    /// Streams decoded rows back to the driver over an unbounded channel.
    /// The channel closes when the flow finishes the output step.
    pub fn output_rows(&self) -> mpsc::UnboundedReceiver<Row> {
        let is_pipe = self.meta().is_pipe;
        let (tx, rx) = mpsc::unbounded_channel();
        let f: OutputFn = Arc::new(move |mut r| {
            let tx = tx.clone();
            Box::pin(async move {
                if is_pipe {
                    let mut lines = BufReader::new(r).lines();
                    while let Some(line) = lines.next_line().await? {
                        let row: Row = line.split('\t').map(Value::from).collect();
                        let _ = tx.send(row);
                    }
                } else {
                    while let Some(payload) = read_message(&mut r).await? {
                        let _ = tx.send(decode_row(&payload)?);
                    }
                }
                Ok(())
            })
        });
        self.add_output("OutputRows", f);
        rx
    }

    /// Resolves with the first row of the dataset; the rest of the
    /// stream is drained so producers finish normally.
    pub fn first_row(&self) -> oneshot::Receiver<Row> {
        let is_pipe = self.meta().is_pipe;
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(std::sync::Mutex::new(Some(tx)));
        let f: OutputFn = Arc::new(move |mut r| {
            let slot = slot.clone();
            Box::pin(async move {
                if is_pipe {
                    let mut lines = BufReader::new(r).lines();
                    while let Some(line) = lines.next_line().await? {
                        if let Some(tx) = slot.lock().expect("first-row slot lock").take() {
                            let row: Row = line.split('\t').map(Value::from).collect();
                            let _ = tx.send(row);
                        }
                    }
                } else {
                    while let Some(payload) = read_message(&mut r).await? {
                        if let Some(tx) = slot.lock().expect("first-row slot lock").take() {
                            let _ = tx.send(decode_row(&payload)?);
                        }
                    }
                }
                Ok(())
            })
        });
        self.add_output("FirstRow", f);
        rx
    }
}
