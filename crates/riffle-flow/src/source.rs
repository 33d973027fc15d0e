//! Driver-side source constructors.
//!
//! Sources run in the flow driver and feed row messages into the first
//! shard(s) of the DAG. The executor appends the EOF message and closes
//! the writer after the body returns.

use std::sync::{Arc, Mutex};

use tokio::io::AsyncRead;

use riffle_core::row::{write_row, Row, Value};
use riffle_core::FlowError;

use crate::flow::{Dataset, Flow};
use crate::graph::{SourceFn, StepFunction, StepLayout};

impl Flow {
    fn add_source(&self, name: &str, shards: usize, f: SourceFn) -> Dataset {
        let mut g = self.lock();
        let (_, out) = g.add_step(
            name,
            vec![],
            Some(shards),
            StepLayout::OneToOne,
            true,
            StepFunction::Source(f),
        );
        let out = out.expect("source step has an output dataset");
        drop(g);
        self.handle(out)
    }

    /// A raw source: the body runs once per shard with the shard ordinal
    /// and that shard's writer, emits row messages, and returns the
    /// writer.
    pub fn source(&self, f: SourceFn) -> Dataset {
        self.add_source("Source", 1, f)
    }

    /// [`source`](Self::source) over an explicit shard count.
    pub fn source_shards(&self, shards: usize, f: SourceFn) -> Dataset {
        assert!(shards >= 1, "a dataset has at least one shard");
        self.add_source("Source", shards, f)
    }

    /// Begins a flow with one single-field string row per element.
    pub fn strings(&self, lines: Vec<String>) -> Dataset {
        let lines = Arc::new(lines);
        let f: SourceFn = Arc::new(move |_, mut w| {
            let lines = lines.clone();
            Box::pin(async move {
                for line in lines.iter() {
                    write_row(&mut w, &[Value::from(line.as_str())]).await?;
                }
                Ok(w)
            })
        });
        self.add_source("Strings", 1, f)
    }

    /// Begins a flow with one single-field integer row per element.
    pub fn ints(&self, numbers: Vec<i64>) -> Dataset {
        let numbers = Arc::new(numbers);
        let f: SourceFn = Arc::new(move |_, mut w| {
            let numbers = numbers.clone();
            Box::pin(async move {
                for n in numbers.iter() {
                    write_row(&mut w, &[Value::from(*n)]).await?;
                }
                Ok(w)
            })
        });
        self.add_source("Ints", 1, f)
    }

    /// Begins a flow with pre-built rows.
    pub fn rows(&self, rows: Vec<Row>) -> Dataset {
        let rows = Arc::new(rows);
        let f: SourceFn = Arc::new(move |_, mut w| {
            let rows = rows.clone();
            Box::pin(async move {
                for row in rows.iter() {
                    write_row(&mut w, row).await?;
                }
                Ok(w)
            })
        });
        self.add_source("Rows", 1, f)
    }

    /// Reads a file's lines as single-field string rows.
    pub fn text_file(&self, path: &str) -> Dataset {
        let path = path.to_string();
        let f: SourceFn = Arc::new(move |_, mut w| {
            let path = path.clone();
            Box::pin(async move {
                riffle_io::text::read_file_as_rows(&path, &mut w).await?;
                Ok(w)
            })
        });
        self.add_source("TextFile", 1, f)
    }

    /// Reads every file matched by a glob pattern, line by line.
    pub fn text_files(&self, pattern: &str) -> Dataset {
        let pattern = pattern.to_string();
        let f: SourceFn = Arc::new(move |_, mut w| {
            let pattern = pattern.clone();
            Box::pin(async move {
                riffle_io::text::read_glob_as_rows(&pattern, &mut w).await?;
                Ok(w)
            })
        });
        self.add_source("TextFiles", 1, f)
    }

    /// Ingests tab-separated lines from any reader.
    pub fn read<R>(&self, reader: R) -> Dataset
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let reader = Arc::new(Mutex::new(Some(reader)));
        let f: SourceFn = Arc::new(move |_, mut w| {
            let reader = reader.clone();
            Box::pin(async move {
                let reader = reader
                    .lock()
                    .expect("reader slot lock poisoned")
                    .take()
                    .ok_or_else(|| FlowError::InvalidFlow("reader source ran twice".into()))?;
                riffle_io::text::read_tsv_as_rows(reader, &mut w).await?;
                Ok(w)
            })
        });
        self.add_source("Read", 1, f)
    }

    /// Accepts one TCP connection and ingests its tab-separated lines.
    pub fn listen(&self, address: &str) -> Dataset {
        let address = address.to_string();
        let f: SourceFn = Arc::new(move |_, mut w| {
            let address = address.clone();
            Box::pin(async move {
                riffle_io::text::listen_text_as_rows(&address, &mut w).await?;
                Ok(w)
            })
        });
        self.add_source("Listen", 1, f)
    }
}
