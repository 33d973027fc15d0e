//! Local sort and k-way merge.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use riffle_core::row::{
    compare_keys, decode_row_keys, indexes_of, read_message, write_eof_message, write_message,
    OrderBy, Row,
};
use riffle_core::{FlowError, PriorityQueue, Result};

/// What to do with an input row whose keys cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeErrorPolicy {
    /// Fail the task. The default: a corrupt stream should not silently
    /// shrink the data.
    #[default]
    Fail,
    /// Log the row and keep going.
    SkipAndLog,
}

struct Keyed {
    keys: Row,
    raw: Vec<u8>,
}

/// Reads every input row into memory, stable-sorts by the OrderBys, and
/// emits the raw bytes in sorted order.
pub async fn local_sort<R, W>(
    r: &mut R,
    w: &mut W,
    order_bys: &[OrderBy],
    on_error: DecodeErrorPolicy,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let indexes = indexes_of(order_bys);
    let mut rows: Vec<Keyed> = Vec::new();
    while let Some(raw) = read_message(r).await? {
        match decode_row_keys(&raw, &indexes) {
            Ok(keys) => rows.push(Keyed { keys, raw }),
            Err(e) => match on_error {
                DecodeErrorPolicy::Fail => {
                    return Err(FlowError::Decode(format!("sort input: {}", e)))
                }
                DecodeErrorPolicy::SkipAndLog => {
                    warn!(error = %e, "dropping undecodable row from sort input");
                }
            },
        }
    }

    // std's sort_by is a stable Timsort-derived merge sort.
    rows.sort_by(|a, b| compare_keys(&a.keys, &b.keys, order_bys));

    for row in &rows {
        write_message(w, &row.raw).await?;
    }
    write_eof_message(w).await
}

/// Merges locally sorted inputs into one sorted output.
///
/// Seeds the queue with one row per input and refills from whichever
/// input the emitted row came from. Equal keys dequeue by input ordinal
/// ascending, which keeps the merge stable.
pub async fn merge_sorted_to<R, W>(readers: Vec<R>, w: &mut W, order_bys: &[OrderBy]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let indexes = indexes_of(order_bys);
    let order: Vec<OrderBy> = order_bys.to_vec();
    let mut pq = PriorityQueue::new(move |a: &(Keyed, usize), b: &(Keyed, usize)| {
        match compare_keys(&a.0.keys, &b.0.keys, &order) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a.1 < b.1,
        }
    });

    let mut readers = readers;
    for (ordinal, r) in readers.iter_mut().enumerate() {
        if let Some(raw) = read_message(r).await? {
            let keys = decode_row_keys(&raw, &indexes)?;
            pq.enqueue((Keyed { keys, raw }, ordinal), ordinal);
        }
    }

    while let Some(((row, _), ordinal)) = pq.dequeue() {
        write_message(w, &row.raw).await?;
        if let Some(raw) = read_message(&mut readers[ordinal]).await? {
            let keys = decode_row_keys(&raw, &indexes)?;
            pq.enqueue((Keyed { keys, raw }, ordinal), ordinal);
        }
    }
    write_eof_message(w).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use riffle_core::row::{write_row, Value};
    use riffle_core::{pipe, PipeReader};

    async fn feed_rows(rows: Vec<Row>) -> PipeReader {
        let (r, mut w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);
        tokio::spawn(async move {
            for row in rows {
                write_row(&mut w, &row).await.expect("write");
            }
            riffle_core::row::write_eof_message(&mut w).await.expect("eof");
            w.close().await.expect("close");
        });
        r
    }

    async fn drain_rows(r: &mut PipeReader) -> Vec<Row> {
        let mut rows = Vec::new();
        while let Some(payload) = read_message(r).await.expect("read") {
            rows.push(riffle_core::row::decode_row(&payload).expect("decode"));
        }
        rows
    }

    fn kv(k: &str, v: i64) -> Row {
        vec![Value::from(k), Value::from(v)]
    }

    #[tokio::test]
    async fn sorts_and_preserves_the_multiset() {
        let input = vec![kv("dog", 1), kv("ant", 3), kv("cat", 2), kv("ant", 9)];
        let mut src = feed_rows(input.clone()).await;
        let (mut out_r, mut out_w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);

        local_sort(&mut src, &mut out_w, &[OrderBy::asc(1)], DecodeErrorPolicy::Fail)
            .await
            .expect("sort");
        out_w.close().await.expect("close");

        let sorted = drain_rows(&mut out_r).await;
        assert_eq!(sorted, vec![kv("ant", 3), kv("ant", 9), kv("cat", 2), kv("dog", 1)]);
    }

    #[tokio::test]
    async fn sort_is_stable_between_equal_keys() {
        let input = vec![kv("k", 1), kv("k", 2), kv("k", 3)];
        let mut src = feed_rows(input.clone()).await;
        let (mut out_r, mut out_w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);

        local_sort(&mut src, &mut out_w, &[OrderBy::asc(1)], DecodeErrorPolicy::Fail)
            .await
            .expect("sort");
        out_w.close().await.expect("close");

        assert_eq!(drain_rows(&mut out_r).await, input);
    }

    #[tokio::test]
    async fn descending_order_reverses() {
        let mut src = feed_rows(vec![kv("a", 1), kv("c", 1), kv("b", 1)]).await;
        let (mut out_r, mut out_w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);

        local_sort(&mut src, &mut out_w, &[OrderBy::desc(1)], DecodeErrorPolicy::Fail)
            .await
            .expect("sort");
        out_w.close().await.expect("close");

        assert_eq!(
            drain_rows(&mut out_r).await,
            vec![kv("c", 1), kv("b", 1), kv("a", 1)]
        );
    }

    #[tokio::test]
    async fn corrupt_row_fails_by_default_and_skips_by_policy() {
        async fn feed_with_garbage() -> PipeReader {
            let (r, mut w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);
            tokio::spawn(async move {
                write_row(&mut w, &[Value::from("ok")]).await.expect("row");
                // A framed message that is not a MessagePack array.
                write_message(&mut w, &[0xc1, 0xc1]).await.expect("garbage");
                riffle_core::row::write_eof_message(&mut w).await.expect("eof");
                w.close().await.expect("close");
            });
            r
        }

        let mut src = feed_with_garbage().await;
        let (_out_r, mut out_w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);
        let failed =
            local_sort(&mut src, &mut out_w, &[OrderBy::asc(1)], DecodeErrorPolicy::Fail).await;
        assert!(matches!(failed, Err(FlowError::Decode(_))));

        let mut src = feed_with_garbage().await;
        let (mut out_r, mut out_w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);
        local_sort(&mut src, &mut out_w, &[OrderBy::asc(1)], DecodeErrorPolicy::SkipAndLog)
            .await
            .expect("skip policy");
        out_w.close().await.expect("close");
        assert_eq!(drain_rows(&mut out_r).await, vec![vec![Value::from("ok")]]);
    }

    #[tokio::test]
    async fn merges_sorted_inputs() {
        fn num(n: i64) -> Row {
            vec![Value::from(n)]
        }
        let a = feed_rows(vec![num(1), num(3), num(5)]).await;
        let b = feed_rows(vec![num(2), num(2), num(6)]).await;
        let (mut out_r, mut out_w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);

        merge_sorted_to(vec![a, b], &mut out_w, &[OrderBy::asc(1)])
            .await
            .expect("merge");
        out_w.close().await.expect("close");

        let merged: Vec<i64> = drain_rows(&mut out_r)
            .await
            .into_iter()
            .map(|row| match &row[0] {
                Value::Integer(n) => n.as_i64().expect("i64"),
                other => panic!("unexpected field {}", other),
            })
            .collect();
        assert_eq!(merged, vec![1, 2, 2, 3, 5, 6]);
    }

    #[tokio::test]
    async fn merge_breaks_ties_by_input_ordinal() {
        let a = feed_rows(vec![kv("k", 10)]).await;
        let b = feed_rows(vec![kv("k", 20)]).await;
        let (mut out_r, mut out_w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);

        merge_sorted_to(vec![a, b], &mut out_w, &[OrderBy::asc(1)])
            .await
            .expect("merge");
        out_w.close().await.expect("close");

        assert_eq!(drain_rows(&mut out_r).await, vec![kv("k", 10), kv("k", 20)]);
    }

    #[tokio::test]
    async fn merge_emits_exactly_one_eof() {
        let a = feed_rows(vec![kv("a", 1)]).await;
        let (mut out_r, mut out_w) = pipe(riffle_core::DEFAULT_PIPE_BUFFER);
        merge_sorted_to(vec![a], &mut out_w, &[OrderBy::asc(1)])
            .await
            .expect("merge");
        out_w.close().await.expect("close");

        assert_eq!(drain_rows(&mut out_r).await.len(), 1);
        // After the EOF message the stream is closed; another read sees
        // clean EOF, not data.
        assert!(read_message(&mut out_r).await.expect("eof").is_none());
    }
}
