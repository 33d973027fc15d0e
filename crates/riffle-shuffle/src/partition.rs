//! Hash-partitioned fan-out and ordered fan-in.

use futures::stream;
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use riffle_core::hash::partition_of;
use riffle_core::row::{decode_row_keys, read_message, write_eof_message, write_message};
use riffle_core::Result;

/// Routes each input row to `writers[hash(keys) % k]`, forwarding the raw
/// message bytes untouched. Every output gets an EOF message at the end,
/// including partitions that received no rows.
pub async fn scatter_partitions<R, W>(r: &mut R, writers: &mut [W], indexes: &[usize]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let partition_count = writers.len();
    let mut routed = 0u64;
    while let Some(raw) = read_message(r).await? {
        let keys = decode_row_keys(&raw, indexes)?;
        let partition = partition_of(&keys, partition_count);
        write_message(&mut writers[partition], &raw).await?;
        routed += 1;
    }
    debug!(rows = routed, partitions = partition_count, "scatter done");

    for w in writers.iter_mut() {
        write_eof_message(w).await?;
    }
    Ok(())
}

/// Interleaves the input streams in arrival order into one output.
///
/// Per-input ordering is preserved; no global order is promised. The
/// output gets one EOF message after every input has finished.
pub async fn collect_partitions<R, W>(readers: Vec<R>, w: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin,
{
    if readers.is_empty() {
        return write_eof_message(w).await;
    }
    let mut merged = stream::select_all(readers.into_iter().map(|r| {
        Box::pin(stream::try_unfold(r, |mut r| async move {
            Ok::<_, riffle_core::FlowError>(read_message(&mut r).await?.map(|payload| (payload, r)))
        }))
    }));

    while let Some(payload) = merged.try_next().await? {
        write_message(w, &payload).await?;
    }
    write_eof_message(w).await
}
