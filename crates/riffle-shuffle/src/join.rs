//! Merge join and cogroup of partitioned-sorted inputs.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use riffle_core::row::{
    compare_keys, decode_row, indexes_of, read_message, write_eof_message, write_row, OrderBy,
    Row, Value,
};
use riffle_core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl JoinType {
    fn keeps_unmatched_left(self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }

    fn keeps_unmatched_right(self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }
}

/// One run of equal-keyed rows from a key-sorted stream.
struct Group {
    keys: Row,
    rows: Vec<Row>,
}

/// Incrementally groups a key-sorted row stream.
///
/// A row whose keys cannot be decoded is dropped with a warning; the
/// group boundaries come from [`compare_keys`] equality.
struct GroupReader<R> {
    r: R,
    indexes: Vec<usize>,
    order_bys: Vec<OrderBy>,
    pending: Option<(Row, Row)>,
}

impl<R: AsyncRead + Unpin> GroupReader<R> {
    fn new(r: R, order_bys: &[OrderBy]) -> Self {
        GroupReader {
            r,
            indexes: indexes_of(order_bys),
            order_bys: order_bys.to_vec(),
            pending: None,
        }
    }

    async fn next_keyed_row(&mut self) -> Result<Option<(Row, Row)>> {
        while let Some(raw) = read_message(&mut self.r).await? {
            match decode_row(&raw) {
                Ok(fields) => {
                    let keys: Row = self
                        .indexes
                        .iter()
                        .map(|&i| fields.get(i - 1).cloned().unwrap_or(Value::Nil))
                        .collect();
                    return Ok(Some((keys, fields)));
                }
                Err(e) => warn!(error = %e, "dropping undecodable row from join input"),
            }
        }
        Ok(None)
    }

    async fn next_group(&mut self) -> Result<Option<Group>> {
        let (keys, first) = match self.pending.take() {
            Some(row) => row,
            None => match self.next_keyed_row().await? {
                Some(row) => row,
                None => return Ok(None),
            },
        };

        let mut rows = vec![first];
        while let Some((next_keys, fields)) = self.next_keyed_row().await? {
            if compare_keys(&next_keys, &keys, &self.order_bys) == Ordering::Equal {
                rows.push(fields);
            } else {
                self.pending = Some((next_keys, fields));
                break;
            }
        }
        Ok(Some(Group { keys, rows }))
    }
}

/// The fields of a row that are not join keys, in row order.
fn non_key_fields(row: &[Value], indexes: &[usize]) -> Row {
    row.iter()
        .enumerate()
        .filter(|(i, _)| !indexes.contains(&(i + 1)))
        .map(|(_, v)| v.clone())
        .collect()
}

fn nils(n: usize) -> Row {
    vec![Value::Nil; n]
}

/// Merge-joins two inputs that are partitioned and locally sorted by the
/// same keys. Output rows are `(key…, left_values…, right_values…)`;
/// unmatched sides are padded with nils to the width last observed on the
/// other side.
pub async fn join_partitioned_sorted<L, Rt, W>(
    left: L,
    right: Rt,
    w: &mut W,
    order_bys: &[OrderBy],
    join_type: JoinType,
) -> Result<()>
where
    L: AsyncRead + Unpin,
    Rt: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let indexes = indexes_of(order_bys);
    let mut left = GroupReader::new(left, order_bys);
    let mut right = GroupReader::new(right, order_bys);

    let mut left_width = 0usize;
    let mut right_width = 0usize;

    let mut lg = left.next_group().await?;
    let mut rg = right.next_group().await?;
    loop {
        if let Some(g) = &lg {
            left_width = g.rows[0].len().saturating_sub(indexes.len()).max(left_width);
        }
        if let Some(g) = &rg {
            right_width = g.rows[0].len().saturating_sub(indexes.len()).max(right_width);
        }

        let advance = match (&lg, &rg) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(l), Some(r)) => compare_keys(&l.keys, &r.keys, order_bys),
        };

        match advance {
            Ordering::Less => {
                let g = lg.take().expect("left group present");
                if join_type.keeps_unmatched_left() {
                    for row in &g.rows {
                        let mut out = g.keys.clone();
                        out.extend(non_key_fields(row, &indexes));
                        out.extend(nils(right_width));
                        write_row(w, &out).await?;
                    }
                }
                lg = left.next_group().await?;
            }
            Ordering::Greater => {
                let g = rg.take().expect("right group present");
                if join_type.keeps_unmatched_right() {
                    for row in &g.rows {
                        let mut out = g.keys.clone();
                        out.extend(nils(left_width));
                        out.extend(non_key_fields(row, &indexes));
                        write_row(w, &out).await?;
                    }
                }
                rg = right.next_group().await?;
            }
            Ordering::Equal => {
                let l = lg.take().expect("left group present");
                let r = rg.take().expect("right group present");
                for lrow in &l.rows {
                    for rrow in &r.rows {
                        let mut out = l.keys.clone();
                        out.extend(non_key_fields(lrow, &indexes));
                        out.extend(non_key_fields(rrow, &indexes));
                        write_row(w, &out).await?;
                    }
                }
                lg = left.next_group().await?;
                rg = right.next_group().await?;
            }
        }
    }
    write_eof_message(w).await
}

/// As the join, but emits one row per key seen on either side:
/// `(key…, [left rows], [right rows])`, each list holding the non-key
/// fields of one input row.
pub async fn co_group_partitioned_sorted<L, Rt, W>(
    left: L,
    right: Rt,
    w: &mut W,
    order_bys: &[OrderBy],
) -> Result<()>
where
    L: AsyncRead + Unpin,
    Rt: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let indexes = indexes_of(order_bys);
    let mut left = GroupReader::new(left, order_bys);
    let mut right = GroupReader::new(right, order_bys);

    let rows_list = |rows: &[Row]| {
        Value::Array(
            rows.iter()
                .map(|row| {
                    let mut fields = non_key_fields(row, &indexes);
                    if fields.len() == 1 {
                        fields.pop().expect("one field")
                    } else {
                        Value::Array(fields)
                    }
                })
                .collect(),
        )
    };

    let mut lg = left.next_group().await?;
    let mut rg = right.next_group().await?;
    loop {
        let advance = match (&lg, &rg) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(l), Some(r)) => compare_keys(&l.keys, &r.keys, order_bys),
        };

        match advance {
            Ordering::Less => {
                let g = lg.take().expect("left group present");
                let mut out = g.keys.clone();
                out.push(rows_list(&g.rows));
                out.push(Value::Array(Vec::new()));
                write_row(w, &out).await?;
                lg = left.next_group().await?;
            }
            Ordering::Greater => {
                let g = rg.take().expect("right group present");
                let mut out = g.keys.clone();
                out.push(Value::Array(Vec::new()));
                out.push(rows_list(&g.rows));
                write_row(w, &out).await?;
                rg = right.next_group().await?;
            }
            Ordering::Equal => {
                let l = lg.take().expect("left group present");
                let r = rg.take().expect("right group present");
                let mut out = l.keys.clone();
                out.push(rows_list(&l.rows));
                out.push(rows_list(&r.rows));
                write_row(w, &out).await?;
                lg = left.next_group().await?;
                rg = right.next_group().await?;
            }
        }
    }
    write_eof_message(w).await
}

/// Groups adjacent equal-keyed rows of one key-sorted input into
/// `(key…, [values])` rows.
pub async fn local_group_by_key<R, W>(r: R, w: &mut W, order_bys: &[OrderBy]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let indexes = indexes_of(order_bys);
    let mut groups = GroupReader::new(r, order_bys);
    while let Some(g) = groups.next_group().await? {
        let values = Value::Array(
            g.rows
                .iter()
                .map(|row| {
                    let mut fields = non_key_fields(row, &indexes);
                    if fields.len() == 1 {
                        fields.pop().expect("one field")
                    } else {
                        Value::Array(fields)
                    }
                })
                .collect(),
        );
        let mut out = g.keys.clone();
        out.push(values);
        write_row(w, &out).await?;
    }
    write_eof_message(w).await
}
