//! Row codec: length-prefixed, self-describing tuples.
//!
//! A row is an ordered tuple of [`Value`] fields. On the wire each row is
//! one MessagePack array preceded by a little-endian `u32` byte length. A
//! zero length prefix is the distinguished EOF message; nothing may follow
//! it on the same stream. The same framing is used on local pipes and on
//! inter-agent sockets.

use std::cmp::Ordering;

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{FlowError, Result};

pub use rmpv::Value;

/// One decoded row.
pub type Row = Vec<Value>;

/// Frames larger than this are treated as stream corruption.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Sort direction of one key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Ascending,
    Descending,
}

/// A `(1-based column index, direction)` sort key element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub index: usize,
    pub order: Order,
}

impl OrderBy {
    pub fn asc(index: usize) -> Self {
        OrderBy { index, order: Order::Ascending }
    }

    pub fn desc(index: usize) -> Self {
        OrderBy { index, order: Order::Descending }
    }
}

/// Ascending OrderBys for the given 1-based column indexes.
pub fn ascending_on(indexes: &[usize]) -> Vec<OrderBy> {
    indexes.iter().map(|&i| OrderBy::asc(i)).collect()
}

/// The column indexes named by an OrderBy sequence, in sequence order.
pub fn indexes_of(order_bys: &[OrderBy]) -> Vec<usize> {
    order_bys.iter().map(|o| o.index).collect()
}

/// Encodes the fields as one MessagePack array, without framing.
///
/// This is the canonical field encoding: the partition hash is computed
/// over exactly these bytes.
pub fn encode_row(fields: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 * fields.len());
    let value = Value::Array(fields.to_vec());
    rmpv::encode::write_value(&mut buf, &value).expect("msgpack encode to Vec cannot fail");
    buf
}

/// Prepends the length prefix to an encoded payload.
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + payload.len());
    WriteBytesExt::write_u32::<LittleEndian>(&mut framed, payload.len() as u32)
        .expect("write to Vec cannot fail");
    framed.extend_from_slice(payload);
    framed
}

/// Writes one framed message. The frame is assembled first so the write is
/// atomic at the message boundary for the single writer owning the pipe.
pub async fn write_message<W>(w: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&frame_message(payload)).await?;
    Ok(())
}

/// Encodes the fields and writes one framed row message.
pub async fn write_row<W>(w: &mut W, fields: &[Value]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(w, &encode_row(fields)).await
}

/// Writes the zero-length EOF sentinel. The writer stays open; closing it
/// is the caller's responsibility.
pub async fn write_eof_message<W>(w: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&0u32.to_le_bytes()).await?;
    Ok(())
}

/// Reads one complete message payload.
///
/// Returns `None` on the EOF message or on a clean stream end at a frame
/// boundary; a stream that ends inside a frame is an error.
pub async fn read_message<R>(r: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = r.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FlowError::UnexpectedEof);
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_MESSAGE_LEN {
        return Err(FlowError::Decode(format!("message length {} out of range", len)));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .map_err(|_| FlowError::UnexpectedEof)?;
    Ok(Some(payload))
}

/// Drives [`read_message`] until EOF, handing each raw payload to `f`.
pub async fn process_messages<R, F>(r: &mut R, mut f: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Result<()>,
{
    while let Some(payload) = read_message(r).await? {
        f(&payload)?;
    }
    Ok(())
}

/// Decodes one message payload into its fields.
pub fn decode_row(payload: &[u8]) -> Result<Row> {
    let mut cursor = payload;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| FlowError::Decode(format!("{}: {:?}", e, payload)))?;
    match value {
        Value::Array(fields) => Ok(fields),
        other => Err(FlowError::Decode(format!("row is not an array: {}", other))),
    }
}

/// Decodes only the key fields at the given 1-based positions, in the
/// order the positions are listed. A position past the end of the row
/// yields [`Value::Nil`], which sorts before every present value.
pub fn decode_row_keys(payload: &[u8], indexes: &[usize]) -> Result<Row> {
    let fields = decode_row(payload)?;
    Ok(indexes
        .iter()
        .map(|&i| {
            if i >= 1 && i <= fields.len() {
                fields[i - 1].clone()
            } else {
                Value::Nil
            }
        })
        .collect())
}

/// Conversion from a row field into a caller-supplied typed slot.
pub trait FromValue: Sized {
    fn from_value(v: &Value) -> Result<Self>;
}

fn coercion_error(wanted: &str, got: &Value) -> FlowError {
    FlowError::Decode(format!("cannot decode {} into {}", got, wanted))
}

impl FromValue for i64 {
    fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::Integer(n) => n
                .as_i64()
                .ok_or_else(|| coercion_error("i64", v)),
            Value::F64(f) => Ok(*f as i64),
            Value::F32(f) => Ok(*f as i64),
            _ => Err(coercion_error("i64", v)),
        }
    }
}

impl FromValue for u64 {
    fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::Integer(n) => n
                .as_u64()
                .ok_or_else(|| coercion_error("u64", v)),
            Value::F64(f) => Ok(*f as u64),
            Value::F32(f) => Ok(*f as u64),
            _ => Err(coercion_error("u64", v)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::Integer(n) => n
                .as_f64()
                .ok_or_else(|| coercion_error("f64", v)),
            Value::F64(f) => Ok(*f),
            Value::F32(f) => Ok(*f as f64),
            _ => Err(coercion_error("f64", v)),
        }
    }
}

impl FromValue for bool {
    fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::Boolean(b) => Ok(*b),
            _ => Err(coercion_error("bool", v)),
        }
    }
}

impl FromValue for String {
    fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::String(s) => Ok(String::from_utf8_lossy(s.as_bytes()).into_owned()),
            Value::Binary(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            _ => Err(coercion_error("string", v)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::Binary(b) => Ok(b.clone()),
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(coercion_error("bytes", v)),
        }
    }
}

impl FromValue for Value {
    fn from_value(v: &Value) -> Result<Self> {
        Ok(v.clone())
    }
}

/// Decoding a whole row into a tuple of typed slots.
pub trait DecodeRow: Sized {
    fn decode_row(row: &[Value]) -> Result<Self>;
}

macro_rules! impl_decode_row {
    ($len:expr; $($t:ident => $i:expr),+) => {
        impl<$($t: FromValue),+> DecodeRow for ($($t,)+) {
            fn decode_row(row: &[Value]) -> Result<Self> {
                if row.len() < $len {
                    return Err(FlowError::Decode(format!(
                        "row has {} fields, wanted {}", row.len(), $len
                    )));
                }
                Ok(($($t::from_value(&row[$i])?,)+))
            }
        }
    };
}

impl_decode_row!(1; A => 0);
impl_decode_row!(2; A => 0, B => 1);
impl_decode_row!(3; A => 0, B => 1, C => 2);
impl_decode_row!(4; A => 0, B => 1, C => 2, D => 3);
impl_decode_row!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
impl_decode_row!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

/// Decodes one message payload into caller-supplied typed slots.
pub fn decode_row_to<T: DecodeRow>(payload: &[u8]) -> Result<T> {
    let row = decode_row(payload)?;
    T::decode_row(&row)
}

/// Rank of a value kind in the cross-kind total order. Pinned in this one
/// table and shared by sort, merge, and join.
fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Nil => 0,
        Value::Boolean(_) => 1,
        Value::Integer(_) | Value::F32(_) | Value::F64(_) => 2,
        Value::String(_) => 3,
        Value::Binary(_) => 4,
        Value::Array(_) => 5,
        Value::Map(_) => 6,
        Value::Ext(_, _) => 7,
    }
}

fn numeric_as_f64(v: &Value) -> f64 {
    match v {
        Value::Integer(n) => n.as_f64().unwrap_or(f64::MAX),
        Value::F32(f) => *f as f64,
        Value::F64(f) => *f,
        _ => f64::NAN,
    }
}

fn compare_numeric(a: &Value, b: &Value) -> Ordering {
    if let (Value::Integer(x), Value::Integer(y)) = (a, b) {
        // Exact path; Integer is either i64-representable or a u64 above
        // i64::MAX.
        return match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i.cmp(&j),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => x.as_u64().cmp(&y.as_u64()),
        };
    }
    numeric_as_f64(a).total_cmp(&numeric_as_f64(b))
}

/// Total order over mixed value kinds.
///
/// Numbers compare by value with int/float promotion, strings and byte
/// blobs lexicographically, `false < true`, and different kinds by the
/// fixed rank table.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (kind_rank(a), kind_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Nil, Value::Nil) => Ordering::Equal,
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Binary(x), Value::Binary(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => compare_value_slices(x, y),
        (Value::Map(x), Value::Map(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let ord = compare_values(ka, kb).then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Ext(tx, dx), Value::Ext(ty, dy)) => tx.cmp(ty).then_with(|| dx.cmp(dy)),
        _ => compare_numeric(a, b),
    }
}

fn compare_value_slices(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = compare_values(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// The strict order derived from [`compare_values`].
pub fn less_than(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Less
}

/// Lexicographic comparison of two extracted key tuples under an OrderBy
/// sequence. The key slices are positional: `keys[i]` was extracted for
/// `order_bys[i]`. A key missing on one side compares as [`Value::Nil`].
pub fn compare_keys(a: &[Value], b: &[Value], order_bys: &[OrderBy]) -> Ordering {
    for (i, order_by) in order_bys.iter().enumerate() {
        let x = a.get(i).unwrap_or(&Value::Nil);
        let y = b.get(i).unwrap_or(&Value::Nil);
        let mut ord = compare_values(x, y);
        if order_by.order == Order::Descending {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(fields: &[Value]) -> Row {
        decode_row(&encode_row(fields)).expect("decode")
    }

    #[test]
    fn encodes_and_decodes_mixed_scalars() {
        let fields = vec![
            Value::from(-3i64),
            Value::from(7u64),
            Value::F64(1.25),
            Value::Boolean(true),
            Value::from("cat"),
            Value::Binary(vec![0, 159, 146]),
        ];
        assert_eq!(roundtrip(&fields), fields);
    }

    #[test]
    fn key_extraction_is_one_based_and_pads_missing() {
        let payload = encode_row(&[Value::from("k"), Value::from(9i64)]);
        let keys = decode_row_keys(&payload, &[2, 1, 3]).expect("keys");
        assert_eq!(keys, vec![Value::from(9i64), Value::from("k"), Value::Nil]);
    }

    #[test]
    fn typed_decode_coerces_scalars() {
        let payload = encode_row(&[Value::from("dog"), Value::from(2i64), Value::F64(0.5)]);
        let (word, count, ratio): (String, i64, f64) = decode_row_to(&payload).expect("decode");
        assert_eq!(word, "dog");
        assert_eq!(count, 2);
        assert_eq!(ratio, 0.5);
    }

    #[test]
    fn typed_decode_rejects_short_rows() {
        let payload = encode_row(&[Value::from(1i64)]);
        assert!(decode_row_to::<(i64, i64)>(&payload).is_err());
    }

    #[tokio::test]
    async fn framing_roundtrip_with_eof() {
        let (mut r, mut w) = crate::pipe(256);
        write_row(&mut w, &[Value::from("a")]).await.expect("row 1");
        write_row(&mut w, &[Value::from("b")]).await.expect("row 2");
        write_eof_message(&mut w).await.expect("eof");
        w.close().await.expect("close");

        let first = read_message(&mut r).await.expect("read").expect("payload");
        assert_eq!(decode_row(&first).expect("decode"), vec![Value::from("a")]);
        let second = read_message(&mut r).await.expect("read").expect("payload");
        assert_eq!(decode_row(&second).expect("decode"), vec![Value::from("b")]);
        assert!(read_message(&mut r).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut r, mut w) = crate::pipe(256);
        let framed = frame_message(&encode_row(&[Value::from("x")]));
        tokio::io::AsyncWriteExt::write_all(&mut w, &framed[..framed.len() - 1])
            .await
            .expect("partial write");
        w.close().await.expect("close");

        assert!(matches!(
            read_message(&mut r).await,
            Err(FlowError::UnexpectedEof)
        ));
    }

    #[test]
    fn cross_kind_rank_is_fixed() {
        let ordered = vec![
            Value::Nil,
            Value::Boolean(false),
            Value::Boolean(true),
            Value::from(-1i64),
            Value::F64(0.5),
            Value::from(2i64),
            Value::from(u64::MAX),
            Value::from("a"),
            Value::from("b"),
            Value::Binary(vec![1]),
            Value::Array(vec![Value::from(1i64)]),
        ];
        for pair in ordered.windows(2) {
            assert!(
                less_than(&pair[0], &pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn integer_comparison_is_exact_beyond_f64_precision() {
        let a = Value::from(i64::MAX - 1);
        let b = Value::from(i64::MAX);
        assert!(less_than(&a, &b));
        assert!(!less_than(&b, &a));
    }

    #[test]
    fn descending_reverses_only_its_own_column() {
        let order = vec![OrderBy::desc(1), OrderBy::asc(2)];
        let a = vec![Value::from(2i64), Value::from("x")];
        let b = vec![Value::from(1i64), Value::from("a")];
        assert_eq!(compare_keys(&a, &b, &order), Ordering::Less);

        let c = vec![Value::from(2i64), Value::from("a")];
        assert_eq!(compare_keys(&c, &a, &order), Ordering::Less);
    }
}
