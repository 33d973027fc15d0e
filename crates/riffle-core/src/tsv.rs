//! Tab-separated text bridging.
//!
//! Child processes and terminals speak newline-terminated, tab-separated
//! text; these helpers convert between that form and framed row streams.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::row::{read_message, decode_row, Value};
use crate::Result;

/// Renders one field for tab-separated output.
pub fn value_to_text(v: &Value) -> String {
    match v {
        Value::Nil => String::new(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(n) => n.to_string(),
        Value::F32(f) => f.to_string(),
        Value::F64(f) => f.to_string(),
        Value::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        Value::Binary(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(value_to_text).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Parses `\t`-separated lines from `r`, handing the field strings to `f`.
/// Stops after `limit` lines; a negative limit reads everything.
pub async fn take_tsv<R, F>(r: R, limit: i64, mut f: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Vec<String>) -> Result<()>,
{
    let mut lines = BufReader::new(r).lines();
    let mut taken = 0i64;
    while limit < 0 || taken < limit {
        match lines.next_line().await? {
            Some(line) => {
                f(line.split('\t').map(str::to_owned).collect())?;
                taken += 1;
            }
            None => break,
        }
    }
    Ok(())
}

/// Prints every row from a framed row stream, fields joined by `delim`,
/// rows terminated by `terminator`.
pub async fn fprint_rows<R, W>(r: &mut R, w: &mut W, delim: &str, terminator: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = read_message(r).await? {
        let fields = decode_row(&payload)?;
        let rendered: Vec<String> = fields.iter().map(value_to_text).collect();
        w.write_all(rendered.join(delim).as_bytes()).await?;
        w.write_all(terminator.as_bytes()).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Substitutes one field per `%s` verb. `%%` renders a literal percent;
/// missing fields render empty, surplus fields are ignored.
pub fn format_fields(format: &str, fields: &[Value]) -> String {
    let mut out = String::with_capacity(format.len() + 8 * fields.len());
    let mut next = 0usize;
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => {
                if let Some(v) = fields.get(next) {
                    out.push_str(&value_to_text(v));
                }
                next += 1;
            }
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Formats each row of a framed row stream with one `%s` verb per field.
pub async fn fprintf<R, W>(r: &mut R, w: &mut W, format: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = read_message(r).await? {
        let fields = decode_row(&payload)?;
        w.write_all(format_fields(format, &fields).as_bytes()).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Formats each tab-separated text line the same way, for raw byte
/// streams produced by child processes.
pub async fn tsv_printf<R, W>(r: R, w: &mut W, format: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(r).lines();
    while let Some(line) = lines.next_line().await? {
        let fields: Vec<Value> = line.split('\t').map(Value::from).collect();
        w.write_all(format_fields(format, &fields).as_bytes()).await?;
    }
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{write_eof_message, write_row};

    #[test]
    fn formats_fields_with_percent_verbs() {
        let fields = vec![Value::from("cat"), Value::from(2i64)];
        assert_eq!(format_fields("%s=%s", &fields), "cat=2");
        assert_eq!(format_fields("100%% %s", &fields), "100% cat");
        assert_eq!(format_fields("%s %s %s", &fields), "cat 2 ");
    }

    #[tokio::test]
    async fn take_tsv_honors_limit() {
        let input = b"a\tb\nc\td\ne\tf\n".to_vec();
        let mut seen = Vec::new();
        take_tsv(&input[..], 2, |fields| {
            seen.push(fields);
            Ok(())
        })
        .await
        .expect("take");
        assert_eq!(seen, vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[tokio::test]
    async fn prints_rows_as_tsv() {
        let (mut r, mut w) = crate::pipe(256);
        write_row(&mut w, &[Value::from("the"), Value::from(2i64)])
            .await
            .expect("row");
        write_eof_message(&mut w).await.expect("eof");
        w.close().await.expect("close");

        let mut out = Vec::new();
        fprint_rows(&mut r, &mut out, "\t", "\n").await.expect("print");
        assert_eq!(out, b"the\t2\n");
    }
}
