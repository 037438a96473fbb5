//! Canonical byte encoding of field values.
//!
//! Every encrypted value is first serialized as
//!
//! ```text
//! [bson type tag:1][BSON value encoding]
//! ```
//!
//! using the BSON wire format (little-endian integers and doubles,
//! length-prefixed NUL-terminated strings, length-prefixed binaries, documents
//! as `[total_len:4][elements][0x00]` in document order, arrays as documents
//! keyed `"0"`, `"1"`, ...). The same bytes feed the deterministic IV
//! derivation and the AEAD plaintext, so equal values always produce equal
//! ciphertext and the declared type survives decryption.

use std::borrow::Cow;

use crate::error::Error;
use crate::value::{Binary, BsonType, Document, Value};

/// Deepest nesting of documents and arrays accepted in either direction.
pub const MAX_DEPTH: usize = 100;

/// Serializes a value to its canonical bytes.
///
/// # Errors
///
/// Returns `Error::InvalidEncoding` if a document key contains a NUL byte, a
/// length does not fit in 32 bits, or nesting exceeds `MAX_DEPTH`.
pub fn encode_canonical(value: &Value) -> Result<Vec<u8>, Error> {
    let mut out = vec![value.bson_type().tag()];
    write_value(value, &mut out, 0)?;
    Ok(out)
}

/// Parses canonical bytes back into a value.
///
/// # Errors
///
/// Returns `Error::InvalidEncoding` on unknown tags, truncation, invalid UTF-8
/// or trailing bytes.
pub fn decode_canonical(bytes: &[u8]) -> Result<Value, Error> {
    let mut reader = Reader { data: bytes, pos: 0 };
    let tag = reader.u8()?;
    let value = reader.value(tag, 0)?;
    if reader.pos != bytes.len() {
        return Err(invalid("trailing bytes after value"));
    }
    Ok(value)
}

fn invalid(msg: &str) -> Error {
    Error::InvalidEncoding(msg.to_string())
}

fn len_i32(len: usize) -> Result<i32, Error> {
    i32::try_from(len).map_err(|_| invalid("length exceeds 32 bits"))
}

fn write_value(value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<(), Error> {
    if depth > MAX_DEPTH {
        return Err(invalid("nesting too deep"));
    }
    match value {
        Value::Null => {}
        Value::Boolean(b) => out.push(u8::from(*b)),
        Value::Int32(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Int64(i) | Value::DateTime(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Double(d) => out.extend_from_slice(&d.to_le_bytes()),
        Value::String(s) => {
            out.extend_from_slice(&len_i32(s.len() + 1)?.to_le_bytes());
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        Value::Binary(bin) => {
            out.extend_from_slice(&len_i32(bin.bytes.len())?.to_le_bytes());
            out.push(bin.subtype);
            out.extend_from_slice(&bin.bytes);
        }
        Value::Document(doc) => {
            write_elements(doc.iter().map(|(k, v)| (Cow::Borrowed(k), v)), out, depth)?;
        }
        Value::Array(items) => {
            let keyed = items.iter().enumerate().map(|(i, v)| (Cow::Owned(i.to_string()), v));
            write_elements(keyed, out, depth)?;
        }
    }
    Ok(())
}

fn write_elements<'a, I>(elements: I, out: &mut Vec<u8>, depth: usize) -> Result<(), Error>
where
    I: Iterator<Item = (Cow<'a, str>, &'a Value)>,
{
    let start = out.len();
    out.extend_from_slice(&[0; 4]);
    for (key, value) in elements {
        if key.as_bytes().contains(&0) {
            return Err(invalid("document key contains NUL"));
        }
        out.push(value.bson_type().tag());
        out.extend_from_slice(key.as_bytes());
        out.push(0);
        write_value(value, out, depth + 1)?;
    }
    out.push(0);
    let total = len_i32(out.len() - start)?;
    out[start..start + 4].copy_from_slice(&total.to_le_bytes());
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.data.len());
        let end = end.ok_or_else(|| invalid("value truncated"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn len(&mut self) -> Result<usize, Error> {
        let len = i32::from_le_bytes(self.array()?);
        usize::try_from(len).map_err(|_| invalid("negative length"))
    }

    fn cstring(&mut self) -> Result<String, Error> {
        let rest = &self.data[self.pos..];
        let nul = rest.iter().position(|b| *b == 0).ok_or_else(|| invalid("unterminated key"))?;
        let key = std::str::from_utf8(&rest[..nul]).map_err(|_| invalid("key is not UTF-8"))?;
        self.pos += nul + 1;
        Ok(key.to_string())
    }

    fn value(&mut self, tag: u8, depth: usize) -> Result<Value, Error> {
        if depth > MAX_DEPTH {
            return Err(invalid("nesting too deep"));
        }
        let ty = BsonType::from_tag(tag).ok_or_else(|| invalid("unknown type tag"))?;
        Ok(match ty {
            BsonType::Null => Value::Null,
            BsonType::Bool => match self.u8()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                _ => return Err(invalid("boolean out of range")),
            },
            BsonType::Int => Value::Int32(i32::from_le_bytes(self.array()?)),
            BsonType::Long => Value::Int64(i64::from_le_bytes(self.array()?)),
            BsonType::Date => Value::DateTime(i64::from_le_bytes(self.array()?)),
            BsonType::Double => Value::Double(f64::from_le_bytes(self.array()?)),
            BsonType::String => {
                let len = self.len()?;
                let bytes = self.take(len)?;
                match bytes.split_last() {
                    Some((0, text)) => Value::String(
                        String::from_utf8(text.to_vec())
                            .map_err(|_| invalid("string is not UTF-8"))?,
                    ),
                    _ => return Err(invalid("string not NUL-terminated")),
                }
            }
            BsonType::BinData => {
                let len = self.len()?;
                let subtype = self.u8()?;
                Value::Binary(Binary::new(subtype, self.take(len)?.to_vec()))
            }
            BsonType::Object => {
                Value::Document(self.elements(depth)?.into_iter().collect::<Document>())
            }
            BsonType::Array => {
                let elements = self.elements(depth)?;
                let mut items = Vec::with_capacity(elements.len());
                for (i, (key, value)) in elements.into_iter().enumerate() {
                    if key != i.to_string() {
                        return Err(invalid("array keys out of sequence"));
                    }
                    items.push(value);
                }
                Value::Array(items)
            }
        })
    }

    fn elements(&mut self, depth: usize) -> Result<Vec<(String, Value)>, Error> {
        let start = self.pos;
        let total = self.len()?;
        if total < 5 {
            return Err(invalid("document length too small"));
        }
        let mut elements = Vec::new();
        loop {
            let tag = self.u8()?;
            if tag == 0 {
                break;
            }
            let key = self.cstring()?;
            elements.push((key, self.value(tag, depth + 1)?));
        }
        if self.pos - start != total {
            return Err(invalid("document length mismatch"));
        }
        Ok(elements)
    }
}
