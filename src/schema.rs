//! Row schemas, field types, and the byte-level conversion functions that
//! bridge SQL literals and on-disk fixed-width fields.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Float,
    Char,
    Text,
}

impl FieldType {
    fn as_str(&self) -> &'static str {
        match self {
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Char => "CHAR",
            FieldType::Text => "TEXT",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INTEGER" => Ok(FieldType::Integer),
            "FLOAT" => Ok(FieldType::Float),
            "CHAR" => Ok(FieldType::Char),
            "TEXT" => Ok(FieldType::Text),
            other => Err(Error::Parse(format!("unknown field type: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub id: u32,
    pub name: String,
    pub ty: FieldType,
    /// Byte width on disk: 4 for INTEGER/FLOAT/TEXT (indirection slot),
    /// exactly `n` for CHAR(n).
    pub length: u32,
}

impl Field {
    pub fn width(&self) -> usize {
        match self.ty {
            FieldType::Integer | FieldType::Float | FieldType::Text => 4,
            FieldType::Char => self.length as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub fields: Vec<Field>,
    pub primary_id: u32,
}

impl Schema {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_id(&self, id: u32) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn primary(&self) -> &Field {
        self.field_by_id(self.primary_id).expect("schema always carries its primary field")
    }

    pub fn row_size(&self) -> usize {
        self.fields.iter().map(Field::width).sum()
    }

    /// Byte offset of `name`'s slot within a row laid out in field order.
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        let mut offset = 0;
        for f in &self.fields {
            if f.name == name {
                return Some(offset);
            }
            offset += f.width();
        }
        None
    }

    /// Compact, pipe-delimited encoding used by the root table:
    /// `name:type:len,name:type:len,...|primary_id`.
    pub fn to_def_string(&self) -> String {
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|f| format!("{}:{}:{}", f.name, f.ty.as_str(), f.length))
            .collect();
        format!("{}|{}", fields.join(","), self.primary_id)
    }

    pub fn from_def_string(s: &str) -> Result<Self> {
        let (fields_part, primary_part) = s
            .split_once('|')
            .ok_or_else(|| Error::Fatal(format!("malformed schema definition: {s}")))?;
        let primary_id: u32 = primary_part
            .parse()
            .map_err(|_| Error::Fatal(format!("malformed primary id in schema definition: {s}")))?;

        let mut fields = Vec::new();
        for (id, part) in fields_part.split(',').enumerate() {
            let mut pieces = part.splitn(3, ':');
            let name = pieces
                .next()
                .ok_or_else(|| Error::Fatal(format!("malformed field in schema definition: {part}")))?
                .to_string();
            let ty = FieldType::from_str(pieces.next().ok_or_else(|| {
                Error::Fatal(format!("malformed field in schema definition: {part}"))
            })?)?;
            let length: u32 = pieces
                .next()
                .ok_or_else(|| Error::Fatal(format!("malformed field in schema definition: {part}")))?
                .parse()
                .map_err(|_| Error::Fatal(format!("malformed field length in schema definition: {part}")))?;
            fields.push(Field {
                id: id as u32,
                name,
                ty,
                length,
            });
        }
        Ok(Schema { fields, primary_id })
    }
}

/// Maps an `i32` to a 4-byte big-endian buffer whose unsigned byte order
/// equals the integer's numeric order (flip the sign bit so negatives
/// sort before positives). B+ tree keys and range bounds are compared as
/// raw bytes, so this encoding is what makes that comparison correct.
fn encode_integer(v: i32) -> [u8; 4] {
    ((v as u32) ^ 0x8000_0000).to_be_bytes()
}

fn decode_integer(buf: &[u8]) -> i32 {
    (u32::from_be_bytes(buf.try_into().unwrap()) ^ 0x8000_0000) as i32
}

/// Maps an `f32` to a 4-byte big-endian buffer whose unsigned byte order
/// equals the float's numeric order: flip the sign bit for non-negative
/// values, flip every bit for negative ones.
fn encode_float(v: f32) -> [u8; 4] {
    let bits = v.to_bits();
    let mapped = if bits & 0x8000_0000 != 0 { !bits } else { bits | 0x8000_0000 };
    mapped.to_be_bytes()
}

fn decode_float(buf: &[u8]) -> f32 {
    let mapped = u32::from_be_bytes(buf.try_into().unwrap());
    let bits = if mapped & 0x8000_0000 != 0 { mapped & !0x8000_0000 } else { !mapped };
    f32::from_bits(bits)
}

/// Parses a literal into its on-disk fixed-width encoding.
///
/// TEXT is always rejected: this engine carries no out-of-line store for
/// it, so accepting a TEXT literal would silently corrupt the 4-byte
/// indirection slot instead of writing real data.
pub fn from_string(ty: FieldType, length: u32, literal: &str) -> Result<Vec<u8>> {
    match ty {
        FieldType::Integer => {
            let v: i32 = literal
                .parse()
                .map_err(|_| Error::TypeMismatch(format!("not an integer: {literal}")))?;
            Ok(encode_integer(v).to_vec())
        }
        FieldType::Float => {
            let v: f32 = literal
                .parse()
                .map_err(|_| Error::TypeMismatch(format!("not a float: {literal}")))?;
            Ok(encode_float(v).to_vec())
        }
        FieldType::Char => {
            let cap = length as usize;
            if cap == 0 || literal.len() > cap - 1 {
                return Err(Error::TypeMismatch(format!(
                    "string of {} bytes does not fit in CHAR({cap})",
                    literal.len()
                )));
            }
            let mut buf = vec![0u8; cap];
            buf[..literal.len()].copy_from_slice(literal.as_bytes());
            Ok(buf)
        }
        FieldType::Text => Err(Error::TypeMismatch(
            "TEXT literals are not supported (no out-of-line store)".into(),
        )),
    }
}

pub fn to_string(ty: FieldType, buf: &[u8]) -> Result<String> {
    match ty {
        FieldType::Integer => Ok(decode_integer(buf).to_string()),
        FieldType::Float => Ok(decode_float(buf).to_string()),
        FieldType::Char => {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8(buf[..end].to_vec()).map_err(|e| Error::Fatal(e.to_string()))
        }
        FieldType::Text => Err(Error::TypeMismatch("TEXT has no inline representation".into())),
    }
}

/// The domain's immediate successor, used to turn `>`/`>=` into a
/// half-open range's lower bound.
///
/// INTEGER and FLOAT share one trick: both are stored as an order-
/// preserving big-endian mapping (see `encode_integer`/`encode_float`),
/// so "the next value in the domain" is just "the next value in the
/// encoded byte space" — a saturating add on the mapped `u32`. For FLOAT
/// this walks toward `+infinity` using the next representable float, not
/// `orig + 1.0` (the REDESIGN concern this fixes): a value near the
/// domain's upper end still makes forward progress instead of silently
/// rounding back to itself.
pub fn next(ty: FieldType, buf: &[u8]) -> Result<Vec<u8>> {
    match ty {
        FieldType::Integer | FieldType::Float => {
            let v = u32::from_be_bytes(buf.try_into().unwrap());
            Ok(v.saturating_add(1).to_be_bytes().to_vec())
        }
        FieldType::Char => {
            let mut v = buf.to_vec();
            increment_char_buf(&mut v).ok_or_else(|| Error::TypeMismatch("no lexicographic successor (all 0xff)".into()))?;
            Ok(v)
        }
        FieldType::Text => Err(Error::TypeMismatch("TEXT has no ordered domain".into())),
    }
}

pub fn prev(ty: FieldType, buf: &[u8]) -> Result<Vec<u8>> {
    match ty {
        FieldType::Integer | FieldType::Float => {
            let v = u32::from_be_bytes(buf.try_into().unwrap());
            Ok(v.saturating_sub(1).to_be_bytes().to_vec())
        }
        FieldType::Char => {
            let mut v = buf.to_vec();
            decrement_char_buf(&mut v).ok_or_else(|| Error::TypeMismatch("no lexicographic predecessor (all 0x00)".into()))?;
            Ok(v)
        }
        FieldType::Text => Err(Error::TypeMismatch("TEXT has no ordered domain".into())),
    }
}

fn increment_char_buf(buf: &mut [u8]) -> Option<()> {
    for b in buf.iter_mut().rev() {
        if *b != 0xff {
            *b += 1;
            return Some(());
        }
        *b = 0;
    }
    None
}

fn decrement_char_buf(buf: &mut [u8]) -> Option<()> {
    for b in buf.iter_mut().rev() {
        if *b != 0x00 {
            *b -= 1;
            return Some(());
        }
        *b = 0xff;
    }
    None
}

pub fn min_limit(ty: FieldType, length: u32) -> Vec<u8> {
    match ty {
        FieldType::Integer => encode_integer(i32::MIN).to_vec(),
        FieldType::Float => encode_float(f32::NEG_INFINITY).to_vec(),
        FieldType::Char => vec![0u8; length as usize],
        FieldType::Text => vec![0u8; 4],
    }
}

pub fn max_limit(ty: FieldType, length: u32) -> Vec<u8> {
    match ty {
        FieldType::Integer => encode_integer(i32::MAX).to_vec(),
        FieldType::Float => encode_float(f32::INFINITY).to_vec(),
        FieldType::Char => vec![0xffu8; length as usize],
        FieldType::Text => vec![0xffu8; 4],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_def_string_round_trips() {
        let schema = Schema {
            fields: vec![
                Field { id: 0, name: "id".into(), ty: FieldType::Integer, length: 4 },
                Field { id: 1, name: "name".into(), ty: FieldType::Char, length: 32 },
            ],
            primary_id: 0,
        };
        let s = schema.to_def_string();
        let back = Schema::from_def_string(&s).unwrap();
        assert_eq!(back.fields.len(), 2);
        assert_eq!(back.primary_id, 0);
        assert_eq!(back.fields[1].name, "name");
    }

    #[test]
    fn text_literal_is_rejected() {
        assert!(from_string(FieldType::Text, 4, "anything").is_err());
    }

    #[test]
    fn char_literal_must_fit_with_terminator() {
        assert!(from_string(FieldType::Char, 4, "abc").is_ok());
        assert!(from_string(FieldType::Char, 4, "abcd").is_err());
    }

    #[test]
    fn float_next_walks_toward_positive_infinity_even_near_max() {
        let near_max = encode_float(f32::MAX);
        let n = next(FieldType::Float, &near_max).unwrap();
        let v = decode_float(&n);
        assert!(v > f32::MAX || v == f32::INFINITY);
    }

    #[test]
    fn encoded_integer_byte_order_matches_numeric_order() {
        assert!(encode_integer(-5) < encode_integer(5));
        assert!(encode_integer(i32::MIN) < encode_integer(i32::MAX));
    }

    #[test]
    fn integer_next_and_prev_are_inverses() {
        let v = encode_integer(41);
        let n = next(FieldType::Integer, &v).unwrap();
        assert_eq!(decode_integer(&n), 42);
        let p = prev(FieldType::Integer, &v).unwrap();
        assert_eq!(decode_integer(&p), 40);
    }
}
