//! Changeset entry stream.
//!
//! A changeset is a sequence of records, each framed as
//! `[type: u8][len: u32 LE][body: len bytes]`:
//!
//! | type | record      | body                                                      |
//! |------|-------------|-----------------------------------------------------------|
//! | 0x01 | Relation    | schema, table, columns (name, type)                       |
//! | 0x02 | RowChange   | relation index, kind, optional old tuple, optional new tuple |
//! | 0x03 | SideEffect  | table, key column, key, value column, delta               |
//!
//! Row changes refer to relations by the order in which Relation records
//! appear earlier in the same stream.

use crate::constants::changeset::ENTRY_PREFIX_LEN;
use crate::database::SqlValue;
use crate::errors::ChangesetError;

pub const ENTRY_RELATION: u8 = 0x01;
pub const ENTRY_ROW_CHANGE: u8 = 0x02;
pub const ENTRY_SIDE_EFFECT: u8 = 0x03;

const VALUE_NULL: u8 = 0;
const VALUE_INT: u8 = 1;
const VALUE_BYTES: u8 = 2;
const VALUE_BOOL: u8 = 3;
const VALUE_TEXT: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub schema: String,
    pub table: String,
    pub columns: Vec<Column>,
}

impl Relation {
    pub fn qualified_name(&self) -> String {
        if self.schema.is_empty() {
            self.table.clone()
        } else {
            format!("{}.{}", self.schema, self.table)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    fn tag(self) -> u8 {
        match self {
            ChangeKind::Insert => 0,
            ChangeKind::Update => 1,
            ChangeKind::Delete => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, ChangesetError> {
        match tag {
            0 => Ok(ChangeKind::Insert),
            1 => Ok(ChangeKind::Update),
            2 => Ok(ChangeKind::Delete),
            other => Err(ChangesetError::decode(format!("unknown change kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub relation: u32,
    pub kind: ChangeKind,
    pub old_tuple: Option<Vec<SqlValue>>,
    pub new_tuple: Option<Vec<SqlValue>>,
}

/// Derived additive update, e.g. the spends a block charged to accounts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffect {
    pub table: String,
    pub key_column: String,
    pub key: SqlValue,
    pub value_column: String,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangesetEntry {
    Relation(Relation),
    RowChange(RowChange),
    SideEffect(SideEffect),
}

impl ChangesetEntry {
    fn type_tag(&self) -> u8 {
        match self {
            ChangesetEntry::Relation(_) => ENTRY_RELATION,
            ChangesetEntry::RowChange(_) => ENTRY_ROW_CHANGE,
            ChangesetEntry::SideEffect(_) => ENTRY_SIDE_EFFECT,
        }
    }
}

/// Serializes entries into one framed stream
pub fn encode_entries(entries: &[ChangesetEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        let mut body = Writer::default();
        match entry {
            ChangesetEntry::Relation(relation) => {
                body.str(&relation.schema);
                body.str(&relation.table);
                body.u32(relation.columns.len() as u32);
                for column in &relation.columns {
                    body.str(&column.name);
                    body.str(&column.data_type);
                }
            }
            ChangesetEntry::RowChange(change) => {
                body.u32(change.relation);
                body.u8(change.kind.tag());
                body.tuple(change.old_tuple.as_deref());
                body.tuple(change.new_tuple.as_deref());
            }
            ChangesetEntry::SideEffect(effect) => {
                body.str(&effect.table);
                body.str(&effect.key_column);
                body.value(&effect.key);
                body.str(&effect.value_column);
                body.i64(effect.delta);
            }
        }

        out.push(entry.type_tag());
        out.extend_from_slice(&(body.buf.len() as u32).to_le_bytes());
        out.extend_from_slice(&body.buf);
    }
    out
}

/// Splits a framed stream back into entries; trailing partial frames are an error
pub fn decode_entries(data: &[u8]) -> Result<Vec<ChangesetEntry>, ChangesetError> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let (tag, len) = decode_prefix(&data[pos..])?;
        pos += ENTRY_PREFIX_LEN;
        let body = data.get(pos..pos + len).ok_or_else(|| {
            ChangesetError::decode(format!(
                "record at offset {} declares {} bytes, {} remain",
                pos - ENTRY_PREFIX_LEN,
                len,
                data.len() - pos
            ))
        })?;
        pos += len;

        let mut r = Reader::new(body);
        let entry = match tag {
            ENTRY_RELATION => {
                let schema = r.str()?;
                let table = r.str()?;
                let count = r.u32()?;
                let mut columns = Vec::new();
                for _ in 0..count {
                    columns.push(Column {
                        name: r.str()?,
                        data_type: r.str()?,
                    });
                }
                ChangesetEntry::Relation(Relation {
                    schema,
                    table,
                    columns,
                })
            }
            ENTRY_ROW_CHANGE => ChangesetEntry::RowChange(RowChange {
                relation: r.u32()?,
                kind: ChangeKind::from_tag(r.u8()?)?,
                old_tuple: r.tuple()?,
                new_tuple: r.tuple()?,
            }),
            ENTRY_SIDE_EFFECT => ChangesetEntry::SideEffect(SideEffect {
                table: r.str()?,
                key_column: r.str()?,
                key: r.value()?,
                value_column: r.str()?,
                delta: r.i64()?,
            }),
            other => return Err(ChangesetError::UnknownEntryType { tag: other }),
        };
        r.finish()?;
        entries.push(entry);
    }

    Ok(entries)
}

/// Reads the `[type u8][len u32 LE]` prefix of a record
pub fn decode_prefix(data: &[u8]) -> Result<(u8, usize), ChangesetError> {
    if data.len() < ENTRY_PREFIX_LEN {
        return Err(ChangesetError::decode(format!(
            "truncated record prefix ({} bytes)",
            data.len()
        )));
    }
    let len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
    Ok((data[0], len))
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    fn str(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }

    fn value(&mut self, v: &SqlValue) {
        match v {
            SqlValue::Null => self.u8(VALUE_NULL),
            SqlValue::Int(i) => {
                self.u8(VALUE_INT);
                self.i64(*i);
            }
            SqlValue::Bytes(b) => {
                self.u8(VALUE_BYTES);
                self.bytes(b);
            }
            SqlValue::Bool(b) => {
                self.u8(VALUE_BOOL);
                self.u8(u8::from(*b));
            }
            SqlValue::Text(s) => {
                self.u8(VALUE_TEXT);
                self.str(s);
            }
        }
    }

    fn tuple(&mut self, tuple: Option<&[SqlValue]>) {
        match tuple {
            None => self.u8(0),
            Some(values) => {
                self.u8(1);
                self.u32(values.len() as u32);
                for value in values {
                    self.value(value);
                }
            }
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ChangesetError> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| ChangesetError::decode("record body truncated"))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ChangesetError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ChangesetError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, ChangesetError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, ChangesetError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn str(&mut self) -> Result<String, ChangesetError> {
        String::from_utf8(self.bytes()?)
            .map_err(|e| ChangesetError::decode(format!("invalid utf-8: {}", e)))
    }

    fn value(&mut self) -> Result<SqlValue, ChangesetError> {
        match self.u8()? {
            VALUE_NULL => Ok(SqlValue::Null),
            VALUE_INT => Ok(SqlValue::Int(self.i64()?)),
            VALUE_BYTES => Ok(SqlValue::Bytes(self.bytes()?)),
            VALUE_BOOL => match self.u8()? {
                0 => Ok(SqlValue::Bool(false)),
                1 => Ok(SqlValue::Bool(true)),
                other => Err(ChangesetError::decode(format!("invalid bool byte {}", other))),
            },
            VALUE_TEXT => Ok(SqlValue::Text(self.str()?)),
            other => Err(ChangesetError::decode(format!("unknown value tag {}", other))),
        }
    }

    fn tuple(&mut self) -> Result<Option<Vec<SqlValue>>, ChangesetError> {
        match self.u8()? {
            0 => Ok(None),
            1 => {
                let count = self.u32()?;
                let mut values = Vec::new();
                for _ in 0..count {
                    values.push(self.value()?);
                }
                Ok(Some(values))
            }
            other => Err(ChangesetError::decode(format!("invalid tuple marker {}", other))),
        }
    }

    fn finish(&self) -> Result<(), ChangesetError> {
        if self.pos != self.data.len() {
            return Err(ChangesetError::decode(format!(
                "{} unread bytes in record body",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<ChangesetEntry> {
        vec![
            ChangesetEntry::Relation(Relation {
                schema: "ds_abc".into(),
                table: "users".into(),
                columns: vec![
                    Column {
                        name: "id".into(),
                        data_type: "int8".into(),
                    },
                    Column {
                        name: "name".into(),
                        data_type: "text".into(),
                    },
                ],
            }),
            ChangesetEntry::RowChange(RowChange {
                relation: 0,
                kind: ChangeKind::Insert,
                old_tuple: None,
                new_tuple: Some(vec![SqlValue::Int(1), SqlValue::Null]),
            }),
            ChangesetEntry::SideEffect(SideEffect {
                table: "kwild_accts.accounts".into(),
                key_column: "identifier".into(),
                key: SqlValue::Bytes(vec![0xaa, 0xbb]),
                value_column: "balance".into(),
                delta: -25,
            }),
        ]
    }

    #[test]
    fn frames_carry_type_and_length() {
        let encoded = encode_entries(&sample());
        let (tag, len) = decode_prefix(&encoded).unwrap();
        assert_eq!(tag, ENTRY_RELATION);
        assert!(len > 0 && ENTRY_PREFIX_LEN + len < encoded.len());
        assert_eq!(decode_entries(&encoded).unwrap(), sample());
    }

    #[test]
    fn hand_built_row_change_decodes() {
        // Insert into relation 2 with one int column = 7
        let mut body = vec![2, 0, 0, 0, 0, 0, 1, 1, 0, 0, 0, VALUE_INT];
        body.extend_from_slice(&7i64.to_le_bytes());
        let mut frame = vec![ENTRY_ROW_CHANGE];
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);

        let entries = decode_entries(&frame).unwrap();
        assert_eq!(
            entries,
            vec![ChangesetEntry::RowChange(RowChange {
                relation: 2,
                kind: ChangeKind::Insert,
                old_tuple: None,
                new_tuple: Some(vec![SqlValue::Int(7)]),
            })]
        );
    }

    #[test]
    fn unknown_type_tags_are_rejected() {
        let frame = [0x09, 0, 0, 0, 0];
        assert!(matches!(
            decode_entries(&frame),
            Err(ChangesetError::UnknownEntryType { tag: 0x09 })
        ));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let encoded = encode_entries(&sample());
        assert!(decode_entries(&encoded[..encoded.len() - 1]).is_err());
        assert!(decode_entries(&encoded[..3]).is_err());
    }

    #[test]
    fn empty_stream_has_no_entries() {
        assert!(decode_entries(&[]).unwrap().is_empty());
    }
}
