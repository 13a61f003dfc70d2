//! Binary telemetry wire format.
//!
//! ## Stream layout
//! ```text
//! Header:  MAGIC (8 bytes) + VERSION (u32 LE) = 12 bytes
//!
//! Records:
//!   0x01 ClassDef → code(u8) + class_id(u16) + name(str) + field_count(u8) + field_name(str) * N
//!   0x02 Object   → code(u8) + class_id(u16) + field_count(u8) + value * N
//!
//! Values: type(u8) + payload
//!   0 Null    → (none)
//!   1 False   → (none)
//!   2 True    → (none)
//!   3 Int     → i32
//!   4 UInt    → u32
//!   5 Double  → f64
//!   6 String  → str
//!   7 Blob    → len(u32) + bytes
//!   8 Object  → class_id(u16) + field_count(u8) + value * N
//!   9 List    → elem_type(u8) + count(u32) + payload * N
//!
//! str: ref(u32 LE)
//!   low bit 1 → inline: byte length = ref >> 1, UTF-8 bytes follow
//!   low bit 0 → index (ref >> 1) into the string table
//! ```
//!
//! All integers are little-endian. List payloads are untagged; a list of
//! booleans uses elem_type 1 and one byte per element. An empty list has
//! elem_type 0.
//!
//! A ClassDef is sent once per stream, before the first object that uses
//! it (nested objects included). Every non-empty string sent inline is
//! appended to both sides' string table, so repeated names cost four bytes.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};

use serde::Serialize;
use serde::ser::SerializeMap;
use thiserror::Error;

pub const MAGIC: &[u8; 8] = b"TLMTRACE";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 12; // 8 magic + 4 version

// Record codes
const WIRE_CLASS_DEF: u8 = 0x01;
const WIRE_OBJECT: u8 = 0x02;

// Value types
const TYPE_NULL: u8 = 0;
const TYPE_FALSE: u8 = 1;
const TYPE_TRUE: u8 = 2;
const TYPE_INT: u8 = 3;
const TYPE_UINT: u8 = 4;
const TYPE_DOUBLE: u8 = 5;
const TYPE_STRING: u8 = 6;
const TYPE_BLOB: u8 = 7;
const TYPE_OBJECT: u8 = 8;
const TYPE_LIST: u8 = 9;

/// Maximum nesting of objects and lists, on both encode and decode.
pub const MAX_DEPTH: usize = 32;

/// Maximum elements in one list, on both encode and decode. Elements such
/// as `Null` take no payload bytes, so the count alone bounds the memory a
/// decoded list needs.
pub const MAX_LIST_LEN: usize = 1 << 20;

const MAX_FIELDS: usize = u8::MAX as usize;
const MAX_INLINE_STR: usize = (u32::MAX >> 1) as usize;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("not a telemetry stream (magic {0:?})")]
    BadMagic([u8; 8]),
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u32),
    #[error("class `{class}` has {expected} fields, record carries {found}")]
    FieldCountMismatch {
        class: String,
        expected: usize,
        found: usize,
    },
    #[error("object refers to undefined class id {0}")]
    UnknownClass(u16),
    #[error("unknown tag {0:#04x}")]
    UnknownTag(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string reference {0} is not in the string table")]
    BadStringRef(u32),
    #[error("stream ended in the middle of a record")]
    Truncated,
    #[error("list mixes element types")]
    HeterogeneousList,
    #[error("{0} is too large for the wire format")]
    TooLarge(&'static str),
    #[error("values nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("class table is full")]
    TooManyClasses,
}

/// A record schema: a class name and its ordered field names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ClassDef {
    pub name: Cow<'static, str>,
    pub fields: Vec<Cow<'static, str>>,
}

impl ClassDef {
    pub fn new<N, F>(name: N, fields: impl IntoIterator<Item = F>) -> Self
    where
        N: Into<Cow<'static, str>>,
        F: Into<Cow<'static, str>>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }
}

/// An instance of a [`ClassDef`], with one value per declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub class: ClassDef,
    pub fields: Vec<Value>,
}

impl Record {
    pub fn new(class: ClassDef, fields: Vec<Value>) -> Self {
        Self { class, fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(self.class.field_index(field)?)
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("class", &self.class.name)?;
        for (name, value) in self.class.fields.iter().zip(&self.fields) {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    UInt(u32),
    Double(f64),
    String(String),
    Blob(Vec<u8>),
    Object(Box<Record>),
    /// Every element must be the same variant.
    List(Vec<Value>),
}

impl Value {
    /// The wire type of this value; both booleans map to `TYPE_FALSE`.
    fn kind(&self) -> u8 {
        match self {
            Value::Null => TYPE_NULL,
            Value::Bool(_) => TYPE_FALSE,
            Value::Int(_) => TYPE_INT,
            Value::UInt(_) => TYPE_UINT,
            Value::Double(_) => TYPE_DOUBLE,
            Value::String(_) => TYPE_STRING,
            Value::Blob(_) => TYPE_BLOB,
            Value::Object(_) => TYPE_OBJECT,
            Value::List(_) => TYPE_LIST,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match *self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u32> {
        match *self {
            Value::UInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Object(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Object(Box::new(v))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Blob(v) => write!(f, "<{} bytes>", v.len()),
            Value::Object(r) => write!(f, "{}{{..}}", r.class.name),
            Value::List(v) => write!(f, "[{} items]", v.len()),
        }
    }
}

pub fn header_bytes() -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..8].copy_from_slice(MAGIC);
    header[8..].copy_from_slice(&VERSION.to_le_bytes());
    header
}

pub fn write_header(w: &mut impl Write) -> io::Result<()> {
    w.write_all(&header_bytes())
}

/// Read and check the stream header, returning the version.
pub fn read_header(r: &mut impl Read) -> Result<u32, ProtocolError> {
    let mut magic = [0u8; 8];
    read_exact(r, &mut magic)?;
    if &magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let mut version = [0u8; 4];
    read_exact(r, &mut version)?;
    let version = u32::from_le_bytes(version);
    if version > VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Stateful encoder for one stream.
///
/// Remembers which classes and strings the peer has already seen. Create a
/// fresh codec for every new stream.
#[derive(Debug, Default)]
pub struct WireCodec {
    classes: HashMap<ClassDef, u16>,
    strings: HashMap<String, u32>,
    scratch: Vec<u8>,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one object (plus any ClassDefs it needs) into the internal
    /// scratch buffer and return the bytes.
    ///
    /// Validation runs before any state changes, so a failed encode leaves
    /// the codec exactly as it was.
    pub fn encode(&mut self, class: &ClassDef, fields: &[Value]) -> Result<&[u8], ProtocolError> {
        validate_object(class, fields, 0)?;
        let mut new_classes = 0usize;
        count_new_classes(&self.classes, class, fields, &mut new_classes);
        if self.classes.len() + new_classes > u16::MAX as usize + 1 {
            return Err(ProtocolError::TooManyClasses);
        }

        let mut out = std::mem::take(&mut self.scratch);
        out.clear();
        self.define_classes(&mut out, class, fields);
        out.push(WIRE_OBJECT);
        self.put_object(&mut out, class, fields);
        self.scratch = out;
        Ok(&self.scratch)
    }

    /// [`encode`](Self::encode) and write the result with a single `write_all`.
    pub fn write_record(
        &mut self,
        out: &mut impl Write,
        class: &ClassDef,
        fields: &[Value],
    ) -> Result<usize, ProtocolError> {
        let bytes = self.encode(class, fields)?;
        out.write_all(bytes)?;
        Ok(bytes.len())
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    fn define_classes(&mut self, out: &mut Vec<u8>, class: &ClassDef, fields: &[Value]) {
        for value in fields {
            self.define_nested(out, value);
        }
        if self.classes.contains_key(class) {
            return;
        }
        let id = self.classes.len() as u16;
        self.classes.insert(class.clone(), id);
        out.push(WIRE_CLASS_DEF);
        out.extend_from_slice(&id.to_le_bytes());
        self.put_str(out, &class.name);
        out.push(class.fields.len() as u8);
        for field in &class.fields {
            self.put_str(out, field);
        }
    }

    fn define_nested(&mut self, out: &mut Vec<u8>, value: &Value) {
        match value {
            Value::Object(record) => self.define_classes(out, &record.class, &record.fields),
            Value::List(items) => {
                for item in items {
                    self.define_nested(out, item);
                }
            }
            _ => {}
        }
    }

    fn put_str(&mut self, out: &mut Vec<u8>, s: &str) {
        if let Some(&index) = self.strings.get(s) {
            out.extend_from_slice(&(index << 1).to_le_bytes());
            return;
        }
        let inline = ((s.len() as u32) << 1) | 1;
        out.extend_from_slice(&inline.to_le_bytes());
        out.extend_from_slice(s.as_bytes());
        if !s.is_empty() {
            let index = self.strings.len() as u32;
            self.strings.insert(s.to_string(), index);
        }
    }

    fn put_object(&mut self, out: &mut Vec<u8>, class: &ClassDef, fields: &[Value]) {
        // Every class reachable from `fields` was defined by `define_classes`.
        let id = self.classes.get(class).copied().unwrap_or_default();
        out.extend_from_slice(&id.to_le_bytes());
        out.push(fields.len() as u8);
        for value in fields {
            self.put_value(out, value);
        }
    }

    fn put_value(&mut self, out: &mut Vec<u8>, value: &Value) {
        match value {
            Value::Bool(b) => out.push(if *b { TYPE_TRUE } else { TYPE_FALSE }),
            _ => {
                out.push(value.kind());
                self.put_payload(out, value);
            }
        }
    }

    fn put_payload(&mut self, out: &mut Vec<u8>, value: &Value) {
        match value {
            Value::Null => {}
            Value::Bool(b) => out.push(*b as u8),
            Value::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::String(s) => self.put_str(out, s),
            Value::Blob(bytes) => {
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            Value::Object(record) => self.put_object(out, &record.class, &record.fields),
            Value::List(items) => {
                let elem_type = items.first().map_or(TYPE_NULL, Value::kind);
                out.push(elem_type);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    self.put_payload(out, item);
                }
            }
        }
    }
}

fn validate_str(s: &str, what: &'static str) -> Result<(), ProtocolError> {
    if s.len() > MAX_INLINE_STR {
        return Err(ProtocolError::TooLarge(what));
    }
    Ok(())
}

fn validate_object(class: &ClassDef, fields: &[Value], depth: usize) -> Result<(), ProtocolError> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::TooDeep);
    }
    if class.fields.len() > MAX_FIELDS {
        return Err(ProtocolError::TooLarge("class field count"));
    }
    if class.fields.len() != fields.len() {
        return Err(ProtocolError::FieldCountMismatch {
            class: class.name.to_string(),
            expected: class.fields.len(),
            found: fields.len(),
        });
    }
    validate_str(&class.name, "class name")?;
    for field in &class.fields {
        validate_str(field, "field name")?;
    }
    fields.iter().try_for_each(|v| validate_value(v, depth + 1))
}

fn validate_value(value: &Value, depth: usize) -> Result<(), ProtocolError> {
    match value {
        Value::String(s) => validate_str(s, "string"),
        Value::Blob(bytes) if bytes.len() > u32::MAX as usize => Err(ProtocolError::TooLarge("blob")),
        Value::Object(record) => validate_object(&record.class, &record.fields, depth),
        Value::List(items) => {
            if depth > MAX_DEPTH {
                return Err(ProtocolError::TooDeep);
            }
            if items.len() > MAX_LIST_LEN {
                return Err(ProtocolError::TooLarge("list"));
            }
            if let Some(first) = items.first() {
                let kind = first.kind();
                if items.iter().any(|item| item.kind() != kind) {
                    return Err(ProtocolError::HeterogeneousList);
                }
            }
            items.iter().try_for_each(|v| validate_value(v, depth + 1))
        }
        _ => Ok(()),
    }
}

fn count_new_classes(
    known: &HashMap<ClassDef, u16>,
    class: &ClassDef,
    fields: &[Value],
    count: &mut usize,
) {
    if !known.contains_key(class) {
        *count += 1;
    }
    for value in fields {
        count_nested(known, value, count);
    }
}

fn count_nested(known: &HashMap<ClassDef, u16>, value: &Value, count: &mut usize) {
    match value {
        Value::Object(r) => count_new_classes(known, &r.class, &r.fields, count),
        Value::List(items) => items.iter().for_each(|v| count_nested(known, v, count)),
        _ => {}
    }
}

/// `read_exact` that reports a short read as [`ProtocolError::Truncated`].
fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), ProtocolError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => ProtocolError::Io(e),
    })
}

fn read_u8(r: &mut impl Read) -> Result<u8, ProtocolError> {
    let mut b = [0u8; 1];
    read_exact(r, &mut b)?;
    Ok(b[0])
}

fn read_u16(r: &mut impl Read) -> Result<u16, ProtocolError> {
    let mut b = [0u8; 2];
    read_exact(r, &mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32(r: &mut impl Read) -> Result<u32, ProtocolError> {
    let mut b = [0u8; 4];
    read_exact(r, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_bytes(r: &mut impl Read, len: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    let read = r.take(len as u64).read_to_end(&mut buf)?;
    if read != len {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf)
}

/// Stateful decoder for one stream; the inverse of [`WireCodec`].
#[derive(Debug, Default)]
pub struct WireDecoder {
    classes: HashMap<u16, ClassDef>,
    strings: Vec<String>,
}

impl WireDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the next object. ClassDef records are consumed along the way.
    /// Returns `Ok(None)` at a clean end of stream.
    pub fn read_record(&mut self, r: &mut impl Read) -> Result<Option<Record>, ProtocolError> {
        loop {
            let mut tag = [0u8; 1];
            let n = loop {
                match r.read(&mut tag) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            if n == 0 {
                return Ok(None);
            }
            match tag[0] {
                WIRE_CLASS_DEF => self.read_class_def(r)?,
                WIRE_OBJECT => return self.read_object(r, 0).map(Some),
                other => return Err(ProtocolError::UnknownTag(other)),
            }
        }
    }

    pub fn class(&self, id: u16) -> Option<&ClassDef> {
        self.classes.get(&id)
    }

    fn read_class_def(&mut self, r: &mut impl Read) -> Result<(), ProtocolError> {
        let id = read_u16(r)?;
        let name = self.read_str(r)?;
        let count = read_u8(r)? as usize;
        let fields = (0..count)
            .map(|_| self.read_str(r).map(Cow::Owned))
            .collect::<Result<Vec<_>, _>>()?;
        self.classes.insert(
            id,
            ClassDef {
                name: Cow::Owned(name),
                fields,
            },
        );
        Ok(())
    }

    fn read_str(&mut self, r: &mut impl Read) -> Result<String, ProtocolError> {
        let reference = read_u32(r)?;
        if reference & 1 == 0 {
            let index = reference >> 1;
            return self
                .strings
                .get(index as usize)
                .cloned()
                .ok_or(ProtocolError::BadStringRef(index));
        }
        let bytes = read_bytes(r, (reference >> 1) as usize)?;
        let s = String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        if !s.is_empty() {
            self.strings.push(s.clone());
        }
        Ok(s)
    }

    fn read_object(&mut self, r: &mut impl Read, depth: usize) -> Result<Record, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::TooDeep);
        }
        let id = read_u16(r)?;
        let count = read_u8(r)? as usize;
        let class = self
            .classes
            .get(&id)
            .cloned()
            .ok_or(ProtocolError::UnknownClass(id))?;
        if class.fields.len() != count {
            return Err(ProtocolError::FieldCountMismatch {
                class: class.name.to_string(),
                expected: class.fields.len(),
                found: count,
            });
        }
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = read_u8(r)?;
            fields.push(match kind {
                TYPE_FALSE => Value::Bool(false),
                TYPE_TRUE => Value::Bool(true),
                _ => self.read_payload(r, kind, depth + 1)?,
            });
        }
        Ok(Record { class, fields })
    }

    fn read_payload(&mut self, r: &mut impl Read, kind: u8, depth: usize) -> Result<Value, ProtocolError> {
        Ok(match kind {
            TYPE_NULL => Value::Null,
            TYPE_FALSE | TYPE_TRUE => Value::Bool(read_u8(r)? != 0),
            TYPE_INT => Value::Int(read_u32(r)? as i32),
            TYPE_UINT => Value::UInt(read_u32(r)?),
            TYPE_DOUBLE => {
                let mut b = [0u8; 8];
                read_exact(r, &mut b)?;
                Value::Double(f64::from_le_bytes(b))
            }
            TYPE_STRING => Value::String(self.read_str(r)?),
            TYPE_BLOB => {
                let len = read_u32(r)? as usize;
                Value::Blob(read_bytes(r, len)?)
            }
            TYPE_OBJECT => Value::Object(Box::new(self.read_object(r, depth)?)),
            TYPE_LIST => {
                if depth > MAX_DEPTH {
                    return Err(ProtocolError::TooDeep);
                }
                let elem_type = read_u8(r)?;
                let count = read_u32(r)? as usize;
                if count > MAX_LIST_LEN {
                    return Err(ProtocolError::TooLarge("list"));
                }
                // The count is untrusted; let the vector grow as elements arrive.
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.read_payload(r, elem_type, depth + 1)?);
                }
                Value::List(items)
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}
