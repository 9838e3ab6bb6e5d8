//! Value codec
//!
//! Values cross between execution contexts by copy: the sender encodes them
//! into a byte string, the receiver decodes fresh values out of it.
//!
//! # Wire Format
//!
//! ```text
//! stream   := varint(count) value*count
//! value    := tag:u8 payload
//! boolean  := u8(0|1)
//! string   := varint(len) byte*len
//! number   := f64, little-endian IEEE-754
//! table    := subtag ( varint(ordinal) | entries )
//! entries  := (value value)* nil-tag
//! function := subtag ( varint(ordinal) | varint(codelen) byte*codelen entries )
//! other    := <empty>
//! ```
//!
//! Tags are the host type numbers ([`TypeTag`]). The sub-tag of a table or
//! function is [`SUBTAG_REF`] for an object already written in this stream
//! (referenced by its ordinal) or [`SUBTAG_VAL`] for a fresh one.
//!
//! # Identity
//!
//! Each encode and decode call keeps its own identity table. Ordinals are
//! assigned from 1 in first-encounter order, and an object is registered
//! *before* its contents are written or read, so self-references and shared
//! sub-objects come back with the same identity.
//!
//! A function's upvalues are written as the entries of a positional table
//! (`1 = first upvalue, ...`). That table itself has no tag and no ordinal.
//!
//! Table entries are written in the host's enumeration order. Two tables
//! with the same contents but different insertion histories may therefore
//! encode to different bytes.

use crate::buffer::Buffer;
use crate::error::CodecError;
use crate::value::{FunctionRef, TableRef, TypeTag, Value};
use std::collections::HashMap;

/// Sub-tag: back-reference to an object already in the stream
pub const SUBTAG_REF: u8 = 1;
/// Sub-tag: a fresh object follows
pub const SUBTAG_VAL: u8 = 2;

/// Default limit on table/function nesting
pub const DEFAULT_MAX_DEPTH: usize = 200;

/// Most upvalues a scripted closure can capture
pub const MAX_UPVALUES: usize = 255;

/// Encoder/decoder settings
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_depth: usize,
    capacity: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Codec {
            max_depth: DEFAULT_MAX_DEPTH,
            capacity: crate::buffer::DEFAULT_CAPACITY,
        }
    }
}

impl Codec {
    pub fn new(max_depth: usize, capacity: usize) -> Self {
        Codec {
            max_depth,
            capacity,
        }
    }

    /// Encode a sequence of values into one byte string
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>, CodecError> {
        let mut enc = Encoder {
            buf: Buffer::with_capacity(self.capacity),
            seen: HashMap::new(),
            pinned: Vec::new(),
            max_depth: self.max_depth,
            depth: 0,
        };
        enc.buf.write_varint(to_u32("value count", values.len())?);
        for value in values {
            enc.encode_value(value)?;
        }
        Ok(enc.buf.into_bytes())
    }

    /// Decode a byte string produced by [`Codec::encode`]
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
        let mut dec = Decoder {
            buf: Buffer::from_bytes(bytes),
            seen: Vec::new(),
            max_depth: self.max_depth,
            depth: 0,
        };
        let count = dec.buf.read_varint()? as usize;
        let mut values = Vec::with_capacity(count.min(dec.buf.remaining()));
        for _ in 0..count {
            values.push(dec.decode_value()?);
        }
        if dec.buf.remaining() > 0 {
            return Err(CodecError::malformed(
                dec.buf.position(),
                format!("{} trailing byte(s)", dec.buf.remaining()),
            ));
        }
        Ok(values)
    }
}

/// Encode with default settings
pub fn encode(values: &[Value]) -> Result<Vec<u8>, CodecError> {
    Codec::default().encode(values)
}

/// Decode with default settings
pub fn decode(bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
    Codec::default().decode(bytes)
}

fn to_u32(what: &'static str, len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge { what, len })
}

struct Encoder {
    buf: Buffer,
    seen: HashMap<*const (), u32>,
    /// Keeps every registered object alive so its address stays unique
    /// for the whole call
    pinned: Vec<Value>,
    max_depth: usize,
    depth: usize,
}

impl Encoder {
    fn encode_value(&mut self, value: &Value) -> Result<(), CodecError> {
        self.buf.put(value.tag() as u8);
        match value {
            Value::Boolean(b) => self.buf.put(u8::from(*b)),
            Value::Number(n) => self.buf.write(&n.to_le_bytes()),
            Value::String(s) => {
                self.buf.write_varint(to_u32("string length", s.len())?);
                self.buf.write(s);
            }
            Value::Table(table) => {
                if self.back_reference(table.identity()) {
                    return Ok(());
                }
                self.buf.put(SUBTAG_VAL);
                self.register(table.identity(), value);
                self.enter()?;
                self.encode_entries(table.pairs())?;
                self.depth -= 1;
            }
            Value::Function(func) => {
                if self.back_reference(func.identity()) {
                    return Ok(());
                }
                self.encode_closure(func, value)?;
            }
            // tag only
            Value::Nil | Value::LightUserdata(_) | Value::Userdata(_) | Value::Thread(_) => {}
        }
        Ok(())
    }

    fn encode_closure(&mut self, func: &FunctionRef, value: &Value) -> Result<(), CodecError> {
        let Some(closure) = func.as_closure() else {
            let name = func.as_native().map(|n| n.name().to_string()).unwrap_or_default();
            return Err(CodecError::NonSerializable { name });
        };

        self.register(func.identity(), value);
        self.buf.put(SUBTAG_VAL);

        let code = closure.code();
        self.buf.write_varint(to_u32("code length", code.len())?);
        self.buf.write(code);

        let upvalues = closure
            .upvalues()
            .into_iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::Number((i + 1) as f64), v))
            .collect();
        self.enter()?;
        self.encode_entries(upvalues)?;
        self.depth -= 1;
        Ok(())
    }

    fn encode_entries(&mut self, entries: Vec<(Value, Value)>) -> Result<(), CodecError> {
        for (key, value) in &entries {
            self.encode_value(key)?;
            self.encode_value(value)?;
        }
        self.buf.put(TypeTag::Nil as u8);
        Ok(())
    }

    /// Writes a back-reference if the object was already encoded
    fn back_reference(&mut self, id: *const ()) -> bool {
        match self.seen.get(&id) {
            Some(&ordinal) => {
                self.buf.put(SUBTAG_REF);
                self.buf.write_varint(ordinal);
                true
            }
            None => false,
        }
    }

    fn register(&mut self, id: *const (), value: &Value) {
        let ordinal = self.pinned.len() as u32 + 1;
        self.seen.insert(id, ordinal);
        self.pinned.push(value.clone());
    }

    fn enter(&mut self) -> Result<(), CodecError> {
        if self.depth >= self.max_depth {
            return Err(CodecError::DepthExceeded {
                limit: self.max_depth,
            });
        }
        self.depth += 1;
        Ok(())
    }
}

struct Decoder {
    buf: Buffer,
    /// Ordinal n lives at index n - 1
    seen: Vec<Value>,
    max_depth: usize,
    depth: usize,
}

impl Decoder {
    fn decode_value(&mut self) -> Result<Value, CodecError> {
        let offset = self.buf.position();
        let raw = self.buf.get()?;
        let tag = TypeTag::from_u8(raw)
            .ok_or_else(|| CodecError::malformed(offset, format!("unknown type tag {}", raw)))?;

        let value = match tag {
            TypeTag::Nil | TypeTag::LightUserdata | TypeTag::Userdata | TypeTag::Thread => {
                Value::Nil
            }
            TypeTag::Boolean => match self.buf.get()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(CodecError::malformed(
                        offset + 1,
                        format!("boolean byte {}", other),
                    ))
                }
            },
            TypeTag::Number => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(self.buf.read(8)?);
                Value::Number(f64::from_le_bytes(raw))
            }
            TypeTag::String => {
                let len = self.buf.read_varint()? as usize;
                Value::String(self.buf.read(len)?.to_vec())
            }
            TypeTag::Table => match self.subtag()? {
                SUBTAG_REF => self.resolve(TypeTag::Table)?,
                _ => {
                    let table = TableRef::new();
                    self.seen.push(Value::Table(table.clone()));
                    self.enter()?;
                    self.decode_entries(&table)?;
                    self.depth -= 1;
                    Value::Table(table)
                }
            },
            TypeTag::Function => match self.subtag()? {
                SUBTAG_REF => self.resolve(TypeTag::Function)?,
                _ => Value::Function(self.decode_closure()?),
            },
        };
        Ok(value)
    }

    fn decode_closure(&mut self) -> Result<FunctionRef, CodecError> {
        let len = self.buf.read_varint()? as usize;
        let code = self.buf.read(len)?.to_vec();
        let func = FunctionRef::closure(code, Vec::new());
        self.seen.push(Value::Function(func.clone()));

        let upvalues = TableRef::new();
        self.enter()?;
        self.decode_entries(&upvalues)?;
        self.depth -= 1;

        for (key, value) in upvalues.pairs() {
            let index = key
                .as_number()
                .filter(|n| n.fract() == 0.0 && *n >= 1.0 && *n <= MAX_UPVALUES as f64)
                .ok_or_else(|| {
                    CodecError::malformed(
                        self.buf.position(),
                        format!("upvalue key must be an index in 1..={}, got {:?}", MAX_UPVALUES, key),
                    )
                })?;
            func.set_upvalue(index as usize, value);
        }
        Ok(func)
    }

    fn decode_entries(&mut self, table: &TableRef) -> Result<(), CodecError> {
        while self.buf.peek()? != TypeTag::Nil as u8 {
            let key = self.decode_value()?;
            let value = self.decode_value()?;
            table.set(key, value);
        }
        // sentinel
        self.buf.get()?;
        Ok(())
    }

    fn subtag(&mut self) -> Result<u8, CodecError> {
        let offset = self.buf.position();
        match self.buf.get()? {
            tag @ (SUBTAG_REF | SUBTAG_VAL) => Ok(tag),
            other => Err(CodecError::malformed(offset, format!("bad sub-tag {}", other))),
        }
    }

    fn resolve(&mut self, expected: TypeTag) -> Result<Value, CodecError> {
        let offset = self.buf.position();
        let ordinal = self.buf.read_varint()? as usize;
        let value = ordinal
            .checked_sub(1)
            .and_then(|i| self.seen.get(i))
            .cloned()
            .ok_or_else(|| {
                CodecError::malformed(offset, format!("back-reference to unseen ordinal {}", ordinal))
            })?;
        if value.tag() != expected {
            return Err(CodecError::malformed(
                offset,
                format!(
                    "ordinal {} is a {}, expected a {}",
                    ordinal,
                    value.type_name(),
                    expected.name()
                ),
            ));
        }
        Ok(value)
    }

    fn enter(&mut self) -> Result<(), CodecError> {
        if self.depth >= self.max_depth {
            return Err(CodecError::DepthExceeded {
                limit: self.max_depth,
            });
        }
        self.depth += 1;
        Ok(())
    }
}
