//! Runtime-described payloads
//!
//! Static [`Encode`]/[`Decode`] impls cover normal message handling. Tools
//! that only learn the payload layout at runtime (the command line client,
//! log dumps) describe it with a [`Shape`] instead and move data through
//! [`Value`]. The set of shapes is closed: anything outside it is rejected
//! with [`CodecError::UnsupportedType`] rather than guessed at.

use crate::codec::{Encode, PayloadReader, PayloadWriter, Vec2};
use crate::error::{CodecError, Result};
use serde_json::{Map as JsonMap, Number, Value as Json};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    String,
    /// Two bare `f32`
    Vec2,
    /// Enumeration carried as `i32`
    Enum,
    List(Box<Shape>),
    Map(Box<Shape>, Box<Shape>),
    Tuple(Vec<Shape>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Vec2(f32, f32),
    Enum(i32),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Tuple(Vec<Value>),
}

impl FromStr for Shape {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parser = ShapeParser { src: s, pos: 0 };
        let shape = parser.parse()?;
        parser.skip_whitespace();
        if parser.pos != s.len() {
            return Err(parser.syntax_error("trailing input"));
        }
        Ok(shape)
    }
}

struct ShapeParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> ShapeParser<'a> {
    fn skip_whitespace(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn syntax_error(&self, what: &str) -> CodecError {
        CodecError::InvalidValue(format!("{} at offset {} in shape '{}'", what, self.pos, self.src))
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_whitespace();
        if self.src[self.pos..].starts_with(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> &'a str {
        self.skip_whitespace();
        let rest = &self.src[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn arguments(&mut self) -> Result<Vec<Shape>> {
        if !self.eat('<') {
            return Err(self.syntax_error("expected '<'"));
        }
        let mut args = vec![self.parse()?];
        while self.eat(',') {
            args.push(self.parse()?);
        }
        if !self.eat('>') {
            return Err(self.syntax_error("expected '>'"));
        }
        Ok(args)
    }

    fn parse(&mut self) -> Result<Shape> {
        let name = self.ident();
        let shape = match name.to_ascii_lowercase().as_str() {
            "bool" => Shape::Bool,
            "u8" | "byte" => Shape::U8,
            "i8" | "sbyte" => Shape::I8,
            "u16" | "ushort" => Shape::U16,
            "i16" | "short" => Shape::I16,
            "u32" | "uint" => Shape::U32,
            "i32" | "int" => Shape::I32,
            "u64" | "ulong" => Shape::U64,
            "i64" | "long" => Shape::I64,
            "f32" | "float" => Shape::F32,
            "f64" | "double" => Shape::F64,
            "string" => Shape::String,
            "vec2" => Shape::Vec2,
            "enum" => Shape::Enum,
            "list" => {
                let mut args = self.arguments()?;
                if args.len() != 1 {
                    return Err(self.syntax_error("list takes one type argument"));
                }
                Shape::List(Box::new(args.remove(0)))
            }
            "map" => {
                let mut args = self.arguments()?;
                if args.len() != 2 {
                    return Err(self.syntax_error("map takes two type arguments"));
                }
                let value = args.remove(1);
                let key = args.remove(0);
                Shape::Map(Box::new(key), Box::new(value))
            }
            "tuple" => Shape::Tuple(self.arguments()?),
            "" => return Err(self.syntax_error("expected a type name")),
            _ => return Err(CodecError::UnsupportedType(name.to_string())),
        };
        Ok(shape)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Bool => write!(f, "bool"),
            Shape::U8 => write!(f, "u8"),
            Shape::I8 => write!(f, "i8"),
            Shape::U16 => write!(f, "u16"),
            Shape::I16 => write!(f, "i16"),
            Shape::U32 => write!(f, "u32"),
            Shape::I32 => write!(f, "i32"),
            Shape::U64 => write!(f, "u64"),
            Shape::I64 => write!(f, "i64"),
            Shape::F32 => write!(f, "f32"),
            Shape::F64 => write!(f, "f64"),
            Shape::String => write!(f, "string"),
            Shape::Vec2 => write!(f, "vec2"),
            Shape::Enum => write!(f, "enum"),
            Shape::List(item) => write!(f, "list<{}>", item),
            Shape::Map(key, value) => write!(f, "map<{},{}>", key, value),
            Shape::Tuple(items) => {
                write!(f, "tuple<")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ">")
            }
        }
    }
}

impl Value {
    /// Read one value of the given shape
    pub fn decode(reader: &mut PayloadReader<'_>, shape: &Shape) -> Result<Value> {
        let value = match shape {
            Shape::Bool => Value::Bool(reader.read_bool()?),
            Shape::U8 => Value::U8(reader.read_u8()?),
            Shape::I8 => Value::I8(reader.read_i8()?),
            Shape::U16 => Value::U16(reader.read_u16()?),
            Shape::I16 => Value::I16(reader.read_i16()?),
            Shape::U32 => Value::U32(reader.read_u32()?),
            Shape::I32 => Value::I32(reader.read_i32()?),
            Shape::U64 => Value::U64(reader.read_u64()?),
            Shape::I64 => Value::I64(reader.read_i64()?),
            Shape::F32 => Value::F32(reader.read_f32()?),
            Shape::F64 => Value::F64(reader.read_f64()?),
            Shape::String => Value::String(reader.read_string()?),
            Shape::Vec2 => {
                let Vec2(x, y) = reader.read()?;
                Value::Vec2(x, y)
            }
            Shape::Enum => Value::Enum(reader.read_i32()?),
            Shape::List(item) => {
                let count = reader.read_len()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Value::decode(reader, item)?);
                }
                Value::List(items)
            }
            Shape::Map(key, value) => {
                let count = reader.read_len()?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let k = Value::decode(reader, key)?;
                    let v = Value::decode(reader, value)?;
                    entries.push((k, v));
                }
                Value::Map(entries)
            }
            Shape::Tuple(items) => {
                let actual = reader.read_7bit_int()?;
                if actual as usize != items.len() || actual < 0 {
                    return Err(CodecError::ArityMismatch {
                        expected: items.len(),
                        actual,
                    });
                }
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(Value::decode(reader, item)?);
                }
                Value::Tuple(values)
            }
        };
        Ok(value)
    }

    /// Decode a whole payload, rejecting trailing bytes
    pub fn decode_payload(bytes: &[u8], shape: &Shape) -> Result<Value> {
        let mut reader = PayloadReader::new(bytes);
        let value = Value::decode(&mut reader, shape)?;
        if !reader.is_empty() {
            return Err(CodecError::InvalidValue(format!(
                "{} trailing bytes after {}",
                reader.remaining(),
                shape
            )));
        }
        Ok(value)
    }

    /// Build a value of the given shape from JSON.
    ///
    /// Numbers must fit the target width. `vec2` and tuples take arrays,
    /// maps take either an object or an array of `[key, value]` pairs.
    pub fn from_json(shape: &Shape, json: &Json) -> Result<Value> {
        let mismatch = || CodecError::InvalidValue(format!("expected {}, got {}", shape, json));

        let value = match shape {
            Shape::Bool => Value::Bool(json.as_bool().ok_or_else(mismatch)?),
            Shape::U8 => Value::U8(unsigned(json).and_then(|v| u8::try_from(v).ok()).ok_or_else(mismatch)?),
            Shape::U16 => Value::U16(unsigned(json).and_then(|v| u16::try_from(v).ok()).ok_or_else(mismatch)?),
            Shape::U32 => Value::U32(unsigned(json).and_then(|v| u32::try_from(v).ok()).ok_or_else(mismatch)?),
            Shape::U64 => Value::U64(unsigned(json).ok_or_else(mismatch)?),
            Shape::I8 => Value::I8(signed(json).and_then(|v| i8::try_from(v).ok()).ok_or_else(mismatch)?),
            Shape::I16 => Value::I16(signed(json).and_then(|v| i16::try_from(v).ok()).ok_or_else(mismatch)?),
            Shape::I32 => Value::I32(signed(json).and_then(|v| i32::try_from(v).ok()).ok_or_else(mismatch)?),
            Shape::I64 => Value::I64(signed(json).ok_or_else(mismatch)?),
            Shape::Enum => Value::Enum(signed(json).and_then(|v| i32::try_from(v).ok()).ok_or_else(mismatch)?),
            Shape::F32 => Value::F32(json.as_f64().ok_or_else(mismatch)? as f32),
            Shape::F64 => Value::F64(json.as_f64().ok_or_else(mismatch)?),
            Shape::String => Value::String(json.as_str().ok_or_else(mismatch)?.to_string()),
            Shape::Vec2 => match json.as_array().map(Vec::as_slice) {
                Some([x, y]) => Value::Vec2(
                    x.as_f64().ok_or_else(mismatch)? as f32,
                    y.as_f64().ok_or_else(mismatch)? as f32,
                ),
                _ => return Err(mismatch()),
            },
            Shape::List(item) => {
                let items = json.as_array().ok_or_else(mismatch)?;
                Value::List(
                    items
                        .iter()
                        .map(|entry| Value::from_json(item, entry))
                        .collect::<Result<_>>()?,
                )
            }
            Shape::Map(key, value) => match json {
                Json::Object(object) => {
                    let mut entries = Vec::with_capacity(object.len());
                    for (k, v) in object {
                        entries.push((map_key_from_json(key, k)?, Value::from_json(value, v)?));
                    }
                    Value::Map(entries)
                }
                Json::Array(pairs) => {
                    let mut entries = Vec::with_capacity(pairs.len());
                    for pair in pairs {
                        match pair.as_array().map(Vec::as_slice) {
                            Some([k, v]) => {
                                entries.push((Value::from_json(key, k)?, Value::from_json(value, v)?))
                            }
                            _ => return Err(mismatch()),
                        }
                    }
                    Value::Map(entries)
                }
                _ => return Err(mismatch()),
            },
            Shape::Tuple(items) => {
                let array = json.as_array().ok_or_else(mismatch)?;
                if array.len() != items.len() {
                    return Err(mismatch());
                }
                Value::Tuple(
                    items
                        .iter()
                        .zip(array)
                        .map(|(item, entry)| Value::from_json(item, entry))
                        .collect::<Result<_>>()?,
                )
            }
        };
        Ok(value)
    }

    /// Render as JSON. Maps with string keys become objects, other maps
    /// become arrays of `[key, value]` pairs. Non-finite floats become null.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Bool(v) => Json::Bool(*v),
            Value::U8(v) => Json::from(*v),
            Value::I8(v) => Json::from(*v),
            Value::U16(v) => Json::from(*v),
            Value::I16(v) => Json::from(*v),
            Value::U32(v) => Json::from(*v),
            Value::I32(v) => Json::from(*v),
            Value::U64(v) => Json::from(*v),
            Value::I64(v) => Json::from(*v),
            Value::Enum(v) => Json::from(*v),
            Value::F32(v) => float_json(*v as f64),
            Value::F64(v) => float_json(*v),
            Value::String(v) => Json::String(v.clone()),
            Value::Vec2(x, y) => Json::Array(vec![float_json(*x as f64), float_json(*y as f64)]),
            Value::List(items) | Value::Tuple(items) => {
                Json::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => {
                if entries.iter().all(|(k, _)| matches!(k, Value::String(_))) {
                    let mut object = JsonMap::new();
                    for (k, v) in entries {
                        if let Value::String(key) = k {
                            object.insert(key.clone(), v.to_json());
                        }
                    }
                    Json::Object(object)
                } else {
                    Json::Array(
                        entries
                            .iter()
                            .map(|(k, v)| Json::Array(vec![k.to_json(), v.to_json()]))
                            .collect(),
                    )
                }
            }
        }
    }
}

fn unsigned(json: &Json) -> Option<u64> {
    json.as_u64()
}

fn signed(json: &Json) -> Option<i64> {
    json.as_i64()
}

fn float_json(value: f64) -> Json {
    Number::from_f64(value).map(Json::Number).unwrap_or(Json::Null)
}

/// JSON object keys are always strings; numeric key shapes parse them back
fn map_key_from_json(shape: &Shape, key: &str) -> Result<Value> {
    match shape {
        Shape::String => Ok(Value::String(key.to_string())),
        _ => {
            let parsed: Json = serde_json::from_str(key).map_err(|_| {
                CodecError::InvalidValue(format!("map key '{}' is not a {}", key, shape))
            })?;
            Value::from_json(shape, &parsed)
        }
    }
}

impl Encode for Value {
    fn encode(&self, writer: &mut PayloadWriter) {
        match self {
            Value::Bool(v) => writer.write_bool(*v),
            Value::U8(v) => writer.write_u8(*v),
            Value::I8(v) => writer.write_i8(*v),
            Value::U16(v) => writer.write_u16(*v),
            Value::I16(v) => writer.write_i16(*v),
            Value::U32(v) => writer.write_u32(*v),
            Value::I32(v) => writer.write_i32(*v),
            Value::U64(v) => writer.write_u64(*v),
            Value::I64(v) => writer.write_i64(*v),
            Value::F32(v) => writer.write_f32(*v),
            Value::F64(v) => writer.write_f64(*v),
            Value::String(v) => writer.write_str(v),
            Value::Vec2(x, y) => {
                writer.write(&Vec2(*x, *y));
            }
            Value::Enum(v) => writer.write_i32(*v),
            Value::List(items) => {
                writer.write_len(items.len());
                for item in items {
                    item.encode(writer);
                }
            }
            Value::Map(entries) => {
                writer.write_len(entries.len());
                for (k, v) in entries {
                    k.encode(writer);
                    v.encode(writer);
                }
            }
            Value::Tuple(items) => {
                writer.write_len(items.len());
                for item in items {
                    item.encode(writer);
                }
            }
        }
    }
}
