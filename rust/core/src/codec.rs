//! Payload codec for message bodies
//!
//! Flat little-endian encoding with no schema or versioning. Sender and
//! receiver agree on the shape of each payload through its message kind.
//!
//! Layout rules:
//! - Fixed-width primitives: little-endian, `bool` as one byte (0 or 1)
//! - Strings: 7-bit encoded UTF-8 byte length, then the bytes
//! - Enumerations: underlying value as a little-endian `i32`
//! - [`Vec2`]: two `f32`, no prefix
//! - Sequences and maps: 7-bit encoded count, then elements (or key/value pairs)
//! - Tuples: 7-bit encoded arity, then the elements in order

use crate::error::{CodecError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Maximum number of bytes in a 7-bit encoded 32-bit integer
pub const MAX_7BIT_INT_BYTES: usize = 5;

/// Two-dimensional vector, written as its two components without an arity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec2(pub f32, pub f32);

/// Types that can be written into a payload
pub trait Encode {
    fn encode(&self, writer: &mut PayloadWriter);
}

/// Types that can be read back from a payload
pub trait Decode: Sized {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self>;
}

/// Enumerations carried as their underlying 32-bit value.
///
/// Usually implemented through [`wire_enum!`](crate::wire_enum).
pub trait WireEnum: Copy {
    /// Name used in error messages
    const NAME: &'static str;

    fn to_repr(self) -> i32;

    fn from_repr(value: i32) -> Option<Self>;
}

/// Carries any [`WireEnum`] through the codec traits, for enums declared
/// without [`wire_enum!`](crate::wire_enum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Enum<E>(pub E);

impl<E: WireEnum> Encode for Enum<E> {
    fn encode(&self, writer: &mut PayloadWriter) {
        writer.write_enum(self.0);
    }
}

impl<E: WireEnum> Decode for Enum<E> {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self> {
        reader.read_enum().map(Enum)
    }
}

/// Growable payload buffer
#[derive(Debug, Default, Clone)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Write any encodable value
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(self);
        self
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    /// Write a 32-bit integer seven bits at a time, low bits first.
    /// Negative values always take five bytes.
    pub fn write_7bit_int(&mut self, value: i32) {
        let mut remaining = value as u32;
        while remaining >= 0x80 {
            self.buf.put_u8((remaining as u8) | 0x80);
            remaining >>= 7;
        }
        self.buf.put_u8(remaining as u8);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_len(value.len());
        self.buf.put_slice(value.as_bytes());
    }

    pub fn write_enum<E: WireEnum>(&mut self, value: E) {
        self.write_i32(value.to_repr());
    }

    /// Append raw bytes with no prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write a count or length prefix
    pub fn write_len(&mut self, len: usize) {
        // Payloads live in a segment far smaller than i32::MAX
        self.write_7bit_int(len as i32);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over an encoded payload
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read any decodable value
    pub fn read<T: Decode>(&mut self) -> Result<T> {
        T::decode(self)
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(CodecError::UnexpectedEof { needed, remaining });
        }
        let bytes = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn read_7bit_int(&mut self) -> Result<i32> {
        let mut result: u32 = 0;
        for index in 0..MAX_7BIT_INT_BYTES - 1 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u32) << (index * 7);
            if byte & 0x80 == 0 {
                return Ok(result as i32);
            }
        }

        // Fifth byte may only carry the top four bits
        let byte = self.read_u8()?;
        if byte > 0x0F {
            return Err(CodecError::InvalidVarInt);
        }
        result |= (byte as u32) << 28;
        Ok(result as i32)
    }

    /// Read a count or length prefix.
    ///
    /// Every element takes at least one byte, so a count larger than what
    /// is left cannot be valid and is rejected before anything is allocated.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_7bit_int()?;
        if len < 0 {
            return Err(CodecError::InvalidLength(len));
        }
        let len = len as usize;
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        Ok(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_enum<E: WireEnum>(&mut self) -> Result<E> {
        let value = self.read_i32()?;
        E::from_repr(value).ok_or(CodecError::InvalidEnum {
            type_name: E::NAME,
            value,
        })
    }

    /// Borrow raw bytes with no prefix
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }
}

/// Encode a single value into a fresh buffer
pub fn encode<T: Encode + ?Sized>(value: &T) -> Bytes {
    let mut writer = PayloadWriter::new();
    value.encode(&mut writer);
    writer.freeze()
}

/// Decode a single value from the start of `bytes`
pub fn decode<T: Decode>(bytes: &[u8]) -> Result<T> {
    PayloadReader::new(bytes).read()
}

macro_rules! impl_primitive {
    ($($ty:ty => $write:ident, $read:ident;)+) => {
        $(
            impl Encode for $ty {
                fn encode(&self, writer: &mut PayloadWriter) {
                    writer.$write(*self);
                }
            }

            impl Decode for $ty {
                fn decode(reader: &mut PayloadReader<'_>) -> Result<Self> {
                    reader.$read()
                }
            }
        )+
    };
}

impl_primitive! {
    bool => write_bool, read_bool;
    u8 => write_u8, read_u8;
    i8 => write_i8, read_i8;
    u16 => write_u16, read_u16;
    i16 => write_i16, read_i16;
    u32 => write_u32, read_u32;
    i32 => write_i32, read_i32;
    u64 => write_u64, read_u64;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, writer: &mut PayloadWriter) {
        (**self).encode(writer);
    }
}

impl Encode for str {
    fn encode(&self, writer: &mut PayloadWriter) {
        writer.write_str(self);
    }
}

impl Encode for String {
    fn encode(&self, writer: &mut PayloadWriter) {
        writer.write_str(self);
    }
}

impl Decode for String {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self> {
        reader.read_string()
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, writer: &mut PayloadWriter) {
        writer.write_len(self.len());
        for item in self {
            item.encode(writer);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, writer: &mut PayloadWriter) {
        self.as_slice().encode(writer);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self> {
        let count = reader.read_len()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(reader)?);
        }
        Ok(items)
    }
}

impl<K: Encode, V: Encode, S> Encode for HashMap<K, V, S> {
    fn encode(&self, writer: &mut PayloadWriter) {
        writer.write_len(self.len());
        for (key, value) in self {
            key.encode(writer);
            value.encode(writer);
        }
    }
}

impl<K, V, S> Decode for HashMap<K, V, S>
where
    K: Decode + Eq + Hash,
    V: Decode,
    S: std::hash::BuildHasher + Default,
{
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self> {
        let count = reader.read_len()?;
        let mut map = HashMap::with_capacity_and_hasher(count, S::default());
        for _ in 0..count {
            let key = K::decode(reader)?;
            let value = V::decode(reader)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, writer: &mut PayloadWriter) {
        writer.write_len(self.len());
        for (key, value) in self {
            key.encode(writer);
            value.encode(writer);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self> {
        let count = reader.read_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = K::decode(reader)?;
            let value = V::decode(reader)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

macro_rules! impl_tuple {
    ($arity:expr; $($name:ident : $index:tt),+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            fn encode(&self, writer: &mut PayloadWriter) {
                writer.write_7bit_int($arity);
                $(self.$index.encode(writer);)+
            }
        }

        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(reader: &mut PayloadReader<'_>) -> Result<Self> {
                let actual = reader.read_7bit_int()?;
                if actual != $arity {
                    return Err(CodecError::ArityMismatch { expected: $arity, actual });
                }
                Ok(($($name::decode(reader)?,)+))
            }
        }
    };
}

impl Encode for Vec2 {
    fn encode(&self, writer: &mut PayloadWriter) {
        writer.write_f32(self.0);
        writer.write_f32(self.1);
    }
}

impl Decode for Vec2 {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self> {
        Ok(Vec2(reader.read_f32()?, reader.read_f32()?))
    }
}

impl_tuple!(2; A: 0, B: 1);
impl_tuple!(3; A: 0, B: 1, C: 2);
impl_tuple!(4; A: 0, B: 1, C: 2, D: 3);

/// Declare an enumeration carried on the wire as its `i32` value.
///
/// ```
/// studio_link_core::wire_enum! {
///     pub enum Hotkey {
///         Start = 0,
///         Pause = 1,
///     }
/// }
///
/// let bytes = studio_link_core::codec::encode(&Hotkey::Pause);
/// assert_eq!(bytes.as_ref(), &[1, 0, 0, 0]);
/// ```
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        $vis enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $crate::codec::WireEnum for $name {
            const NAME: &'static str = stringify!($name);

            fn to_repr(self) -> i32 {
                self as i32
            }

            fn from_repr(value: i32) -> ::std::option::Option<Self> {
                $(
                    if value == $value {
                        return ::std::option::Option::Some($name::$variant);
                    }
                )+
                ::std::option::Option::None
            }
        }

        impl $crate::codec::Encode for $name {
            fn encode(&self, writer: &mut $crate::codec::PayloadWriter) {
                writer.write_enum(*self);
            }
        }

        impl $crate::codec::Decode for $name {
            fn decode(reader: &mut $crate::codec::PayloadReader<'_>) -> $crate::error::Result<Self> {
                reader.read_enum()
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::wire_enum! {
        enum Setting {
            ShowHitboxes = 0,
            SimplifiedGraphics = 1,
            CenterCamera = 7,
        }
    }

    fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = encode(&value);
        let mut reader = PayloadReader::new(&bytes);
        let decoded: T = reader.read().unwrap();
        assert_eq!(decoded, value);
        assert!(reader.is_empty(), "trailing bytes after {:?}", value);
    }

    #[test]
    fn test_primitive_round_trips() {
        round_trip(true);
        round_trip(false);
        round_trip(0xABu8);
        round_trip(-5i8);
        round_trip(u16::MAX);
        round_trip(i16::MIN);
        round_trip(0xDEAD_BEEFu32);
        round_trip(-42i32);
        round_trip(u64::MAX);
        round_trip(i64::MIN);
        round_trip(1.5f32);
        round_trip(-0.25f64);
        round_trip("héllo wörld".to_string());
    }

    #[test]
    fn test_composite_round_trips() {
        round_trip(vec![1i32, -2, 3]);
        round_trip(Vec::<String>::new());
        round_trip(vec![vec![1u8, 2], vec![3]]);
        round_trip(Vec2(3.5, -1.25));
        round_trip((0.5f32, -8.0f32));
        round_trip((1i32, "two".to_string(), false));
        round_trip((1u8, 2u16, 3u32, 4u64));
        round_trip(vec![Setting::CenterCamera, Setting::ShowHitboxes]);

        let mut lines = HashMap::new();
        lines.insert(12i32, "1,R,J".to_string());
        lines.insert(40i32, "#Start".to_string());
        round_trip(lines);

        let mut bindings = BTreeMap::new();
        bindings.insert(0i32, vec![65i32, 66]);
        bindings.insert(3i32, vec![]);
        round_trip(bindings);
    }

    #[test]
    fn test_little_endian_layout() {
        assert_eq!(encode(&42i32).as_ref(), &[42, 0, 0, 0]);
        assert_eq!(encode(&0x0102u16).as_ref(), &[0x02, 0x01]);
        assert_eq!(encode(&true).as_ref(), &[1]);
    }

    #[test]
    fn test_7bit_int_encoding() {
        let cases: &[(i32, &[u8])] = &[
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (300, &[0xAC, 0x02]),
            (i32::MAX, &[0xFF, 0xFF, 0xFF, 0xFF, 0x07]),
            (-1, &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
        ];

        for (value, expected) in cases {
            let mut writer = PayloadWriter::new();
            writer.write_7bit_int(*value);
            assert_eq!(writer.as_slice(), *expected, "encoding {}", value);

            let mut reader = PayloadReader::new(expected);
            assert_eq!(reader.read_7bit_int().unwrap(), *value);
        }
    }

    #[test]
    fn test_string_prefix_is_byte_length() {
        let bytes = encode("ab");
        assert_eq!(bytes.as_ref(), &[2, b'a', b'b']);

        // "é" is two UTF-8 bytes
        let bytes = encode("é");
        assert_eq!(bytes[0], 2);
    }

    #[test]
    fn test_tuple_carries_arity() {
        let bytes = encode(&(7i32, true));
        assert_eq!(bytes.as_ref(), &[2, 7, 0, 0, 0, 1]);
    }

    #[test]
    fn test_vec2_is_two_bare_floats() {
        let bytes = encode(&Vec2(1.0, 2.0));
        assert_eq!(bytes.as_ref(), &[0, 0, 0x80, 0x3F, 0, 0, 0, 0x40]);
        assert_eq!(decode::<Vec2>(&bytes), Ok(Vec2(1.0, 2.0)));
        assert!(matches!(decode::<Vec2>(&bytes[..6]), Err(CodecError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_malformed_input() {
        let mut reader = PayloadReader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(reader.read_7bit_int(), Err(CodecError::InvalidVarInt));

        let mut reader = PayloadReader::new(&[1, 2]);
        assert_eq!(
            reader.read_i32(),
            Err(CodecError::UnexpectedEof { needed: 4, remaining: 2 })
        );

        assert_eq!(decode::<bool>(&[2]), Err(CodecError::InvalidBool(2)));
        assert_eq!(decode::<String>(&[2, 0xC3, 0x28]), Err(CodecError::InvalidUtf8));
        assert_eq!(
            decode::<Setting>(&[9, 0, 0, 0]),
            Err(CodecError::InvalidEnum { type_name: "Setting", value: 9 })
        );
        assert_eq!(
            decode::<(f32, f32)>(&encode(&(1.0f32, 2.0f32, 3.0f32))),
            Err(CodecError::ArityMismatch { expected: 2, actual: 3 })
        );
    }

    #[test]
    fn test_oversized_count_rejected_before_allocation() {
        let mut writer = PayloadWriter::new();
        writer.write_7bit_int(1_000_000);
        writer.write_u8(1);
        assert!(matches!(
            decode::<Vec<u8>>(writer.as_slice()),
            Err(CodecError::UnexpectedEof { .. })
        ));

        let mut writer = PayloadWriter::new();
        writer.write_7bit_int(-3);
        assert_eq!(decode::<Vec<u8>>(writer.as_slice()), Err(CodecError::InvalidLength(-3)));
    }

    #[test]
    fn test_reader_tracks_position() {
        let mut writer = PayloadWriter::new();
        writer.write(&7i32).write("abc").write(&true);

        let mut reader = PayloadReader::new(writer.as_slice());
        assert_eq!(reader.read::<i32>().unwrap(), 7);
        assert_eq!(reader.position(), 4);
        assert_eq!(reader.read::<String>().unwrap(), "abc");
        assert_eq!(reader.position(), 8);
        assert!(reader.read::<bool>().unwrap());
        assert!(reader.is_empty());
    }
}
