//! Order-preserving binary form for composite big-map keys.
//!
//! Comparing two encodings byte by byte gives the same answer as comparing
//! the values with their derived `Ord`, so a disk `TREEMAP` keyed by tuples,
//! structs, enums or sequences pages through `ORDER BY key` like a scalar
//! one.
//!
//! | shape                | encoding                                            |
//! |----------------------|-----------------------------------------------------|
//! | unsigned integers    | big-endian                                          |
//! | signed integers      | big-endian, sign bit flipped                        |
//! | floats               | IEEE bits, total-order transform                    |
//! | `bool`               | `0` / `1`                                           |
//! | `char`               | scalar value as big-endian `u32`                    |
//! | strings, bytes       | `0x00` written as `0x00 0xFF`, ended by `0x00 0x01` |
//! | `Option`             | `0` for `None`; `1` then the value                  |
//! | sequences, maps      | `1` before each element, `0` after the last         |
//! | enums                | variant index as big-endian `u32`, then the payload |
//! | structs, tuples      | fields in declaration order                         |
//!
//! Every encoding is self-delimiting, so a field never bleeds into the one
//! after it. The form is not self-describing: decoding needs the type.

use crate::persistence::encoding::Sortable;
use serde::de::{self, DeserializeOwned, DeserializeSeed, IntoDeserializer, Visitor};
use serde::ser::{self, Serialize};
use std::fmt;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;
const MORE: u8 = 1;
const END: u8 = 0;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub(crate) struct KeyError(String);

impl ser::Error for KeyError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        KeyError(msg.to_string())
    }
}

impl de::Error for KeyError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        KeyError(msg.to_string())
    }
}

type KeyResult<T> = std::result::Result<T, KeyError>;

pub(crate) fn to_bytes<T: Serialize + ?Sized>(value: &T) -> KeyResult<Vec<u8>> {
    let mut ser = KeySerializer { out: Vec::new() };
    value.serialize(&mut ser)?;
    Ok(ser.out)
}

pub(crate) fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> KeyResult<T> {
    let mut de = KeyDeserializer { input: bytes };
    let value = T::deserialize(&mut de)?;
    if !de.input.is_empty() {
        return Err(KeyError(format!("{} trailing bytes after key", de.input.len())));
    }
    Ok(value)
}

struct KeySerializer {
    out: Vec<u8>,
}

impl KeySerializer {
    fn scalar<P: Sortable>(&mut self, value: P) -> KeyResult<()> {
        self.out.extend_from_slice(&value.to_sortable());
        Ok(())
    }

    fn escaped(&mut self, bytes: &[u8]) -> KeyResult<()> {
        for &b in bytes {
            self.out.push(b);
            if b == ESCAPE {
                self.out.push(ESCAPED_ZERO);
            }
        }
        self.out.extend_from_slice(&[ESCAPE, TERMINATOR]);
        Ok(())
    }

    fn variant(&mut self, index: u32) {
        self.out.extend_from_slice(&index.to_be_bytes());
    }
}

macro_rules! serialize_scalars {
    ($($method:ident: $t:ty),*) => {
        $(
            fn $method(self, v: $t) -> KeyResult<()> {
                self.scalar(v)
            }
        )*
    };
}

impl<'a> ser::Serializer for &'a mut KeySerializer {
    type Ok = ();
    type Error = KeyError;
    type SerializeSeq = Elements<'a>;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Elements<'a>;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    serialize_scalars!(
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_f32: f32,
        serialize_f64: f64
    );

    fn serialize_char(self, v: char) -> KeyResult<()> {
        self.scalar(v as u32)
    }

    fn serialize_str(self, v: &str) -> KeyResult<()> {
        self.escaped(v.as_bytes())
    }

    fn serialize_bytes(self, v: &[u8]) -> KeyResult<()> {
        self.escaped(v)
    }

    fn serialize_none(self) -> KeyResult<()> {
        self.out.push(END);
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> KeyResult<()> {
        self.out.push(MORE);
        value.serialize(self)
    }

    fn serialize_unit(self) -> KeyResult<()> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> KeyResult<()> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
    ) -> KeyResult<()> {
        self.variant(variant_index);
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> KeyResult<()> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> KeyResult<()> {
        self.variant(variant_index);
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> KeyResult<Elements<'a>> {
        Ok(Elements { ser: self })
    }

    fn serialize_tuple(self, _len: usize) -> KeyResult<Self> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> KeyResult<Self> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> KeyResult<Self> {
        self.variant(variant_index);
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> KeyResult<Elements<'a>> {
        Ok(Elements { ser: self })
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> KeyResult<Self> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> KeyResult<Self> {
        self.variant(variant_index);
        Ok(self)
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

/// Variable-length collections: a marker before each element.
struct Elements<'a> {
    ser: &'a mut KeySerializer,
}

impl ser::SerializeSeq for Elements<'_> {
    type Ok = ();
    type Error = KeyError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> KeyResult<()> {
        self.ser.out.push(MORE);
        value.serialize(&mut *self.ser)
    }

    fn end(self) -> KeyResult<()> {
        self.ser.out.push(END);
        Ok(())
    }
}

impl ser::SerializeMap for Elements<'_> {
    type Ok = ();
    type Error = KeyError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> KeyResult<()> {
        self.ser.out.push(MORE);
        key.serialize(&mut *self.ser)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> KeyResult<()> {
        value.serialize(&mut *self.ser)
    }

    fn end(self) -> KeyResult<()> {
        self.ser.out.push(END);
        Ok(())
    }
}

// Fixed-length shapes are plain concatenation.
macro_rules! concatenated {
    ($($trait:ident :: $method:ident),*) => {
        $(
            impl ser::$trait for &mut KeySerializer {
                type Ok = ();
                type Error = KeyError;

                fn $method<T: ?Sized + Serialize>(&mut self, value: &T) -> KeyResult<()> {
                    value.serialize(&mut **self)
                }

                fn end(self) -> KeyResult<()> {
                    Ok(())
                }
            }
        )*
    };
}

concatenated!(
    SerializeTuple::serialize_element,
    SerializeTupleStruct::serialize_field,
    SerializeTupleVariant::serialize_field
);

impl ser::SerializeStruct for &mut KeySerializer {
    type Ok = ();
    type Error = KeyError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> KeyResult<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> KeyResult<()> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for &mut KeySerializer {
    type Ok = ();
    type Error = KeyError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> KeyResult<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> KeyResult<()> {
        Ok(())
    }
}

struct KeyDeserializer<'de> {
    input: &'de [u8],
}

impl<'de> KeyDeserializer<'de> {
    fn take(&mut self, n: usize) -> KeyResult<&'de [u8]> {
        if self.input.len() < n {
            return Err(KeyError(format!(
                "key truncated: wanted {n} bytes, {} left",
                self.input.len()
            )));
        }
        let (head, rest) = self.input.split_at(n);
        self.input = rest;
        Ok(head)
    }

    fn byte(&mut self) -> KeyResult<u8> {
        let bytes = self.take(1)?;
        Ok(bytes[0])
    }

    fn scalar<P: Sortable>(&mut self) -> KeyResult<P> {
        let bytes = self.take(std::mem::size_of::<P>())?;
        P::from_sortable(bytes).ok_or_else(|| KeyError(format!("invalid {} in key", P::NAME)))
    }

    /// `true` if another element follows.
    fn marker(&mut self) -> KeyResult<bool> {
        match self.byte()? {
            MORE => Ok(true),
            END => Ok(false),
            b => Err(KeyError(format!("invalid marker byte {b:#04x} in key"))),
        }
    }

    fn escaped(&mut self) -> KeyResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match self.byte()? {
                ESCAPE => match self.byte()? {
                    ESCAPED_ZERO => out.push(0),
                    TERMINATOR => return Ok(out),
                    b => return Err(KeyError(format!("invalid escape byte {b:#04x} in key"))),
                },
                b => out.push(b),
            }
        }
    }
}

macro_rules! deserialize_scalars {
    ($($method:ident => $visit:ident: $t:ty),*) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
                visitor.$visit(self.scalar::<$t>()?)
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for &mut KeyDeserializer<'de> {
    type Error = KeyError;

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> KeyResult<V::Value> {
        Err(KeyError("stored keys are not self-describing".into()))
    }

    deserialize_scalars!(
        deserialize_bool => visit_bool: bool,
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64
    );

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        let raw = self.scalar::<u32>()?;
        let c = char::from_u32(raw)
            .ok_or_else(|| KeyError(format!("{raw:#x} is not a char")))?;
        visitor.visit_char(c)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        self.deserialize_string(visitor)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        let s = String::from_utf8(self.escaped()?)
            .map_err(|e| KeyError(format!("invalid UTF-8 in key: {e}")))?;
        visitor.visit_string(s)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        self.deserialize_byte_buf(visitor)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        visitor.visit_byte_buf(self.escaped()?)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        if self.marker()? {
            visitor.visit_some(self)
        } else {
            visitor.visit_none()
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> KeyResult<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> KeyResult<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        visitor.visit_seq(Marked { de: self })
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> KeyResult<V::Value> {
        visitor.visit_seq(Counted { de: self, remaining: len })
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> KeyResult<V::Value> {
        visitor.visit_seq(Counted { de: self, remaining: len })
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        visitor.visit_map(Marked { de: self })
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> KeyResult<V::Value> {
        visitor.visit_seq(Counted {
            de: self,
            remaining: fields.len(),
        })
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> KeyResult<V::Value> {
        visitor.visit_enum(self)
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> KeyResult<V::Value> {
        self.deserialize_u32(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, _visitor: V) -> KeyResult<V::Value> {
        Err(KeyError("stored keys cannot skip values".into()))
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

/// Sequences and maps, ended by an `END` marker.
struct Marked<'a, 'de> {
    de: &'a mut KeyDeserializer<'de>,
}

impl<'de> de::SeqAccess<'de> for Marked<'_, 'de> {
    type Error = KeyError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> KeyResult<Option<T::Value>> {
        if !self.de.marker()? {
            return Ok(None);
        }
        seed.deserialize(&mut *self.de).map(Some)
    }
}

impl<'de> de::MapAccess<'de> for Marked<'_, 'de> {
    type Error = KeyError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> KeyResult<Option<K::Value>> {
        if !self.de.marker()? {
            return Ok(None);
        }
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> KeyResult<V::Value> {
        seed.deserialize(&mut *self.de)
    }
}

/// Tuples and structs, whose length the type knows.
struct Counted<'a, 'de> {
    de: &'a mut KeyDeserializer<'de>,
    remaining: usize,
}

impl<'de> de::SeqAccess<'de> for Counted<'_, 'de> {
    type Error = KeyError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> KeyResult<Option<T::Value>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

impl<'de> de::EnumAccess<'de> for &mut KeyDeserializer<'de> {
    type Error = KeyError;
    type Variant = Self;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> KeyResult<(V::Value, Self)> {
        let index = self.scalar::<u32>()?;
        let value = seed.deserialize(IntoDeserializer::<'de, KeyError>::into_deserializer(index))?;
        Ok((value, self))
    }
}

impl<'de> de::VariantAccess<'de> for &mut KeyDeserializer<'de> {
    type Error = KeyError;

    fn unit_variant(self) -> KeyResult<()> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> KeyResult<T::Value> {
        seed.deserialize(self)
    }

    fn tuple_variant<V: Visitor<'de>>(self, len: usize, visitor: V) -> KeyResult<V::Value> {
        visitor.visit_seq(Counted { de: self, remaining: len })
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> KeyResult<V::Value> {
        visitor.visit_seq(Counted {
            de: self,
            remaining: fields.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, Deserialize)]
    enum Feature {
        Bias,
        Token(String),
        Ngram { n: u8, text: String },
        Pair(i32, Option<char>),
    }

    fn assert_sorted_like_ord<T>(mut values: Vec<T>)
    where
        T: Serialize + DeserializeOwned + Ord + Clone + fmt::Debug,
    {
        values.sort();
        values.dedup();
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| to_bytes(v).unwrap()).collect();
        for (pair, bytes) in values.windows(2).zip(encoded.windows(2)) {
            assert!(bytes[0] < bytes[1], "{:?} vs {:?}", pair[0], pair[1]);
        }
        for (value, bytes) in values.iter().zip(&encoded) {
            assert_eq!(&from_bytes::<T>(bytes).unwrap(), value);
        }
    }

    #[test]
    fn strings_with_nul_and_prefixes() {
        assert_sorted_like_ord(vec![
            String::new(),
            "\0".to_string(),
            "\0\0".to_string(),
            "a".to_string(),
            "a\0".to_string(),
            "a\0b".to_string(),
            "ab".to_string(),
            "b".to_string(),
            "\u{ff}".to_string(),
        ]);
    }

    #[test]
    fn composite_shapes() {
        assert_sorted_like_ord(vec![
            ("neg".to_string(), "awful".to_string()),
            ("pos".to_string(), "great".to_string()),
            ("pos".to_string(), "".to_string()),
            ("po".to_string(), "s".to_string()),
        ]);
        assert_sorted_like_ord(vec![
            Feature::Pair(-3, None),
            Feature::Pair(-3, Some('a')),
            Feature::Pair(7, None),
            Feature::Ngram { n: 2, text: "ab".into() },
            Feature::Ngram { n: 1, text: "zz".into() },
            Feature::Token("x".into()),
            Feature::Bias,
        ]);
        assert_sorted_like_ord(vec![vec![], vec![0u16], vec![0, 0], vec![1], vec![0, 1]]);
        let maps: Vec<BTreeMap<u8, bool>> = vec![
            BTreeMap::new(),
            [(1, false)].into_iter().collect(),
            [(1, true)].into_iter().collect(),
            [(0, true), (5, false)].into_iter().collect(),
        ];
        assert_sorted_like_ord(maps);
    }

    #[test]
    fn corrupt_keys_are_rejected() {
        assert!(from_bytes::<(u32, String)>(&[0, 0, 0, 1, b'a']).is_err());
        assert!(from_bytes::<String>(&[b'a', 0x00, 0x07]).is_err());
        assert!(from_bytes::<Vec<u8>>(&[MORE, 3, 9]).is_err());
        assert!(from_bytes::<u16>(&[0, 1, 2]).is_err());
    }

    proptest! {
        #[test]
        fn byte_order_matches_ord(
            a in (any::<i16>(), ".{0,6}", prop::collection::vec(any::<u8>(), 0..4)),
            b in (any::<i16>(), ".{0,6}", prop::collection::vec(any::<u8>(), 0..4)),
        ) {
            let (ea, eb) = (to_bytes(&a).unwrap(), to_bytes(&b).unwrap());
            prop_assert_eq!(ea.cmp(&eb), a.cmp(&b));
            prop_assert_eq!(from_bytes::<(i16, String, Vec<u8>)>(&ea).unwrap(), a);
        }
    }
}
