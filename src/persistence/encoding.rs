//! Per-type encoders for big-map keys and values.
//!
//! Every key encoding is order-preserving, so a `TREEMAP` stored on disk
//! is walked in key order straight from the B-tree. Common scalars get
//! fixed-width encodings and `String` is stored as raw UTF-8, whose byte
//! order matches `Ord`. Other key types use the escaped form in
//! [`ordered`](super::ordered). Values that are not scalars use postcard,
//! which is compact but unordered.
//!
//! | type                     | width | key encoding                      | value encoding |
//! |--------------------------|-------|-----------------------------------|----------------|
//! | `u8 u16 u32 u64 usize`   | fixed | big-endian                        | same           |
//! | `i8 i16 i32 i64`         | fixed | big-endian, sign bit flipped      | same           |
//! | `f32 f64`                | fixed | IEEE bits, total-order transform  | same           |
//! | `bool`                   | 1     | `0` / `1`                         | same           |
//! | `String`                 | var   | UTF-8                             | same           |
//! | anything else            | var   | ordered                           | postcard       |

use crate::error::{Result, StorageError};
use crate::persistence::ordered;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

/// Converts values of one type to and from their stored bytes.
pub(crate) trait Encoder<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
    fn name(&self) -> &'static str;
}

/// Pick the encoder for values of type `T`.
pub(crate) fn encoder_for<T>() -> Arc<dyn Encoder<T>>
where
    T: Serialize + DeserializeOwned + 'static,
{
    scalar_encoder::<T>().unwrap_or_else(|| Arc::new(Generic))
}

/// Pick the encoder for keys of type `T`; byte order always follows `Ord`.
pub(crate) fn key_encoder_for<T>() -> Arc<dyn Encoder<T>>
where
    T: Serialize + DeserializeOwned + 'static,
{
    scalar_encoder::<T>().unwrap_or_else(|| Arc::new(Ordered))
}

fn scalar_encoder<T: 'static>() -> Option<Arc<dyn Encoder<T>>> {
    let id = TypeId::of::<T>();
    macro_rules! fixed {
        ($($t:ty),*) => {
            $(
                if id == TypeId::of::<$t>() {
                    return Some(Arc::new(FixedWidth::<$t>::new()));
                }
            )*
        };
    }
    fixed!(u8, u16, u32, u64, usize, i8, i16, i32, i64, f32, f64, bool);
    if id == TypeId::of::<String>() {
        return Some(Arc::new(Utf8));
    }
    None
}

/// Scalars with a fixed-width, order-preserving byte form.
pub(crate) trait Sortable: Copy + Send + Sync + 'static {
    const NAME: &'static str;
    fn to_sortable(self) -> Vec<u8>;
    fn from_sortable(bytes: &[u8]) -> Option<Self>;
}

macro_rules! sortable_unsigned {
    ($($t:ty),*) => {
        $(
            impl Sortable for $t {
                const NAME: &'static str = stringify!($t);
                fn to_sortable(self) -> Vec<u8> {
                    self.to_be_bytes().to_vec()
                }
                fn from_sortable(bytes: &[u8]) -> Option<Self> {
                    Some(<$t>::from_be_bytes(bytes.try_into().ok()?))
                }
            }
        )*
    };
}

macro_rules! sortable_signed {
    ($($t:ty => $u:ty),*) => {
        $(
            impl Sortable for $t {
                const NAME: &'static str = stringify!($t);
                fn to_sortable(self) -> Vec<u8> {
                    ((self as $u) ^ (1 << (<$u>::BITS - 1))).to_be_bytes().to_vec()
                }
                fn from_sortable(bytes: &[u8]) -> Option<Self> {
                    let raw = <$u>::from_be_bytes(bytes.try_into().ok()?);
                    Some((raw ^ (1 << (<$u>::BITS - 1))) as $t)
                }
            }
        )*
    };
}

macro_rules! sortable_float {
    ($($t:ty => $u:ty),*) => {
        $(
            impl Sortable for $t {
                const NAME: &'static str = stringify!($t);
                fn to_sortable(self) -> Vec<u8> {
                    let bits = self.to_bits();
                    let sign = 1 << (<$u>::BITS - 1);
                    let ordered = if bits & sign != 0 { !bits } else { bits | sign };
                    ordered.to_be_bytes().to_vec()
                }
                fn from_sortable(bytes: &[u8]) -> Option<Self> {
                    let ordered = <$u>::from_be_bytes(bytes.try_into().ok()?);
                    let sign = 1 << (<$u>::BITS - 1);
                    let bits = if ordered & sign != 0 { ordered & !sign } else { !ordered };
                    Some(<$t>::from_bits(bits))
                }
            }
        )*
    };
}

sortable_unsigned!(u8, u16, u32, u64);
sortable_signed!(i8 => u8, i16 => u16, i32 => u32, i64 => u64);
sortable_float!(f32 => u32, f64 => u64);

// usize is stored as u64 so files move between 32- and 64-bit hosts.
impl Sortable for usize {
    const NAME: &'static str = "usize";
    fn to_sortable(self) -> Vec<u8> {
        (self as u64).to_be_bytes().to_vec()
    }
    fn from_sortable(bytes: &[u8]) -> Option<Self> {
        usize::try_from(u64::from_be_bytes(bytes.try_into().ok()?)).ok()
    }
}

impl Sortable for bool {
    const NAME: &'static str = "bool";
    fn to_sortable(self) -> Vec<u8> {
        vec![self as u8]
    }
    fn from_sortable(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [0] => Some(false),
            [1] => Some(true),
            _ => None,
        }
    }
}

pub(crate) struct FixedWidth<P> {
    _scalar: PhantomData<fn() -> P>,
}

impl<P> FixedWidth<P> {
    fn new() -> Self {
        Self {
            _scalar: PhantomData,
        }
    }
}

impl<T: 'static, P: Sortable> Encoder<T> for FixedWidth<P> {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        let scalar = (value as &dyn Any)
            .downcast_ref::<P>()
            .ok_or_else(|| StorageError::type_mismatch(P::NAME, type_name::<T>()))?;
        Ok(scalar.to_sortable())
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        let scalar = P::from_sortable(bytes).ok_or_else(|| {
            StorageError::Deserialization(format!(
                "{} bytes are not a valid {}",
                bytes.len(),
                P::NAME
            ))
        })?;
        let boxed: Box<dyn Any> = Box::new(scalar);
        boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| StorageError::type_mismatch(type_name::<T>(), P::NAME))
    }

    fn name(&self) -> &'static str {
        P::NAME
    }
}

pub(crate) struct Utf8;

impl<T: 'static> Encoder<T> for Utf8 {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        let s = (value as &dyn Any)
            .downcast_ref::<String>()
            .ok_or_else(|| StorageError::type_mismatch("String", type_name::<T>()))?;
        Ok(s.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        let s = String::from_utf8(bytes.to_vec())
            .map_err(|e| StorageError::Deserialization(format!("invalid UTF-8 string: {e}")))?;
        let boxed: Box<dyn Any> = Box::new(s);
        boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| StorageError::type_mismatch(type_name::<T>(), "String"))
    }

    fn name(&self) -> &'static str {
        "utf8"
    }
}

pub(crate) struct Generic;

impl<T: Serialize + DeserializeOwned + 'static> Encoder<T> for Generic {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        postcard::from_bytes(bytes).map_err(|e| {
            StorageError::Deserialization(format!("{}: {e}", type_name::<T>()))
        })
    }

    fn name(&self) -> &'static str {
        "postcard"
    }
}

pub(crate) struct Ordered;

impl<T: Serialize + DeserializeOwned + 'static> Encoder<T> for Ordered {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        ordered::to_bytes(value).map_err(|e| {
            StorageError::Serialization(format!("key of type {}: {e}", type_name::<T>()))
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        ordered::from_bytes(bytes).map_err(|e| {
            StorageError::Deserialization(format!("key of type {}: {e}", type_name::<T>()))
        })
    }

    fn name(&self) -> &'static str {
        "ordered"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T>(value: T) -> T
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let enc = encoder_for::<T>();
        let bytes = enc.encode(&value).unwrap();
        enc.decode(&bytes).unwrap()
    }

    #[test]
    fn picks_specialized_encoders() {
        assert_eq!(encoder_for::<u64>().name(), "u64");
        assert_eq!(encoder_for::<i32>().name(), "i32");
        assert_eq!(encoder_for::<f64>().name(), "f64");
        assert_eq!(encoder_for::<usize>().name(), "usize");
        assert_eq!(encoder_for::<String>().name(), "utf8");
        assert_eq!(encoder_for::<Vec<u8>>().name(), "postcard");
        assert_eq!(encoder_for::<(u32, String)>().name(), "postcard");
        assert_eq!(key_encoder_for::<u64>().name(), "u64");
        assert_eq!(key_encoder_for::<String>().name(), "utf8");
        assert_eq!(key_encoder_for::<(u32, String)>().name(), "ordered");
    }

    #[test]
    fn fixed_width_sizes() {
        assert_eq!(encoder_for::<u16>().encode(&7).unwrap().len(), 2);
        assert_eq!(encoder_for::<i64>().encode(&-7).unwrap().len(), 8);
        assert_eq!(encoder_for::<usize>().encode(&7).unwrap().len(), 8);
        assert_eq!(encoder_for::<bool>().encode(&true).unwrap(), vec![1]);
    }

    #[test]
    fn scalars_survive() {
        assert_eq!(roundtrip(i64::MIN), i64::MIN);
        assert_eq!(roundtrip(-3i8), -3);
        assert_eq!(roundtrip(u32::MAX), u32::MAX);
        assert_eq!(roundtrip(-0.5f64), -0.5);
        assert_eq!(roundtrip(f32::INFINITY), f32::INFINITY);
        assert_eq!(roundtrip("héllo".to_string()), "héllo");
        assert_eq!(roundtrip(vec![(1u8, 'x')]), vec![(1u8, 'x')]);
    }

    #[test]
    fn signed_order_is_preserved() {
        let enc = encoder_for::<i32>();
        let values = [i32::MIN, -100, -1, 0, 1, 100, i32::MAX];
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| enc.encode(v).unwrap()).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn float_order_is_preserved() {
        let enc = encoder_for::<f64>();
        let values = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-300, 7.0, f64::INFINITY];
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| enc.encode(v).unwrap()).collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn composite_key_order_is_preserved() {
        let enc = key_encoder_for::<(String, String)>();
        let values = [
            ("neg".to_string(), "awful".to_string()),
            ("neg".to_string(), "bad".to_string()),
            ("negative".to_string(), "".to_string()),
            ("pos".to_string(), "great".to_string()),
        ];
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| enc.encode(v).unwrap()).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        assert_eq!(enc.decode(&encoded[2]).unwrap(), values[2]);
    }

    #[test]
    fn wrong_width_is_rejected() {
        let enc = encoder_for::<u32>();
        assert!(matches!(
            enc.decode(&[1, 2, 3]),
            Err(StorageError::Deserialization(_))
        ));
        assert!(encoder_for::<bool>().decode(&[2]).is_err());
    }
}
