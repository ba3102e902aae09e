use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use serde::ser::{self, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::KeyDerivationError;

/// An opaque identifier for a producer call, derived from its full argument list.
///
/// Two argument lists that serialize to structurally equal values derive the same key.
/// The key is a SHA-256 digest over a canonical JSON rendering of the arguments, which
/// is kept around as human readable [`metadata`](Self::metadata).
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Derives the [`CacheKey`] for the given call arguments.
    ///
    /// Calls with multiple arguments pass them as a tuple, which serializes as an
    /// ordered sequence: `("a", "b")` and `("b", "a")` derive different keys. Maps are
    /// rendered with sorted keys, so their iteration order does not matter.
    ///
    /// # Errors
    ///
    /// Fails with [`KeyDerivationError`] if the arguments cannot be serialized, for
    /// example a map with non-string keys. Non-finite floats are rejected as well,
    /// JSON would render `NaN` and both infinities as `null`.
    pub fn from_args<A>(args: &A) -> Result<Self, KeyDerivationError>
    where
        A: Serialize + ?Sized,
    {
        args.serialize(FiniteFloats)?;
        let value = serde_json::to_value(args)?;
        let mut builder = CacheKeyBuilder {
            metadata: String::new(),
        };
        // Writing into a `String` cannot fail.
        let _ = builder.write_value(&value);
        Ok(builder.build())
    }

    /// Returns the canonical rendering of the arguments this key was derived from.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    #[cfg(test)]
    pub(crate) fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder {
            metadata: key.into(),
        }
        .build()
    }
}

/// Accumulates the stable input that is hashed into a [`CacheKey`].
struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes `value` as compact JSON with object keys in sorted order.
    ///
    /// The order of object keys must not depend on whether `serde_json` preserves
    /// insertion order, otherwise equal maps could derive different keys.
    fn write_value(&mut self, value: &Value) -> fmt::Result {
        match value {
            Value::Array(items) => {
                self.write_char('[')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.write_char(',')?;
                    }
                    self.write_value(item)?;
                }
                self.write_char(']')
            }
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

                self.write_char('{')?;
                for (i, (key, item)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        self.write_char(',')?;
                    }
                    write!(self, "{}:", Value::from(key.as_str()))?;
                    self.write_value(item)?;
                }
                self.write_char('}')
            }
            scalar => write!(self, "{scalar}"),
        }
    }

    fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata).into();

        CacheKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// A serializer that only checks that all floats in a value are finite.
struct FiniteFloats;

impl FiniteFloats {
    fn check(v: f64) -> Result<(), serde_json::Error> {
        if v.is_finite() {
            Ok(())
        } else {
            Err(ser::Error::custom(format_args!(
                "non-finite float {v} is not a valid key argument"
            )))
        }
    }
}

impl Serializer for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i8(self, _: i8) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i16(self, _: i16) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i32(self, _: i32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i64(self, _: i64) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i128(self, _: i128) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u8(self, _: u8) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u16(self, _: u16) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u32(self, _: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u64(self, _: u64) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u128(self, _: u128) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_f32(self, v: f32) -> Result<(), Self::Error> {
        Self::check(v.into())
    }

    fn serialize_f64(self, v: f64) -> Result<(), Self::Error> {
        Self::check(v)
    }

    fn serialize_char(self, _: char) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_str(self, _: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_bytes(self, _: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), Self::Error> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant, Self::Error> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, Self::Error> {
        Ok(self)
    }

    fn serialize_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStruct, Self::Error> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant, Self::Error> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Self::Error> {
        key.serialize(FiniteFloats)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}
