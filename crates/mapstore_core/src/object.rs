//! The static object model: the [`StoreObject`] trait and secondary key
//! definitions.
//!
//! Each persistent object type tags itself with a small integer
//! (`TYPE_TAG`) that selects its slot in the segment's index directory, and
//! declares its secondary orderings as a static table of extractors. Keys
//! are type-erased into [`IndexKey`] so that every ordering, whatever it is
//! keyed on, can live in the same index machinery.

use crate::types::ObjectId;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A type-erased, ordered secondary key value.
///
/// A given secondary ordering always produces the same variant, so the
/// derived cross-variant ordering is never observed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    /// Signed 64-bit key.
    Int(i64),
    /// Unsigned 64-bit key.
    Uint(u64),
    /// Signed 128-bit key.
    Big(i128),
    /// UTF-8 string key.
    Str(String),
    /// Raw byte key.
    Bytes(Vec<u8>),
    /// Lexicographic composite of several keys.
    Composite(Vec<IndexKey>),
}

impl From<i64> for IndexKey {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for IndexKey {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<i128> for IndexKey {
    fn from(v: i128) -> Self {
        Self::Big(v)
    }
}

impl From<&str> for IndexKey {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for IndexKey {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Declaration of one secondary ordering on an object type.
pub struct SecondaryKeyDef<T> {
    /// Name the ordering is looked up by.
    pub name: &'static str,
    /// Whether the ordering enforces uniqueness.
    pub unique: bool,
    /// Extracts the key from an object.
    pub extract: fn(&T) -> IndexKey,
}

impl<T> Clone for SecondaryKeyDef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SecondaryKeyDef<T> {}

/// A persistent object type stored in a typed index.
///
/// Implementors carry their id as a field; the index assigns it at `create`
/// time and it is immutable afterwards. All other fields change only
/// through `modify`.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Book {
///     id: ObjectId,
///     a: i64,
///     b: i64,
/// }
///
/// impl StoreObject for Book {
///     const TYPE_TAG: u16 = 1;
///     const TYPE_NAME: &'static str = "book";
///
///     fn object_id(&self) -> ObjectId {
///         self.id
///     }
///
///     fn assign_id(&mut self, id: ObjectId) {
///         self.id = id;
///     }
///
///     fn secondary_keys() -> &'static [SecondaryKeyDef<Self>] {
///         const KEYS: &[SecondaryKeyDef<Book>] = &[SecondaryKeyDef {
///             name: "by_a",
///             unique: false,
///             extract: |book| IndexKey::Int(book.a),
///         }];
///         KEYS
///     }
/// }
/// ```
pub trait StoreObject:
    Default + Clone + Serialize + DeserializeOwned + Send + 'static
{
    /// Distinct small integer selecting this type's slot in the segment
    /// directory. Must be unique across all registered types of a store.
    const TYPE_TAG: u16;

    /// Human-readable type name, used in errors.
    const TYPE_NAME: &'static str;

    /// Returns the object's id.
    fn object_id(&self) -> ObjectId;

    /// Assigns the object's id. Called exactly once, by `create`.
    fn assign_id(&mut self, id: ObjectId);

    /// The secondary orderings of this type. Empty by default.
    fn secondary_keys() -> &'static [SecondaryKeyDef<Self>] {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_key_ordering_within_variant() {
        assert!(IndexKey::Int(-5) < IndexKey::Int(3));
        assert!(IndexKey::Str("alpha".into()) < IndexKey::Str("beta".into()));
        assert!(
            IndexKey::Composite(vec![IndexKey::Int(1), IndexKey::Int(2)])
                < IndexKey::Composite(vec![IndexKey::Int(1), IndexKey::Int(3)])
        );
    }

    #[test]
    fn index_key_from_conversions() {
        assert_eq!(IndexKey::from(3i64), IndexKey::Int(3));
        assert_eq!(IndexKey::from("x"), IndexKey::Str("x".into()));
        assert_eq!(IndexKey::from(vec![1u8]), IndexKey::Bytes(vec![1]));
    }
}
