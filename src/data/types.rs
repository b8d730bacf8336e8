//! Type identity and the predefined type table.
//!
//! Predefined IDs follow the exact ordering of `enum afb_typeids` in the
//! original `afb-type-predefined.h`: `None=0`, then Opaque, Bytearray,
//! Stringz, Json, Json_C, Bool, I8, U8, I16, U16, I32, U32, I64, U64, Float,
//! Double, UUID. User types are assigned starting at 18.

use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};

/// Numeric identifier of a registered [`Type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u16);

impl TypeId {
    pub const NONE: TypeId = TypeId(0);
    pub const OPAQUE: TypeId = TypeId(1);
    pub const BYTEARRAY: TypeId = TypeId(2);
    pub const STRINGZ: TypeId = TypeId(3);
    pub const JSON: TypeId = TypeId(4);
    pub const JSON_C: TypeId = TypeId(5);
    pub const BOOL: TypeId = TypeId(6);
    pub const I8: TypeId = TypeId(7);
    pub const U8: TypeId = TypeId(8);
    pub const I16: TypeId = TypeId(9);
    pub const U16: TypeId = TypeId(10);
    pub const I32: TypeId = TypeId(11);
    pub const U32: TypeId = TypeId(12);
    pub const I64: TypeId = TypeId(13);
    pub const U64: TypeId = TypeId(14);
    pub const FLOAT: TypeId = TypeId(15);
    pub const DOUBLE: TypeId = TypeId(16);
    pub const UUID: TypeId = TypeId(17);

    pub const LAST_PREDEFINED: u16 = 17;
    pub const FIRST_USER: u16 = 18;
}

/// A named type and its wire-streamability flag.
#[derive(Debug, Clone)]
pub struct Type {
    pub id: TypeId,
    pub name: String,
    pub streamable: bool,
}

/// Maps type names to ids and assigns fresh ids to user types.
///
/// Populated with the predefined table at construction; `register_type`
/// after that only ever hands out ids `>= FIRST_USER`.
#[derive(Debug, Default)]
pub struct TypeTable {
    by_name: HashMap<String, TypeId>,
    by_id: HashMap<TypeId, Type>,
    next_user_id: u16,
}

impl TypeTable {
    #[must_use]
    pub fn new() -> Self {
        let mut table = TypeTable {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_user_id: TypeId::FIRST_USER,
        };
        for (id, name, streamable) in PREDEFINED {
            table.insert_raw(*id, (*name).to_owned(), *streamable);
        }
        table
    }

    fn insert_raw(&mut self, id: TypeId, name: String, streamable: bool) {
        self.by_name.insert(name.clone(), id);
        self.by_id.insert(id, Type { id, name, streamable });
    }

    /// Registers a new user type. Fails with [`CoreError::Exists`] if the
    /// name is already taken, [`CoreError::Overflow`] if the 16-bit id space
    /// for user types is exhausted.
    pub fn register_type(&mut self, name: &str, streamable: bool) -> CoreResult<TypeId> {
        if self.by_name.contains_key(name) {
            return Err(CoreError::Exists);
        }
        if self.next_user_id == u16::MAX {
            return Err(CoreError::Overflow);
        }
        let id = TypeId(self.next_user_id);
        self.next_user_id += 1;
        self.insert_raw(id, name.to_owned(), streamable);
        Ok(id)
    }

    #[must_use]
    pub fn lookup_by_name(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn get(&self, id: TypeId) -> Option<&Type> {
        self.by_id.get(&id)
    }

    #[must_use]
    pub fn is_streamable(&self, id: TypeId) -> bool {
        self.by_id.get(&id).is_some_and(|t| t.streamable)
    }
}

const PREDEFINED: &[(TypeId, &str, bool)] = &[
    (TypeId::NONE, "#none", false),
    (TypeId::OPAQUE, "#opaque", false),
    (TypeId::BYTEARRAY, "#bytearray", true),
    (TypeId::STRINGZ, "#stringz", true),
    (TypeId::JSON, "#json", true),
    (TypeId::JSON_C, "#json_c", true),
    (TypeId::BOOL, "#bool", true),
    (TypeId::I8, "#i8", true),
    (TypeId::U8, "#u8", true),
    (TypeId::I16, "#i16", true),
    (TypeId::U16, "#u16", true),
    (TypeId::I32, "#i32", true),
    (TypeId::U32, "#u32", true),
    (TypeId::I64, "#i64", true),
    (TypeId::U64, "#u64", true),
    (TypeId::FLOAT, "#float", true),
    (TypeId::DOUBLE, "#double", true),
    (TypeId::UUID, "#uuid", true),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_ids_match_original_ordering() {
        let table = TypeTable::new();
        assert_eq!(table.lookup_by_name("#opaque"), Some(TypeId::OPAQUE));
        assert_eq!(table.lookup_by_name("#uuid"), Some(TypeId::UUID));
        assert_eq!(TypeId::UUID.0, TypeId::LAST_PREDEFINED);
    }

    #[test]
    fn register_type_assigns_ids_starting_at_first_user() {
        let mut table = TypeTable::new();
        let id = table.register_type("my.vendor.widget", true).unwrap();
        assert_eq!(id.0, TypeId::FIRST_USER);
        assert!(table.is_streamable(id));
    }

    #[test]
    fn register_type_rejects_duplicate_names() {
        let mut table = TypeTable::new();
        table.register_type("dup", false).unwrap();
        assert_eq!(table.register_type("dup", false), Err(CoreError::Exists));
    }
}
