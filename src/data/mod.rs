//! Component A: the data value, type table, converter graph and registry.

mod converter;
mod registry;
mod types;
mod value;

pub use converter::{ConvertFn, ConverterGraph};
pub use registry::DataRegistry;
pub use types::{Type, TypeId, TypeTable};
pub use value::DataValue;

use crate::error::CoreResult;

/// Bulk helpers over a slice of [`DataValue`]s, grounded in the original's
/// `afb-data-array.c` (see `SPEC_FULL.md` §10). Call dispatch passes its
/// parameters around as exactly this kind of array.
pub struct DataArray;

impl DataArray {
    /// Converts every element to `target`, stopping at the first failure.
    /// On success, returns a new `Vec` the same length as `data`; on
    /// failure, none of the already-converted elements are reported back
    /// to the caller (they are simply dropped).
    pub fn convert_all(data: &[DataValue], target: TypeId, registry: &DataRegistry) -> CoreResult<Vec<DataValue>> {
        data.iter().map(|d| registry.convert(d, target)).collect()
    }

    /// Clones every handle in `data`, incrementing each value's refcount.
    #[must_use]
    pub fn addref_all(data: &[DataValue]) -> Vec<DataValue> {
        data.iter().cloned().collect()
    }

    /// Drops every handle in `data`, decrementing each value's refcount.
    /// Equivalent to letting the `Vec` go out of scope; named explicitly
    /// to mirror the original's paired `addref_all`/`unref_all` calls at
    /// dispatch boundaries.
    pub fn unref_all(data: Vec<DataValue>) {
        drop(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_all_converts_every_element() {
        let registry = DataRegistry::new();
        let t1 = registry.register_type("arr.t1", false).unwrap();
        let t2 = registry.register_type("arr.t2", false).unwrap();
        registry.add_converter(t1, t2, |d| Ok(DataValue::create_copy(t2, &d.read(), false, false)));

        let items = vec![
            DataValue::create_copy(t1, &[1], false, false),
            DataValue::create_copy(t1, &[2], false, false),
            DataValue::create_copy(t1, &[3], false, false),
        ];
        let converted = DataArray::convert_all(&items, t2, &registry).unwrap();
        assert_eq!(converted.len(), 3);
        assert!(converted.iter().all(|d| d.type_id() == t2));
    }

    #[test]
    fn convert_all_fails_fast_on_first_unconvertible_element() {
        let registry = DataRegistry::new();
        let t1 = registry.register_type("arr.fail.t1", false).unwrap();
        let t2 = registry.register_type("arr.fail.t2", false).unwrap();
        let items = vec![DataValue::create_copy(t1, &[1], false, false)];
        assert!(DataArray::convert_all(&items, t2, &registry).is_err());
    }

    #[test]
    fn addref_all_produces_independent_clones_sharing_identity() {
        let t = TypeId(9001);
        let original = DataValue::create_copy(t, &[1, 2, 3], false, false);
        let items = vec![original.clone()];
        let refs = DataArray::addref_all(&items);
        assert!(refs[0].is_same(&original));
        assert_eq!(original.strong_count(), 3);
        DataArray::unref_all(refs);
        assert_eq!(original.strong_count(), 2);
    }
}
