//! The directed converter graph and its shortest-path conversion planner.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};

use super::types::TypeId;
use super::value::DataValue;

/// A user-supplied `(data_from) -> data_to` conversion function.
pub type ConvertFn = Arc<dyn Fn(&DataValue) -> CoreResult<DataValue> + Send + Sync>;

#[derive(Clone)]
struct Edge {
    to: TypeId,
    convert: ConvertFn,
}

/// Directed graph of converters between types. Edges are explored in
/// insertion order on ties, matching `spec.md` §4.1's "BFS by edge count;
/// ties broken by insertion order".
#[derive(Default)]
pub struct ConverterGraph {
    edges: RwLock<HashMap<TypeId, Vec<Edge>>>,
}

impl ConverterGraph {
    #[must_use]
    pub fn new() -> Self {
        ConverterGraph {
            edges: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_converter(
        &self,
        from: TypeId,
        to: TypeId,
        convert: impl Fn(&DataValue) -> CoreResult<DataValue> + Send + Sync + 'static,
    ) {
        self.edges
            .write()
            .entry(from)
            .or_default()
            .push(Edge {
                to,
                convert: Arc::new(convert),
            });
    }

    /// Finds the shortest (fewest-edge) path from `from` to `to`, returning
    /// the ordered list of `(target_type, converter)` hops to walk. `None`
    /// if no path exists.
    fn shortest_path(&self, from: TypeId, to: TypeId) -> Option<Vec<(TypeId, ConvertFn)>> {
        if from == to {
            return Some(Vec::new());
        }
        let edges = self.edges.read();

        let mut came_from: HashMap<TypeId, (TypeId, ConvertFn)> = HashMap::new();
        let mut visited = std::collections::HashSet::new();
        visited.insert(from);
        let mut queue = VecDeque::new();
        queue.push_back(from);

        while let Some(node) = queue.pop_front() {
            let Some(out_edges) = edges.get(&node) else {
                continue;
            };
            for edge in out_edges {
                if visited.contains(&edge.to) {
                    continue;
                }
                visited.insert(edge.to);
                came_from.insert(edge.to, (node, edge.convert.clone()));
                if edge.to == to {
                    // Reconstruct the path immediately: BFS guarantees this
                    // is a shortest path, and the first one found among
                    // ties since edges are walked in insertion order.
                    let mut path = vec![(to, edge.convert.clone())];
                    let mut cur = node;
                    while cur != from {
                        let (prev, f) = came_from.get(&cur).expect("path node must be recorded");
                        path.push((cur, f.clone()));
                        cur = *prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(edge.to);
            }
        }
        None
    }

    /// Walks the shortest path from `data.type_id()` to `target`, creating
    /// an intermediate [`DataValue`] at each hop. Intermediate values are
    /// dropped as soon as the next hop has consumed them.
    pub fn convert(&self, data: &DataValue, target: TypeId) -> CoreResult<DataValue> {
        let path = self
            .shortest_path(data.type_id(), target)
            .ok_or(CoreError::NotFound)?;
        let mut current = data.clone();
        for (_, convert) in path {
            current = convert(&current)?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retag(data: &DataValue, to: TypeId) -> CoreResult<DataValue> {
        Ok(DataValue::create_copy(to, &data.read(), false, false))
    }

    #[test]
    fn direct_edge_is_preferred_over_longer_path() {
        let graph = ConverterGraph::new();
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let h1 = hits.clone();
        graph.add_converter(TypeId::I32, TypeId::I64, move |d| {
            h1.lock().push("a->b");
            retag(d, TypeId::I64)
        });
        let h2 = hits.clone();
        graph.add_converter(TypeId::I64, TypeId::DOUBLE, move |d| {
            h2.lock().push("b->c");
            retag(d, TypeId::DOUBLE)
        });
        let h3 = hits.clone();
        graph.add_converter(TypeId::I32, TypeId::DOUBLE, move |d| {
            h3.lock().push("a->c direct");
            retag(d, TypeId::DOUBLE)
        });

        let data = DataValue::create_copy(TypeId::I32, &[1, 0, 0, 0], false, false);
        let out = graph.convert(&data, TypeId::DOUBLE).unwrap();
        assert_eq!(out.type_id(), TypeId::DOUBLE);
        assert_eq!(hits.lock().as_slice(), ["a->c direct"]);
    }

    #[test]
    fn three_hop_chain_invokes_three_converters() {
        let graph = ConverterGraph::new();
        let hits = Arc::new(parking_lot::Mutex::new(0));

        for (from, to) in [
            (TypeId::I8, TypeId::I16),
            (TypeId::I16, TypeId::I32),
            (TypeId::I32, TypeId::I64),
        ] {
            let h = hits.clone();
            graph.add_converter(from, to, move |d| {
                *h.lock() += 1;
                retag(d, to)
            });
        }

        let data = DataValue::create_copy(TypeId::I8, &[7], false, false);
        let out = graph.convert(&data, TypeId::I64).unwrap();
        assert_eq!(out.type_id(), TypeId::I64);
        assert_eq!(*hits.lock(), 3);
    }

    #[test]
    fn missing_path_reports_not_found() {
        let graph = ConverterGraph::new();
        let data = DataValue::create_copy(TypeId::I8, &[1], false, false);
        assert_eq!(graph.convert(&data, TypeId::DOUBLE), Err(CoreError::NotFound));
    }
}
