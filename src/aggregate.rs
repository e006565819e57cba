//! Group aggregation: one output row per distinct key.

use std::collections::BTreeMap;

use crate::stats;

/// Aggregated group.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregated<K, T> {
    pub key: K,
    /// First row of the group in input order, for pass-through attributes.
    pub first: T,
    pub mean: f64,
    pub count: usize,
}

/// Average `value` per key, rounding the mean to `decimals`.
///
/// Output is sorted by key. Keys with absent components are kept as their own group.
pub fn aggregate<T, K, FK, FV>(rows: Vec<T>, key: FK, value: FV, decimals: u32) -> Vec<Aggregated<K, T>>
where
    K: Ord + Clone,
    FK: Fn(&T) -> K,
    FV: Fn(&T) -> f64,
{
    let mut groups: BTreeMap<K, (T, Vec<f64>)> = BTreeMap::new();
    for row in rows {
        let k = key(&row);
        let v = value(&row);
        match groups.get_mut(&k) {
            Some((_, values)) => values.push(v),
            None => {
                groups.insert(k, (row, vec![v]));
            }
        }
    }

    groups
        .into_iter()
        .filter_map(|(key, (first, values))| {
            let mean = stats::mean(&values)?;
            Some(Aggregated {
                key,
                first,
                mean: stats::round_to(mean, decimals),
                count: values.len(),
            })
        })
        .collect()
}
