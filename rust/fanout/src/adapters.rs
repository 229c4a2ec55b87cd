//! Typed entry points over collections.
//!
//! Each function maps the positions of a collection to the unit indices `0..len` and
//! forwards to [`for_range_with`], so they share its options, failure handling and
//! result. The callback shape is picked at compile time by choosing the function:
//!
//! | function | callback |
//! |---|---|
//! | [`for_each_index`] | `Fn(usize)` |
//! | [`for_each_element`] | `Fn(&T)` |
//! | [`for_each_indexed`] | `Fn(usize, &T)` |
//! | [`for_each_key`] | `Fn(&K)` |
//! | [`for_each_entry`] | `Fn(&K, &V)` |
//! | [`repeat`] | `Fn()` |
//!
//! Maps are anything iterable by reference as `(&K, &V)` pairs, such as `HashMap` and
//! `BTreeMap`. The pairs are collected before the first unit starts.

use crate::{
    error::{Error, Result},
    options::ExecutionOptions,
    scheduler::for_range_with,
};

/// Calls `f` with every index of `items`.
pub fn for_each_index<T, F>(
    items: &[T],
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    F: Fn(usize) + Sync,
{
    for_each_position(items.len(), options, f)
}

/// Calls `f` with every element of `items`.
///
/// ```
/// use fanout::ExecutionOptions;
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let sum = AtomicU64::new(0);
/// fanout::for_each_element(&[1u64, 2, 3, 4], ExecutionOptions::new(), |n| {
///     sum.fetch_add(*n, Ordering::Relaxed);
/// })
/// .unwrap();
/// assert_eq!(sum.into_inner(), 10);
/// ```
pub fn for_each_element<T, F>(
    items: &[T],
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    T: Sync,
    F: Fn(&T) + Sync,
{
    for_each_position(items.len(), options, |i| f(&items[i]))
}

/// Calls `f` with every index of `items` and the element at that index.
pub fn for_each_indexed<T, F>(
    items: &[T],
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    T: Sync,
    F: Fn(usize, &T) + Sync,
{
    for_each_position(items.len(), options, |i| f(i, &items[i]))
}

/// Calls `f` with every key of `map`.
pub fn for_each_key<'m, M, K, V, F>(
    map: &'m M,
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    &'m M: IntoIterator<Item = (&'m K, &'m V)>,
    K: Sync + 'm,
    V: Sync + 'm,
    F: Fn(&K) + Sync,
{
    for_each_entry(map, options, |key, _| f(key))
}

/// Calls `f` with every key and value of `map`.
///
/// ```
/// use fanout::ExecutionOptions;
/// use std::{collections::BTreeMap, sync::Mutex};
///
/// let ages = BTreeMap::from([("ada", 36), ("alan", 41)]);
/// let seen = Mutex::new(Vec::new());
/// fanout::for_each_entry(&ages, ExecutionOptions::new(), |name, age| {
///     seen.lock().unwrap().push(format!("{name}={age}"));
/// })
/// .unwrap();
/// let mut seen = seen.into_inner().unwrap();
/// seen.sort();
/// assert_eq!(seen, ["ada=36", "alan=41"]);
/// ```
pub fn for_each_entry<'m, M, K, V, F>(
    map: &'m M,
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    &'m M: IntoIterator<Item = (&'m K, &'m V)>,
    K: Sync + 'm,
    V: Sync + 'm,
    F: Fn(&K, &V) + Sync,
{
    let entries: Vec<(&K, &V)> = map.into_iter().collect();
    for_each_position(entries.len(), options, |i| {
        let (key, value) = entries[i];
        f(key, value)
    })
}

/// Calls `f` `count` times.
pub fn repeat<F>(
    count: usize,
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    F: Fn() + Sync,
{
    for_each_position(count, options, |_| f())
}

fn for_each_position<F>(
    len: usize,
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    F: Fn(usize) + Sync,
{
    let end = i64::try_from(len)
        .map_err(|_| Error::invalid_arg("len", format!("{len} positions cannot be indexed")))?;
    // Indices stay within 0..len, which fits usize.
    for_range_with(0, end, options, |index| f(index as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::{BTreeMap, HashMap},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    #[test]
    fn test_for_each_index() {
        let items = vec!['a'; 50];
        let seen: Vec<AtomicUsize> = (0..50).map(|_| AtomicUsize::new(0)).collect();
        for_each_index(&items, ExecutionOptions::new().with_worker_count(4), |i| {
            seen[i].fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(seen.iter().all(|count| count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_for_each_indexed() {
        let items: Vec<usize> = (0..20).map(|i| i * 10).collect();
        let mismatches = AtomicUsize::new(0);
        for_each_indexed(&items, ExecutionOptions::new(), |i, item| {
            if *item != i * 10 {
                mismatches.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        assert_eq!(mismatches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_collections() {
        let calls = AtomicUsize::new(0);
        let empty: [u8; 0] = [];
        for_each_element(&empty, ExecutionOptions::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        for_each_key(&HashMap::<u32, u32>::new(), ExecutionOptions::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        repeat(0, ExecutionOptions::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_for_each_key() {
        let map: HashMap<u32, &str> = (0..30).map(|k| (k, "v")).collect();
        let keys = Mutex::new(Vec::new());
        for_each_key(&map, ExecutionOptions::new().with_worker_count(3), |key| {
            keys.lock().unwrap().push(*key);
        })
        .unwrap();
        let mut keys = keys.into_inner().unwrap();
        keys.sort();
        assert_eq!(keys, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn test_for_each_entry() {
        let map: BTreeMap<String, usize> = (0..10).map(|i| (format!("k{i}"), i)).collect();
        let total = AtomicUsize::new(0);
        for_each_entry(&map, ExecutionOptions::new(), |key, value| {
            assert_eq!(key, &format!("k{value}"));
            total.fetch_add(*value, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 45);
    }

    #[test]
    fn test_repeat() {
        let calls = AtomicUsize::new(0);
        repeat(7, ExecutionOptions::new().with_worker_count(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_adapter_failure_uses_position() {
        let items = ["ok", "bad", "ok"];
        let err = for_each_element(&items, ExecutionOptions::new(), |item| {
            assert_ne!(*item, "bad", "rejected item");
        })
        .unwrap_err();
        assert_eq!(err.failures()[0].index, 1);
    }
}
