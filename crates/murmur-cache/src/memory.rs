use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

use crate::transaction::{Command, Reply, Transaction};
use crate::{CacheError, CacheResult, CacheStore, Direction};

enum Entry {
    Scalar(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    /// Fields in insertion order.
    Hash(Vec<(String, Vec<u8>)>),
    Set(BTreeSet<Vec<u8>>),
    Sorted(SortedSet),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::Scalar(_) => false,
            Entry::List(l) => l.is_empty(),
            Entry::Hash(h) => h.is_empty(),
            Entry::Set(s) => s.is_empty(),
            Entry::Sorted(z) => z.ordered.is_empty(),
        }
    }
}

/// Members ordered by (score, member bytes), the same total order Redis uses.
#[derive(Default)]
struct SortedSet {
    scores: HashMap<Vec<u8>, i64>,
    ordered: BTreeSet<(i64, Vec<u8>)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &[u8]) -> bool {
        match self.scores.insert(member.to_vec(), score) {
            Some(old) => {
                self.ordered.remove(&(old, member.to_vec()));
                self.ordered.insert((score, member.to_vec()));
                false
            }
            None => {
                self.ordered.insert((score, member.to_vec()));
                true
            }
        }
    }

    fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_vec())),
            None => false,
        }
    }

    fn walk(&self, direction: Direction) -> Box<dyn Iterator<Item = &(i64, Vec<u8>)> + '_> {
        match direction {
            Direction::Forward => Box::new(self.ordered.iter()),
            Direction::Reverse => Box::new(self.ordered.iter().rev()),
        }
    }
}

/// In-process [`CacheStore`] with Redis semantics.
///
/// All keys live behind one mutex, so every call (and every committed
/// transaction) is atomic. `set_offline(true)` makes every call fail with
/// [`CacheError::Unavailable`], which is how outages are rehearsed.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

fn mismatch(key: &str) -> CacheError {
    error!(key, "WRONGTYPE operation against cache key");
    CacheError::ShapeMismatch { key: key.to_string() }
}

/// Borrow an existing entry as the given kind, `None` if the key is absent.
macro_rules! read_as {
    ($map:expr, $key:expr, $kind:ident) => {
        match $map.get($key) {
            None => None,
            Some(Entry::$kind(v)) => Some(v),
            Some(_) => return Err(mismatch($key)),
        }
    };
}

/// Mutably borrow an existing entry as the given kind, `None` if absent.
macro_rules! modify_as {
    ($map:expr, $key:expr, $kind:ident) => {
        match $map.get_mut($key) {
            None => None,
            Some(Entry::$kind(v)) => Some(v),
            Some(_) => return Err(mismatch($key)),
        }
    };
}

/// Mutably borrow an entry as the given kind, creating it if absent.
macro_rules! write_as {
    ($map:expr, $key:expr, $kind:ident, $init:expr) => {
        match $map.entry($key.to_string()).or_insert_with(|| Entry::$kind($init)) {
            Entry::$kind(v) => v,
            _ => return Err(mismatch($key)),
        }
    };
}

type Entries = HashMap<String, Entry>;

/// Redis deletes containers once they become empty.
fn prune(map: &mut Entries, key: &str) {
    if map.get(key).is_some_and(Entry::is_empty) {
        map.remove(key);
    }
}

fn op_set(map: &mut Entries, key: &str, value: &[u8]) {
    map.insert(key.to_string(), Entry::Scalar(value.to_vec()));
}

fn op_delete(map: &mut Entries, key: &str) -> bool {
    map.remove(key).is_some()
}

fn op_increment_by(map: &mut Entries, key: &str, delta: i64) -> CacheResult<i64> {
    let slot = write_as!(map, key, Scalar, b"0".to_vec());
    let current = std::str::from_utf8(slot)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| CacheError::Protocol("value is not an integer or out of range".into()))?;
    let next = current
        .checked_add(delta)
        .ok_or_else(|| CacheError::Protocol("increment or decrement would overflow".into()))?;
    *slot = next.to_string().into_bytes();
    Ok(next)
}

fn op_add_with_score(map: &mut Entries, key: &str, score: i64, member: &[u8]) -> CacheResult<bool> {
    let zset = write_as!(map, key, Sorted, SortedSet::default());
    Ok(zset.insert(score, member))
}

fn op_raise_score(map: &mut Entries, key: &str, score: i64, member: &[u8]) -> CacheResult<bool> {
    let zset = write_as!(map, key, Sorted, SortedSet::default());
    if zset.scores.get(member).is_some_and(|&current| current >= score) {
        return Ok(false);
    }
    zset.insert(score, member);
    Ok(true)
}

fn op_set_field(map: &mut Entries, key: &str, field: &str, value: &[u8]) -> CacheResult<bool> {
    let hash = write_as!(map, key, Hash, Vec::new());
    match hash.iter_mut().find(|(f, _)| f == field) {
        Some((_, v)) => {
            *v = value.to_vec();
            Ok(false)
        }
        None => {
            hash.push((field.to_string(), value.to_vec()));
            Ok(true)
        }
    }
}

fn op_add_member(map: &mut Entries, key: &str, member: &[u8]) -> CacheResult<bool> {
    let set = write_as!(map, key, Set, BTreeSet::new());
    Ok(set.insert(member.to_vec()))
}

/// Resolve a Redis-style inclusive index range against a length.
fn resolve_range(start: i64, end: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let end = if end < 0 { end + len } else { end.min(len - 1) };
    if len == 0 || start > end || start >= len {
        return None;
    }
    Some((start as usize, end as usize))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn with_entries<F, T>(&self, f: F) -> CacheResult<T>
    where
        F: FnOnce(&mut Entries) -> CacheResult<T>,
    {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory store is offline".into()));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("store lock poisoned: {}", e)))?;
        f(&mut entries)
    }
}

impl CacheStore for MemoryStore {
    fn exists(&self, key: &str) -> CacheResult<bool> {
        self.with_entries(|map| Ok(map.contains_key(key)))
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        self.with_entries(|map| Ok(op_delete(map, key)))
    }

    fn flush_all(&self) -> CacheResult<()> {
        self.with_entries(|map| {
            map.clear();
            Ok(())
        })
    }

    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.with_entries(|map| Ok(read_as!(map, key, Scalar).cloned()))
    }

    fn set(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.with_entries(|map| {
            op_set(map, key, value);
            Ok(())
        })
    }

    fn set_if_absent(&self, key: &str, value: &[u8]) -> CacheResult<bool> {
        self.with_entries(|map| {
            if map.contains_key(key) {
                return Ok(false);
            }
            op_set(map, key, value);
            Ok(true)
        })
    }

    fn increment(&self, key: &str) -> CacheResult<i64> {
        self.with_entries(|map| op_increment_by(map, key, 1))
    }

    fn decrement(&self, key: &str) -> CacheResult<i64> {
        self.with_entries(|map| op_increment_by(map, key, -1))
    }

    fn push_back(&self, key: &str, value: &[u8]) -> CacheResult<i64> {
        self.with_entries(|map| {
            let list = write_as!(map, key, List, VecDeque::new());
            list.push_back(value.to_vec());
            Ok(list.len() as i64)
        })
    }

    fn push_front(&self, key: &str, value: &[u8]) -> CacheResult<i64> {
        self.with_entries(|map| {
            let list = write_as!(map, key, List, VecDeque::new());
            list.push_front(value.to_vec());
            Ok(list.len() as i64)
        })
    }

    fn list_range(&self, key: &str, start: i64, end: i64) -> CacheResult<Vec<Vec<u8>>> {
        self.with_entries(|map| {
            let Some(list) = read_as!(map, key, List) else {
                return Ok(Vec::new());
            };
            Ok(match resolve_range(start, end, list.len()) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            })
        })
    }

    fn list_len(&self, key: &str) -> CacheResult<i64> {
        self.with_entries(|map| Ok(read_as!(map, key, List).map_or(0, |l| l.len() as i64)))
    }

    fn remove_from_list(&self, key: &str, value: &[u8]) -> CacheResult<bool> {
        self.with_entries(|map| {
            let removed = match modify_as!(map, key, List) {
                Some(list) => match list.iter().position(|v| v == value) {
                    Some(idx) => list.remove(idx).is_some(),
                    None => false,
                },
                None => false,
            };
            prune(map, key);
            Ok(removed)
        })
    }

    fn set_field(&self, key: &str, field: &str, value: &[u8]) -> CacheResult<bool> {
        self.with_entries(|map| op_set_field(map, key, field, value))
    }

    fn get_field(&self, key: &str, field: &str) -> CacheResult<Option<Vec<u8>>> {
        self.with_entries(|map| {
            Ok(read_as!(map, key, Hash)
                .and_then(|hash| hash.iter().find(|(f, _)| f == field))
                .map(|(_, v)| v.clone()))
        })
    }

    fn get_fields(&self, key: &str, fields: &[&str]) -> CacheResult<Vec<Vec<u8>>> {
        self.with_entries(|map| {
            let Some(hash) = read_as!(map, key, Hash) else {
                return Ok(Vec::new());
            };
            Ok(fields
                .iter()
                .filter_map(|want| hash.iter().find(|(f, _)| f == want).map(|(_, v)| v.clone()))
                .collect())
        })
    }

    fn all_values(&self, key: &str) -> CacheResult<Vec<Vec<u8>>> {
        self.with_entries(|map| {
            Ok(read_as!(map, key, Hash)
                .map(|hash| hash.iter().map(|(_, v)| v.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn field_count(&self, key: &str) -> CacheResult<i64> {
        self.with_entries(|map| Ok(read_as!(map, key, Hash).map_or(0, |h| h.len() as i64)))
    }

    fn field_keys(&self, key: &str) -> CacheResult<Vec<String>> {
        self.with_entries(|map| {
            Ok(read_as!(map, key, Hash)
                .map(|hash| hash.iter().map(|(f, _)| f.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn delete_field(&self, key: &str, field: &str) -> CacheResult<bool> {
        self.with_entries(|map| {
            let removed = match modify_as!(map, key, Hash) {
                Some(hash) => {
                    let before = hash.len();
                    hash.retain(|(f, _)| f != field);
                    hash.len() != before
                }
                None => false,
            };
            prune(map, key);
            Ok(removed)
        })
    }

    fn add_member(&self, key: &str, member: &[u8]) -> CacheResult<bool> {
        self.with_entries(|map| op_add_member(map, key, member))
    }

    fn members(&self, key: &str) -> CacheResult<Vec<Vec<u8>>> {
        self.with_entries(|map| {
            Ok(read_as!(map, key, Set)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn remove_member(&self, key: &str, member: &[u8]) -> CacheResult<bool> {
        self.with_entries(|map| {
            let removed = modify_as!(map, key, Set).is_some_and(|set| set.remove(member));
            prune(map, key);
            Ok(removed)
        })
    }

    fn member_count(&self, key: &str) -> CacheResult<i64> {
        self.with_entries(|map| Ok(read_as!(map, key, Set).map_or(0, |s| s.len() as i64)))
    }

    fn add_with_score(&self, key: &str, score: i64, member: &[u8]) -> CacheResult<bool> {
        self.with_entries(|map| op_add_with_score(map, key, score, member))
    }

    fn raise_score(&self, key: &str, score: i64, member: &[u8]) -> CacheResult<bool> {
        self.with_entries(|map| op_raise_score(map, key, score, member))
    }

    fn score(&self, key: &str, member: &[u8]) -> CacheResult<Option<i64>> {
        self.with_entries(|map| {
            Ok(read_as!(map, key, Sorted).and_then(|zset| zset.scores.get(member).copied()))
        })
    }

    fn range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
        offset: usize,
        direction: Direction,
    ) -> CacheResult<Vec<Vec<u8>>> {
        self.with_entries(|map| {
            let Some(zset) = read_as!(map, key, Sorted) else {
                return Ok(Vec::new());
            };
            Ok(zset
                .walk(direction)
                .filter(|(score, _)| *score >= min && *score <= max)
                .skip(offset)
                .take(limit.unwrap_or(usize::MAX))
                .map(|(_, member)| member.clone())
                .collect())
        })
    }

    fn range_by_rank(
        &self,
        key: &str,
        start: i64,
        end: i64,
        direction: Direction,
    ) -> CacheResult<Vec<Vec<u8>>> {
        self.with_entries(|map| {
            let Some(zset) = read_as!(map, key, Sorted) else {
                return Ok(Vec::new());
            };
            Ok(match resolve_range(start, end, zset.ordered.len()) {
                Some((from, to)) => zset
                    .walk(direction)
                    .skip(from)
                    .take(to - from + 1)
                    .map(|(_, member)| member.clone())
                    .collect(),
                None => Vec::new(),
            })
        })
    }

    fn count_by_score(&self, key: &str, min: i64, max: i64) -> CacheResult<i64> {
        self.with_entries(|map| {
            Ok(read_as!(map, key, Sorted).map_or(0, |zset| {
                zset.ordered
                    .iter()
                    .filter(|(score, _)| *score >= min && *score <= max)
                    .count() as i64
            }))
        })
    }

    fn cardinality(&self, key: &str) -> CacheResult<i64> {
        self.with_entries(|map| Ok(read_as!(map, key, Sorted).map_or(0, |z| z.ordered.len() as i64)))
    }

    fn remove_matching(&self, key: &str, member: &[u8]) -> CacheResult<bool> {
        self.with_entries(|map| {
            let removed = modify_as!(map, key, Sorted).is_some_and(|zset| zset.remove(member));
            prune(map, key);
            Ok(removed)
        })
    }

    fn commit(&self, tx: Transaction) -> CacheResult<Vec<Reply>> {
        if tx.is_empty() {
            return Ok(Vec::new());
        }
        self.with_entries(|map| {
            let mut replies = Vec::with_capacity(tx.len());
            for cmd in tx.into_commands() {
                let reply = match cmd {
                    Command::Set { key, value } => {
                        op_set(map, &key, &value);
                        Reply::Done
                    }
                    Command::Delete { key } => Reply::Integer(op_delete(map, &key) as i64),
                    Command::Increment { key } => Reply::Integer(op_increment_by(map, &key, 1)?),
                    Command::AddWithScore { key, score, member } => {
                        Reply::Integer(op_add_with_score(map, &key, score, &member)? as i64)
                    }
                    Command::RaiseScore { key, score, member } => {
                        Reply::Integer(op_raise_score(map, &key, score, &member)? as i64)
                    }
                    Command::SetField { key, field, value } => {
                        Reply::Integer(op_set_field(map, &key, &field, &value)? as i64)
                    }
                    Command::AddMember { key, member } => {
                        Reply::Integer(op_add_member(map, &key, &member)? as i64)
                    }
                    Command::Cardinality { key } => {
                        Reply::Integer(read_as!(map, &key, Sorted).map_or(0, |z| z.ordered.len() as i64))
                    }
                };
                replies.push(reply);
            }
            Ok(replies)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("seq").unwrap(), 1);
        assert_eq!(store.increment("seq").unwrap(), 2);
        assert_eq!(store.decrement("seq").unwrap(), 1);
        assert_eq!(store.get("seq").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.decrement("fresh").unwrap(), -1);
    }

    #[test]
    fn set_if_absent_keeps_existing_value() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", b"first").unwrap());
        assert!(!store.set_if_absent("k", b"second").unwrap());
        assert_eq!(store.get("k").unwrap(), Some(b"first".to_vec()));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn wrong_container_kind_is_a_shape_mismatch() {
        let store = MemoryStore::new();
        store.add_with_score("z", 1, b"a").unwrap();

        let err = store.get("z").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(store.increment("z"), Err(CacheError::ShapeMismatch { .. })));
        assert!(matches!(store.set_field("z", "f", b"v"), Err(CacheError::ShapeMismatch { .. })));
        // SET replaces whatever the key held
        store.set("z", b"plain").unwrap();
        assert_eq!(store.get("z").unwrap(), Some(b"plain".to_vec()));
    }

    #[test]
    fn score_ranges_respect_bounds_direction_and_paging() {
        let store = MemoryStore::new();
        for i in 1..=6 {
            store.add_with_score("log", i, format!("m{}", i).as_bytes()).unwrap();
        }

        let asc = store.range_by_score("log", 3, i64::MAX, None, 0, Direction::Forward).unwrap();
        assert_eq!(asc, vec![b"m3".to_vec(), b"m4".to_vec(), b"m5".to_vec(), b"m6".to_vec()]);

        let desc = store.range_by_score("log", 1, 6, Some(2), 1, Direction::Reverse).unwrap();
        assert_eq!(desc, vec![b"m5".to_vec(), b"m4".to_vec()]);

        assert!(store.range_by_score("log", 7, i64::MAX, None, 0, Direction::Forward).unwrap().is_empty());
        assert_eq!(store.count_by_score("log", 5, i64::MAX).unwrap(), 2);
        assert_eq!(store.cardinality("log").unwrap(), 6);
        assert_eq!(store.cardinality("nothing").unwrap(), 0);
    }

    #[test]
    fn rank_ranges_accept_negative_indices() {
        let store = MemoryStore::new();
        for i in 1..=5 {
            store.add_with_score("log", i, format!("m{}", i).as_bytes()).unwrap();
        }

        let newest = store.range_by_rank("log", 0, 1, Direction::Reverse).unwrap();
        assert_eq!(newest, vec![b"m5".to_vec(), b"m4".to_vec()]);

        let tail = store.range_by_rank("log", -2, -1, Direction::Forward).unwrap();
        assert_eq!(tail, vec![b"m4".to_vec(), b"m5".to_vec()]);

        assert_eq!(store.range_by_rank("log", 0, -1, Direction::Forward).unwrap().len(), 5);
        assert!(store.range_by_rank("log", 9, 12, Direction::Forward).unwrap().is_empty());
    }

    #[test]
    fn raise_score_only_moves_forward() {
        let store = MemoryStore::new();
        assert!(store.raise_score("hr", 5, b"ch1").unwrap());
        assert!(!store.raise_score("hr", 3, b"ch1").unwrap());
        assert!(!store.raise_score("hr", 5, b"ch1").unwrap());
        assert!(store.raise_score("hr", 9, b"ch1").unwrap());
        assert_eq!(store.score("hr", b"ch1").unwrap(), Some(9));
        assert_eq!(store.score("hr", b"ch2").unwrap(), None);
    }

    #[test]
    fn removing_the_last_member_drops_the_key() {
        let store = MemoryStore::new();
        store.add_with_score("log", 1, b"m1").unwrap();
        assert!(store.remove_matching("log", b"m1").unwrap());
        assert!(!store.remove_matching("log", b"m1").unwrap());
        assert!(!store.exists("log").unwrap());
    }

    #[test]
    fn hash_values_follow_field_insertion_order() {
        let store = MemoryStore::new();
        assert!(store.set_field("h", "b", b"2").unwrap());
        assert!(store.set_field("h", "a", b"1").unwrap());
        assert!(!store.set_field("h", "b", b"22").unwrap());

        assert_eq!(store.all_values("h").unwrap(), vec![b"22".to_vec(), b"1".to_vec()]);
        assert_eq!(store.field_keys("h").unwrap(), vec!["b".to_string(), "a".to_string()]);
        assert_eq!(store.get_fields("h", &["a", "zz", "b"]).unwrap(), vec![b"1".to_vec(), b"22".to_vec()]);
        assert!(store.get_fields("h", &[]).unwrap().is_empty());
        assert_eq!(store.field_count("h").unwrap(), 2);

        assert!(store.delete_field("h", "a").unwrap());
        assert_eq!(store.get_field("h", "a").unwrap(), None);
    }

    #[test]
    fn lists_and_sets() {
        let store = MemoryStore::new();
        store.push_back("l", b"b").unwrap();
        store.push_front("l", b"a").unwrap();
        assert_eq!(store.push_back("l", b"c").unwrap(), 3);
        assert_eq!(store.list_range("l", 0, -1).unwrap(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(store.remove_from_list("l", b"b").unwrap());
        assert_eq!(store.list_len("l").unwrap(), 2);

        assert!(store.add_member("s", b"x").unwrap());
        assert!(!store.add_member("s", b"x").unwrap());
        store.add_member("s", b"y").unwrap();
        assert_eq!(store.member_count("s").unwrap(), 2);
        assert!(store.remove_member("s", b"x").unwrap());
        assert_eq!(store.members("s").unwrap(), vec![b"y".to_vec()]);
    }

    #[test]
    fn transaction_applies_all_commands() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.delete("log")
            .add_with_score("log", 1, b"m1".to_vec())
            .add_with_score("log", 1, b"m1".to_vec())
            .increment("count")
            .cardinality("log")
            .raise_score("hr", 4, b"ch".to_vec())
            .raise_score("hr", 2, b"ch".to_vec())
            .set("seq", b"1".to_vec());

        let replies = store.commit(tx).unwrap();
        assert_eq!(
            replies,
            vec![
                Reply::Integer(0),
                Reply::Integer(1),
                Reply::Integer(0),
                Reply::Integer(1),
                Reply::Integer(1),
                Reply::Integer(1),
                Reply::Integer(0),
                Reply::Done,
            ]
        );
        assert_eq!(store.score("hr", b"ch").unwrap(), Some(4));
        assert_eq!(store.cardinality("log").unwrap(), 1);
        assert!(store.commit(Transaction::new()).unwrap().is_empty());
    }

    #[test]
    fn offline_store_is_unavailable() {
        let store = MemoryStore::new();
        store.set("k", b"v").unwrap();
        store.set_offline(true);
        assert!(store.get("k").unwrap_err().is_unavailable());
        store.set_offline(false);
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn flush_drops_everything() {
        let store = MemoryStore::new();
        store.set("a", b"1").unwrap();
        store.add_member("b", b"2").unwrap();
        store.flush_all().unwrap();
        assert!(!store.exists("a").unwrap());
        assert!(!store.exists("b").unwrap());
    }
}
