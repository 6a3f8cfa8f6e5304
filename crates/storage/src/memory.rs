use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Volatile store with one ordered map per column.
pub struct MemoryStore {
    columns: RwLock<Vec<ColumnMap>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            columns: RwLock::new(vec![ColumnMap::new(); Column::ALL.len()]),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held in `column`.
    pub fn len(&self, column: Column) -> usize {
        self.read()[column.index()].len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ColumnMap>> {
        self.columns.read().expect("memory store lock")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ColumnMap>> {
        self.columns.write().expect("memory store lock")
    }
}

fn prefix_range(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = Bound::Included(prefix.to_vec());
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return (start, Bound::Excluded(end));
        }
    }
    (start, Bound::Unbounded)
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()[column.index()].get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write()[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.write()[column.index()].remove(key);
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.read();
        Ok(guard[column.index()]
            .range(prefix_range(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read();
        for (key, value) in guard[column.index()].range(prefix_range(prefix)) {
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn last_with_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.read();
        Ok(guard[column.index()]
            .range(prefix_range(prefix))
            .next_back()
            .map(|(key, value)| (key.clone(), value.clone())))
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.write();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard[column.index()].insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    guard[column.index()].remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_inside_prefix() {
        let store = MemoryStore::new();
        store.put(Column::HeightIndex, b"a/\x01", b"1").expect("put");
        store.put(Column::HeightIndex, b"a/\x02", b"2").expect("put");
        store.put(Column::HeightIndex, b"a0", b"x").expect("put");
        store.put(Column::HeightIndex, b"b/\x01", b"3").expect("put");

        let rows = store.scan_prefix(Column::HeightIndex, b"a/").expect("scan");
        assert_eq!(rows.len(), 2);
        let last = store
            .last_with_prefix(Column::HeightIndex, b"a/")
            .expect("last")
            .expect("some");
        assert_eq!(last.1, b"2".to_vec());
        assert!(store
            .last_with_prefix(Column::HeightIndex, b"c/")
            .expect("last")
            .is_none());
    }

    #[test]
    fn prefix_of_max_bytes_is_unbounded() {
        let store = MemoryStore::new();
        store.put(Column::Meta, &[0xff, 0xff, 0x01], b"v").expect("put");
        let last = store
            .last_with_prefix(Column::Meta, &[0xff, 0xff])
            .expect("last");
        assert_eq!(last.map(|(_, value)| value), Some(b"v".to_vec()));
    }

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Block, b"k", b"one");
        batch.delete(Column::Block, b"k");
        batch.put(Column::Block, b"k", b"two");
        store.write_batch(&batch).expect("batch");
        assert_eq!(store.get(Column::Block, b"k").expect("get"), Some(b"two".to_vec()));
        assert_eq!(store.len(Column::Block), 1);
        assert_eq!(store.len(Column::Transaction), 0);
    }
}
