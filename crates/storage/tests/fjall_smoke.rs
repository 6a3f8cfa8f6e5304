#![cfg(feature = "fjall")]

use chainsync_storage::fjall::FjallStore;
use chainsync_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");

    let store = FjallStore::open(dir.path()).expect("open fjall");
    store.put(Column::Meta, b"key", b"value").expect("put");
    assert_eq!(
        store.get(Column::Meta, b"key").expect("get"),
        Some(b"value".to_vec())
    );

    for height in [3u64, 1, 2] {
        let mut key = b"XQC:mainnet/".to_vec();
        key.extend_from_slice(&height.to_be_bytes());
        store
            .put(Column::HeightIndex, &key, format!("h{height}").as_bytes())
            .expect("put height");
    }
    let rows = store
        .scan_prefix(Column::HeightIndex, b"XQC:mainnet/")
        .expect("scan");
    let values: Vec<Vec<u8>> = rows.into_iter().map(|(_, value)| value).collect();
    assert_eq!(values, vec![b"h1".to_vec(), b"h2".to_vec(), b"h3".to_vec()]);

    let last = store
        .last_with_prefix(Column::HeightIndex, b"XQC:mainnet/")
        .expect("last")
        .expect("present");
    assert_eq!(last.1, b"h3".to_vec());

    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"batch", b"ok");
    batch.delete(Column::Meta, b"key");
    store.write_batch(&batch).expect("batch commit");

    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
}
