//! In-memory ordered-KV engine.
//!
//! Namespaces live in a process-wide registry so a store's contents
//! survive close/reopen (a vnode restart reopens the same namespace and
//! finds its data). Each namespace admits a single open handle at a time;
//! a second open while the first is alive reports [`StorageError::Locked`],
//! which is what the lock-retry policy in the crate root is for.

use crate::{BatchOp, OrderedStore, StorageError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

type Data = Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>;

struct Namespace {
    data: Data,
    open: bool,
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Namespace>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Namespace>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Single-opener handle onto one in-memory namespace.
pub struct MemoryStore {
    namespace: String,
    data: Data,
    destroyed: bool,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Open or create a namespace. Fails with [`StorageError::Locked`]
    /// while another handle to the same namespace is alive.
    pub fn open(namespace: &str) -> Result<Self, StorageError> {
        let mut reg = registry().lock().expect("storage registry poisoned");
        let ns = reg.entry(namespace.to_string()).or_insert_with(|| Namespace {
            data: Arc::new(Mutex::new(BTreeMap::new())),
            open: false,
        });
        if ns.open {
            return Err(StorageError::Locked(namespace.to_string()));
        }
        ns.open = true;
        tracing::debug!(namespace, "memory store opened");
        Ok(Self {
            namespace: namespace.to_string(),
            data: ns.data.clone(),
            destroyed: false,
        })
    }

    /// Destroy a namespace that is not currently open.
    pub fn destroy_namespace(namespace: &str) -> Result<(), StorageError> {
        let mut reg = registry().lock().expect("storage registry poisoned");
        match reg.get(namespace) {
            Some(ns) if ns.open => Err(StorageError::Locked(namespace.to_string())),
            _ => {
                reg.remove(namespace);
                Ok(())
            }
        }
    }

    fn data(&self) -> std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.data.lock().expect("namespace data poisoned")
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        let mut reg = registry().lock().expect("storage registry poisoned");
        if let Some(ns) = reg.get_mut(&self.namespace) {
            ns.open = false;
        }
    }
}

impl OrderedStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data().get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.data().remove(key);
        Ok(())
    }

    fn batch(&mut self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let mut data = self.data();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn fold(&self, f: &mut dyn FnMut(&[u8], &[u8])) -> Result<(), StorageError> {
        for (k, v) in self.data().iter() {
            f(k, v);
        }
        Ok(())
    }

    fn fold_keys(&self, f: &mut dyn FnMut(&[u8])) -> Result<(), StorageError> {
        for k in self.data().keys() {
            f(k);
        }
        Ok(())
    }

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.data().is_empty())
    }

    fn destroy(mut self: Box<Self>) -> Result<(), StorageError> {
        let mut reg = registry().lock().expect("storage registry poisoned");
        reg.remove(&self.namespace);
        self.destroyed = true;
        tracing::debug!(namespace = %self.namespace, "memory store destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let mut store = MemoryStore::open("test_put_get_delete").unwrap();
        assert!(store.get(b"k1").unwrap().is_none());

        store.put(b"k1", b"v1").unwrap();
        assert_eq!(store.get(b"k1").unwrap().unwrap(), b"v1");

        store.delete(b"k1").unwrap();
        assert!(store.get(b"k1").unwrap().is_none());
    }

    #[test]
    fn test_batch_applies_in_order() {
        let mut store = MemoryStore::open("test_batch").unwrap();
        store
            .batch(vec![
                BatchOp::Put {
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                },
                BatchOp::Put {
                    key: b"b".to_vec(),
                    value: b"2".to_vec(),
                },
                BatchOp::Delete { key: b"a".to_vec() },
            ])
            .unwrap();
        assert!(store.get(b"a").unwrap().is_none());
        assert_eq!(store.get(b"b").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_fold_is_ordered() {
        let mut store = MemoryStore::open("test_fold_ordered").unwrap();
        store.put(b"c", b"3").unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();

        let mut keys = Vec::new();
        store.fold_keys(&mut |k| keys.push(k.to_vec())).unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let mut pairs = Vec::new();
        store
            .fold(&mut |k, v| pairs.push((k.to_vec(), v.to_vec())))
            .unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], (b"a".to_vec(), b"1".to_vec()));
    }

    #[test]
    fn test_second_open_is_locked() {
        let store = MemoryStore::open("test_second_open").unwrap();
        let err = MemoryStore::open("test_second_open").unwrap_err();
        assert!(matches!(err, StorageError::Locked(_)));
        drop(store);
        // Released on drop.
        MemoryStore::open("test_second_open").unwrap();
    }

    #[test]
    fn test_data_survives_reopen() {
        {
            let mut store = MemoryStore::open("test_survives_reopen").unwrap();
            store.put(b"k", b"v").unwrap();
        }
        let store = MemoryStore::open("test_survives_reopen").unwrap();
        assert_eq!(store.get(b"k").unwrap().unwrap(), b"v");
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn test_destroy_removes_data() {
        {
            let mut store = MemoryStore::open("test_destroy").unwrap();
            store.put(b"k", b"v").unwrap();
            Box::new(store).destroy().unwrap();
        }
        let store = MemoryStore::open("test_destroy").unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_destroy_namespace_respects_lock() {
        let store = MemoryStore::open("test_destroy_locked").unwrap();
        let err = MemoryStore::destroy_namespace("test_destroy_locked").unwrap_err();
        assert!(matches!(err, StorageError::Locked(_)));
        drop(store);
        MemoryStore::destroy_namespace("test_destroy_locked").unwrap();
    }
}
