//! [SlabRoot] behind a lock
//!
//! A bare [SlabRoot] is single-owner: all mutation needs `&mut`. This wrapper
//! puts the whole root (registry, header slab and every slab it owns) behind
//! one mutex so that it can be shared between threads.

use std::fmt::Debug;

use crate::{
    allocator::{SlabId, SlabInitFn, SlabRoot, SlabStats, SlotRef},
    error::SlabError,
    loom_testing::{Mutex, MutexGuard},
};

pub struct SharedSlabRoot {
    inner: Mutex<SlabRoot>,
}

impl Debug for SharedSlabRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedSlabRoot").field(&*self.lock()).finish()
    }
}

impl Default for SharedSlabRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedSlabRoot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlabRoot::new()),
        }
    }

    /// Every operation on the root leaves it consistent before it can panic,
    /// so a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, SlabRoot> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `f` with exclusive access to the root
    pub fn with<R>(&self, f: impl FnOnce(&mut SlabRoot) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn create(
        &self,
        name: &str,
        obj_size: usize,
        align: usize,
        init_func: Option<SlabInitFn>,
    ) -> Result<SlabId, SlabError> {
        self.lock().create(name, obj_size, align, init_func)
    }

    pub fn destroy(&self, id: Option<SlabId>) {
        self.lock().destroy(id)
    }

    pub fn alloc(&self, id: SlabId) -> Result<SlotRef, SlabError> {
        self.lock().alloc(id)
    }

    pub fn free(&self, id: SlabId, slot: SlotRef) {
        self.lock().free(id, slot)
    }

    pub fn total_count(&self, id: SlabId) -> usize {
        self.lock().total_count(id)
    }

    pub fn free_count(&self, id: SlabId) -> usize {
        self.lock().free_count(id)
    }

    pub fn active_count(&self, id: SlabId) -> usize {
        self.lock().active_count(id)
    }

    /// The lock is held for the whole walk
    pub fn for_each_pool<F: FnMut(&SlabStats<'_>)>(&self, f: F) {
        self.lock().for_each_pool(f)
    }

    pub fn into_inner(self) -> SlabRoot {
        match self.inner.into_inner() {
            Ok(root) => root,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn ensure_shared_root_send_sync() {
        assert_send::<SharedSlabRoot>();
        assert_sync::<SharedSlabRoot>();
    }

    #[cfg(not(loom))]
    #[test]
    fn shared_root_threads() {
        use std::{sync::Arc, thread};

        let root = Arc::new(SharedSlabRoot::new());

        let handles = (0..4)
            .map(|thread_i| {
                let root = root.clone();
                thread::spawn(move || {
                    let id = root.create(&format!("thread{}", thread_i), 16, 0, None).unwrap();
                    let slots = (0..100).map(|_| root.alloc(id).unwrap()).collect::<Vec<_>>();
                    for &slot in &slots[..40] {
                        root.free(id, slot);
                    }
                    assert_eq!(root.active_count(id), 60);
                    id
                })
            })
            .collect::<Vec<_>>();
        let ids = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();

        let mut names = Vec::new();
        root.for_each_pool(|stats| names.push(stats.name.to_owned()));
        assert_eq!(names.len(), 5);
        assert_eq!(names[0], "slab_header");
        for thread_i in 0..4 {
            assert!(names.contains(&format!("thread{}", thread_i)));
        }

        for id in ids {
            assert_eq!(root.total_count(id) - root.free_count(id), 60);
            root.destroy(Some(id));
        }
        let root = Arc::try_unwrap(root).unwrap().into_inner();
        assert_eq!(root.pool_count(), 0);
    }

    #[cfg(not(loom))]
    #[test]
    fn shared_root_with() {
        let root = SharedSlabRoot::new();
        let id = root.create("with", 8, 0, None).unwrap();
        let outstanding = root.with(|root| {
            let a = root.alloc(id).unwrap();
            let _b = root.alloc(id).unwrap();
            root.free(id, a);
            root.debug_check(id)
        });
        assert_eq!(outstanding.len(), 1);
    }

    #[cfg(loom)]
    #[test]
    fn loom_concurrent_create_alloc() {
        use loom::{sync::Arc, thread};

        loom::model(|| {
            let root = Arc::new(SharedSlabRoot::new());

            let root_1 = root.clone();
            let t1 = thread::spawn(move || {
                let id = root_1.create("t1", 32, 0, None).unwrap();
                let a = root_1.alloc(id).unwrap();
                root_1.free(id, a);
                id
            });
            let root_2 = root.clone();
            let t2 = thread::spawn(move || {
                let id = root_2.create("t2", 32, 0, None).unwrap();
                let a = root_2.alloc(id).unwrap();
                let b = root_2.alloc(id).unwrap();
                root_2.free(id, b);
                (id, a)
            });

            let id_1 = t1.join().unwrap();
            let (id_2, a_2) = t2.join().unwrap();

            assert_ne!(id_1, id_2);
            assert_eq!(root.active_count(id_1), 0);
            assert_eq!(root.active_count(id_2), 1);

            let mut n = 0;
            root.for_each_pool(|_| n += 1);
            assert_eq!(n, 3);

            root.free(id_2, a_2);
            root.destroy(Some(id_1));
            root.destroy(Some(id_2));
        });
    }
}
