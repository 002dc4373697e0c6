pub(crate) mod binned;
pub(crate) mod bit_tree;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod integration;
pub(crate) mod malloc;
pub(crate) mod os_alloc;
pub(crate) mod platform;
pub(crate) mod pool;
pub(crate) mod pool_map;
pub(crate) mod proxy;
pub(crate) mod recycler;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod thread_cache;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
