pub(crate) mod allocator;
pub(crate) mod arena;
pub(crate) mod buf;
pub(crate) mod chunk;
pub(crate) mod error;
pub(crate) mod integration;
pub(crate) mod region;
pub(crate) mod size_classes;
pub(crate) mod stats;
pub(crate) mod subpage;
pub(crate) mod thread_cache;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
