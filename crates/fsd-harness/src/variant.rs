use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Identity of one compiled variant of a computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub stage: Option<String>,
    pub accelerated: bool,
}

impl VariantKey {
    #[must_use]
    pub fn new(stage: Option<&str>, accelerated: bool) -> Self {
        Self {
            stage: stage.map(str::to_owned),
            accelerated,
        }
    }
}

/// Memoizes compiled variants so each `(stage, accelerated)` pair is built once
/// per process, even when cases run on parallel test threads.
pub struct VariantCache<T> {
    entries: Mutex<FxHashMap<VariantKey, Arc<T>>>,
}

impl<T> Default for VariantCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<T> std::fmt::Debug for VariantCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariantCache")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl<T> VariantCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached variant for `key`, building it with `build` on first use.
    ///
    /// The lock is held across `build`, so concurrent callers never build the
    /// same variant twice. A failed build is not cached.
    pub fn get_or_try_build<E>(
        &self,
        key: &VariantKey,
        build: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<T>, E> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            return Ok(Arc::clone(existing));
        }
        debug!(
            stage = key.stage.as_deref().unwrap_or("<none>"),
            accelerated = key.accelerated,
            "building variant"
        );
        let built = Arc::new(build()?);
        entries.insert(key.clone(), Arc::clone(&built));
        Ok(built)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
