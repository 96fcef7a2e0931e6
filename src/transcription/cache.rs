//! # Context Cache
//!
//! Holds at most one loaded [`InferenceContext`]. Consecutive tasks that ask
//! for the same variant share it; a different variant replaces it.
//!
//! ## Memory Management:
//! - The cached context is dropped before a new one is loaded, so two models
//!   are never resident at once.
//! - A load refused by the [`ResourceGate`] leaves the cache untouched.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::transcription::catalog::{ModelCatalog, ModelVariant};
use crate::transcription::context::{ContextProvider, InferenceContext};
use crate::transcription::resources::ResourceGate;

/// Result of resolving a context for a task.
pub struct ResolvedContext {
    /// The variant actually used, which may be the catalog default
    pub variant: ModelVariant,
    pub context: Arc<dyn InferenceContext>,
    pub reused: bool,
}

struct CachedContext {
    variant: ModelVariant,
    context: Arc<dyn InferenceContext>,
}

pub struct ContextCache {
    catalog: Arc<ModelCatalog>,
    gate: ResourceGate,
    provider: Arc<dyn ContextProvider>,
    current: Option<CachedContext>,
    load_count: usize,
}

impl ContextCache {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        gate: ResourceGate,
        provider: Arc<dyn ContextProvider>,
    ) -> Self {
        Self {
            catalog,
            gate,
            provider,
            current: None,
            load_count: 0,
        }
    }

    /// Return a context for `requested`, loading one if needed.
    pub async fn resolve(&mut self, requested: &str) -> Result<ResolvedContext, WorkerError> {
        if let Some(cached) = self.cached_for(requested) {
            return Ok(cached);
        }

        let selected = self.catalog.resolve_available(requested).clone();
        if selected.id != requested {
            warn!(
                requested = %requested,
                fallback = %selected.id,
                "Requested model variant not available, using default"
            );
            if let Some(cached) = self.cached_for(&selected.id) {
                return Ok(cached);
            }
        }

        self.gate.admit(&selected)?;

        if let Some(previous) = self.current.take() {
            info!(variant = %previous.variant.id, "Releasing cached inference context");
        }

        let started = Instant::now();
        let context = self.provider.load(&selected).await?;
        self.load_count += 1;

        info!(
            variant = %selected.id,
            loads = self.load_count,
            load_secs = started.elapsed().as_secs_f64(),
            "Inference context loaded"
        );

        self.current = Some(CachedContext {
            variant: selected.clone(),
            context: Arc::clone(&context),
        });

        Ok(ResolvedContext {
            variant: selected,
            context,
            reused: false,
        })
    }

    fn cached_for(&self, variant_id: &str) -> Option<ResolvedContext> {
        self.current
            .as_ref()
            .filter(|cached| cached.variant.id == variant_id)
            .map(|cached| ResolvedContext {
                variant: cached.variant.clone(),
                context: Arc::clone(&cached.context),
                reused: true,
            })
    }

    #[cfg(test)]
    pub fn current_variant(&self) -> Option<&ModelVariant> {
        self.current.as_ref().map(|cached| &cached.variant)
    }

    /// Number of contexts loaded over the cache's lifetime.
    #[cfg(test)]
    pub fn load_count(&self) -> usize {
        self.load_count
    }

    #[cfg(test)]
    pub fn unload(&mut self) {
        if let Some(previous) = self.current.take() {
            info!(variant = %previous.variant.id, "Inference context unloaded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::testing::{test_catalog, FixedMemory, ScriptedProvider, MB};

    fn cache_with(available: u64, provider: Arc<ScriptedProvider>) -> (ContextCache, tempfile::TempDir) {
        let (catalog, dir) = test_catalog(&["small", "large"]);
        let gate = ResourceGate::new(Arc::new(FixedMemory::new(available)));
        (ContextCache::new(Arc::new(catalog), gate, provider), dir)
    }

    #[tokio::test]
    async fn test_same_variant_is_reused() {
        let provider = Arc::new(ScriptedProvider::finishing());
        let (mut cache, _dir) = cache_with(1_000 * MB, provider.clone());

        let first = cache.resolve("small").await.unwrap();
        let second = cache.resolve("small").await.unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert!(Arc::ptr_eq(&first.context, &second.context));
        assert_eq!(cache.load_count(), 1);
        assert_eq!(provider.loads(), 1);
    }

    #[tokio::test]
    async fn test_different_variant_replaces_context() {
        let provider = Arc::new(ScriptedProvider::finishing());
        let (mut cache, _dir) = cache_with(1_000 * MB, provider.clone());

        let small = cache.resolve("small").await.unwrap();
        let weak = Arc::downgrade(&small.context);
        drop(small);

        let large = cache.resolve("large").await.unwrap();
        assert_eq!(large.variant.id, "large");
        assert_eq!(cache.current_variant().map(|v| v.id.as_str()), Some("large"));
        assert!(weak.upgrade().is_none());
        assert_eq!(cache.load_count(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_memory_leaves_cache_untouched() {
        let provider = Arc::new(ScriptedProvider::finishing());
        let (mut cache, _dir) = cache_with(200 * MB, provider.clone());

        cache.resolve("small").await.unwrap();
        let err = cache.resolve("large").await.err().unwrap();

        assert_eq!(
            err,
            WorkerError::InsufficientMemory {
                available: 200 * MB,
                required: 600 * MB
            }
        );
        assert_eq!(cache.current_variant().map(|v| v.id.as_str()), Some("small"));
        assert_eq!(provider.loads(), 1);
    }

    #[tokio::test]
    async fn test_missing_variant_substitutes_default() {
        let provider = Arc::new(ScriptedProvider::finishing());
        let (mut cache, _dir) = cache_with(1_000 * MB, provider.clone());

        let resolved = cache.resolve("medium").await.unwrap();
        assert_eq!(resolved.variant.id, "small");

        let again = cache.resolve("medium").await.unwrap();
        assert!(again.reused);
        assert_eq!(cache.load_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_reported() {
        let provider = Arc::new(ScriptedProvider::finishing().failing_loads());
        let (mut cache, _dir) = cache_with(1_000 * MB, provider);

        let err = cache.resolve("small").await.err().unwrap();
        assert!(matches!(err, WorkerError::ModelLoad { .. }));
        assert!(cache.current_variant().is_none());
        assert_eq!(cache.load_count(), 0);
    }

    #[tokio::test]
    async fn test_unload_clears_context() {
        let provider = Arc::new(ScriptedProvider::finishing());
        let (mut cache, _dir) = cache_with(1_000 * MB, provider);

        cache.resolve("small").await.unwrap();
        cache.unload();
        assert!(cache.current_variant().is_none());
    }
}
