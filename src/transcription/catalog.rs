//! # Model Catalog
//!
//! The set of Whisper variants this worker knows about, where each one lives
//! on disk, and how much memory it needs once loaded.
//!
//! ## Fallback Rule:
//! A task asks for a variant by id. If that variant is unknown or its files
//! are not on disk, the catalog's default variant is used instead. The
//! default is expected to ship with every install.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::WorkerError;

const MB: u64 = 1024 * 1024;

/// Static description of a built-in variant.
#[derive(Debug, Clone, Copy)]
pub struct VariantSpec {
    pub id: &'static str,
    pub description: &'static str,
    /// Parameter count in millions, the usual way Whisper sizes are quoted
    pub size_mb: u32,
    /// Resident memory needed to run the variant
    pub memory_mb: u64,
}

pub const BUILTIN_VARIANTS: &[VariantSpec] = &[
    VariantSpec { id: "tiny", description: "Fastest, basic accuracy", size_mb: 39, memory_mb: 273 },
    VariantSpec { id: "tiny.en", description: "Fastest, English only", size_mb: 39, memory_mb: 273 },
    VariantSpec { id: "base", description: "Fast, good for short notes", size_mb: 74, memory_mb: 388 },
    VariantSpec { id: "base.en", description: "Fast, English only", size_mb: 74, memory_mb: 388 },
    VariantSpec { id: "small", description: "Balanced speed and accuracy", size_mb: 244, memory_mb: 852 },
    VariantSpec { id: "small.en", description: "Balanced, English only", size_mb: 244, memory_mb: 852 },
    VariantSpec { id: "medium", description: "Good accuracy, handles technical vocabulary", size_mb: 769, memory_mb: 2_100 },
    VariantSpec { id: "medium.en", description: "Good accuracy, English only", size_mb: 769, memory_mb: 2_100 },
    VariantSpec { id: "large-v3", description: "Best accuracy, slower processing", size_mb: 1550, memory_mb: 3_900 },
];

/// A model variant with its on-disk location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelVariant {
    pub id: String,
    pub description: String,
    pub size_mb: u32,
    /// Bytes
    pub memory_required: u64,
    pub local_path: PathBuf,
}

impl ModelVariant {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        size_mb: u32,
        memory_required: u64,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            size_mb,
            memory_required,
            local_path: local_path.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    variants: Vec<ModelVariant>,
    default_index: usize,
}

impl ModelCatalog {
    /// Build a catalog from an explicit variant table.
    pub fn new(variants: Vec<ModelVariant>, default_id: &str) -> Result<Self, WorkerError> {
        let default_index = variants
            .iter()
            .position(|variant| variant.id == default_id)
            .ok_or_else(|| WorkerError::UnknownVariant(default_id.to_string()))?;

        Ok(Self {
            variants,
            default_index,
        })
    }

    /// The built-in Whisper variants, each stored at `<models_dir>/<id>`.
    pub fn whisper(models_dir: &Path, default_id: &str) -> Result<Self, WorkerError> {
        let variants = BUILTIN_VARIANTS
            .iter()
            .map(|spec| {
                ModelVariant::new(
                    spec.id,
                    spec.description,
                    spec.size_mb,
                    spec.memory_mb * MB,
                    models_dir.join(spec.id),
                )
            })
            .collect();
        Self::new(variants, default_id)
    }

    pub fn variants(&self) -> &[ModelVariant] {
        &self.variants
    }

    pub fn get(&self, id: &str) -> Option<&ModelVariant> {
        self.variants.iter().find(|variant| variant.id == id)
    }

    pub fn default_variant(&self) -> &ModelVariant {
        &self.variants[self.default_index]
    }

    pub fn is_downloaded(&self, variant: &ModelVariant) -> bool {
        variant.local_path.exists()
    }

    pub fn downloaded_variants(&self) -> Vec<&ModelVariant> {
        self.variants
            .iter()
            .filter(|variant| self.is_downloaded(variant))
            .collect()
    }

    /// The variant a task asking for `id` will actually run with.
    pub fn resolve_available(&self, id: &str) -> &ModelVariant {
        match self.get(id) {
            Some(variant) if self.is_downloaded(variant) => variant,
            _ => self.default_variant(),
        }
    }
}
