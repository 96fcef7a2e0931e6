//! # Resource Gate
//!
//! Decides whether a model variant may be loaded given the memory the system
//! currently has available. The check runs before every load; a refused load
//! leaves everything as it was.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use sysinfo::System;
use tracing::{debug, info};

use crate::error::{format_bytes, WorkerError};
use crate::transcription::catalog::ModelVariant;

/// Source of memory figures, in bytes.
pub trait MemoryProbe: Send + Sync {
    fn available_memory(&self) -> u64;
    fn total_memory(&self) -> u64;
}

/// Reads physical memory through `sysinfo`, refreshing on every query.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refreshed<T>(&self, read: impl FnOnce(&System) -> T) -> Option<T> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        Some(read(&system))
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_memory(&self) -> u64 {
        // A poisoned probe reports nothing available, so loads are refused
        self.refreshed(System::available_memory).unwrap_or(0)
    }

    fn total_memory(&self) -> u64 {
        self.refreshed(System::total_memory).unwrap_or(0)
    }
}

/// Memory snapshot reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Clone)]
pub struct ResourceGate {
    probe: Arc<dyn MemoryProbe>,
}

impl ResourceGate {
    pub fn new(probe: Arc<dyn MemoryProbe>) -> Self {
        Self { probe }
    }

    /// Admit `variant` only if available memory strictly exceeds its requirement.
    pub fn admit(&self, variant: &ModelVariant) -> Result<(), WorkerError> {
        let available = self.probe.available_memory();
        let required = variant.memory_required;

        info!(
            variant = %variant.id,
            available = %format_bytes(available),
            required = %format_bytes(required),
            "Checking memory before model load"
        );

        if available <= required {
            return Err(WorkerError::InsufficientMemory {
                available,
                required,
            });
        }

        debug!(variant = %variant.id, "Model load admitted");
        Ok(())
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            available_bytes: self.probe.available_memory(),
            total_bytes: self.probe.total_memory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::testing::FixedMemory;

    fn variant(required: u64) -> ModelVariant {
        ModelVariant::new("v", "test", 1, required, "/tmp/v")
    }

    #[test]
    fn test_admits_when_memory_exceeds_requirement() {
        let gate = ResourceGate::new(Arc::new(FixedMemory::new(1_000)));
        assert!(gate.admit(&variant(999)).is_ok());
    }

    #[test]
    fn test_rejects_when_memory_equals_requirement() {
        let gate = ResourceGate::new(Arc::new(FixedMemory::new(1_000)));
        assert_eq!(
            gate.admit(&variant(1_000)),
            Err(WorkerError::InsufficientMemory {
                available: 1_000,
                required: 1_000
            })
        );
    }

    #[test]
    fn test_snapshot_reports_probe_values() {
        let gate = ResourceGate::new(Arc::new(FixedMemory::new(512)));
        let snapshot = gate.snapshot();
        assert_eq!(snapshot.available_bytes, 512);
        assert!(snapshot.total_bytes >= snapshot.available_bytes);
    }

    #[test]
    fn test_system_memory_reports_total() {
        let probe = SystemMemory::new();
        assert!(probe.total_memory() > 0);
    }
}
