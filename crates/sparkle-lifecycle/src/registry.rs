use std::sync::Arc;

use serde::Serialize;
use sparkle_store::{aggregates::VersionMetrics, ModelVersion, Store};
use tracing::{info, instrument};

use crate::LifecycleError;

#[derive(Debug, Serialize)]
pub struct VersionCompare {
    pub variant: String,
    pub version_a: i64,
    pub version_b: i64,
    pub metrics_a: VersionMetrics,
    pub metrics_b: VersionMetrics,
    pub booking_rate_delta: f64,
    pub escalation_rate_delta: f64,
    pub avg_cost_delta: f64,
}

#[derive(Debug, Serialize)]
pub struct PromptDiff {
    pub variant: String,
    pub version_a: i64,
    pub version_b: i64,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Domain service over the persisted prompt-version rows: registration,
/// activation, rollback, tagging, and comparison.
pub struct VersionRegistry {
    store: Arc<Store>,
}

impl VersionRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register the next version of a variant. Does not activate it.
    #[instrument(skip(self, system_prompt, metadata))]
    pub fn register(
        &self,
        variant: &str,
        system_prompt: &str,
        metadata: serde_json::Value,
    ) -> Result<i64, LifecycleError> {
        Ok(self.store.register_version(variant, system_prompt, &metadata)?)
    }

    #[instrument(skip(self))]
    pub fn activate(&self, variant: &str, version: i64) -> Result<(), LifecycleError> {
        self.store
            .activate_version(variant, version)
            .map_err(|e| match e {
                sparkle_store::StoreError::NotFound { .. } => LifecycleError::VersionNotFound {
                    variant: variant.to_string(),
                    version,
                },
                other => LifecycleError::Store(other),
            })
    }

    /// Activate the most recent version below the currently active one.
    #[instrument(skip(self))]
    pub fn rollback(&self, variant: &str) -> Result<i64, LifecycleError> {
        let active = self
            .store
            .get_active_version(variant)?
            .ok_or_else(|| LifecycleError::UnknownVariant(variant.to_string()))?;
        let previous = self
            .store
            .list_versions(variant)?
            .into_iter()
            .filter(|v| v.version < active.version)
            .map(|v| v.version)
            .max()
            .ok_or_else(|| LifecycleError::NothingToRollBack(variant.to_string()))?;
        self.store.activate_version(variant, previous)?;
        info!(variant, from = active.version, to = previous, "version rolled back");
        Ok(previous)
    }

    pub fn tag(
        &self,
        variant: &str,
        version: i64,
        tag: &str,
        description: &str,
    ) -> Result<(), LifecycleError> {
        self.store
            .tag_version(variant, version, tag, description)
            .map_err(|e| match e {
                sparkle_store::StoreError::NotFound { .. } => LifecycleError::VersionNotFound {
                    variant: variant.to_string(),
                    version,
                },
                other => LifecycleError::Store(other),
            })
    }

    pub fn active(&self, variant: &str) -> Result<Option<ModelVersion>, LifecycleError> {
        Ok(self.store.get_active_version(variant)?)
    }

    pub fn history(&self, variant: &str) -> Result<Vec<ModelVersion>, LifecycleError> {
        Ok(self.store.list_versions(variant)?)
    }

    pub fn variants(&self) -> Result<Vec<String>, LifecycleError> {
        Ok(self.store.list_variants()?)
    }

    /// Per-metric deltas between two versions, from conversation aggregates.
    pub fn compare(
        &self,
        variant: &str,
        version_a: i64,
        version_b: i64,
    ) -> Result<VersionCompare, LifecycleError> {
        for v in [version_a, version_b] {
            if self.store.get_version(variant, v)?.is_none() {
                return Err(LifecycleError::VersionNotFound {
                    variant: variant.to_string(),
                    version: v,
                });
            }
        }
        let metrics_a = self.store.version_metrics(variant, version_a)?;
        let metrics_b = self.store.version_metrics(variant, version_b)?;
        Ok(VersionCompare {
            variant: variant.to_string(),
            version_a,
            version_b,
            booking_rate_delta: metrics_b.booking_rate - metrics_a.booking_rate,
            escalation_rate_delta: metrics_b.escalation_rate - metrics_a.escalation_rate,
            avg_cost_delta: metrics_b.avg_cost_usd - metrics_a.avg_cost_usd,
            metrics_a,
            metrics_b,
        })
    }

    /// Line-level diff of two prompts.
    pub fn diff(
        &self,
        variant: &str,
        version_a: i64,
        version_b: i64,
    ) -> Result<PromptDiff, LifecycleError> {
        let a = self
            .store
            .get_version(variant, version_a)?
            .ok_or_else(|| LifecycleError::VersionNotFound {
                variant: variant.to_string(),
                version: version_a,
            })?;
        let b = self
            .store
            .get_version(variant, version_b)?
            .ok_or_else(|| LifecycleError::VersionNotFound {
                variant: variant.to_string(),
                version: version_b,
            })?;

        let lines_a: Vec<&str> = a.system_prompt.lines().collect();
        let lines_b: Vec<&str> = b.system_prompt.lines().collect();
        let added: Vec<String> = lines_b
            .iter()
            .filter(|l| !lines_a.contains(l))
            .map(|l| l.to_string())
            .collect();
        let removed: Vec<String> = lines_a
            .iter()
            .filter(|l| !lines_b.contains(l))
            .map(|l| l.to_string())
            .collect();

        Ok(PromptDiff {
            variant: variant.to_string(),
            version_a,
            version_b,
            lines_added: added.len(),
            lines_removed: removed.len(),
            added,
            removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> VersionRegistry {
        VersionRegistry::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn register_activate_rollback_reactivate_round_trip() {
        let r = registry();
        let v1 = r.register("baseline", "prompt one", serde_json::json!({})).unwrap();
        let v2 = r.register("baseline", "prompt two", serde_json::json!({})).unwrap();
        r.activate("baseline", v2).unwrap();

        let rolled_to = r.rollback("baseline").unwrap();
        assert_eq!(rolled_to, v1);
        assert_eq!(r.active("baseline").unwrap().unwrap().version, v1);

        r.activate("baseline", v2).unwrap();
        assert_eq!(r.active("baseline").unwrap().unwrap().version, v2);
    }

    #[test]
    fn rollback_needs_a_previous_version() {
        let r = registry();
        let v1 = r.register("solo", "only prompt", serde_json::json!({})).unwrap();
        r.activate("solo", v1).unwrap();
        assert!(matches!(
            r.rollback("solo"),
            Err(LifecycleError::NothingToRollBack(_))
        ));
    }

    #[test]
    fn diff_reports_added_and_removed_lines() {
        let r = registry();
        r.register("v", "line one\nline two", serde_json::json!({})).unwrap();
        r.register("v", "line one\nline three", serde_json::json!({})).unwrap();
        let diff = r.diff("v", 1, 2).unwrap();
        assert_eq!(diff.lines_added, 1);
        assert_eq!(diff.lines_removed, 1);
        assert_eq!(diff.added, vec!["line three"]);
        assert_eq!(diff.removed, vec!["line two"]);
    }

    #[test]
    fn compare_rejects_unknown_versions() {
        let r = registry();
        r.register("v", "p", serde_json::json!({})).unwrap();
        assert!(matches!(
            r.compare("v", 1, 9),
            Err(LifecycleError::VersionNotFound { version: 9, .. })
        ));
    }
}
