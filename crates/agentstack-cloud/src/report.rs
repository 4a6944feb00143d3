//! Teardown accounting

use crate::ensure::Removal;
use crate::resource::ResourceKind;
use serde::{Deserialize, Serialize};

/// Result of a teardown run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Resources deleted or found already absent
    pub succeeded: Vec<RemovalEntry>,

    /// Resources that could not be deleted
    pub failed: Vec<RemovalEntry>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn add_success(&mut self, kind: ResourceKind, name: impl Into<String>, removal: Removal) {
        self.succeeded.push(RemovalEntry {
            kind,
            name: name.into(),
            outcome: Some(removal),
            error: None,
        });
    }

    pub fn add_failure(&mut self, kind: ResourceKind, name: impl Into<String>, error: String) {
        self.failed.push(RemovalEntry {
            kind,
            name: name.into(),
            outcome: None,
            error: Some(error),
        });
    }

    /// Drop earlier failures for a resource that a later pass removed
    pub fn clear_failure(&mut self, kind: ResourceKind, name: &str) {
        self.failed.retain(|e| !(e.kind == kind && e.name == name));
    }

    pub fn deleted_count(&self) -> usize {
        self.succeeded
            .iter()
            .filter(|e| e.outcome == Some(Removal::Deleted))
            .count()
    }

    pub fn failed_of(&self, kind: ResourceKind) -> Vec<&RemovalEntry> {
        self.failed.iter().filter(|e| e.kind == kind).collect()
    }
}

impl std::fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let absent = self.succeeded.len() - self.deleted_count();
        write!(
            f,
            "{} deleted, {} already absent, {} failed ({:.1}s)",
            self.deleted_count(),
            absent,
            self.failed.len(),
            self.duration_ms as f64 / 1000.0
        )
    }
}

/// One resource in a [`TeardownReport`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalEntry {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(skip)]
    pub outcome: Option<Removal>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_summary() {
        let mut report = TeardownReport::new();
        report.add_success(ResourceKind::Bucket, "storage-for-demo", Removal::Deleted);
        report.add_success(ResourceKind::Secret, "tavilyapikey-demo", Removal::AlreadyAbsent);
        report.add_failure(ResourceKind::Vpc, "vpc-for-demo", "DependencyViolation".into());
        report.duration_ms = 1500;

        assert!(!report.is_success());
        assert_eq!(
            report.to_string(),
            "1 deleted, 1 already absent, 1 failed (1.5s)"
        );

        report.clear_failure(ResourceKind::Vpc, "vpc-for-demo");
        assert!(report.is_success());
    }
}
