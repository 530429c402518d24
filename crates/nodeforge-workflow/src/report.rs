//! Execution reports
//!
//! A [`Report`] is produced by every execute and rollback call. Reports are
//! only built through [`Report::success`], [`Report::skipped`] and
//! [`Report::failed`], so a failed report always carries an error and a
//! successful or skipped one never does.

use crate::error::StepError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Report metadata: unique string keys to string values
pub type Metadata = BTreeMap<String, String>;

/// Stable metadata vocabulary used by steps and asserted on by tests
pub mod keys {
    /// Target binaries were already present, nothing was done
    pub const ALREADY_INSTALLED: &str = "AlreadyInstalled";
    pub const DOWNLOADED_BY_THIS_STEP: &str = "DownloadedByThisStep";
    pub const EXTRACTED_BY_THIS_STEP: &str = "ExtractedByThisStep";
    pub const INSTALLED_BY_THIS_STEP: &str = "InstalledByThisStep";
    pub const CLEANED_UP_BY_THIS_STEP: &str = "CleanedUpByThisStep";
    /// Configuration was already in place, nothing was done
    pub const ALREADY_CONFIGURED: &str = "AlreadyConfigured";
    pub const CONFIGURED_BY_THIS_STEP: &str = "ConfiguredByThisStep";

    /// Cluster resource already existed
    pub const ALREADY_EXISTS: &str = "AlreadyExists";
    pub const NAMESPACE_CREATED_BY_THIS_STEP: &str = "NamespaceCreatedByThisStep";
    pub const VOLUMES_CREATED_BY_THIS_STEP: &str = "VolumesCreatedByThisStep";
    pub const CHART_INSTALLED_BY_THIS_STEP: &str = "ChartInstalledByThisStep";
    /// Helm status of a broken release that was replaced by a fresh install
    pub const REPLACED_RELEASE_STATUS: &str = "ReplacedReleaseStatus";
    pub const SERVICE_ANNOTATED_BY_THIS_STEP: &str = "ServiceAnnotatedByThisStep";
    /// Deployed release already matches the requested chart and values
    pub const ALREADY_UP_TO_DATE: &str = "AlreadyUpToDate";
    pub const UPGRADED_BY_THIS_STEP: &str = "UpgradedByThisStep";
    pub const MIGRATED_BY_THIS_STEP: &str = "MigratedByThisStep";
    pub const PREVIOUS_REVISION: &str = "PreviousRevision";
    pub const READY: &str = "Ready";
}

/// Outcome of an execute or rollback call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Skipped,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => f.write_str("success"),
            Status::Skipped => f.write_str("skipped"),
            Status::Failed => f.write_str("failed"),
        }
    }
}

/// Result of a step or workflow execution or rollback attempt
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    id: String,
    status: Status,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<StepError>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: Metadata,

    /// One child report per executed step, in execution order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    step_reports: Vec<Report>,

    /// Rollback attempt for the step that produced this report
    #[serde(skip_serializing_if = "Option::is_none")]
    rollback: Option<Box<Report>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<Duration>,
}

impl Report {
    fn with_status(id: impl Into<String>, status: Status, error: Option<StepError>) -> Self {
        Self {
            id: id.into(),
            status,
            error,
            metadata: Metadata::new(),
            step_reports: Vec::new(),
            rollback: None,
            duration: None,
        }
    }

    /// Create a successful report
    pub fn success(id: impl Into<String>) -> Self {
        Self::with_status(id, Status::Success, None)
    }

    /// Create a report for work that was not needed
    pub fn skipped(id: impl Into<String>) -> Self {
        Self::with_status(id, Status::Skipped, None)
    }

    /// Create a failed report
    pub fn failed(id: impl Into<String>, error: StepError) -> Self {
        Self::with_status(id, Status::Failed, Some(error))
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a boolean flag set to `"true"`
    pub fn with_flag(self, key: &str) -> Self {
        self.with_metadata(key, "true")
    }

    /// Merge a batch of metadata entries
    pub fn with_all_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Set the child step reports
    pub fn with_step_reports(mut self, reports: Vec<Report>) -> Self {
        self.step_reports = reports;
        self
    }

    /// Attach the rollback attempt for this report's step
    pub fn with_rollback(mut self, rollback: Report) -> Self {
        self.rollback = Some(Box::new(rollback));
        self
    }

    /// Set the duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub(crate) fn attach_rollback(&mut self, rollback: Report) {
        self.rollback = Some(Box::new(rollback));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Get a metadata value by key
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    /// Check whether a boolean flag is set to `"true"`
    pub fn flag(&self, key: &str) -> bool {
        self.meta(key) == Some("true")
    }

    pub fn step_reports(&self) -> &[Report] {
        &self.step_reports
    }

    /// Find a direct child report by step id
    pub fn step(&self, id: &str) -> Option<&Report> {
        self.step_reports.iter().find(|r| r.id == id)
    }

    pub fn rollback(&self) -> Option<&Report> {
        self.rollback.as_deref()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_skipped(&self) -> bool {
        self.status == Status::Skipped
    }

    pub fn is_failed(&self) -> bool {
        self.status == Status::Failed
    }

    /// Success or Skipped: the step's target state holds
    pub fn is_ok(&self) -> bool {
        !self.is_failed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_report_success() {
        let report = Report::success("install-containerd");

        assert!(report.is_success());
        assert!(report.is_ok());
        assert!(report.error().is_none());
        assert_eq!(report.id(), "install-containerd");
    }

    #[test]
    fn test_report_failed_carries_error() {
        let report = Report::failed(
            "install-containerd",
            StepError::new(ErrorKind::Download, "connection reset"),
        );

        assert!(report.is_failed());
        assert_eq!(report.status(), Status::Failed);
        assert!(report.error().unwrap().is(ErrorKind::Download));
    }

    #[test]
    fn test_report_skipped_has_no_error() {
        let report = Report::skipped("install-containerd").with_flag(keys::ALREADY_INSTALLED);

        assert!(report.is_skipped());
        assert!(report.error().is_none());
        assert!(report.flag(keys::ALREADY_INSTALLED));
        assert!(!report.flag(keys::INSTALLED_BY_THIS_STEP));
    }

    #[test]
    fn test_report_metadata_keys_are_unique() {
        let report = Report::success("step")
            .with_metadata("Key", "first")
            .with_metadata("Key", "second");

        assert_eq!(report.metadata().len(), 1);
        assert_eq!(report.meta("Key"), Some("second"));
    }

    #[test]
    fn test_report_children_and_rollback() {
        let child = Report::success("a").with_rollback(Report::skipped("a"));
        let report = Report::success("wf").with_step_reports(vec![child]);

        let child = report.step("a").unwrap();
        assert!(child.rollback().unwrap().is_skipped());
        assert!(report.step("missing").is_none());
    }

    #[test]
    fn test_report_serialization() {
        let report = Report::failed("wf", StepError::internal("boom"))
            .with_step_reports(vec![Report::success("a").with_flag(keys::INSTALLED_BY_THIS_STEP)])
            .with_duration(Duration::from_millis(5));

        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "internal");
        assert_eq!(json["step_reports"][0]["metadata"]["InstalledByThisStep"], "true");
        assert!(json["step_reports"][0].get("error").is_none());
    }
}
