//! Operation timing records and experiment result snapshots
//!
//! Every high-level operation (create, scale steps, delete) is timed under a
//! stable label such as `create_cluster` or `scale_up_2_to_4`. The record is
//! append-only during a run and persisted as part of a snapshot that also
//! carries the cluster metadata, for the experiment tooling that consumes
//! these files. Loading an existing snapshot lets an interrupted run resume
//! with its accumulated times instead of losing them.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::spec::ClusterSpec;
use crate::{Error, Result};

/// Append-only mapping of operation label to elapsed seconds
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimingRecorder {
    times: BTreeMap<String, f64>,
}

impl TimingRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation's duration, rounded to milliseconds
    ///
    /// Re-running an operation under the same label overwrites the previous
    /// entry, matching re-run-and-resume semantics.
    pub fn record(&mut self, label: impl Into<String>, elapsed: Duration) {
        let label = label.into();
        let seconds = (elapsed.as_secs_f64() * 1000.0).round() / 1000.0;
        debug!(label = %label, seconds, "recorded operation time");
        self.times.insert(label, seconds);
    }

    /// Elapsed seconds recorded under the label, if any
    pub fn get(&self, label: &str) -> Option<f64> {
        self.times.get(label).copied()
    }

    /// All recorded times
    pub fn times(&self) -> &BTreeMap<String, f64> {
        &self.times
    }

    /// Absorb times from a previously saved snapshot
    ///
    /// Existing entries win over loaded ones, so times recorded in this run
    /// are never clobbered by stale data.
    pub fn merge_earlier(&mut self, earlier: BTreeMap<String, f64>) {
        for (label, seconds) in earlier {
            self.times.entry(label).or_insert(seconds);
        }
    }

    /// The timing label for a scaling step
    pub fn scale_label(from: u32, to: u32) -> String {
        if to >= from {
            format!("scale_up_{from}_to_{to}")
        } else {
            format!("scale_down_{from}_to_{to}")
        }
    }
}

/// Persisted experiment result: times plus cluster metadata
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ResultSnapshot {
    /// Operation label to elapsed seconds
    pub times: BTreeMap<String, f64>,
    /// Cluster name
    pub cluster_name: String,
    /// Worker machine type
    pub machine_type: String,
    /// Cloud region
    pub region: String,
    /// Tags applied to remote resources
    pub tags: BTreeMap<String, String>,
    /// Free-form experiment description
    #[serde(default)]
    pub description: String,
    /// When the snapshot was written
    pub saved_at: DateTime<Utc>,
}

impl ResultSnapshot {
    /// Build a snapshot from the spec and the recorder's current state
    pub fn new(spec: &ClusterSpec, recorder: &TimingRecorder, description: impl Into<String>) -> Self {
        Self {
            times: recorder.times().clone(),
            cluster_name: spec.name().to_string(),
            machine_type: spec.machine_type().to_string(),
            region: spec.region().to_string(),
            tags: spec.tags().clone(),
            description: description.into(),
            saved_at: Utc::now(),
        }
    }

    /// Write the snapshot as pretty-printed JSON
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::serialization(e.to_string()))?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Load a snapshot written by a previous run
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&json).map_err(|e| Error::serialization(e.to_string()))
    }
}
