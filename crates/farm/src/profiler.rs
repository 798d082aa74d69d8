//! Call profiling and memory snapshots
//!
//! Profiling is per executor: `startProfile` begins collecting one sample per
//! method call, `endProfile` returns them. Memory snapshots are a JSON report
//! of the executor process written to a directory chosen by the coordinator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use workerfarm_protocol::ChildId;

/// One timed method call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSample {
    pub method: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub ok: bool,
}

/// Samples collected by one executor between start and end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// `None` for the coordinator's local worker
    pub child_id: Option<ChildId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub samples: Vec<ProfileSample>,
}

/// Aggregate of the samples for one method
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MethodSummary {
    pub calls: usize,
    pub failures: usize,
    pub total_ms: f64,
}

impl Profile {
    /// Per-method totals, ordered by method name
    pub fn summary(&self) -> BTreeMap<String, MethodSummary> {
        let mut summary: BTreeMap<String, MethodSummary> = BTreeMap::new();
        for sample in &self.samples {
            let entry = summary.entry(sample.method.clone()).or_default();
            entry.calls += 1;
            entry.total_ms += sample.duration_ms;
            if !sample.ok {
                entry.failures += 1;
            }
        }
        summary
    }
}

/// Collects samples while a profile is active
#[derive(Debug, Default)]
pub struct Profiler {
    active: Option<(DateTime<Utc>, Vec<ProfileSample>)>,
}

impl Profiler {
    /// Start a profile, discarding any unfinished one
    pub fn start(&mut self) {
        self.active = Some((Utc::now(), Vec::new()));
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Record a call; ignored when no profile is active
    pub fn record(&mut self, method: &str, started_at: DateTime<Utc>, duration: Duration, ok: bool) {
        if let Some((_, samples)) = &mut self.active {
            samples.push(ProfileSample {
                method: method.to_string(),
                started_at,
                duration_ms: duration.as_secs_f64() * 1000.0,
                ok,
            });
        }
    }

    /// Finish the active profile
    pub fn finish(&mut self, child_id: Option<ChildId>) -> Option<Profile> {
        let (started_at, samples) = self.active.take()?;
        Some(Profile {
            child_id,
            started_at,
            ended_at: Utc::now(),
            samples,
        })
    }
}

/// Memory report of one executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub snapshot_id: String,
    pub child_id: Option<ChildId>,
    pub pid: u32,
    pub taken_at: DateTime<Utc>,
    /// Resident memory in bytes, when the platform reports it
    pub memory_bytes: Option<u64>,
    pub virtual_memory_bytes: Option<u64>,
    pub shared_references: usize,
    pub handles: usize,
}

impl MemorySnapshot {
    /// Measure the current process
    pub fn capture(
        snapshot_id: impl Into<String>,
        child_id: Option<ChildId>,
        shared_references: usize,
        handles: usize,
    ) -> Self {
        let system = System::new_all();
        let process = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| system.process(pid));

        Self {
            snapshot_id: snapshot_id.into(),
            child_id,
            pid: std::process::id(),
            taken_at: Utc::now(),
            memory_bytes: process.map(|p| p.memory()),
            virtual_memory_bytes: process.map(|p| p.virtual_memory()),
            shared_references,
            handles,
        }
    }

    /// `heap-<snapshot>-<child>.json`
    pub fn file_name(&self) -> String {
        let owner = self
            .child_id
            .map(|c| c.to_string())
            .unwrap_or_else(|| "main".to_string());
        format!("heap-{}-{}.json", self.snapshot_id, owner)
    }

    /// Write the report into `dir` and return its path
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}
