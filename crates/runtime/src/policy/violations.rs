//! Bounded violation log driving the audit trail and compliance counters.
//!
//! The log is a fixed-capacity ring: oldest entries drop first, the buffer
//! never exceeds capacity. Cumulative per-kind counters survive ring
//! turnover so compliance metrics stay accurate over long uptimes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::ResourceType;

/// Classification of a policy breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    AccessDenied,
    RateLimitExceeded,
    ExecutionTimeViolation,
    ParameterViolation,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::AccessDenied => "access_denied",
            ViolationKind::RateLimitExceeded => "rate_limit_exceeded",
            ViolationKind::ExecutionTimeViolation => "execution_time_violation",
            ViolationKind::ParameterViolation => "parameter_violation",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded breach.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationRecord {
    pub timestamp: DateTime<Utc>,
    pub subject_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub action: String,
    #[serde(rename = "violation_type")]
    pub kind: ViolationKind,
    pub details: serde_json::Value,
}

/// Ring buffer of the last N violations plus cumulative counters.
pub struct ViolationLog {
    capacity: usize,
    buffer: Mutex<VecDeque<ViolationRecord>>,
    total: AtomicU64,
    access_denied: AtomicU64,
    rate_limit: AtomicU64,
    execution_time: AtomicU64,
    parameter: AtomicU64,
}

impl ViolationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            total: AtomicU64::new(0),
            access_denied: AtomicU64::new(0),
            rate_limit: AtomicU64::new(0),
            execution_time: AtomicU64::new(0),
            parameter: AtomicU64::new(0),
        }
    }

    pub fn record(&self, record: ViolationRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match record.kind {
            ViolationKind::AccessDenied => &self.access_denied,
            ViolationKind::RateLimitExceeded => &self.rate_limit,
            ViolationKind::ExecutionTimeViolation => &self.execution_time,
            ViolationKind::ParameterViolation => &self.parameter,
        }
        .fetch_add(1, Ordering::Relaxed);

        let mut buffer = self.buffer.lock();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(record);
    }

    /// Newest-first slice of the ring, at most `limit` entries.
    pub fn newest_first(&self, limit: usize) -> Vec<ViolationRecord> {
        let buffer = self.buffer.lock();
        buffer.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn total_recorded(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn count(&self, kind: ViolationKind) -> u64 {
        match kind {
            ViolationKind::AccessDenied => &self.access_denied,
            ViolationKind::RateLimitExceeded => &self.rate_limit,
            ViolationKind::ExecutionTimeViolation => &self.execution_time,
            ViolationKind::ParameterViolation => &self.parameter,
        }
        .load(Ordering::Relaxed)
    }

    /// Breakdown of buffered violations by kind.
    pub fn by_kind(&self) -> BTreeMap<String, u64> {
        let buffer = self.buffer.lock();
        let mut counts = BTreeMap::new();
        for record in buffer.iter() {
            *counts.entry(record.kind.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Breakdown of buffered violations by subject.
    pub fn by_subject(&self) -> BTreeMap<String, u64> {
        let buffer = self.buffer.lock();
        let mut counts = BTreeMap::new();
        for record in buffer.iter() {
            *counts.entry(record.subject_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Breakdown of buffered violations by `{type}_{id}` resource key.
    pub fn by_resource(&self) -> BTreeMap<String, u64> {
        let buffer = self.buffer.lock();
        let mut counts = BTreeMap::new();
        for record in buffer.iter() {
            let key = format!("{}_{}", record.resource_type, record.resource_id);
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}
