//! Prometheus-style counters for the upload endpoints.
//!
//! Exposed via `/metrics` in Prometheus text exposition format.

use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Maximum assembly latency samples kept for P99
const LATENCY_WINDOW_SIZE: usize = 1000;

pub struct UploadMetrics {
    pub sessions_started: AtomicU64,
    pub chunks_received: AtomicU64,
    pub chunk_bytes_received: AtomicU64,
    pub uploads_completed: AtomicU64,
    /// Complete calls rejected for missing chunks
    pub completes_conflicted: AtomicU64,
    /// Size or digest mismatch after assembly
    pub assemblies_rejected: AtomicU64,
    pub single_uploads: AtomicU64,
    pub sessions_swept: AtomicU64,
    pub temp_files_swept: AtomicU64,
    assembly_latencies: RwLock<VecDeque<f64>>,
}

impl Default for UploadMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadMetrics {
    pub fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            chunks_received: AtomicU64::new(0),
            chunk_bytes_received: AtomicU64::new(0),
            uploads_completed: AtomicU64::new(0),
            completes_conflicted: AtomicU64::new(0),
            assemblies_rejected: AtomicU64::new(0),
            single_uploads: AtomicU64::new(0),
            sessions_swept: AtomicU64::new(0),
            temp_files_swept: AtomicU64::new(0),
            assembly_latencies: RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
        }
    }

    pub fn record_chunk(&self, bytes: usize) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.chunk_bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a successful assembly and how long it took
    pub fn record_completed(&self, latency_ms: f64) {
        self.uploads_completed.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut latencies) = self.assembly_latencies.write() {
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                latencies.pop_front();
            }
            latencies.push_back(latency_ms);
        }
    }

    pub fn get_p99_latency(&self) -> f64 {
        if let Ok(latencies) = self.assembly_latencies.read() {
            if latencies.is_empty() {
                return 0.0;
            }

            let mut sorted: Vec<f64> = latencies.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let p99_index = ((sorted.len() as f64) * 0.99).ceil() as usize - 1;
            sorted[p99_index.min(sorted.len() - 1)]
        } else {
            0.0
        }
    }

    pub fn get_avg_latency(&self) -> f64 {
        if let Ok(latencies) = self.assembly_latencies.read() {
            if latencies.is_empty() {
                return 0.0;
            }
            latencies.iter().sum::<f64>() / latencies.len() as f64
        } else {
            0.0
        }
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 9] = [
            ("chunkport_sessions_started_total", "Chunked upload sessions created", &self.sessions_started),
            ("chunkport_chunks_received_total", "Chunks written to the chunk store", &self.chunks_received),
            ("chunkport_chunk_bytes_received_total", "Bytes received across all chunks", &self.chunk_bytes_received),
            ("chunkport_uploads_completed_total", "Chunked uploads assembled", &self.uploads_completed),
            ("chunkport_completes_conflicted_total", "Complete calls rejected for missing chunks", &self.completes_conflicted),
            ("chunkport_assemblies_rejected_total", "Assemblies rejected for size or digest mismatch", &self.assemblies_rejected),
            ("chunkport_single_uploads_total", "Single-shot uploads stored", &self.single_uploads),
            ("chunkport_sessions_swept_total", "Abandoned chunk sessions removed", &self.sessions_swept),
            ("chunkport_temp_files_swept_total", "Expired temp files removed", &self.temp_files_swept),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }
        let _ = writeln!(out, "# HELP chunkport_assembly_latency_ms Assembly latency over the recent window");
        let _ = writeln!(out, "# TYPE chunkport_assembly_latency_ms gauge");
        let _ = writeln!(out, "chunkport_assembly_latency_ms{{quantile=\"avg\"}} {:.3}", self.get_avg_latency());
        let _ = writeln!(out, "chunkport_assembly_latency_ms{{quantile=\"0.99\"}} {:.3}", self.get_p99_latency());
        out
    }
}
