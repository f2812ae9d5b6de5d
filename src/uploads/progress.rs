use std::time::Instant;

use serde::Serialize;
use utoipa::ToSchema;

/// Snapshot pushed to a progress channel after each uploaded part.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct ProgressEvent {
    /// 0.0 to 100.0
    pub percent: f64,
    #[serde(rename = "elapsed_time")]
    pub elapsed_seconds: f64,
    /// KiB per second.
    #[serde(rename = "speed")]
    pub throughput_kbps: f64,
    #[serde(rename = "estimated_time")]
    pub eta_seconds: f64,
}

/// Payload of one message on a progress channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProgressMessage {
    Progress(ProgressEvent),
    Complete { status: &'static str },
    Failed { status: &'static str, error: String },
}

impl ProgressMessage {
    pub fn complete() -> Self {
        Self::Complete { status: "complete" }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self::Failed {
            status: "failed",
            error: error.to_string(),
        }
    }
}

/// Computes percent complete, throughput and time remaining.
///
/// Never divides by zero: an unknown (zero) total reports 0% and no ETA, and
/// a zero elapsed time reports no throughput.
pub fn compute(
    bytes_transferred: u64,
    total_size: u64,
    start_time: Instant,
    now: Instant,
) -> ProgressEvent {
    let percent = if total_size == 0 {
        0.0
    } else {
        (100.0 * bytes_transferred as f64 / total_size as f64).clamp(0.0, 100.0)
    };

    let elapsed_seconds = now.saturating_duration_since(start_time).as_secs_f64();
    let transferred_kb = bytes_transferred as f64 / 1024.0;
    let throughput_kbps = if elapsed_seconds > 0.0 {
        transferred_kb / elapsed_seconds
    } else {
        0.0
    };

    let eta_seconds = if throughput_kbps > 0.0 && total_size > 0 {
        let remaining_kb = total_size.saturating_sub(bytes_transferred) as f64 / 1024.0;
        remaining_kb / throughput_kbps
    } else {
        0.0
    };

    ProgressEvent {
        percent,
        elapsed_seconds,
        throughput_kbps,
        eta_seconds,
    }
}
