//! # Utility Functions
//!
//! Formatters for human-readable output, validation of run parameters and a
//! few system helpers shared by the run controller and the results module.
//!
//! ## Usage Examples
//!
//! ```rust
//! use netbox_stress::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_rate(1048576.0), "1.00 MB/s");
//!
//! validate_payload_size(100)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Upper bound for a single payload; larger values are rejected up front
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Generate a unique identifier for test runs
///
/// UUID v4 string, used as the run id in JSON results and log lines.
pub fn generate_test_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp as nanoseconds since Unix epoch
///
/// If the system time is before the Unix epoch, returns 0 rather than
/// panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Format a duration in a human-readable way
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use netbox_stress::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_nanos(1250)), "1.25μs");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        // For longer durations, use compound format (hours, minutes, seconds)
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a latency given in (fractional) milliseconds
pub fn format_latency_ms(ms: f64) -> String {
    if !ms.is_finite() || ms < 0.0 {
        return "n/a".to_string();
    }
    format_duration(Duration::from_secs_f64(ms / 1000.0))
}

/// Format bytes in a human-readable way
///
/// Uses binary (1024-based) scaling.
///
/// ```rust
/// # use netbox_stress::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(2621440), "2.50 MB");
/// ```
pub fn format_bytes(bytes: usize) -> String {
    format_bytes_f64(bytes as f64)
}

pub fn format_bytes_f64(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a rate (bytes per second) in a human-readable way
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes_f64(bytes_per_second))
}

/// Format an operation rate in a human-readable way
///
/// Uses decimal scaling (powers of 1000):
///
/// ```rust
/// # use netbox_stress::utils::format_operation_rate;
/// assert_eq!(format_operation_rate(750.0), "750 ops/s");
/// assert_eq!(format_operation_rate(15500.0), "15.50K ops/s");
/// assert_eq!(format_operation_rate(2300000.0), "2.30M ops/s");
/// ```
pub fn format_operation_rate(operations_per_second: f64) -> String {
    if operations_per_second < 1000.0 {
        format!("{:.0} ops/s", operations_per_second)
    } else if operations_per_second < 1_000_000.0 {
        format!("{:.2}K ops/s", operations_per_second / 1000.0)
    } else {
        format!("{:.2}M ops/s", operations_per_second / 1_000_000.0)
    }
}

/// Validate that a payload size is reasonable
///
/// ## Validation Rules
///
/// - **Minimum**: 1 byte (prevent zero-length values)
/// - **Maximum**: 16 MB per payload
pub fn validate_payload_size(payload_size: usize) -> Result<()> {
    if payload_size == 0 {
        anyhow::bail!("Payload size cannot be zero");
    }
    if payload_size > MAX_PAYLOAD_SIZE {
        anyhow::bail!("Payload size {} is too large (maximum 16MB)", payload_size);
    }
    Ok(())
}

/// Validate that a timeout is non-zero
pub fn validate_timeout(name: &str, timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        anyhow::bail!("{} must be greater than 0", name);
    }
    Ok(())
}

/// Validate that every percentile lies in 0.0 - 100.0
pub fn validate_percentiles(percentiles: &[f64]) -> Result<()> {
    for &p in percentiles {
        if !(0.0..=100.0).contains(&p) {
            anyhow::bail!("Percentile {} is out of range (expected 0.0 - 100.0)", p);
        }
    }
    Ok(())
}

/// Get the number of CPU cores available
///
/// Uses `num_cpus`, which accounts for container limits and affinity.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}
