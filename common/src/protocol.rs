//! JSON types served by the HTTP surface next to the image endpoint.

use serde::{Deserialize, Serialize};

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cameras: usize,
}

/// Snapshot of one camera's cache, breaker and lock state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatus {
    pub airport: String,
    pub cam: usize,
    pub name: String,
    pub kind: String,
    pub refresh_secs: u64,
    pub cached: bool,
    /// Age of the cached JPEG in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
    /// ISO-8601 timestamp of the cached JPEG.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub breaker: BreakerReport,
    pub refreshing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerReport {
    pub open: bool,
    pub failures: u32,
    pub backoff_remaining_secs: u64,
}

/// Result of an operator cache-clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub removed: usize,
}

/// Error body for the JSON endpoints (never used by the image endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncached_status_omits_age_fields() {
        let status = CameraStatus {
            airport: "kspb".into(),
            cam: 0,
            name: "Runway".into(),
            kind: "rtsp".into(),
            refresh_secs: 60,
            cached: false,
            age_secs: None,
            timestamp: None,
            breaker: BreakerReport {
                open: true,
                failures: 3,
                backoff_remaining_secs: 240,
            },
            refreshing: false,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("age_secs").is_none());
        assert!(json.get("timestamp").is_none());
        assert_eq!(json["breaker"]["failures"], 3);

        let back: CameraStatus = serde_json::from_value(json).unwrap();
        assert!(back.age_secs.is_none());
    }
}
