use serde::{Deserialize, Serialize};

/// A counted visit: who, and when (Unix seconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub visitor_id: String,
    pub visited_at: i64,
}

impl VisitRecord {
    pub fn new(visitor_id: impl Into<String>, visited_at: i64) -> Self {
        Self {
            visitor_id: visitor_id.into(),
            visited_at,
        }
    }

    /// A record is live while `now - visited_at < window`
    pub fn is_live(&self, now: i64, window_secs: i64) -> bool {
        now.saturating_sub(self.visited_at) < window_secs
    }

    /// `identifier|unix_timestamp` followed by a newline
    pub fn to_log_line(&self) -> String {
        format!("{}|{}\n", self.visitor_id, self.visited_at)
    }

    /// Parse one visit log line. Returns `None` for anything malformed.
    ///
    /// The timestamp is taken after the last `|`, so identifiers may
    /// themselves contain the separator.
    pub fn parse_log_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (visitor_id, timestamp) = line.rsplit_once('|')?;
        if visitor_id.is_empty() {
            return None;
        }
        let visited_at = timestamp.trim().parse::<i64>().ok()?;
        Some(Self::new(visitor_id, visited_at))
    }
}

/// Summary of the visit log, used by diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitLogStats {
    pub total: u64,
    pub live: u64,
    pub malformed: u64,
}

/// Body of `GET /visit-count`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitCountResponse {
    pub count: u64,
    /// Present (and true) when storage failed and `count` is the last known value
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

impl VisitCountResponse {
    pub fn fresh(count: u64) -> Self {
        Self {
            count,
            stale: false,
        }
    }

    pub fn stale(count: u64) -> Self {
        Self { count, stale: true }
    }
}
