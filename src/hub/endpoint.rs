//! Per-endpoint hub connection state: health scoring, error
//! classification, reconnect bookkeeping.

use crate::config::schema::HubOptions;
use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Upper bound on the retained reconnect history.
pub const RECONNECT_HISTORY_CAP: usize = 10;

pub const HEALTH_MAX: i32 = 100;
pub const HEALTH_MIN: i32 = 0;

// ── Error classification ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorClass {
    Network,
    Authentication,
    Server,
    Timeout,
    Unknown,
}

impl ErrorClass {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Authentication => "AUTHENTICATION",
            Self::Server => "SERVER",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Map an error message onto a recovery class by keyword search.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("timeout") {
        return ErrorClass::Timeout;
    }
    if ["econnrefused", "enotfound", "network", "connection refused"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return ErrorClass::Network;
    }
    if ["auth", "unauthorized", "forbidden", "401", "403"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return ErrorClass::Authentication;
    }
    if ["500", "502", "503", "504", "server"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return ErrorClass::Server;
    }
    ErrorClass::Unknown
}

// ── Connection state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconnectRecord {
    pub at: DateTime<Utc>,
    pub attempt: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything the manager tracks for one hub endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub endpoint_url: String,
    pub state: EndpointState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    pub reconnect_attempts: u32,
    pub health_score: i32,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_reconnect_at: Option<DateTime<Utc>>,
    pub reconnect_delay_ms: u64,
    pub reconnect_history: VecDeque<ReconnectRecord>,
}

impl EndpointStatus {
    pub fn new(url: &str) -> Self {
        Self {
            endpoint_url: url.to_string(),
            state: EndpointState::Disconnected,
            connected_at: None,
            last_error: None,
            error_class: None,
            reconnect_attempts: 0,
            health_score: HEALTH_MAX,
            consecutive_failures: 0,
            total_requests: 0,
            successful_requests: 0,
            last_success_at: None,
            next_reconnect_at: None,
            reconnect_delay_ms: 0,
            reconnect_history: VecDeque::new(),
        }
    }

    /// Apply a successful probe with the observed latency.
    pub fn record_success(&mut self, latency_ms: u64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(Utc::now());

        let gain = match latency_ms {
            0..=99 => 10,
            100..=499 => 7,
            500..=999 => 5,
            _ => 2,
        };
        self.health_score += gain;
        self.apply_ratio_adjustment();
        self.clamp_score();
    }

    /// Apply a failed probe or connection drop.
    pub fn record_failure(&mut self, error: &str) {
        self.total_requests += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        self.error_class = Some(classify_error(error));

        let penalty = if self.consecutive_failures >= 5 {
            30
        } else if self.consecutive_failures >= 3 {
            20
        } else {
            15
        };
        self.health_score -= penalty;
        self.apply_ratio_adjustment();
        self.clamp_score();
    }

    fn apply_ratio_adjustment(&mut self) {
        if self.total_requests == 0 {
            return;
        }
        let ratio = self.successful_requests as f64 / self.total_requests as f64;
        if ratio < 0.5 {
            self.health_score -= 10;
        } else if ratio > 0.9 {
            self.health_score += 5;
        }
    }

    fn clamp_score(&mut self) {
        self.health_score = self.health_score.clamp(HEALTH_MIN, HEALTH_MAX);
    }

    /// Append one reconnect attempt, holding the history at the cap.
    pub fn push_reconnect_record(&mut self, attempt: u32, success: bool, error: Option<String>) {
        self.reconnect_history.push_back(ReconnectRecord {
            at: Utc::now(),
            attempt,
            success,
            error,
        });
        while self.reconnect_history.len() > RECONNECT_HISTORY_CAP {
            self.reconnect_history.pop_front();
        }
    }

    /// Counters reset on a successful (re)connect. Health score is left to
    /// the scoring rules alone.
    pub fn mark_connected(&mut self) {
        self.state = EndpointState::Connected;
        self.connected_at = Some(Utc::now());
        self.last_error = None;
        self.error_class = None;
        self.consecutive_failures = 0;
        self.reconnect_attempts = 0;
        self.reconnect_delay_ms = 0;
        self.next_reconnect_at = None;
    }

    /// Whether another reconnect may be scheduled.
    pub fn may_reconnect(&self, options: &HubOptions) -> bool {
        if self.reconnect_attempts >= options.max_reconnect_attempts {
            return false;
        }
        if self.error_class == Some(ErrorClass::Authentication) && self.reconnect_attempts >= 3 {
            return false;
        }
        if self.consecutive_failures >= 10 {
            return false;
        }
        true
    }
}

// ── Option bounds ──────────────────────────────────────────────────────────

/// Bounds applied on hot reload; out-of-range options are rejected rather
/// than silently clamped.
pub fn validate_options(options: &HubOptions) -> Result<()> {
    fn check(name: &str, value: u64, range: std::ops::RangeInclusive<u64>) -> Result<()> {
        if range.contains(&value) {
            Ok(())
        } else {
            Err(GatewayError::Validation(format!(
                "hub option `{name}` = {value} out of range {}..={}",
                range.start(),
                range.end()
            )))
        }
    }

    check("reconnect_interval_ms", options.reconnect_interval_ms, 100..=600_000)?;
    check(
        "max_reconnect_attempts",
        options.max_reconnect_attempts as u64,
        0..=100,
    )?;
    check(
        "connection_timeout_ms",
        options.connection_timeout_ms,
        100..=120_000,
    )?;
    check(
        "health_check_interval_ms",
        options.health_check_interval_ms,
        1_000..=3_600_000,
    )?;
    check(
        "connection_idle_timeout_ms",
        options.connection_idle_timeout_ms,
        1_000..=3_600_000,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_keyword_table() {
        assert_eq!(classify_error("connect timeout after 10s"), ErrorClass::Timeout);
        assert_eq!(classify_error("ECONNREFUSED 127.0.0.1"), ErrorClass::Network);
        assert_eq!(classify_error("getaddrinfo ENOTFOUND hub"), ErrorClass::Network);
        assert_eq!(classify_error("Connection Refused by peer"), ErrorClass::Network);
        assert_eq!(classify_error("401 Unauthorized"), ErrorClass::Authentication);
        assert_eq!(classify_error("forbidden by policy"), ErrorClass::Authentication);
        assert_eq!(classify_error("HTTP 502 Bad Gateway"), ErrorClass::Server);
        assert_eq!(classify_error("internal server error"), ErrorClass::Server);
        assert_eq!(classify_error("something odd happened"), ErrorClass::Unknown);
    }

    #[test]
    fn classification_priority_timeout_first() {
        // "timeout" wins even when other keywords are present.
        assert_eq!(
            classify_error("network timeout talking to server"),
            ErrorClass::Timeout
        );
    }

    #[test]
    fn success_gain_depends_on_latency_bucket() {
        let gains: Vec<i32> = [50, 200, 700, 2_000]
            .iter()
            .map(|latency| {
                let mut status = EndpointStatus::new("wss://hub");
                status.health_score = 50;
                // A fresh success ratio of 1.0 adds the +5 bonus on top.
                status.record_success(*latency);
                status.health_score - 50 - 5
            })
            .collect();
        assert_eq!(gains, vec![10, 7, 5, 2]);
    }

    #[test]
    fn score_is_clamped_to_bounds() {
        let mut status = EndpointStatus::new("wss://hub");
        status.record_success(10);
        assert_eq!(status.health_score, HEALTH_MAX);

        for _ in 0..12 {
            status.record_failure("boom");
        }
        assert_eq!(status.health_score, HEALTH_MIN);
    }

    #[test]
    fn failure_penalty_escalates_with_consecutive_failures() {
        let mut status = EndpointStatus::new("wss://hub");
        status.total_requests = 100;
        status.successful_requests = 80; // ratio 0.8: no adjustment

        status.record_failure("err");
        assert_eq!(status.health_score, 100 - 15);
        status.record_failure("err");
        assert_eq!(status.health_score, 100 - 15 - 15);
        status.record_failure("err");
        assert_eq!(status.health_score, 100 - 15 - 15 - 20);
        status.record_failure("err");
        status.record_failure("err");
        // Fifth consecutive failure costs 30.
        assert_eq!(status.health_score, 100 - 15 - 15 - 20 - 20 - 30);
    }

    #[test]
    fn low_success_ratio_applies_extra_penalty() {
        let mut status = EndpointStatus::new("wss://hub");
        status.total_requests = 9;
        status.successful_requests = 1; // ratio well under 0.5
        status.record_failure("err");
        assert_eq!(status.health_score, 100 - 15 - 10);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut status = EndpointStatus::new("wss://hub");
        status.record_failure("one");
        status.record_failure("two");
        assert_eq!(status.consecutive_failures, 2);

        status.record_success(50);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_success_at.is_some());
    }

    #[test]
    fn reconnect_history_is_capped_at_ten() {
        let mut status = EndpointStatus::new("wss://hub");
        for attempt in 1..=25 {
            status.push_reconnect_record(attempt, false, Some("down".into()));
            assert!(status.reconnect_history.len() <= RECONNECT_HISTORY_CAP);
        }
        assert_eq!(status.reconnect_history.len(), RECONNECT_HISTORY_CAP);
        // Oldest entries were dropped first.
        assert_eq!(status.reconnect_history.front().unwrap().attempt, 16);
        assert_eq!(status.reconnect_history.back().unwrap().attempt, 25);
    }

    #[test]
    fn mark_connected_resets_counters_not_score() {
        let mut status = EndpointStatus::new("wss://hub");
        status.record_failure("down");
        status.reconnect_attempts = 2;
        status.reconnect_delay_ms = 5_000;
        let score = status.health_score;

        status.mark_connected();
        assert_eq!(status.state, EndpointState::Connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.reconnect_delay_ms, 0);
        assert!(status.last_error.is_none());
        assert_eq!(status.health_score, score);
    }

    #[test]
    fn reconnect_stops_at_attempt_cap() {
        let options = HubOptions::default(); // max 3
        let mut status = EndpointStatus::new("wss://hub");
        assert!(status.may_reconnect(&options));
        status.reconnect_attempts = 3;
        assert!(!status.may_reconnect(&options));
    }

    #[test]
    fn reconnect_stops_for_persistent_auth_failures() {
        let mut options = HubOptions::default();
        options.max_reconnect_attempts = 10;
        let mut status = EndpointStatus::new("wss://hub");
        status.record_failure("401 unauthorized");
        status.reconnect_attempts = 3;
        assert!(!status.may_reconnect(&options));

        status.error_class = Some(ErrorClass::Network);
        assert!(status.may_reconnect(&options));
    }

    #[test]
    fn reconnect_stops_after_ten_consecutive_failures() {
        let mut options = HubOptions::default();
        options.max_reconnect_attempts = 100;
        let mut status = EndpointStatus::new("wss://hub");
        status.consecutive_failures = 10;
        assert!(!status.may_reconnect(&options));
    }

    #[test]
    fn option_bounds_are_enforced() {
        assert!(validate_options(&HubOptions::default()).is_ok());

        let mut options = HubOptions::default();
        options.reconnect_interval_ms = 10;
        assert!(validate_options(&options).is_err());

        let mut options = HubOptions::default();
        options.connection_timeout_ms = 500_000;
        assert!(validate_options(&options).is_err());

        let mut options = HubOptions::default();
        options.health_check_interval_ms = 10;
        assert!(validate_options(&options).is_err());
    }
}
