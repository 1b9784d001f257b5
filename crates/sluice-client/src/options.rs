//! Client options.
//!
//! Every options struct deserializes from a configuration document with
//! missing fields taken from `Default`. Durations are in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default largest chunk of body bytes staged before a transfer is sent.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Credit top-up rule for a receiver with a credit window.
///
/// Credit is only topped up once the current credit has fallen to
/// `replenish_threshold` of the window and the potential prefetch (credit
/// plus deliveries that arrived but were not yet received) is at most
/// `prefetch_ceiling` of the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditWindowPolicy {
    pub replenish_threshold: f64,
    pub prefetch_ceiling: f64,
}

impl Default for CreditWindowPolicy {
    fn default() -> Self {
        Self {
            replenish_threshold: 0.5,
            prefetch_ceiling: 0.7,
        }
    }
}

impl CreditWindowPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fraction of the window credit must fall to before a top-up
    pub fn replenish_threshold(mut self, fraction: f64) -> Self {
        self.replenish_threshold = fraction.clamp(0.0, 1.0);
        self
    }

    /// Set the fraction of the window potential prefetch must stay under
    pub fn prefetch_ceiling(mut self, fraction: f64) -> Self {
        self.prefetch_ceiling = fraction.clamp(0.0, 1.0);
        self
    }

    /// Credit to add, if any, for a receiver holding `credit` with
    /// `unclaimed` deliveries waiting.
    pub fn top_up(&self, window: u32, credit: u32, unclaimed: usize) -> Option<u32> {
        if window == 0 {
            return None;
        }
        let window_f = f64::from(window);
        if f64::from(credit) > window_f * self.replenish_threshold {
            return None;
        }
        let prefetch = u64::from(credit) + unclaimed as u64;
        if prefetch as f64 > window_f * self.prefetch_ceiling {
            return None;
        }
        let additional = u64::from(window).saturating_sub(prefetch);
        u32::try_from(additional).ok().filter(|&extra| extra > 0)
    }
}

/// Options for a stream sender link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSenderOptions {
    /// Link name; generated from the address when absent
    pub link_name: Option<String>,
    /// Body bytes staged before a non-final transfer is sent. Zero uses the
    /// peer's max frame size, capped at [`DEFAULT_WRITE_BUFFER_SIZE`].
    pub write_buffer_size: usize,
    /// Fail a write that waits this long for credit
    pub send_timeout_ms: Option<u64>,
    /// Wait this long for the peer's Attach
    pub open_timeout_ms: Option<u64>,
    /// Settle locally once the peer settles
    pub auto_settle: bool,
}

impl Default for StreamSenderOptions {
    fn default() -> Self {
        Self {
            link_name: None,
            write_buffer_size: 0,
            send_timeout_ms: None,
            open_timeout_ms: Some(60_000),
            auto_settle: true,
        }
    }
}

impl StreamSenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn link_name(mut self, name: impl Into<String>) -> Self {
        self.link_name = Some(name.into());
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn auto_settle(mut self, enabled: bool) -> Self {
        self.auto_settle = enabled;
        self
    }

    pub(crate) fn send_timeout_duration(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn open_timeout_duration(&self) -> Option<Duration> {
        self.open_timeout_ms.map(Duration::from_millis)
    }

    /// Write buffer size once the peer's max frame size is known.
    pub(crate) fn effective_write_buffer_size(&self, remote_max_frame_size: u32) -> usize {
        if self.write_buffer_size > 0 {
            return self.write_buffer_size;
        }
        usize::try_from(remote_max_frame_size)
            .unwrap_or(DEFAULT_WRITE_BUFFER_SIZE)
            .min(DEFAULT_WRITE_BUFFER_SIZE)
    }
}

/// Options for a stream receiver link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamReceiverOptions {
    /// Link name; generated from the address when absent
    pub link_name: Option<String>,
    /// Credit kept outstanding automatically. Zero means the application
    /// grants credit itself with `add_credit`.
    pub credit_window: u32,
    pub credit_policy: CreditWindowPolicy,
    /// Fail a drain the peer has not answered after this long
    pub drain_timeout_ms: u64,
    /// Wait this long for the peer's Attach
    pub open_timeout_ms: Option<u64>,
}

impl Default for StreamReceiverOptions {
    fn default() -> Self {
        Self {
            link_name: None,
            credit_window: 10,
            credit_policy: CreditWindowPolicy::default(),
            drain_timeout_ms: 60_000,
            open_timeout_ms: Some(60_000),
        }
    }
}

impl StreamReceiverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn link_name(mut self, name: impl Into<String>) -> Self {
        self.link_name = Some(name.into());
        self
    }

    pub fn credit_window(mut self, window: u32) -> Self {
        self.credit_window = window;
        self
    }

    pub fn credit_policy(mut self, policy: CreditWindowPolicy) -> Self {
        self.credit_policy = policy;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = millis(timeout);
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout_ms = Some(millis(timeout));
        self
    }

    pub(crate) fn drain_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub(crate) fn open_timeout_duration(&self) -> Option<Duration> {
        self.open_timeout_ms.map(Duration::from_millis)
    }
}

/// Options for the body of one streamed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputStreamOptions {
    /// Total body length when known up front. Closing the body short of it
    /// aborts the message.
    pub body_length: Option<usize>,
    /// Complete the message when the body is closed. When false, footer
    /// sections may still be set and `complete` must be called.
    pub complete_send_on_close: bool,
}

impl Default for OutputStreamOptions {
    fn default() -> Self {
        Self {
            body_length: None,
            complete_send_on_close: true,
        }
    }
}

impl OutputStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body_length(mut self, length: usize) -> Self {
        self.body_length = Some(length);
        self
    }

    pub fn complete_send_on_close(mut self, enabled: bool) -> Self {
        self.complete_send_on_close = enabled;
        self
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = CreditWindowPolicy::default();
        assert_eq!(policy.replenish_threshold, 0.5);
        assert_eq!(policy.prefetch_ceiling, 0.7);
    }

    #[test]
    fn test_no_top_up_above_threshold() {
        let policy = CreditWindowPolicy::default();
        assert_eq!(policy.top_up(10, 6, 0), None);
    }

    #[test]
    fn test_top_up_restores_window() {
        let policy = CreditWindowPolicy::default();
        assert_eq!(policy.top_up(10, 5, 0), Some(5));
        assert_eq!(policy.top_up(10, 0, 3), Some(7));
    }

    #[test]
    fn test_unclaimed_deliveries_hold_back_credit() {
        let policy = CreditWindowPolicy::default();
        // 4 credit + 4 waiting is 80% of the window, over the ceiling.
        assert_eq!(policy.top_up(10, 4, 4), None);
        assert_eq!(policy.top_up(10, 4, 3), Some(3));
    }

    #[test]
    fn test_zero_window_never_tops_up() {
        assert_eq!(CreditWindowPolicy::default().top_up(0, 0, 0), None);
    }

    #[test]
    fn test_custom_thresholds() {
        let policy = CreditWindowPolicy::new()
            .replenish_threshold(0.9)
            .prefetch_ceiling(1.5);
        assert_eq!(policy.prefetch_ceiling, 1.0);
        assert_eq!(policy.top_up(100, 90, 10), None);
        assert_eq!(policy.top_up(100, 90, 0), Some(10));
    }

    #[test]
    fn test_receiver_options_from_json() {
        let options = StreamReceiverOptions::from_json(
            r#"{ "credit_window": 100, "drain_timeout_ms": 250,
                 "credit_policy": { "replenish_threshold": 0.25 } }"#,
        )
        .unwrap();
        assert_eq!(options.credit_window, 100);
        assert_eq!(options.drain_timeout_duration(), Duration::from_millis(250));
        assert_eq!(options.credit_policy.replenish_threshold, 0.25);
        assert_eq!(options.credit_policy.prefetch_ceiling, 0.7);
        assert_eq!(options.open_timeout_ms, Some(60_000));
    }

    #[test]
    fn test_sender_write_buffer_follows_frame_size() {
        let options = StreamSenderOptions::default();
        assert_eq!(options.effective_write_buffer_size(16384), 16384);
        assert_eq!(
            options.effective_write_buffer_size(u32::MAX),
            DEFAULT_WRITE_BUFFER_SIZE
        );
        let options = options.write_buffer_size(100);
        assert_eq!(options.effective_write_buffer_size(16384), 100);
    }

    #[test]
    fn test_output_stream_options_round_trip_json() {
        let options = OutputStreamOptions::new()
            .body_length(8192)
            .complete_send_on_close(false);
        let json = serde_json::to_string(&options).unwrap();
        let parsed: OutputStreamOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, options);
    }

    proptest::proptest! {
        #[test]
        fn test_top_up_stays_within_window(
            window in 0u32..10_000,
            credit in 0u32..10_000,
            unclaimed in 0usize..10_000,
        ) {
            let policy = CreditWindowPolicy::default();
            if let Some(added) = policy.top_up(window, credit, unclaimed) {
                proptest::prop_assert!(added > 0);
                let prefetch = u64::from(credit) + unclaimed as u64;
                proptest::prop_assert!(prefetch + u64::from(added) <= u64::from(window));
                proptest::prop_assert!(f64::from(credit) <= f64::from(window) * policy.replenish_threshold);
            }
        }
    }
}
