//! Frequency-weighted cyclic polling order.

use crate::error::LinkError;

/// Upper bound on the built cycle; frequency ratios beyond this are a
/// configuration mistake rather than a schedule.
pub const MAX_CYCLE_LEN: usize = 65_536;

/// One poll request as registered by a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct PollRequest {
    pub key: String,
    pub payload: Vec<u8>,
    /// Sends per second.
    pub frequency: f64,
    /// Response rule that answers this poll, if only one may.
    pub expected_response: Option<String>,
}

impl PollRequest {
    pub fn new(
        key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        frequency: f64,
    ) -> Result<Self, LinkError> {
        let key = key.into();
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(LinkError::Config(format!(
                "poll {key}: frequency must be positive, got {frequency}"
            )));
        }
        Ok(Self {
            key,
            payload: payload.into(),
            frequency,
            expected_response: None,
        })
    }

    #[must_use]
    pub fn with_expected_response(mut self, key: impl Into<String>) -> Self {
        self.expected_response = Some(key.into());
        self
    }
}

/// Deterministic cyclic schedule. Each key appears `round(f / min(f))` times per
/// cycle, and slots are spread by emitting one slot per key per pass.
#[derive(Debug, Default)]
pub struct RequestScheduler {
    requests: Vec<PollRequest>,
    cycle: Vec<usize>,
    cursor: usize,
}

impl RequestScheduler {
    pub fn new(requests: Vec<PollRequest>) -> Result<Self, LinkError> {
        if requests.is_empty() {
            return Ok(Self::default());
        }
        let min = requests
            .iter()
            .map(|r| r.frequency)
            .fold(f64::INFINITY, f64::min);
        let multiplier = 1.0 / min;

        let mut remaining: Vec<usize> = Vec::with_capacity(requests.len());
        for r in &requests {
            let weight = (r.frequency * multiplier).round();
            if !weight.is_finite() || weight > MAX_CYCLE_LEN as f64 {
                return Err(LinkError::Config(format!(
                    "poll {}: frequency ratio too large to schedule",
                    r.key
                )));
            }
            // the minimum-frequency entry computes to exactly 1; guard rounding anyway
            remaining.push((weight as usize).max(1));
        }
        let total: usize = remaining.iter().sum();
        if total > MAX_CYCLE_LEN {
            return Err(LinkError::Config(format!(
                "poll schedule too long: {total} slots (max {MAX_CYCLE_LEN})"
            )));
        }

        let mut cycle = Vec::with_capacity(total);
        while cycle.len() < total {
            for (idx, left) in remaining.iter_mut().enumerate() {
                if *left > 0 {
                    *left -= 1;
                    cycle.push(idx);
                }
            }
        }
        Ok(Self {
            requests,
            cycle,
            cursor: 0,
        })
    }

    /// Next scheduled poll, walking the cycle circularly. `None` when nothing
    /// was registered.
    pub fn next_request(&mut self) -> Option<&PollRequest> {
        if self.cycle.is_empty() {
            return None;
        }
        let idx = self.cycle[self.cursor % self.cycle.len()];
        self.cursor = (self.cursor + 1) % self.cycle.len();
        self.requests.get(idx)
    }

    /// Keys of one full cycle, in order.
    #[must_use]
    pub fn cycle_keys(&self) -> Vec<&str> {
        self.cycle
            .iter()
            .map(|&i| self.requests[i].key.as_str())
            .collect()
    }

    #[must_use]
    pub fn cycle_len(&self) -> usize {
        self.cycle.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cycle.is_empty()
    }
}
