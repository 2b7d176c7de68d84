use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownPhase {
    Idle,
    Active,
    Closing,
}

impl CooldownPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Closing => "closing",
        }
    }
}

/// Bookkeeping for the segment that is currently open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentState {
    pub start: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub resets_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CooldownError {
    #[error("cooldown duration must be positive, got {0}ms")]
    InvalidDuration(i64),
    #[error("no segment is open")]
    NoOpenSegment,
}

/// Idle-timeout state machine deciding when a burst of activity becomes a
/// closed segment: `Idle -> Active -> Closing -> Idle`.
#[derive(Debug, Clone)]
pub struct CooldownTimer {
    cooldown: Duration,
    phase: CooldownPhase,
    segment: Option<SegmentState>,
}

impl CooldownTimer {
    pub fn new(cooldown: Duration) -> Result<Self, CooldownError> {
        if cooldown <= Duration::zero() {
            return Err(CooldownError::InvalidDuration(cooldown.num_milliseconds()));
        }
        Ok(Self {
            cooldown,
            phase: CooldownPhase::Idle,
            segment: None,
        })
    }

    pub fn from_secs_f64(secs: f64) -> Result<Self, CooldownError> {
        match crate::duration_from_secs_f64(secs) {
            Some(duration) => Self::new(duration),
            None => Err(CooldownError::InvalidDuration(
                if secs.is_finite() { (secs * 1_000.0) as i64 } else { 0 },
            )),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn phase(&self) -> CooldownPhase {
        self.phase
    }

    pub fn segment(&self) -> Option<&SegmentState> {
        self.segment.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.segment.is_some()
    }

    /// Opens a segment when idle, otherwise extends the open one. Returns
    /// `true` only when a new segment was opened.
    pub fn on_resetting_event(&mut self, ts: DateTime<Utc>) -> bool {
        match self.segment.as_mut() {
            None => {
                self.segment = Some(SegmentState {
                    start: ts,
                    last: ts,
                    resets_count: 0,
                });
                self.phase = CooldownPhase::Active;
                true
            }
            Some(state) => {
                if ts > state.last {
                    state.last = ts;
                }
                state.resets_count = state.resets_count.saturating_add(1);
                self.phase = CooldownPhase::Active;
                false
            }
        }
    }

    /// Moves the segment end forward without restarting the idle clock's
    /// phase or touching the reset count. Ignored while idle.
    pub fn on_non_resetting_event(&mut self, ts: DateTime<Utc>) {
        if self.phase == CooldownPhase::Idle {
            return;
        }
        if let Some(state) = self.segment.as_mut() {
            if ts > state.last {
                state.last = ts;
            }
        }
    }

    pub fn check_expiration(&mut self, now: DateTime<Utc>) -> bool {
        if self.phase != CooldownPhase::Active {
            return false;
        }
        let Some(state) = self.segment.as_ref() else {
            return false;
        };
        if now - state.last >= self.cooldown {
            self.phase = CooldownPhase::Closing;
            return true;
        }
        false
    }

    pub fn close_segment(&mut self) -> Result<SegmentState, CooldownError> {
        let state = self.segment.take().ok_or(CooldownError::NoOpenSegment)?;
        self.phase = CooldownPhase::Idle;
        Ok(state)
    }

    pub fn time_until_expiration(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.phase != CooldownPhase::Active {
            return None;
        }
        let state = self.segment.as_ref()?;
        let remaining = self.cooldown - (now - state.last);
        Some(remaining.max(Duration::zero()))
    }
}
