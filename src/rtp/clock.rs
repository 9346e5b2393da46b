/// RTP media clock
///
/// Maps the wrapping 32-bit RTP timestamp onto a local millisecond timeline.
/// The clock is anchored to a local instant by `synchronize`; the first
/// timestamp converted afterwards becomes the base. Rollover is handled by
/// extending each timestamp with its signed distance to the last one seen,
/// so there is never an absolute comparison across a wrap.

use tracing::trace;

/// Typical clock rates
pub mod clock_rates {
    /// G.711, G.726, G.729
    pub const AUDIO_8KHZ: u32 = 8000;
    /// G.722
    pub const AUDIO_16KHZ: u32 = 16000;
    /// Opus
    pub const AUDIO_48KHZ: u32 = 48000;
    /// Video
    pub const VIDEO_90KHZ: u32 = 90000;
}

#[derive(Debug, Clone, Default)]
pub struct RtpClock {
    /// Ticks per second; `None` until the media format is known
    clock_rate: Option<u32>,
    synchronized: bool,
    /// Local time the base timestamp maps to
    anchor_ms: i64,
    base_timestamp: Option<u32>,
    /// Highest timestamp seen, and its extended offset from the base
    last_timestamp: u32,
    last_extended: i64,
}

impl RtpClock {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate: (clock_rate > 0).then_some(clock_rate),
            ..Self::default()
        }
    }

    /// A clock whose format is not negotiated yet
    pub fn unconfigured() -> Self {
        Self::default()
    }

    pub fn set_clock_rate(&mut self, clock_rate: u32) {
        self.clock_rate = (clock_rate > 0).then_some(clock_rate);
    }

    pub fn clock_rate(&self) -> Option<u32> {
        self.clock_rate
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Anchor the clock at `initial_ms`. The next timestamp converted maps
    /// to exactly this instant.
    pub fn synchronize(&mut self, initial_ms: i64) {
        self.synchronized = true;
        self.anchor_ms = initial_ms;
        self.base_timestamp = None;
        self.last_timestamp = 0;
        self.last_extended = 0;
        trace!("RTP clock synchronized at {} ms", initial_ms);
    }

    /// Convert a media timestamp to local milliseconds.
    ///
    /// Before synchronization, or without a clock rate, this returns the
    /// anchor unchanged instead of failing.
    pub fn get_time(&mut self, timestamp: u32) -> i64 {
        let Some(rate) = self.clock_rate else {
            return self.anchor_ms;
        };
        if !self.synchronized {
            return self.anchor_ms;
        }

        let extended = match self.base_timestamp {
            None => {
                self.base_timestamp = Some(timestamp);
                self.last_timestamp = timestamp;
                self.last_extended = 0;
                0
            }
            Some(_) => {
                let delta = timestamp.wrapping_sub(self.last_timestamp) as i32 as i64;
                let extended = self.last_extended + delta;
                if delta > 0 {
                    self.last_timestamp = timestamp;
                    self.last_extended = extended;
                }
                extended
            }
        };

        self.anchor_ms + (extended * 1000).div_euclid(rate as i64)
    }

    /// Convert local milliseconds back to a media timestamp (mod 2^32).
    pub fn get_timestamp(&self, time_ms: i64) -> u32 {
        let Some(rate) = self.clock_rate else {
            return 0;
        };
        if !self.synchronized {
            return 0;
        }
        let ticks = ((time_ms - self.anchor_ms) * rate as i64).div_euclid(1000);
        self.base_timestamp.unwrap_or(0).wrapping_add(ticks as u32)
    }

    /// Forget anchor, synchronization and format
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
