/// round trip time assumed before the first sample arrives, in ms
pub const INITIAL_ROUND_TRIP_TIME: i32 = 300;

/// Smoothed round trip time and variance estimate (in milliseconds), updated from acks or pings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoundTrip {
    pub round_trip_time: i32,
    pub round_trip_time_variance: i32,
    pub last_round_trip_time: i32,
    pub lowest_round_trip_time: i32,
    pub highest_round_trip_time_variance: i32,
}

impl Default for RoundTrip {
    fn default() -> Self {
        RoundTrip::new()
    }
}

impl RoundTrip {
    pub fn new() -> RoundTrip {
        RoundTrip {
            round_trip_time: INITIAL_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            last_round_trip_time: 0,
            lowest_round_trip_time: i32::MAX,
            highest_round_trip_time_variance: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = RoundTrip::new();
    }

    pub fn update(&mut self, sample: i32) {
        if sample < 0 {
            return;
        }

        self.last_round_trip_time = sample;
        self.round_trip_time_variance -= self.round_trip_time_variance / 4;

        if sample >= self.round_trip_time {
            self.round_trip_time += (sample - self.round_trip_time) / 8;
            self.round_trip_time_variance += (sample - self.round_trip_time) / 4;
        }
        else {
            self.round_trip_time += (sample - self.round_trip_time) / 8;
            self.round_trip_time_variance -= (sample - self.round_trip_time) / 4;
        }

        self.lowest_round_trip_time = self.lowest_round_trip_time.min(self.round_trip_time);
        self.highest_round_trip_time_variance = self.highest_round_trip_time_variance.max(self.round_trip_time_variance);
    }

    /// the retransmission timeout for a command sent for the first time
    pub fn retransmission_timeout(&self) -> i32 {
        self.round_trip_time + 4 * self.round_trip_time_variance
    }
}
