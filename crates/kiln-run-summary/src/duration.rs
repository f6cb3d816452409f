use std::fmt;

use chrono::{DateTime, Duration, Local, SubsecRound};

/// Wall-clock time of a run, rendered the way humans read build times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KilnDuration(Duration);

impl KilnDuration {
    pub fn new(start_time: &DateTime<Local>, end_time: &DateTime<Local>) -> Self {
        KilnDuration(
            end_time
                .trunc_subsecs(3)
                .signed_duration_since(start_time.trunc_subsecs(3)),
        )
    }

    pub fn num_milliseconds(&self) -> i64 {
        self.0.num_milliseconds()
    }
}

impl From<Duration> for KilnDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl fmt::Display for KilnDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let duration = &self.0;

        if duration.num_hours() > 0 {
            write!(
                f,
                "{}h{}m{}s",
                duration.num_hours(),
                duration.num_minutes() % 60,
                duration.num_seconds() % 60
            )
        } else if duration.num_minutes() > 0 {
            write!(
                f,
                "{}m{}s",
                duration.num_minutes(),
                duration.num_seconds() % 60
            )
        } else if duration.num_seconds() > 0 {
            write!(f, "{}s", duration.num_seconds())
        } else {
            write!(f, "{}ms", duration.num_milliseconds())
        }
    }
}
