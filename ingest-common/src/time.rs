use chrono::{DateTime, Utc};

pub trait TimeSource {
    fn current_time(&self) -> DateTime<Utc>;

    // Return an RFC 3339 timestamp
    fn current_timestamp(&self) -> String {
        self.current_time()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant, for tests.
#[derive(Clone)]
pub struct FixedTime {
    pub time: DateTime<Utc>,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> DateTime<Utc> {
        self.time
    }
}
