//! Telefab time types.
//!
//! Both types are internally i64 nanoseconds, matching their wire
//! serialization. Absolute times count from the unix epoch.

/// An absolute point in time, i64 nanoseconds from the unix epoch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Construct a new timestamp of "now".
    pub fn now() -> Self {
        std::time::SystemTime::now().into()
    }

    /// Construct a timestamp from i64 nanoseconds since unix epoch.
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Get the i64 nanoseconds since unix epoch.
    pub fn as_nanos(&self) -> i64 {
        self.0
    }
}

impl std::ops::Add<std::time::Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: std::time::Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_nanos() as i64))
    }
}

impl std::ops::Add<Timespan> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timespan) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_nanos()))
    }
}

impl std::ops::Sub for Timestamp {
    type Output = Timespan;

    fn sub(self, rhs: Self) -> Self::Output {
        Timespan::from_nanos(self.0.saturating_sub(rhs.0))
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(t: std::time::SystemTime) -> Self {
        match t.duration_since(std::time::SystemTime::UNIX_EPOCH) {
            Ok(d) => Self(d.as_nanos() as i64),
            Err(e) => Self(-(e.duration().as_nanos() as i64)),
        }
    }
}

/// A signed span of time, i64 nanoseconds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timespan(i64);

impl Timespan {
    /// Construct a timespan from i64 nanoseconds.
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Get the i64 nanoseconds of this span.
    pub fn as_nanos(&self) -> i64 {
        self.0
    }
}

impl From<std::time::Duration> for Timespan {
    fn from(d: std::time::Duration) -> Self {
        Self(d.as_nanos() as i64)
    }
}
