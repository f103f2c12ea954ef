/// Utility functions and helpers
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, wall_clock_millis(), random)
}

/// Milliseconds since the Unix epoch, zero if the clock is before it
pub fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Database type from a connection URL: the scheme, lowercased, without a `jdbc:` prefix.
///
/// `jdbc:mysql://db:3306/app` and `mysql://db/app` both yield `mysql`.
pub fn database_type_of(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let without_prefix = trimmed
        .get(..5)
        .filter(|prefix| prefix.eq_ignore_ascii_case("jdbc:"))
        .map(|_| &trimmed[5..])
        .unwrap_or(trimmed);

    let scheme = without_prefix.split(':').next()?;
    if scheme.is_empty() || scheme.len() == without_prefix.len() {
        return None;
    }
    if !scheme
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
    {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", millis)
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// One point in time, kept both on the monotonic clock and as wall-clock millis
#[derive(Debug, Clone, Copy)]
pub struct Stamp {
    pub instant: Instant,
    pub wall_millis: u64,
}

impl Stamp {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall_millis: wall_clock_millis(),
        }
    }
}

/// Before/after pair around one lifecycle step
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing {
    before: Option<Stamp>,
    after: Option<Stamp>,
}

impl Timing {
    /// Start a new measurement, discarding any previous one
    pub fn begin(&mut self) {
        self.before = Some(Stamp::now());
        self.after = None;
    }

    pub fn end(&mut self) {
        self.after = Some(Stamp::now());
    }

    pub fn before(&self) -> Option<Stamp> {
        self.before
    }

    pub fn after(&self) -> Option<Stamp> {
        self.after
    }

    /// Monotonic time between `begin` and `end`, if both happened
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.before, self.after) {
            (Some(before), Some(after)) => Some(after.instant.saturating_duration_since(before.instant)),
            _ => None,
        }
    }
}
