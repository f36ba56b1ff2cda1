//! Wall-clock helpers. All persisted timestamps are unix epoch seconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix epoch in seconds.
pub fn epoch_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}

/// Unix epoch seconds of a filesystem timestamp.
pub fn system_time_to_epoch(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_sane() {
        let now = epoch_i64();
        // 2020-01-01 .. 2100-01-01
        assert!(now > 1_577_836_800);
        assert!(now < 4_102_444_800);
    }
}
