use chrono::Utc;

/// Current time in milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_tracks_the_wall_clock() {
        let before = Utc::now().timestamp_millis();
        let now = now_ms();
        assert!(now >= before);
        assert!(now - before < 1_000);
    }
}
