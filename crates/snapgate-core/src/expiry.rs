use chrono::Utc;

/// Largest integer an IEEE-754 double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCheck {
    Valid,
    Malformed,
    Expired,
}

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.0
    }
}

/// Expired when `expireAt <= now`; equality counts as expired.
pub fn check_expiry(expire_at_raw: &str, now_millis: i64) -> ExpiryCheck {
    check_expiry_with_skew(expire_at_raw, now_millis, 0)
}

/// Same as [`check_expiry`], extending the window by `skew_ms`.
pub fn check_expiry_with_skew(expire_at_raw: &str, now_millis: i64, skew_ms: u64) -> ExpiryCheck {
    let Some(expire_at) = parse_safe_integer(expire_at_raw) else {
        return ExpiryCheck::Malformed;
    };

    let skew = i64::try_from(skew_ms).unwrap_or(i64::MAX);
    if expire_at.saturating_add(skew) <= now_millis {
        ExpiryCheck::Expired
    } else {
        ExpiryCheck::Valid
    }
}

fn parse_safe_integer(raw: &str) -> Option<i64> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i64 = raw.parse().ok()?;
    (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER)
        .contains(&value)
        .then_some(value)
}
