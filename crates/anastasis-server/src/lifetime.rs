//! Year arithmetic for paid storage. Charging rounds up in 365-day
//! years (what clients compute with); granting uses 52 weeks per year
//! plus a single week of grace, so the seconds that pass between a
//! payment and our check never strand a client just short of a year.

use anastasis_core::constants::{
    GRANTED_YEAR_SECONDS, LIFETIME_GRACE_SECONDS, SECONDS_PER_YEAR,
};
use anastasis_core::Timestamp;

/// When storage should end if the client buys `years` from `now`.
pub fn desired_until(now: Timestamp, years: u32) -> Timestamp {
    now + i64::from(years) * SECONDS_PER_YEAR
}

/// Full years the client still has to pay to reach `desired` given
/// coverage until `paid_until` (never negative; partial years round up).
pub fn years_to_pay(desired: Timestamp, paid_until: Timestamp, now: Timestamp) -> u32 {
    let covered = paid_until.max(now);
    let remaining = desired - covered;
    if remaining <= 0 {
        return 0;
    }
    ((remaining + SECONDS_PER_YEAR - 1) / SECONDS_PER_YEAR) as u32
}

/// Lifetime granted for a paid number of years.
pub fn grant_seconds(years: u32) -> i64 {
    i64::from(years) * GRANTED_YEAR_SECONDS + LIFETIME_GRACE_SECONDS
}
