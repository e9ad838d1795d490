//! Bounded retry for transient storage failures. Hard errors and
//! protocol outcomes pass through untouched; only [`DbError::Soft`] is
//! retried, and only a few times.

use crate::status::DbError;

/// How many times a soft failure is retried before surfacing.
pub const SOFT_RETRIES: u32 = 3;

/// Run `op`, retrying soft errors up to [`SOFT_RETRIES`] times.
pub fn retry_soft<T>(mut op: impl FnMut() -> Result<T, DbError>) -> Result<T, DbError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(DbError::Soft(msg)) if attempt < SOFT_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, error = %msg, "retrying soft database error");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_success_and_hard_errors_through() {
        assert_eq!(retry_soft(|| Ok::<_, DbError>(7)).unwrap(), 7);
        let mut calls = 0;
        let result: Result<(), _> = retry_soft(|| {
            calls += 1;
            Err(DbError::Hard("broken".into()))
        });
        assert!(matches!(result, Err(DbError::Hard(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn soft_errors_retry_then_surface() {
        let mut calls = 0;
        let result: Result<(), _> = retry_soft(|| {
            calls += 1;
            Err(DbError::Soft("busy".into()))
        });
        assert!(matches!(result, Err(DbError::Soft(_))));
        assert_eq!(calls, 1 + SOFT_RETRIES);
    }

    #[test]
    fn recovers_after_transient_failures() {
        let mut calls = 0;
        let result = retry_soft(|| {
            calls += 1;
            if calls < 3 {
                Err(DbError::Soft("busy".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }
}
