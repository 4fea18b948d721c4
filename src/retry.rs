//! Polls a predicate at a fixed 1 second cadence until it succeeds or a
//! ~15 minute deadline is exhausted.

use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};

/// Total number of non-terminal attempts before the terminal attempt.
const ATTEMPTS: u32 = 899;

/// Call `predicate(last)` up to 900 times, sleeping 1 second between calls.
///
/// `predicate` is called with `last = false` for the first 899 attempts and
/// `last = true` for the 900th (and final) attempt, so callers can emit
/// diagnostic context ("window list was: ...") only once, right before
/// giving up. Returns as soon as `predicate` returns `true`; if the 900th
/// call still returns `false`, returns a timed-out error.
pub fn retry(mut predicate: impl FnMut(bool) -> bool) -> Result<()> {
    for _ in 0..ATTEMPTS {
        if predicate(false) {
            return Ok(());
        }
        thread::sleep(Duration::from_secs(1));
    }

    if predicate(true) {
        return Ok(());
    }

    bail!("action timed out")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_succeeds_immediately() {
        let calls = Cell::new(0);
        let result = retry(|_last| {
            calls.set(calls.get() + 1);
            true
        });
        assert!(result.is_ok());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_succeeds_on_last_try() {
        let calls = Cell::new(0);
        let result = retry(|last| {
            calls.set(calls.get() + 1);
            last
        });
        assert!(result.is_ok());
        assert_eq!(calls.get(), (ATTEMPTS + 1) as usize);
    }

    // This test sleeps ~899 times for 1s each in the naive implementation,
    // so it is marked ignored by default; run explicitly with
    // `cargo test -- --ignored` when validating the retry bound end to end.
    #[test]
    #[ignore]
    fn test_bound_on_always_false() {
        let calls = Cell::new(0);
        let last_flag = Cell::new(false);
        let result = retry(|last| {
            calls.set(calls.get() + 1);
            last_flag.set(last);
            false
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), (ATTEMPTS + 1) as usize);
        assert!(last_flag.get());
    }
}
