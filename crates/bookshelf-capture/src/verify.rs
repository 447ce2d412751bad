//! Consistency check between the enumerated and captured item counts.

use tracing::{info, warn};

/// The number of captured items differs from the number the library lists.
///
/// Usually a transient failure (a lazy-load that did not mount every item, a
/// slow response); rerunning skips items already downloaded.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error(
    "Captured {captured} of {expected} items. Some items may lack a downloadable file, \
     or the run was interrupted; please run again"
)]
pub struct CountMismatchError {
    pub expected: usize,
    pub captured: usize,
}

/// Succeed only when every enumerated item was captured.
pub fn verify_counts(expected: usize, captured: usize) -> Result<(), CountMismatchError> {
    if expected == captured {
        info!(items = expected, "Item counts match");
        Ok(())
    } else {
        warn!(expected, captured, "Item counts differ");
        Err(CountMismatchError { expected, captured })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_counts_pass() {
        assert!(verify_counts(5, 5).is_ok());
        assert!(verify_counts(0, 0).is_ok());
    }

    #[test]
    fn test_mismatch_carries_both_counts() {
        let err = verify_counts(5, 4).unwrap_err();
        assert_eq!(
            err,
            CountMismatchError {
                expected: 5,
                captured: 4
            }
        );
        let message = err.to_string();
        assert!(message.contains("4 of 5"));
        assert!(message.contains("run again"));
    }
}
