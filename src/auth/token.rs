//! Constant-time shared-secret comparison.

use subtle::ConstantTimeEq;

/// Compare a provided token against the expected one in constant time.
///
/// When lengths differ the expected value is compared against itself so the
/// work done does not depend on where the inputs diverge or on the provided
/// length. Empty provided or expected values are always false.
pub fn timing_safe_eq(provided: &str, expected: &str) -> bool {
    let p = provided.as_bytes();
    let e = expected.as_bytes();

    if p.is_empty() || e.is_empty() || p.len() != e.len() {
        let _ = e.ct_eq(e);
        return false;
    }

    p.ct_eq(e).into()
}
