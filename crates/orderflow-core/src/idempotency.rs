//! Idempotency token scheme for order tasks.
//!
//! Each task carries a token of the form `{order_id}:{sequence}:{attempt}`,
//! refreshed on every retry so a dispatch integration that deduplicates
//! on this token never conflates two distinct attempts.

use uuid::Uuid;

/// Build the idempotency token for a given order, task sequence, and
/// attempt number.
pub fn token(order_id: Uuid, sequence: i32, attempt: i32) -> String {
    format!("{order_id}:{sequence}:{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_format() {
        let order_id = Uuid::nil();
        assert_eq!(token(order_id, 3, 1), format!("{order_id}:3:1"));
    }

    #[test]
    fn token_changes_with_attempt() {
        let order_id = Uuid::new_v4();
        assert_ne!(token(order_id, 0, 0), token(order_id, 0, 1));
    }
}
