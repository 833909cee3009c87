//! Small shared helpers that don't belong to any one component.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Current Unix timestamp in whole seconds. Falls back to 0 if the system clock is somehow
/// before the epoch, which should never happen outside of a misconfigured container.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Normalizes message content before hashing: trims surrounding whitespace and collapses
/// internal whitespace runs, so cosmetic differences between polls of the same message don't
/// defeat dedup.
#[must_use]
pub fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Computes the ingest dedup content hash `H(sender || normalized_content)`.
#[must_use]
pub fn content_hash(sender: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalize_content(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Buckets a timestamp into the 60-second window used by the ingest dedup key.
#[must_use]
pub fn dedup_bucket(received_ts: i64, bucket_secs: i64) -> i64 {
    received_ts.div_euclid(bucket_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_whitespace() {
        assert_eq!(normalize_content("  hi   there\n"), "hi there");
    }

    #[test]
    fn same_inputs_hash_identically() {
        assert_eq!(content_hash("alice", "hi there"), content_hash("alice", "hi   there"));
    }

    #[test]
    fn different_senders_hash_differently() {
        assert_ne!(content_hash("alice", "hi"), content_hash("bob", "hi"));
    }

    #[test]
    fn bucket_groups_nearby_timestamps() {
        assert_eq!(dedup_bucket(100, 60), dedup_bucket(130, 60));
        assert_ne!(dedup_bucket(100, 60), dedup_bucket(200, 60));
    }

    proptest! {
        /// Any two timestamps inside the same 60-second window bucket identically (§8's
        /// dedup-window property).
        #[test]
        fn same_bucket_within_window(bucket_idx in 0i64..100_000, a in 0i64..59, b in 0i64..59) {
            let base = bucket_idx * 60;
            prop_assert_eq!(dedup_bucket(base + a, 60), dedup_bucket(base + b, 60));
        }

        #[test]
        fn hash_is_insensitive_to_surrounding_whitespace(
            sender in "[a-z]{1,10}",
            content in "[a-zA-Z ]{1,40}",
            padding in "[ \t]{0,5}",
        ) {
            let padded = format!("{padding}{content}{padding}");
            prop_assert_eq!(content_hash(&sender, &content), content_hash(&sender, &padded));
        }
    }
}
