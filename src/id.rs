//! Correlation ids for connection-scoped log events
//!
//! Each connection gets a 13-character, lexicographically sortable,
//! Crockford base-32 id derived from a process-global monotonic counter
//! seeded with the wall clock at first use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn counter() -> &'static AtomicU64 {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    COUNTER.get_or_init(|| {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        AtomicU64::new(seed)
    })
}

/// Produce the next correlation id
pub(crate) fn next_id() -> String {
    let value = counter().fetch_add(1, Ordering::Relaxed);

    let mut out = [0u8; 13];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 5 * (12 - i);
        *slot = ALPHABET[((value >> shift) & 0x1F) as usize];
    }

    // The alphabet is ASCII.
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_13_chars() {
        let id = next_id();
        assert_eq!(id.len(), 13);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn ids_sort_in_issue_order() {
        let a = next_id();
        let b = next_id();
        let c = next_id();
        assert!(a < b && b < c);
    }
}
