//! Deterministic hashing, identifier generation, and the user color palette.

use std::time::SystemTime;

use rand::random;

/// Fixed palette of colors assigned to participants. The pick is a pure
/// function of the user ID so every replica renders the same colors.
pub const USER_COLORS: [&str; 15] = [
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
    "#bcf60c", "#fabebe", "#008080", "#e6beff", "#9a6324", "#800000", "#aaffc3",
];

/// Computes a 32-bit rolling hash of `content`, rendered in base-36.
///
/// Replicas with equal character sequences produce equal checksums, which is
/// how divergence is detected after synchronization or recovery.
pub fn checksum(content: &str) -> String {
    to_base36(str_hash(content))
}

/// 32-bit rolling string hash with a 31 multiplier.
pub fn str_hash(s: &str) -> u32 {
    let mut hash: u32 = 0;
    for c in s.chars() {
        hash = hash.wrapping_mul(31).wrapping_add(c as u32);
    }
    hash
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).expect("base-36 digits are ASCII")
}

/// Deterministically picks a display color for a user.
pub fn generate_user_color(user_id: &str) -> String {
    USER_COLORS[str_hash(user_id) as usize % USER_COLORS.len()].to_string()
}

/// Returns a fresh opaque operation ID.
pub fn operation_id() -> String {
    format!("op-{:016x}", random::<u64>())
}

/// Returns a fresh opaque session ID.
pub fn session_id() -> String {
    format!("session-{:016x}", random::<u64>())
}

/// Returns a fresh opaque message ID for the wire envelope.
pub fn message_id() -> String {
    format!("msg-{:016x}", random::<u64>())
}

/// Returns a fresh opaque conflict ID.
pub fn conflict_id() -> String {
    format!("conflict-{:016x}", random::<u64>())
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime returned before UNIX_EPOCH")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        assert_eq!(checksum("hello world"), checksum("hello world"));
        assert_ne!(checksum("hello world"), checksum("hello worle"));
        assert_eq!(checksum(""), "0");
    }

    #[test]
    fn checksum_is_base36() {
        let sum = checksum("The quick brown fox jumps over the lazy dog");
        assert!(sum.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn colors_are_stable_per_user() {
        let color = generate_user_color("alice");
        assert_eq!(generate_user_color("alice"), color);
        assert!(USER_COLORS.contains(&color.as_str()));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(operation_id(), operation_id());
        assert_ne!(session_id(), session_id());
    }
}
