//! Allowlist enforcement — deny-by-default.
//!
//! Entries come from `REMOTECODE_ALLOWED_USERS`: numeric Telegram user ids
//! and `@`-prefixed usernames (the `@` may be omitted).

/// Returns `true` when the sender may talk to the bot.
///
/// An empty allowlist denies everyone; configuration loading already rejects
/// that, so this is belt only.
pub fn is_allowed(allowed: &[String], username: &str, user_id: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    allowed.iter().any(|entry| {
        let entry = entry.trim_start_matches('@');
        entry == username || entry == user_id
    })
}
