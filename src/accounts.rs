use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 6;

/// Stretching rounds for new password hashes.
pub const PASSWORD_ROUNDS: u32 = 100_000;

const HASH_SCHEME: &str = "sha256i";

/// Whether account administration runs against the real store or the
/// read-only directory served after an elevation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountsMode {
    Admin,
    Fallback,
}

impl AccountsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Fallback => "fallback",
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    to_hex(&hasher.finalize())
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

fn stretch(password: &str, salt: &str, rounds: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 1..rounds {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(password.as_bytes());
        digest = hasher.finalize();
    }
    to_hex(&digest)
}

/// Encoded as `sha256i$<rounds>$<hex>` so the round count can be raised
/// without invalidating stored hashes.
pub fn hash_password_with_rounds(password: &str, salt: &str, rounds: u32) -> String {
    let rounds = rounds.max(1);
    format!("{}${}${}", HASH_SCHEME, rounds, stretch(password, salt, rounds))
}

pub fn hash_password(password: &str, salt: &str) -> String {
    hash_password_with_rounds(password, salt, PASSWORD_ROUNDS)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn verify_password(password: &str, salt: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(HASH_SCHEME), Some(rounds), Some(_)) = (parts.next(), parts.next(), parts.next())
    else {
        // Bare hex: a single round written before stretching was added.
        return constant_time_eq(stretch(password, salt, 1).as_bytes(), stored.as_bytes());
    };
    match rounds.parse::<u32>() {
        Ok(rounds) if rounds > 0 => constant_time_eq(
            hash_password_with_rounds(password, salt, rounds).as_bytes(),
            stored.as_bytes(),
        ),
        _ => false,
    }
}

/// Compares digests so the comparison time does not depend on key length.
pub fn service_key_matches(configured: &str, presented: &str) -> bool {
    constant_time_eq(
        sha256_hex(configured.as_bytes()).as_bytes(),
        sha256_hex(presented.as_bytes()).as_bytes(),
    )
}

pub fn generate_password() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

pub fn check_password_policy(password: &str, confirm: Option<&str>) -> Result<(), String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    if let Some(c) = confirm {
        if c != password {
            return Err("Passwords do not match".into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_roundtrip() {
        let salt = new_salt();
        let h = hash_password_with_rounds("hunter22", &salt, 50);
        assert!(h.starts_with("sha256i$50$"));
        assert_eq!(h.rsplit('$').next().map(str::len), Some(64));
        assert!(verify_password("hunter22", &salt, &h));
        assert!(!verify_password("hunter23", &salt, &h));
        assert!(!verify_password("hunter22", &new_salt(), &h));
    }

    #[test]
    fn rounds_change_the_digest() {
        let salt = new_salt();
        let one = hash_password_with_rounds("hunter22", &salt, 1);
        let many = hash_password_with_rounds("hunter22", &salt, 2);
        assert_ne!(one.rsplit('$').next(), many.rsplit('$').next());
        assert!(verify_password("hunter22", &salt, &many));
        assert!(!verify_password("hunter22", &salt, "sha256i$0$abcd"));
    }

    #[test]
    fn single_round_hex_still_verifies() {
        let salt = "legacy";
        let mut hasher = Sha256::new();
        hasher.update(b"legacy:hunter22");
        let bare = to_hex(&hasher.finalize());
        assert!(verify_password("hunter22", salt, &bare));
        assert!(!verify_password("hunter23", salt, &bare));
    }

    #[test]
    fn policy() {
        assert!(check_password_policy("abc", None).is_err());
        assert!(check_password_policy("abcdef", Some("abcdeg")).is_err());
        assert!(check_password_policy("abcdef", Some("abcdef")).is_ok());
    }

    #[test]
    fn generated_passwords_meet_policy() {
        let p = generate_password();
        assert_eq!(p.len(), 10);
        assert!(check_password_policy(&p, None).is_ok());
    }

    #[test]
    fn service_key_compare() {
        assert!(service_key_matches("s3cret", "s3cret"));
        assert!(!service_key_matches("s3cret", "s3cret "));
    }
}
