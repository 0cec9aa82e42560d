//! Field checks applied before anything touches the database.

pub const GENDERS: [&str; 3] = ["male", "female", "other"];

pub fn is_valid_email(s: &str) -> bool {
    let s = s.trim();
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !host.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// 7 to 15 digits, optional leading `+`, spaces and dashes as separators.
pub fn is_valid_phone(s: &str) -> bool {
    let s = s.trim();
    let body = s.strip_prefix('+').unwrap_or(s);
    let mut digits = 0usize;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            ' ' | '-' => {}
            _ => return false,
        }
    }
    (7..=15).contains(&digits)
}

pub fn normalize_gender(s: &str) -> Option<&'static str> {
    let lower = s.trim().to_ascii_lowercase();
    GENDERS.iter().copied().find(|g| *g == lower)
}

pub fn is_valid_year(year: i64) -> bool {
    (1..=4).contains(&year)
}

pub fn non_empty_trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails() {
        assert!(is_valid_email("warden@hostel.edu"));
        assert!(is_valid_email(" a.b+c@x.co "));
        assert!(!is_valid_email("no-at-sign.com"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a@@b.com"));
        assert!(!is_valid_email("a b@c.com"));
        assert!(!is_valid_email("@c.com"));
    }

    #[test]
    fn phones() {
        assert!(is_valid_phone("9876543210"));
        assert!(is_valid_phone("+91 98765-43210"));
        assert!(!is_valid_phone("12345"));
        assert!(!is_valid_phone("98765x3210"));
        assert!(!is_valid_phone("1234567890123456"));
    }

    #[test]
    fn genders_and_years() {
        assert_eq!(normalize_gender("Female"), Some("female"));
        assert_eq!(normalize_gender("x"), None);
        assert!(is_valid_year(1));
        assert!(is_valid_year(4));
        assert!(!is_valid_year(0));
        assert!(!is_valid_year(5));
    }
}
