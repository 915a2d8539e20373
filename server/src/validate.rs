//! Input validation shared by the REST surface and the ingress.

/// `^[a-z0-9-]{3,50}$`
pub fn subdomain_ok(s: &str) -> bool {
    (3..=50).contains(&s.len())
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Region codes are short hostname labels, 2–10 chars.
pub fn region_ok(s: &str) -> bool {
    (2..=10).contains(&s.len())
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Ports are 1–65535.
pub fn port_ok(port: u32) -> bool {
    (1..=65535).contains(&port)
}

/// Connection tokens are 32–64 chars.
pub fn token_ok(token: &str) -> bool {
    (32..=64).contains(&token.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_rules() {
        assert!(subdomain_ok("myapp"));
        assert!(subdomain_ok("my-app-01"));
        assert!(!subdomain_ok("ab")); // too short
        assert!(!subdomain_ok("MyApp")); // uppercase
        assert!(!subdomain_ok("has_underscore"));
        assert!(!subdomain_ok(&"a".repeat(51)));
    }

    #[test]
    fn region_rules() {
        assert!(region_ok("id"));
        assert!(region_ok("ap-south"));
        assert!(!region_ok("x"));
        assert!(!region_ok("waytoolongregion"));
    }

    #[test]
    fn port_rules() {
        assert!(port_ok(1));
        assert!(port_ok(65535));
        assert!(!port_ok(0));
        assert!(!port_ok(65536));
    }

    #[test]
    fn token_rules() {
        assert!(token_ok(&"a".repeat(32)));
        assert!(token_ok(&"a".repeat(64)));
        assert!(!token_ok("short"));
        assert!(!token_ok(&"a".repeat(65)));
    }
}
