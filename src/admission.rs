/// Outcome of checking a request path against the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Admission::Admitted
    }
}

// Plain prefix match, no wildcard or pattern semantics. Paths that would
// change shape when resolved upstream never match.
pub fn admit<S: AsRef<str>>(path: &str, prefixes: &[S]) -> Admission {
    if is_traversal(path) {
        return Admission::Rejected;
    }
    if prefixes.iter().any(|p| path.starts_with(p.as_ref())) {
        Admission::Admitted
    } else {
        Admission::Rejected
    }
}

/// True when `path` holds a `.` or `..` segment (plain or percent-encoded)
/// or an encoded separator. URL resolution would move such a path outside
/// the prefix it appears to start with.
pub fn is_traversal(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    if lower.contains("%2f") || lower.contains("%5c") {
        return true;
    }
    lower
        .split(['/', '\\'])
        .any(|segment| matches!(segment, "." | ".." | "%2e" | ".%2e" | "%2e." | "%2e%2e"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIXES: [&str; 2] = ["/assets/", "/images/"];

    #[test]
    fn admits_any_matching_prefix() {
        assert_eq!(admit("/assets/logo.png", &PREFIXES), Admission::Admitted);
        assert_eq!(admit("/images/a/b/c.jpg", &PREFIXES), Admission::Admitted);
    }

    #[test]
    fn rejects_everything_else() {
        assert_eq!(admit("/private/data", &PREFIXES), Admission::Rejected);
        assert_eq!(admit("/assets", &PREFIXES), Admission::Rejected);
        assert_eq!(admit("/", &PREFIXES), Admission::Rejected);
        assert_eq!(admit("/x/assets/logo.png", &PREFIXES), Admission::Rejected);
    }

    #[test]
    fn no_prefixes_rejects() {
        let none: [&str; 0] = [];
        assert!(!admit("/assets/logo.png", &none).is_admitted());
    }

    #[test]
    fn rejects_dot_segments_under_allowed_prefix() {
        for path in [
            "/assets/../private/data",
            "/assets/%2e%2e/private/data",
            "/assets/%2E%2E/private/data",
            "/assets/.%2e/private/data",
            "/assets/./logo.png",
            "/assets/..",
            "/images/a/..\\..\\private",
            "/assets/..%2fprivate/data",
            "/assets/..%5Cprivate/data",
        ] {
            assert_eq!(admit(path, &PREFIXES), Admission::Rejected, "{path}");
        }
    }

    #[test]
    fn dots_inside_names_are_fine() {
        assert!(admit("/assets/logo.v2.png", &PREFIXES).is_admitted());
        assert!(admit("/assets/..hidden/x.png", &PREFIXES).is_admitted());
        assert!(admit("/images/a.../b.png", &PREFIXES).is_admitted());
    }
}
