//! Validation of names that are spliced into generated sandbox code.
//!
//! Generated snippets never interpolate free-form text: values travel through
//! the state channel, and the only raw tokens are names checked here.

use std::sync::LazyLock;

use regex::Regex;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Package requirement as accepted by `pip install` (name, extras, version pin).
static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(\[[A-Za-z0-9._,-]+\])?((==|>=|<=|~=|!=|>|<)[A-Za-z0-9.*+!_-]+)?$")
        .unwrap()
});

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// True for a plain, non-keyword identifier.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER_RE.is_match(name) && !KEYWORDS.contains(&name)
}

pub fn is_package_spec(spec: &str) -> bool {
    PACKAGE_RE.is_match(spec)
}

/// Names reserved by the sandbox driver.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with("__sandbox") || name == "final_answer"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("a"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier("2a"));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier("x; import os"));
        assert!(!is_identifier("lambda"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn package_specs() {
        assert!(is_package_spec("numpy"));
        assert!(is_package_spec("scikit-learn==1.5.0"));
        assert!(is_package_spec("requests[socks]>=2"));
        assert!(!is_package_spec("numpy; rm -rf /"));
        assert!(!is_package_spec("-e ."));
        assert!(!is_package_spec(""));
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved("final_answer"));
        assert!(is_reserved("__sandbox_load_state__"));
        assert!(!is_reserved("answer"));
    }
}
