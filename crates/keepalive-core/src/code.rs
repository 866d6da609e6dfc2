use regex::Regex;
use std::sync::LazyLock;

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{5,6})\b").unwrap());

/// Pull a login code (a standalone 5 or 6 digit number) out of a service message.
pub fn extract_code(text: &str) -> Option<&str> {
    CODE_PATTERN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::extract_code;

    #[test]
    fn finds_login_code() {
        assert_eq!(
            extract_code("Login code: 48213. Do not give this code to anyone"),
            Some("48213")
        );
        assert_eq!(extract_code("Your code is 123456"), Some("123456"));
    }

    #[test]
    fn ignores_other_numbers() {
        assert_eq!(extract_code("Welcome back!"), None);
        assert_eq!(extract_code("ticket 1234 and 1234567"), None);
        assert_eq!(extract_code("ref A12345"), None);
    }
}
