//! Environment variable parsing helpers.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or return the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) parse as true; anything
/// else parses as false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get an environment variable as an optional parsed value.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__CORIO_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_parse_failure_returns_default() {
        std::env::set_var("__CORIO_TEST_BAD__", "not_a_number");
        let val: usize = env_get("__CORIO_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__CORIO_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool() {
        assert!(env_get_bool("__CORIO_TEST_UNSET__", true));
        std::env::set_var("__CORIO_TEST_BOOL__", "yes");
        assert!(env_get_bool("__CORIO_TEST_BOOL__", false));
        std::env::set_var("__CORIO_TEST_BOOL__", "0");
        assert!(!env_get_bool("__CORIO_TEST_BOOL__", true));
        std::env::remove_var("__CORIO_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_opt() {
        let val: Option<u16> = env_get_opt("__CORIO_TEST_UNSET__");
        assert!(val.is_none());
    }
}
