//! Helpers for reading settings from the environment.

use std::{env, str::FromStr};

/// Parse an `envvar` as `T`. Return `None` if env missing or parsing fails.
pub fn parse_env<T: FromStr>(envvar: &str) -> Option<T> {
    env::var(envvar).ok().and_then(|s| T::from_str(&s).ok())
}

/// Parse an `envvar` as `T`. Return `fallback` if env missing or parsing fails.
pub fn parse_env_or<T: FromStr>(envvar: &str, fallback: T) -> T {
    parse_env(envvar).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_fallback() {
        env::set_var("CATBRIDGE_TEST_PARSE_ENV", "42");
        assert_eq!(parse_env::<u64>("CATBRIDGE_TEST_PARSE_ENV"), Some(42));
        assert_eq!(parse_env_or::<u64>("CATBRIDGE_TEST_PARSE_ENV", 7), 42);

        env::set_var("CATBRIDGE_TEST_PARSE_ENV_BAD", "forty-two");
        assert_eq!(parse_env_or::<u64>("CATBRIDGE_TEST_PARSE_ENV_BAD", 7), 7);
        assert_eq!(parse_env_or::<u64>("CATBRIDGE_TEST_PARSE_ENV_MISSING", 7), 7);
    }
}
