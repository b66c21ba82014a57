//! Configuration read from environment variables.

/// Interpret a string value such as "1" or "no" as a boolean.
pub fn str_as_bool(s: &str) -> bool {
    match s {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => {
            eprintln!("Unrecognized boolean value \"{}\"", s);
            false
        }
    }
}

/// Return whether a feature flag controlled by an environment variable is
/// enabled.
pub fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .as_ref()
        .map(|s| str_as_bool(s))
        .unwrap_or(default)
}

/// Return the non-empty, comma separated entries of an environment variable.
///
/// Whitespace around entries is ignored.
pub fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|s| split_list(&s))
        .unwrap_or_default()
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

/// Return the value of an environment variable, if set and non-empty.
pub fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{split_list, str_as_bool};

    #[test]
    fn test_str_as_bool() {
        assert!(str_as_bool("1"));
        assert!(str_as_bool("yes"));
        assert!(!str_as_bool("0"));
        assert!(!str_as_bool("n"));
        assert!(!str_as_bool("maybe"));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("fusion, inplace,,"), ["fusion", "inplace"]);
        assert!(split_list("").is_empty());
    }
}
