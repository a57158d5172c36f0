fn read_float_and_factor_from_env(var: &str) -> Option<(f64, usize)> {
    let value = std::env::var(var).ok()?;
    let mut value = value.trim();
    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let (number, factor) = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    };

    number.parse::<f64>().ok().map(|x| (x, factor))
}

/// Reads an unsigned integer, accepting `k`, `m` and `g` size suffixes.
pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor_from_env(var)?;
    if value < 0.0 {
        return None;
    }

    Some(value as usize * factor)
}

pub fn read_string_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

pub fn read_bool_from_env(var: &str) -> Option<bool> {
    match read_string_from_env(var)?.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes() {
        std::env::set_var("JNISTATE_TEST_UINT_K", "4k");
        std::env::set_var("JNISTATE_TEST_UINT_MB", "2MB");
        std::env::set_var("JNISTATE_TEST_UINT_PLAIN", "512");
        std::env::set_var("JNISTATE_TEST_UINT_BAD", "lots");

        assert_eq!(read_uint_from_env("JNISTATE_TEST_UINT_K"), Some(4096));
        assert_eq!(read_uint_from_env("JNISTATE_TEST_UINT_MB"), Some(2 * 1024 * 1024));
        assert_eq!(read_uint_from_env("JNISTATE_TEST_UINT_PLAIN"), Some(512));
        assert_eq!(read_uint_from_env("JNISTATE_TEST_UINT_BAD"), None);
        assert_eq!(read_uint_from_env("JNISTATE_TEST_UINT_UNSET"), None);
    }

    #[test]
    fn booleans() {
        std::env::set_var("JNISTATE_TEST_BOOL_ON", "True");
        std::env::set_var("JNISTATE_TEST_BOOL_OFF", "0");
        std::env::set_var("JNISTATE_TEST_BOOL_BAD", "maybe");

        assert_eq!(read_bool_from_env("JNISTATE_TEST_BOOL_ON"), Some(true));
        assert_eq!(read_bool_from_env("JNISTATE_TEST_BOOL_OFF"), Some(false));
        assert_eq!(read_bool_from_env("JNISTATE_TEST_BOOL_BAD"), None);
    }
}
