use std::fmt::{self, Write};

/// The delimiter between the parts of a cache key.
pub const KEY_DELIMITER: char = ':';

/// Joins `parts` into a cache key, separated by [`KEY_DELIMITER`].
///
/// ```
/// assert_eq!(cacheable::key(&[&"user", &5, &"profile"]), "user:5:profile");
/// ```
pub fn key(parts: &[&dyn fmt::Display]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_DELIMITER);
        }
        // Writing into a `String` never fails.
        let _ = write!(key, "{part}");
    }
    key
}

/// Builds a cache key from any number of displayable parts.
///
/// ```
/// let id = 5;
/// assert_eq!(cacheable::cache_key!("user", id, "profile"), "user:5:profile");
/// ```
#[macro_export]
macro_rules! cache_key {
    ($($part:expr),+ $(,)?) => {
        $crate::key(&[$(&$part as &dyn ::std::fmt::Display),+])
    };
}
