//! Unique ID generator.
//!
//! Provides utilities for generating unique identifiers.

use uuid::Uuid;

/// Generates unique identifiers for various entities.
pub struct IdGenerator;

impl IdGenerator {
    /// Generates a unique request ID.
    pub fn request_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Generates a random 16-character resource code, used to relate tags.
    pub fn resource_code() -> String {
        Self::random_chars(16)
    }

    /// Generates a random 24-character business key for workflow submissions.
    pub fn biz_key() -> String {
        Self::random_chars(24)
    }

    /// Random alphanumeric string of `len` characters (at most 64).
    fn random_chars(len: usize) -> String {
        let mut s = Uuid::new_v4().simple().to_string();
        s.push_str(&Uuid::new_v4().simple().to_string());
        s.truncate(len);
        s
    }
}
