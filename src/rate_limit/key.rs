use std::fmt;

/// Identity of one rate-limited bucket: `(service prefix, caller id, method, path)`.
///
/// Rendered into the shared store as `<prefix>:rl:<caller>:<method>:<path>` for bucket
/// state and `<prefix>:rll:<caller>:<method>:<path>` for its lock. Components are not
/// escaped; only uniqueness of the tuple matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimiterKey {
    prefix: String,
    caller_id: String,
    method: String,
    path: String,
}

impl LimiterKey {
    pub fn new(
        prefix: impl Into<String>,
        caller_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            caller_id: caller_id.into(),
            method: method.into(),
            path: path.into(),
        }
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state_key(&self) -> String {
        self.render("rl")
    }

    pub fn lock_key(&self) -> String {
        self.render("rll")
    }

    fn render(&self, kind: &str) -> String {
        format!("{}:{}:{}:{}:{}", self.prefix, kind, self.caller_id, self.method, self.path)
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.state_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_state_and_lock_keys() {
        let key = LimiterKey::new("movie", "10.0.0.7", "GET", "/movies/42");
        assert_eq!(key.state_key(), "movie:rl:10.0.0.7:GET:/movies/42");
        assert_eq!(key.lock_key(), "movie:rll:10.0.0.7:GET:/movies/42");
        assert_eq!(key.to_string(), key.state_key());
    }

    #[test]
    fn any_component_distinguishes_keys() {
        let base = LimiterKey::new("svc", "a", "GET", "/x");
        assert_ne!(base, LimiterKey::new("svc", "b", "GET", "/x"));
        assert_ne!(base, LimiterKey::new("svc", "a", "POST", "/x"));
        assert_ne!(base, LimiterKey::new("svc", "a", "GET", "/y"));
        assert_ne!(base, LimiterKey::new("other", "a", "GET", "/x"));
    }
}
