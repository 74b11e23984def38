/// Resolve an explicitly requested agent name from the environment.
///
/// Checks `PI_AGENT_NAME` first. Returns `None` if unset, letting callers
/// fall back to base-name probing.
pub fn requested_name() -> Option<String> {
    std::env::var("PI_AGENT_NAME")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the session identity: explicit value, then `PI_SESSION_ID`,
/// then a fresh UUID.
pub fn resolve_session_id(session_id: Option<&str>) -> String {
    session_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .or_else(|| {
            std::env::var("PI_SESSION_ID")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Validate an agent name: non-empty, ASCII alphanumeric + hyphen +
/// underscore, at most 64 characters.
pub fn validate_name(name: &str) -> crate::error::Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(crate::error::PimError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env-var tests must not run concurrently.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn requested_name_env_behavior() {
        let _guard = ENV_LOCK.lock().unwrap();

        unsafe { std::env::set_var("PI_AGENT_NAME", "test-agent-42") };
        assert_eq!(requested_name(), Some("test-agent-42".to_string()));

        unsafe { std::env::set_var("PI_AGENT_NAME", "") };
        assert_eq!(requested_name(), None);

        unsafe { std::env::remove_var("PI_AGENT_NAME") };
        assert_eq!(requested_name(), None);
    }

    #[test]
    fn session_id_prefers_explicit_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("PI_SESSION_ID", "from-env") };
        assert_eq!(resolve_session_id(Some("explicit")), "explicit");
        assert_eq!(resolve_session_id(None), "from-env");
        unsafe { std::env::remove_var("PI_SESSION_ID") };
    }

    #[test]
    fn session_id_generates_fallback() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("PI_SESSION_ID") };
        let a = resolve_session_id(None);
        let b = resolve_session_id(None);
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn validate_name_rules() {
        assert!(validate_name("agent-1").is_ok());
        assert!(validate_name("A_b2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("has/slash").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }
}
