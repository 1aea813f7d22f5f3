//! Default User-Agent for transfer requests.

/// Default User-Agent identifying the engine and its version.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("download-manager/{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_user_agent_carries_version() {
        let ua = default_user_agent();
        assert!(ua.starts_with("download-manager/"));
        assert!(ua.ends_with(env!("CARGO_PKG_VERSION")));
    }
}
