//! Bus topic names

/// Liveness ping, control plane to agents
pub const PING: &str = "fleet.ping";

/// Liveness reply carrying the agent host name
pub const PONG: &str = "fleet.pong";

/// Deploy requests forwarded to the control plane that owns the store
pub const CONTROL_DEPLOY: &str = "fleet.control.deploy";

/// Prefix for per-request reply inboxes
pub const INBOX_PREFIX: &str = "fleet._inbox";

/// Job dispatch topic for `host`
#[must_use]
pub fn playbook(host: &str) -> String {
    format!("fleet.{host}.playbook")
}

/// Terminal success topic for `host`
#[must_use]
pub fn playbook_success(host: &str) -> String {
    format!("fleet.{host}.playbook.success")
}

/// Terminal failure topic for `host`
#[must_use]
pub fn playbook_error(host: &str) -> String {
    format!("fleet.{host}.playbook.error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_scoped_topics() {
        assert_eq!(playbook("web1"), "fleet.web1.playbook");
        assert_eq!(playbook_success("web1"), "fleet.web1.playbook.success");
        assert_eq!(playbook_error("web1"), "fleet.web1.playbook.error");
    }
}
