//! Relay endpoint addressing: the tunnel target descriptor and the
//! connect/reconnect URL builder.

use url::form_urlencoded;

/// Production relay endpoint host.
pub const RELAY_HOST: &str = "tunnel.cloudproxy.app";
pub const CONNECT_PATH: &str = "/v4/connect";
pub const RECONNECT_PATH: &str = "/v4/reconnect";

/// Subprotocol advertised during the WebSocket handshake.
pub const RELAY_SUBPROTOCOL: &str = "relay.tunnel.cloudproxy.app";
pub const ORIGIN: &str = "bot:iap-tunneler";
pub const USER_AGENT: &str = "iap-tunneler-cli/1.0";

/// Conventional primary network interface of a Compute Engine instance.
pub const DEFAULT_INTERFACE: &str = "nic0";

/// WebSocket close statuses used by the relay.
pub mod close_status {
    pub const NORMAL: u16 = 1000;
    pub const ABNORMAL: u16 = 1006;
    pub const ERROR_UNKNOWN: u16 = 4000;
    pub const SID_UNKNOWN: u16 = 4001;
    pub const SID_IN_USE: u16 = 4002;
    pub const BACKEND_UNREACHABLE: u16 = 4003;
    pub const REAUTH_REQUIRED: u16 = 4004;
    pub const BAD_ACK: u16 = 4005;
    pub const INVALID_ACK: u16 = 4006;
    pub const INVALID_OPCODE: u16 = 4007;
    pub const INVALID_TAG: u16 = 4008;
    pub const DEST_WRITE_FAILED: u16 = 4009;
    pub const DEST_READ_FAILED: u16 = 4010;
    pub const INVALID_DATA: u16 = 4013;
    pub const NOT_AUTHORIZED: u16 = 4033;
    pub const LOOKUP_FAILED: u16 = 4047;
    pub const LOOKUP_FAILED_RECONNECT: u16 = 4051;
    pub const REWIND_FAILED: u16 = 4074;

    /// Human-readable label for a relay close status, for log lines.
    pub fn describe(code: u16) -> &'static str {
        match code {
            NORMAL => "normal closure",
            ABNORMAL => "abnormal closure",
            ERROR_UNKNOWN => "unknown relay error",
            SID_UNKNOWN => "session id unknown",
            SID_IN_USE => "session id in use",
            BACKEND_UNREACHABLE => "failed to connect to backend",
            REAUTH_REQUIRED => "reauthentication required",
            BAD_ACK => "bad ack",
            INVALID_ACK => "invalid ack",
            INVALID_OPCODE => "invalid socket opcode",
            INVALID_TAG => "invalid frame tag",
            DEST_WRITE_FAILED => "destination write failed",
            DEST_READ_FAILED => "destination read failed",
            INVALID_DATA => "invalid data",
            NOT_AUTHORIZED => "not authorized",
            LOOKUP_FAILED => "lookup failed",
            LOOKUP_FAILED_RECONNECT => "lookup failed, reconnect",
            REWIND_FAILED => "failed to rewind",
            _ => "unrecognized status",
        }
    }
}

/// Describes the Compute Engine port a tunnel terminates at.
///
/// Immutable after construction. The remote port is kept in string form
/// because the relay takes it as a query parameter.
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    pub project: String,
    pub zone: String,
    pub instance: String,
    pub interface: String,
    pub port: String,
}

impl TunnelTarget {
    /// Target with the conventional interface (`nic0`) and SSH port.
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
            interface: DEFAULT_INTERFACE.to_string(),
            port: "22".to_string(),
        }
    }
}

/// Base URL of the relay service.
///
/// Defaults to the production endpoint; a non-default base exists so tests
/// can point a tunnel at an in-process relay.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    base: String,
}

impl Default for RelayEndpoint {
    fn default() -> Self {
        Self {
            base: format!("wss://{RELAY_HOST}"),
        }
    }
}

impl RelayEndpoint {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// URL for establishing a fresh session.
    ///
    /// Query keys are appended in sorted order so the surface is stable.
    pub fn connect_url(&self, target: &TunnelTarget) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("instance", &target.instance);
        query.append_pair("interface", &target.interface);
        query.append_pair("port", &target.port);
        query.append_pair("project", &target.project);
        query.append_pair("zone", &target.zone);
        format!("{}{}?{}", self.base, CONNECT_PATH, query.finish())
    }

    /// URL for resuming a session. `ack` asserts the cumulative count of
    /// payload bytes received so far; the relay replays everything past it.
    pub fn reconnect_url(&self, zone: &str, sid: &str, ack: u64) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("ack", &ack.to_string());
        query.append_pair("sid", sid);
        query.append_pair("zone", zone);
        format!("{}{}?{}", self.base, RECONNECT_PATH, query.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TunnelTarget {
        TunnelTarget {
            project: "test-project".to_string(),
            zone: "us-central1-a".to_string(),
            instance: "test-instance".to_string(),
            interface: "nic0".to_string(),
            port: "8080".to_string(),
        }
    }

    #[test]
    fn connect_url_is_canonical() {
        let url = RelayEndpoint::default().connect_url(&target());
        assert_eq!(
            url,
            "wss://tunnel.cloudproxy.app/v4/connect?instance=test-instance&interface=nic0&port=8080&project=test-project&zone=us-central1-a"
        );
    }

    #[test]
    fn reconnect_url_is_canonical() {
        let url = RelayEndpoint::default().reconnect_url("us-central1-a", "12345", 67890);
        assert_eq!(
            url,
            "wss://tunnel.cloudproxy.app/v4/reconnect?ack=67890&sid=12345&zone=us-central1-a"
        );
    }

    #[test]
    fn query_values_are_percent_encoded() {
        let mut t = target();
        t.instance = "has space".to_string();
        let url = RelayEndpoint::default().connect_url(&t);
        assert!(url.contains("instance=has+space"));
    }

    #[test]
    fn custom_base_strips_trailing_slash() {
        let endpoint = RelayEndpoint::new("ws://127.0.0.1:9000/");
        let url = endpoint.connect_url(&target());
        assert!(url.starts_with("ws://127.0.0.1:9000/v4/connect?"));
    }

    #[test]
    fn default_target_fills_conventions() {
        let t = TunnelTarget::new("p", "z", "i");
        assert_eq!(t.interface, "nic0");
        assert_eq!(t.port, "22");
    }
}
