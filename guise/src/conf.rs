//! Tunnel options shared by both ends.
//!
//! The same options value is the entry point for opening connections:
//! [`TunnelOpts::dial_raw`] for the active side, [`TunnelOpts::listen_raw`]
//! for the passive side. Both ends of a tunnel must agree on `no_http`.

use serde::{Deserialize, Serialize};

use crate::dial::RawConn;
use crate::error::Result;
use crate::listen::RawListener;

/// Behavior knobs for a tunnel endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelOpts {
    /// Skip the HTTP decoy exchange after the TCP handshake.
    pub no_http: bool,

    /// Silently drop captured RST segments. Some middleboxes inject
    /// spurious resets into long-lived flows.
    pub ignore_rst: bool,

    /// TOS byte stamped on every emitted IPv4 packet.
    pub dscp: u8,

    /// Value for the `Host:` and `X-Online-Host:` decoy request headers.
    pub host: Option<String>,
}

impl TunnelOpts {
    /// Actively opens a tunnel to `remote` ("ip:port") over the interface
    /// that owns the route. Requires raw-capture privilege.
    pub async fn dial_raw(&self, remote: &str) -> Result<RawConn> {
        crate::dial::dial_raw(self.clone(), remote).await
    }

    /// Passively opens a tunnel endpoint bound to `local` ("ip:port").
    /// An unspecified bind address falls back to 127.0.0.1. Requires
    /// raw-capture privilege.
    pub async fn listen_raw(&self, local: &str) -> Result<RawListener> {
        crate::listen::listen_raw(self.clone(), local).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_off() {
        let opts = TunnelOpts::default();
        assert!(!opts.no_http);
        assert!(!opts.ignore_rst);
        assert_eq!(opts.dscp, 0);
        assert_eq!(opts.host, None);
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let opts: TunnelOpts =
            serde_yaml_from_str("no_http: true\nhost: updates.example.net\n");
        assert!(opts.no_http);
        assert!(!opts.ignore_rst);
        assert_eq!(opts.host.as_deref(), Some("updates.example.net"));
    }

    fn serde_yaml_from_str(raw: &str) -> TunnelOpts {
        use figment::providers::{Format, Yaml};
        figment::Figment::from(Yaml::string(raw)).extract().unwrap()
    }
}
