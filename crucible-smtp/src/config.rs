//! Send-time configuration: direct-to-MX delivery vs. a configured relay, and the knobs the
//! configuration envelope (a `name value` text file, one pair per line, `#` comments) exposes.

use crucible_base::{err, Result};

use crate::resolve::IpVerPref;
use crate::schema::TlsAssurance;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthType {
    Login,
    Plain,
    CramMd5,
}

impl AuthType {
    pub const ALL: [AuthType; 3] = [AuthType::Login, AuthType::Plain, AuthType::CramMd5];

    fn parse(s: &str) -> Result<AuthType> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "LOGIN" => AuthType::Login,
            "PLAIN" => AuthType::Plain,
            "CRAM-MD5" => AuthType::CramMd5,
            other => return Err(err(format!("unknown relayAuthType {other:?}"))),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Login => "LOGIN",
            AuthType::Plain => "PLAIN",
            AuthType::CramMd5 => "CRAM-MD5",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            AuthType::Login => "AUTH LOGIN: base64 username then password, each its own exchange",
            AuthType::Plain => "AUTH PLAIN: a single base64 NUL-separated authzid/authcid/password blob",
            AuthType::CramMd5 => "AUTH CRAM-MD5: server nonce challenge answered with an HMAC-MD5 digest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub implicit_tls: bool,
    pub tls_requirement: TlsAssurance,
    pub auth_type: AuthType,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct SendConfig {
    pub sender_computer_name: String,
    pub ip_ver_pref: IpVerPref,
    pub relay: Option<RelayConfig>,
}

impl Default for SendConfig {
    fn default() -> SendConfig {
        SendConfig {
            sender_computer_name: "localhost".to_string(),
            ip_ver_pref: IpVerPref::PreferV4,
            relay: None,
        }
    }
}

/// Parses the `name value` configuration envelope: one pair per line, `#`-prefixed lines and
/// blank lines ignored. Recognized keys: `senderComputerName, ipVerPref, useRelay, relayHost,
/// relayPort, relayImplicitTls, relayTlsReq, relayAuthType, relayUsername, relayPassword`.
pub fn parse_config_envelope(text: &str) -> Result<SendConfig> {
    let mut values = std::collections::HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once(' ').ok_or_else(|| err(format!("bad config line: {line:?}")))?;
        values.insert(key.to_string(), value.trim().to_string());
    }

    let mut config = SendConfig::default();
    if let Some(name) = values.get("senderComputerName") {
        config.sender_computer_name = name.clone();
    }
    if let Some(pref) = values.get("ipVerPref") {
        config.ip_ver_pref = match pref.as_str() {
            "4" => IpVerPref::PreferV4,
            "6" => IpVerPref::PreferV6,
            other => return Err(err(format!("bad ipVerPref {other:?}"))),
        };
    }
    let use_relay = values.get("useRelay").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
    if use_relay {
        let host = values.get("relayHost").ok_or_else(|| err("useRelay set but relayHost missing"))?.clone();
        let port: u16 = values
            .get("relayPort")
            .ok_or_else(|| err("useRelay set but relayPort missing"))?
            .parse()
            .map_err(|_| err("bad relayPort"))?;
        let implicit_tls = values.get("relayImplicitTls").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let tls_requirement = values
            .get("relayTlsReq")
            .and_then(|v| TlsAssurance::parse(v))
            .unwrap_or(TlsAssurance::Unverified);
        let auth_type = values.get("relayAuthType").map(|v| AuthType::parse(v)).transpose()?.unwrap_or(AuthType::Plain);
        let username = values.get("relayUsername").cloned().unwrap_or_default();
        let password = values.get("relayPassword").cloned().unwrap_or_default();
        config.relay = Some(RelayConfig {
            host,
            port,
            implicit_tls,
            tls_requirement,
            auth_type,
            username,
            password,
        });
    }
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_direct_delivery_envelope() {
        let text = "# comment\nsenderComputerName mail01\nipVerPref 4\n";
        let config = parse_config_envelope(text).unwrap();
        assert_eq!(config.sender_computer_name, "mail01");
        assert_eq!(config.ip_ver_pref, IpVerPref::PreferV4);
        assert!(config.relay.is_none());
    }

    #[test]
    fn parses_relay_envelope() {
        let text = "useRelay 1\nrelayHost smtp.example.com\nrelayPort 587\nrelayAuthType LOGIN\nrelayUsername bob\nrelayPassword secret\n";
        let config = parse_config_envelope(text).unwrap();
        let relay = config.relay.unwrap();
        assert_eq!(relay.host, "smtp.example.com");
        assert_eq!(relay.port, 587);
        assert_eq!(relay.auth_type, AuthType::Login);
    }
}
