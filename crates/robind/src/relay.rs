use crate::config::RelayConfig;
use crate::session::Envelope;
use anyhow::Context;
use mailparsing::MimeHeaders;
use rfc5321::{EnvelopeAddress, SmtpClient, SmtpClientTimeouts};

/// Decide where (if anywhere) a received message should be relayed:
/// an `X-Robin-Relay: host[:port]` header wins, otherwise the global
/// relay configuration applies
pub fn relay_target(config: &RelayConfig, headers: &MimeHeaders) -> Option<String> {
    if let Some(header) = headers.get_first("X-Robin-Relay") {
        let value = header.value().trim();
        if !value.is_empty() {
            return Some(if value.contains(':') {
                value.to_string()
            } else {
                format!("{value}:25")
            });
        }
    }
    if config.enabled {
        if let Some(host) = &config.host {
            return Some(format!("{}:{}", host, config.port));
        }
    }
    None
}

/// Deliver the envelope to `target`. Runs on the connection task after
/// the message has already been acknowledged to the original sender,
/// so failures are logged rather than surfaced to the peer.
pub async fn relay_message(
    target: &str,
    ehlo_name: &str,
    envelope: &Envelope,
) -> anyhow::Result<()> {
    let sender = envelope.sender.clone().unwrap_or(EnvelopeAddress::Null);
    let mut client = SmtpClient::connect(target, SmtpClientTimeouts::default())
        .await
        .with_context(|| format!("connecting to relay target {target}"))?;
    client.read_banner().await?;
    client.ehlo(ehlo_name).await?;
    client
        .send_mail(sender, &envelope.recipients, &envelope.data)
        .await?;
    client.quit().await.ok();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;
    use mailparsing::MimeHeader;

    #[test]
    fn header_beats_config() {
        let mut headers = MimeHeaders::new();
        headers.push(MimeHeader::new("X-Robin-Relay", "relay.example"));
        let config = RelayConfig {
            enabled: true,
            host: Some("configured.example".to_string()),
            port: 2525,
        };
        assert_equal!(
            relay_target(&config, &headers).unwrap(),
            "relay.example:25"
        );
    }

    #[test]
    fn config_applies_when_no_header() {
        let config = RelayConfig {
            enabled: true,
            host: Some("configured.example".to_string()),
            port: 2525,
        };
        assert_equal!(
            relay_target(&config, &MimeHeaders::new()).unwrap(),
            "configured.example:2525"
        );
    }

    #[test]
    fn disabled_and_headerless_means_no_relay() {
        let config = RelayConfig::default();
        assert_equal!(relay_target(&config, &MimeHeaders::new()), None);

        let mut headers = MimeHeaders::new();
        headers.push(MimeHeader::new("X-Robin-Relay", "  "));
        assert_equal!(relay_target(&config, &headers), None);
    }

    #[test]
    fn explicit_port_preserved() {
        let mut headers = MimeHeaders::new();
        headers.push(MimeHeader::new("X-Robin-Relay", "relay.example:587"));
        assert_equal!(
            relay_target(&RelayConfig::default(), &headers).unwrap(),
            "relay.example:587"
        );
    }
}
