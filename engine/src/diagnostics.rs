//! Where codec and transport errors are reported when verbose diagnostics are on

use crate::target::TargetId;
use log::warn;
use protocol::QueryErrorKind;
use std::net::SocketAddr;

/// One reportable problem with a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub target: TargetId,
    pub address: SocketAddr,
    pub protocol: &'static str,
    pub kind: QueryErrorKind,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({}): {}: {}",
            self.target, self.address, self.protocol, self.kind, self.message
        )
    }
}

/// Receiver for diagnostics. Only called for targets whose config has
/// `show_errors` set.
pub trait DiagnosticSink: Send {
    fn report(&mut self, diagnostic: &Diagnostic);
}

/// Forwards every diagnostic to the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&mut self, diagnostic: &Diagnostic) {
        warn!("{}", diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let diagnostic = Diagnostic {
            target: TargetId(3),
            address: "192.168.1.5:27015".parse().unwrap(),
            protocol: "a2s",
            kind: QueryErrorKind::MalformedPacket,
            message: "unterminated string at offset 6".into(),
        };

        assert_eq!(
            diagnostic.to_string(),
            "#3 192.168.1.5:27015 (a2s): malformed packet: unterminated string at offset 6"
        );
    }

    #[test]
    fn test_log_sink_accepts_reports() {
        let mut sink = LogSink;
        sink.report(&Diagnostic {
            target: TargetId(1),
            address: "127.0.0.1:1".parse().unwrap(),
            protocol: "q3",
            kind: QueryErrorKind::ProtocolError,
            message: "not a statusResponse".into(),
        });
    }
}
