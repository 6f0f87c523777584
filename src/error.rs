//! Tagged error model for the transport core.
//!
//! Every error surfaced across DNS, dial, proxy, TLS, protocol and IO
//! boundaries is collapsed into a single [`Error`] carrying a [`Kind`], an
//! operation label, an optional `host`/`port`, an optional cause and a
//! capture timestamp. Callers branch on [`Error::kind`] rather than on the
//! `Display` string, and address formatting lives in one place
//! ([`Kind::fmt`]/[`Error::address`]) so call sites never hand-format
//! `host:port` themselves.

use std::fmt;
use std::time::SystemTime;

/// The tagged error kind.
///
/// Mirrors the taxonomy in the design: `dns, connection, tls, timeout,
/// protocol, io, validation, proxy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Dns,
    Connection,
    Tls,
    Timeout,
    Protocol,
    Io,
    Validation,
    Proxy,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Dns => "dns",
            Kind::Connection => "connection",
            Kind::Tls => "tls",
            Kind::Timeout => "timeout",
            Kind::Protocol => "protocol",
            Kind::Io => "io",
            Kind::Validation => "validation",
            Kind::Proxy => "proxy",
        };
        f.write_str(s)
    }
}

/// A well-known operation label, attached to most errors for observability.
pub type Operation = &'static str;

/// The crate's unified error type.
#[derive(Debug, thiserror::Error)]
#[error("{kind} error during {operation}{address}: {message}{cause}", address = self.fmt_address(), cause = self.fmt_cause())]
pub struct Error {
    kind: Kind,
    operation: Operation,
    message: String,
    host: Option<String>,
    port: Option<u16>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    at: SystemTime,
}

impl Error {
    /// Builds a new tagged error.
    pub fn new(kind: Kind, operation: Operation, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
            host: None,
            port: None,
            cause: None,
            at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[must_use]
    pub fn with_boxed_cause(
        mut self,
        cause: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn at(&self) -> SystemTime {
        self.at
    }

    /// `host:port` formatted from the stored components, never duplicated
    /// at call sites.
    pub fn address(&self) -> Option<String> {
        match (&self.host, self.port) {
            (Some(h), Some(p)) => Some(format!("{h}:{p}")),
            (Some(h), None) => Some(h.clone()),
            _ => None,
        }
    }

    fn fmt_address(&self) -> String {
        match self.address() {
            Some(a) => format!(" ({a})"),
            None => String::new(),
        }
    }

    fn fmt_cause(&self) -> String {
        String::new()
    }

    /// True for a deadline-exceeded / elapsed condition, whether it
    /// originated from a context cancellation or a platform timeout.
    pub fn is_timeout(&self) -> bool {
        if self.kind == Kind::Timeout {
            return true;
        }
        self.cause
            .as_ref()
            .map(|c| {
                let s = c.to_string();
                s.contains("deadline has elapsed") || s.contains("timed out")
            })
            .unwrap_or(false)
    }

    /// True when the error stems from a cancelled context/token.
    pub fn is_context_canceled(&self) -> bool {
        self.cause
            .as_ref()
            .map(|c| c.to_string().contains("cancelled") || c.to_string().contains("canceled"))
            .unwrap_or(false)
    }

    /// True when cancellation specifically manifested as a timeout.
    pub fn is_context_timeout(&self) -> bool {
        self.is_context_canceled() && self.is_timeout()
    }

    pub fn get_kind(&self) -> Kind {
        self.kind
    }
}

macro_rules! ctor {
    ($name:ident, $kind:expr) => {
        impl Error {
            pub fn $name(operation: Operation, message: impl Into<String>) -> Self {
                Self::new($kind, operation, message)
            }
        }
    };
}

ctor!(dns, Kind::Dns);
ctor!(connection, Kind::Connection);
ctor!(tls, Kind::Tls);
ctor!(timeout, Kind::Timeout);
ctor!(protocol, Kind::Protocol);
ctor!(io, Kind::Io);
ctor!(validation, Kind::Validation);
ctor!(proxy, Kind::Proxy);

/// Lightweight context extension, in the shape of `rama_error::ErrorContext`,
/// for attaching an operation-tagged [`Error`] to a lower-level `Result`.
pub trait ErrorContext<T> {
    fn ctx(self, kind: Kind, operation: Operation, message: impl Into<String>) -> Result<T, Error>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn ctx(self, kind: Kind, operation: Operation, message: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| Error::new(kind, operation, message).with_cause(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_formats_host_and_port_once() {
        let err = Error::new(Kind::Dns, "lookup", "no such host").with_address("example.com", 443);
        assert_eq!(err.address().as_deref(), Some("example.com:443"));
        let s = err.to_string();
        assert_eq!(s.matches("example.com:443").count(), 1);
    }

    #[test]
    fn is_timeout_detects_kind_and_cause() {
        let err = Error::new(Kind::Timeout, "read", "deadline exceeded");
        assert!(err.is_timeout());

        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let wrapped = Error::new(Kind::Io, "read", "read failed").with_cause(io_err);
        assert!(wrapped.is_timeout());
    }
}
