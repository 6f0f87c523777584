//! Proxy-specific error wrapping, always surfaced through the common
//! [`crate::error::Error`] with `Kind::Proxy`.

use crate::error::Error;

pub fn proxy_err(operation: &'static str, host: &str, port: u16, message: impl Into<String>) -> Error {
    Error::proxy(operation, message).with_address(host.to_string(), port)
}
