//! Runtime environment capabilities.
//!
//! The connection never inspects globals. Whatever it needs to know about the
//! host (native socket support, the page host and protocol used as defaults
//! for endpoint derivation) comes through an [`Environment`].

/// Capabilities of the environment a connection runs in.
pub trait Environment {
    /// Whether the native socket transport can be used at all.
    fn supports_native_socket(&self) -> bool;

    /// Host used when the configuration does not name one.
    fn host(&self) -> String;

    /// Protocol (e.g. `"https:"`) used when the configuration does not name one.
    fn protocol(&self) -> String;
}

/// An environment described by plain values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticEnvironment {
    native_socket: bool,
    host: String,
    protocol: String,
}

impl StaticEnvironment {
    /// Create an environment from explicit values.
    #[must_use]
    pub fn new(native_socket: bool, host: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            native_socket,
            host: host.into(),
            protocol: normalize_protocol(protocol.into()),
        }
    }

    /// The environment of this process.
    ///
    /// Native sockets are available when the `websocket` feature is compiled
    /// in; the page defaults to `http://localhost`.
    #[must_use]
    pub fn native() -> Self {
        Self::new(cfg!(feature = "websocket"), "localhost", "http:")
    }

    /// Override native socket support.
    #[must_use]
    pub fn with_native_socket(mut self, supported: bool) -> Self {
        self.native_socket = supported;
        self
    }

    /// Override the page host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Override the page protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = normalize_protocol(protocol.into());
        self
    }
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self::native()
    }
}

impl Environment for StaticEnvironment {
    fn supports_native_socket(&self) -> bool {
        self.native_socket
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    fn protocol(&self) -> String {
        self.protocol.clone()
    }
}

/// Protocols are compared in their `scheme:` form.
pub(crate) fn normalize_protocol(mut protocol: String) -> String {
    if !protocol.is_empty() && !protocol.ends_with(':') {
        protocol.push(':');
    }
    protocol
}
