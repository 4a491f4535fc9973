//! Connection and link configuration.
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{credit::CreditFlowMode, error::Error, retry::RetryOptions, Result};

/// AMQPS port.
pub const DEFAULT_AMQPS_PORT: u16 = 5671;
/// Default max frame size.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 65536;

/// Kind of token put on the CBS node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationType {
    Jwt,
    SharedAccessSignature,
}

impl AuthorizationType {
    /// Value of the `type` property of a put-token request.
    pub fn token_type(&self) -> &'static str {
        match self {
            AuthorizationType::Jwt => "jwt",
            AuthorizationType::SharedAccessSignature => "servicebus.windows.net:sastoken",
        }
    }
}

impl fmt::Display for AuthorizationType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.token_type())
    }
}

/// The arguments used to create connections.
///
/// # Usage
///
/// ```
/// # use amqp_core::{ConnectionOptions, RetryOptions};
/// let options = ConnectionOptions::new("contoso.servicebus.windows.net")
///     .port(5671)
///     .retry_options(RetryOptions::new().max_retries(5).finish())
///     .finish();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// The namespace, e.g. `contoso.servicebus.windows.net`. Used to build token audiences.
    pub fully_qualified_namespace: String,
    /// Host to connect to. Same as the namespace unless connecting through a custom endpoint.
    pub hostname: String,
    /// Default: [`DEFAULT_AMQPS_PORT`]
    pub port: u16,
    /// Default: [`DEFAULT_MAX_FRAME_SIZE`]
    pub max_frame_size: u32,
    /// Default: `Jwt`
    pub authorization_type: AuthorizationType,
    /// Scope requested from the token credential.
    pub authorization_scope: String,
    pub retry_options: RetryOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            fully_qualified_namespace: String::new(),
            hostname: String::new(),
            port: DEFAULT_AMQPS_PORT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            authorization_type: AuthorizationType::Jwt,
            authorization_scope: "https://servicebus.azure.net/.default".to_string(),
            retry_options: RetryOptions::default(),
        }
    }
}

impl ConnectionOptions {
    /// Create new options for `fully_qualified_namespace`, the hostname defaults to it.
    pub fn new(fully_qualified_namespace: &str) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.to_owned(),
            hostname: fully_qualified_namespace.to_owned(),
            ..Default::default()
        }
    }

    pub fn hostname(&mut self, hostname: &str) -> &mut Self {
        self.hostname = hostname.to_owned();
        self
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn max_frame_size(&mut self, max_frame_size: u32) -> &mut Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn authorization_type(&mut self, authorization_type: AuthorizationType) -> &mut Self {
        self.authorization_type = authorization_type;
        self
    }

    pub fn authorization_scope(&mut self, authorization_scope: &str) -> &mut Self {
        self.authorization_scope = authorization_scope.to_owned();
        self
    }

    pub fn retry_options(&mut self, retry_options: RetryOptions) -> &mut Self {
        self.retry_options = retry_options;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty namespace or hostname, or invalid retry options.
    pub fn validate(&self) -> Result<()> {
        if self.fully_qualified_namespace.is_empty() {
            return Err(Error::InvalidArgument(
                "fully qualified namespace cannot be empty".to_string(),
            ));
        }
        if self.hostname.is_empty() {
            return Err(Error::InvalidArgument("hostname cannot be empty".to_string()));
        }
        self.retry_options.validate()
    }
}

/// Settings of a receive link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveOptions {
    /// Number of messages the link is allowed to buffer. Default: `500`
    pub prefetch: u32,
    /// Default: `EmissionDriven`
    pub credit_mode: CreditFlowMode,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            prefetch: 500,
            credit_mode: CreditFlowMode::EmissionDriven,
        }
    }
}

impl ReceiveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefetch(&mut self, prefetch: u32) -> &mut Self {
        self.prefetch = prefetch;
        self
    }

    pub fn credit_mode(&mut self, credit_mode: CreditFlowMode) -> &mut Self {
        self.credit_mode = credit_mode;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }
}

/// Settings of a send link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    /// Overrides the link size announced by the peer.
    pub max_message_size: Option<u64>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_message_size(&mut self, max_message_size: u64) -> &mut Self {
        self.max_message_size = Some(max_message_size);
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }
}
