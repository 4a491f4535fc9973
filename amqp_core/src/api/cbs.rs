//! Claims-based security: authorizing entities by putting tokens on the `$cbs` node.
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::engine::{ErrorCondition, RemoteError};

use super::{
    cache::ResourceCache,
    error::{Error, ErrorContext},
    message::{Message, PropertyValue},
    options::AuthorizationType,
    request_response::RequestResponseChannel,
    retry::{with_retry, RetryPolicy},
    Result,
};

/// Address of the claims-based security node.
pub const CBS_NODE_ADDRESS: &str = "$cbs";

const PUT_TOKEN_OPERATION: &str = "put-token";
const OPERATION_KEY: &str = "operation";
const TYPE_KEY: &str = "type";
const NAME_KEY: &str = "name";
const EXPIRATION_KEY: &str = "expiration";
const STATUS_CODE_KEY: &str = "status-code";
const STATUS_DESCRIPTION_KEY: &str = "status-description";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: SystemTime,
}

/// Source of access tokens.
#[async_trait]
pub trait TokenCredential: Send + Sync + 'static {
    async fn get_token(&self, scopes: &[String]) -> Result<AccessToken>;
}

#[async_trait]
pub trait ClaimsBasedSecurity: Send + Sync + 'static {
    /// Authorizes `audience`, returns when the authorization expires.
    async fn authorize(&self, audience: &str, scopes: &[String]) -> Result<SystemTime>;
}

/////////////////////////////////////////////////////////////////////////////
/// Puts tokens on the `$cbs` node over a recoverable request-response channel.
pub struct ClaimsBasedSecurityChannel {
    channels: Arc<ResourceCache<RequestResponseChannel>>,
    credential: Arc<dyn TokenCredential>,
    authorization_type: AuthorizationType,
    retry_policy: Arc<dyn RetryPolicy>,
    namespace: String,
}

impl ClaimsBasedSecurityChannel {
    pub fn new(
        channels: Arc<ResourceCache<RequestResponseChannel>>,
        credential: Arc<dyn TokenCredential>,
        authorization_type: AuthorizationType,
        retry_policy: Arc<dyn RetryPolicy>,
        namespace: &str,
    ) -> Self {
        Self {
            channels,
            credential,
            authorization_type,
            retry_policy,
            namespace: namespace.to_owned(),
        }
    }

    /// Disposes the channel cache. Idempotent.
    pub async fn close(&self) {
        if self.channels.dispose().await {
            info!("closed CBS channel of {}", self.namespace);
        }
    }

    async fn put_token(&self, request: &Message) -> Result<()> {
        let channel = self.channels.get().await?;
        let response = channel.send_with_ack(request.clone()).await?;
        check_status(&response, &self.namespace)
    }
}

#[async_trait]
impl ClaimsBasedSecurity for ClaimsBasedSecurityChannel {
    async fn authorize(&self, audience: &str, scopes: &[String]) -> Result<SystemTime> {
        let token = self.credential.get_token(scopes).await?;
        let request = put_token_request(&self.authorization_type, audience, &token);
        with_retry(
            self.retry_policy.as_ref(),
            &format!("put token for {}", audience),
            || self.put_token(&request),
        )
        .await?;
        debug!("authorized {} until {:?}", audience, token.expires_on);
        Ok(token.expires_on)
    }
}

fn put_token_request(
    authorization_type: &AuthorizationType,
    audience: &str,
    token: &AccessToken,
) -> Message {
    let expiration = token
        .expires_on
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    Message::new(token.token.clone())
        .with_property(OPERATION_KEY, PUT_TOKEN_OPERATION)
        .with_property(TYPE_KEY, authorization_type.token_type())
        .with_property(NAME_KEY, audience)
        .with_property(EXPIRATION_KEY, i64::try_from(expiration).unwrap_or(i64::MAX))
}

/// Maps the status of a put-token response.
fn check_status(response: &Message, namespace: &str) -> Result<()> {
    let status = match response.property(STATUS_CODE_KEY) {
        Some(PropertyValue::Long(status)) => *status,
        _ => {
            return Err(Error::from_remote(
                RemoteError::new(ErrorCondition::InternalError, "put-token response has no status code"),
                Some(ErrorContext::new(namespace)),
            ))
        }
    };
    let description = match response.property(STATUS_DESCRIPTION_KEY) {
        Some(PropertyValue::String(description)) => description.as_str(),
        _ => "",
    };
    let condition = match status {
        200 | 202 => return Ok(()),
        401 => ErrorCondition::UnauthorizedAccess,
        404 => ErrorCondition::NotFound,
        400 => ErrorCondition::ArgumentError,
        503 => ErrorCondition::ServerBusy,
        _ => ErrorCondition::InternalError,
    };
    Err(Error::from_remote(
        RemoteError::new(
            condition,
            &format!("put-token failed with status {}: {}", status, description),
        ),
        Some(ErrorContext::new(namespace)),
    ))
}
