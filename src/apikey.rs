//! API-key management over the control channel.
//!
//! These are opaque request/reply pairs on the same TCP connection as the
//! session traffic. Each operation requires an active session token and uses
//! a short read deadline so a slow router cannot stall refreshes for long.

use std::time::Duration;

use tracing::info;

use crate::control::ControlChannel;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    ApiKeyAck, ApiKeyCommand, ApiKeyRequest, ApiKeyResponse, ApiKeyStatusResponse,
    MSG_API_KEY_DELETE, MSG_API_KEY_DELETE_ACK, MSG_API_KEY_REVOKE, MSG_API_KEY_REVOKE_ACK,
    MSG_API_KEY_STATUS, RESULT_SUCCESS,
};

/// Read deadline for API-key replies.
const API_KEY_TIMEOUT: Duration = Duration::from_secs(3);

/// Valid API-key lifetime bounds in hours.
const MIN_EXPIRATION_HOURS: u16 = 1;
const MAX_EXPIRATION_HOURS: u16 = 720;

impl ControlChannel {
    fn require_session(&self) -> Result<String> {
        self.session_token()
            .ok_or_else(|| BridgeError::internal("no active session"))
    }

    /// Requests a new API key with the given lifetime (clamped to 1-720 h).
    pub async fn request_api_key(&self, expiration_hours: u16) -> Result<ApiKeyResponse> {
        let token = self.require_session()?;
        let hours = expiration_hours.clamp(MIN_EXPIRATION_HOURS, MAX_EXPIRATION_HOURS);

        let request = ApiKeyRequest {
            drone_uuid: self.drone_uuid().to_string(),
            session_token: token,
            expiration_hours: hours,
        };
        let response: ApiKeyResponse = self
            .command(
                request.encode(),
                API_KEY_TIMEOUT,
                "API_KEY_REQUEST",
                ApiKeyResponse::decode,
            )
            .await?;

        if response.result != RESULT_SUCCESS {
            return Err(BridgeError::Command {
                op: "API_KEY_REQUEST",
                code: response.error_code,
            });
        }

        info!("API key issued (expires_at={})", response.expires_at);
        Ok(response)
    }

    /// Revokes the current API key.
    pub async fn revoke_api_key(&self) -> Result<()> {
        let token = self.require_session()?;
        let request = ApiKeyCommand {
            msg_type: MSG_API_KEY_REVOKE,
            drone_uuid: self.drone_uuid().to_string(),
            session_token: token,
        };
        let ack: ApiKeyAck = self
            .command(request.encode(), API_KEY_TIMEOUT, "API_KEY_REVOKE", |d| {
                ApiKeyAck::decode(MSG_API_KEY_REVOKE_ACK, d)
            })
            .await?;

        if ack.result != RESULT_SUCCESS {
            return Err(BridgeError::Command {
                op: "API_KEY_REVOKE",
                code: ack.error_code,
            });
        }
        info!("API key revoked");
        Ok(())
    }

    /// Fetches the current API-key status.
    pub async fn get_api_key_status(&self) -> Result<ApiKeyStatusResponse> {
        let token = self.require_session()?;
        let request = ApiKeyCommand {
            msg_type: MSG_API_KEY_STATUS,
            drone_uuid: self.drone_uuid().to_string(),
            session_token: token,
        };
        let response = self
            .command(
                request.encode(),
                API_KEY_TIMEOUT,
                "API_KEY_STATUS",
                ApiKeyStatusResponse::decode,
            )
            .await?;
        Ok(response)
    }

    /// Deletes the API key completely.
    pub async fn delete_api_key(&self) -> Result<()> {
        let token = self.require_session()?;
        let request = ApiKeyCommand {
            msg_type: MSG_API_KEY_DELETE,
            drone_uuid: self.drone_uuid().to_string(),
            session_token: token,
        };
        let ack: ApiKeyAck = self
            .command(request.encode(), API_KEY_TIMEOUT, "API_KEY_DELETE", |d| {
                ApiKeyAck::decode(MSG_API_KEY_DELETE_ACK, d)
            })
            .await?;

        if ack.result != RESULT_SUCCESS {
            return Err(BridgeError::Command {
                op: "API_KEY_DELETE",
                code: ack.error_code,
            });
        }
        info!("API key deleted");
        Ok(())
    }
}
