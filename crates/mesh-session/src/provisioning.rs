//! Room provisioning
//!
//! A room is created (or joined) through a REST call on the signaling service
//! before the WebSocket is opened. The response grants access to one room.

use crate::config::IceServer;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Access grant for one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomGrant {
    pub room_id: String,
    pub token: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl RoomGrant {
    pub fn new(room_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            token: token.into(),
            ice_servers: Vec::new(),
        }
    }

    /// ICE servers from the grant, or `fallback` when the grant supplied none
    pub fn ice_servers_or(&self, fallback: Vec<IceServer>) -> Vec<IceServer> {
        if self.ice_servers.is_empty() {
            debug!("Room grant carries no ICE servers, using fallback STUN servers");
            fallback
        } else {
            self.ice_servers.clone()
        }
    }
}

/// Request a room grant from the provisioning endpoint
///
/// The endpoint is called with `POST` and an optional JSON body (e.g. a
/// display name); the response must deserialize into [`RoomGrant`].
pub async fn fetch_room_grant(
    client: &reqwest::Client,
    endpoint: &str,
    body: Option<serde_json::Value>,
) -> Result<RoomGrant> {
    info!("Requesting room grant from {}", endpoint);

    let response = client
        .post(endpoint)
        .json(&body.unwrap_or_else(|| serde_json::json!({})))
        .send()
        .await
        .map_err(|e| Error::ProvisioningError(format!("Request failed: {}", e)))?
        .error_for_status()
        .map_err(|e| Error::ProvisioningError(format!("Provisioning rejected: {}", e)))?;

    let grant: RoomGrant = response
        .json()
        .await
        .map_err(|e| Error::ProvisioningError(format!("Invalid grant payload: {}", e)))?;

    info!(
        room_id = %grant.room_id,
        ice_servers = grant.ice_servers.len(),
        "Room grant received"
    );

    Ok(grant)
}
