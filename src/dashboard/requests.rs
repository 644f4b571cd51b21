use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::{ErrorCode, Message};
use crate::utils::DashboardError;

/// Every request a client can make. Adding a variant forces a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    GetStats,
    GetConfig,
    GetLogs,
    GetFileWatcherStatus,
    GetConnectedClients,
    RefreshState,
}

impl RequestType {
    pub fn parse(name: &str) -> Result<Self, DashboardError> {
        serde_json::from_value(Value::String(name.to_string()))
            .map_err(|_| DashboardError::UnknownRequest(name.to_string()))
    }
}

/// Decoded `data` of a `request` message.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_type: RequestType,
    pub params: Value,
}

impl Request {
    pub fn from_message(message: &Message) -> Result<Self, DashboardError> {
        let name = message
            .data_str("requestType")
            .ok_or_else(|| DashboardError::InvalidParams("missing requestType".to_string()))?;
        let request_type = RequestType::parse(name)?;

        let params = match message.data.get("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(params) if params.is_object() => params.clone(),
            Some(_) => {
                return Err(DashboardError::InvalidParams(
                    "params must be an object".to_string(),
                ));
            }
        };

        Ok(Self {
            request_type,
            params,
        })
    }
}

/// Error code reported to the client for a failed request.
pub fn error_code(error: &DashboardError) -> ErrorCode {
    match error {
        DashboardError::UnknownRequest(_) => ErrorCode::UnknownRequest,
        DashboardError::InvalidParams(_) => ErrorCode::InvalidParams,
        _ => ErrorCode::RequestFailed,
    }
}
