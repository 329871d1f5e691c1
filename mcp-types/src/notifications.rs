use serde::Deserialize;
use serde::Serialize;

use crate::ProgressToken;
use crate::RequestId;

/// Params of `notifications/progress`. `progress` is monotonically
/// non-decreasing per token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotificationParams {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Params of `notifications/cancelled`. Only meaningful for requests still
/// in flight on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotificationParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Params of `notifications/resources/updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpdatedNotificationParams {
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn progress_params_round_trip() {
        let params = ProgressNotificationParams {
            progress_token: ProgressToken::Integer(3),
            progress: 1.0,
            total: Some(3.0),
            message: None,
        };
        let value = serde_json::to_value(&params).expect("to_value");
        assert_eq!(
            value,
            json!({"progressToken": 3, "progress": 1.0, "total": 3.0})
        );
        let back: ProgressNotificationParams = serde_json::from_value(value).expect("from_value");
        assert_eq!(back, params);
    }

    #[test]
    fn cancelled_params_round_trip() {
        let params = CancelledNotificationParams {
            request_id: RequestId::String("r-9".to_string()),
            reason: Some("timeout".to_string()),
        };
        let value = serde_json::to_value(&params).expect("to_value");
        assert_eq!(value, json!({"requestId": "r-9", "reason": "timeout"}));
    }
}
