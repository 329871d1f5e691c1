use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::ProgressNotificationParams;
use mcp_types::ProgressToken;
use mcp_types::ServerNotification;
use pretty_assertions::assert_eq;
use serde_json::json;

#[test]
fn deserialize_progress_notification() {
    let raw = r#"{
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": {
            "progressToken": 42,
            "progress": 1,
            "total": 3,
            "message": "reticulating"
        }
    }"#;

    let msg: JSONRPCMessage = serde_json::from_str(raw).expect("deserialize");
    let JSONRPCMessage::Notification(notification) = msg else {
        unreachable!()
    };

    let parsed = ServerNotification::try_from(notification).expect("typed conversion");
    assert_eq!(
        parsed,
        ServerNotification::ProgressNotification(ProgressNotificationParams {
            progress_token: ProgressToken::Integer(42),
            progress: 1.0,
            total: Some(3.0),
            message: Some("reticulating".to_string()),
        })
    );
}

#[test]
fn serialize_progress_notification_omits_absent_fields() {
    let notification = JSONRPCNotification {
        jsonrpc: "2.0".into(),
        method: "notifications/progress".into(),
        params: Some(
            serde_json::to_value(ProgressNotificationParams {
                progress_token: ProgressToken::String("tok".to_string()),
                progress: 0.5,
                total: None,
                message: None,
            })
            .expect("params to_value"),
        ),
    };
    assert_eq!(
        serde_json::to_value(JSONRPCMessage::Notification(notification)).expect("to_value"),
        json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {"progressToken": "tok", "progress": 0.5},
        })
    );
}
