//! JSON text codec for the rtty WebSocket protocol.
//!
//! Wire format: one UTF-8 JSON object per WebSocket text frame.

use crate::error::RttyResult;
use crate::messages::{ClientMessage, ServerMessage};

/// Decode one client frame.
///
/// Unknown `type` values, missing fields and non-JSON input are all errors;
/// the relay drops such frames without closing the connection.
pub fn decode_client(text: &str) -> RttyResult<ClientMessage> {
    Ok(serde_json::from_str(text)?)
}

/// Encode one server message into a text frame.
pub fn encode_server(msg: &ServerMessage) -> RttyResult<String> {
    Ok(serde_json::to_string(msg)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sync_with_and_without_watermark() {
        assert_eq!(
            decode_client(r#"{"type":"sync","lastSeq":42}"#).unwrap(),
            ClientMessage::Sync { last_seq: Some(42) }
        );
        assert_eq!(
            decode_client(r#"{"type":"sync"}"#).unwrap(),
            ClientMessage::Sync { last_seq: None }
        );
        assert_eq!(
            decode_client(r#"{"type":"sync","lastSeq":null}"#).unwrap(),
            ClientMessage::Sync { last_seq: None }
        );
    }

    #[test]
    fn decodes_resize_and_upload() {
        assert_eq!(
            decode_client(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap(),
            ClientMessage::Resize { cols: 120, rows: 40 }
        );
        assert_eq!(
            decode_client(r#"{"type":"image_upload","data":"aGk="}"#).unwrap(),
            ClientMessage::ImageUpload {
                data: "aGk=".into(),
                filename: None
            }
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(decode_client("not json").is_err());
        assert!(decode_client(r#"{"type":"launch_missiles"}"#).is_err());
        assert!(decode_client(r#"{"type":"input"}"#).is_err());
        assert!(decode_client(r#"{"type":"resize","cols":"wide","rows":10}"#).is_err());
        assert!(decode_client(r#"{"type":"resize","cols":80.5,"rows":10}"#).is_err());
    }

    #[test]
    fn encodes_server_messages_with_wire_names() {
        let delta = encode_server(&ServerMessage::HistoryDelta {
            data: vec!["a".into()],
            last_seq: 7,
        })
        .unwrap();
        assert_eq!(delta, r#"{"type":"history-delta","data":["a"],"lastSeq":7}"#);

        let ok = encode_server(&ServerMessage::uploaded("/tmp/x.png")).unwrap();
        assert_eq!(ok, r#"{"type":"image_uploaded","path":"/tmp/x.png"}"#);

        let err = encode_server(&ServerMessage::upload_failed("too large")).unwrap();
        assert_eq!(err, r#"{"type":"image_uploaded","error":"too large"}"#);

        let exit = encode_server(&ServerMessage::Exit { code: 0 }).unwrap();
        assert_eq!(exit, r#"{"type":"exit","code":0}"#);
    }
}
