//! Wire formats shared by the client bindings and the server primitives

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};

/// Declared size of a streaming download response
pub const HEADER_DOWNLOAD_SIZE: &str = "x-download-size-bytes";
/// Server wall clock at response time, milliseconds since the epoch
pub const HEADER_SERVER_TIMESTAMP: &str = "x-server-timestamp";
pub const HEADER_DOWNLOAD_START: &str = "x-download-start-time";

/// Binary frame size for duplex transfers
pub const DUPLEX_CHUNK_BYTES: usize = 64 * 1024;
/// Interval between `download_progress` messages
pub const DUPLEX_PROGRESS_INTERVAL_BYTES: u64 = 1024 * 1024;

/// Header length of an unmasked server-to-client WebSocket frame carrying
/// `payload_len` bytes
pub fn ws_frame_header_len(payload_len: usize) -> usize {
    match payload_len {
        0..=125 => 2,
        126..=65_535 => 4,
        _ => 10,
    }
}

/// `GET /ping` response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoResponse {
    pub status: String,
    pub message: String,
    pub server_timestamp: i64,
    #[serde(default)]
    pub request_timestamp: Option<i64>,
    /// Milliseconds spent between receiving the request and answering it
    #[serde(default)]
    pub server_processing_time: Option<f64>,
}

/// `POST /upload` response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub status: String,
    pub received_at: i64,
    pub byte_length: u64,
    /// Milliseconds from accepting the request to the last body byte
    pub duration: f64,
    #[serde(rename = "throughputMBps")]
    pub throughput_megabytes_per_sec: f64,
    #[serde(default)]
    pub throughput_mbps: f64,
}

/// Messages sent by the client over the duplex socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Ping {
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    DownloadStart {
        size: u64,
        chunk_size: usize,
    },
    /// Stop an in-flight download; answered with `download_complete`
    DownloadCancel,
    UploadStart,
    UploadData {
        byte_length: u64,
        /// Echoed in the matching `upload_ack`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    TestComplete,
}

/// Messages sent by the server over the duplex socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        client_id: String,
        timestamp: i64,
    },
    Pong {
        client_timestamp: i64,
        server_timestamp: i64,
        #[serde(default)]
        server_processing_time: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    DownloadStarted {
        total_bytes: u64,
        #[serde(default)]
        chunk_size: usize,
    },
    DownloadProgress {
        bytes_transferred: u64,
        total_bytes: u64,
    },
    DownloadComplete {
        total_bytes: u64,
        /// Milliseconds
        duration: f64,
    },
    UploadReady,
    UploadAck {
        bytes_received: u64,
        #[serde(default)]
        total_bytes_received: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    TestCompleteAck,
    Error {
        message: String,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| AppError::protocol(format!("Malformed client message: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| AppError::protocol(format!("Malformed server message: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let json = ClientMessage::DownloadStart {
            size: 10_485_760,
            chunk_size: DUPLEX_CHUNK_BYTES,
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "download_start");
        assert_eq!(value["size"], 10_485_760);
        assert_eq!(value["chunkSize"], 65_536);

        let json = ClientMessage::TestComplete.to_json().unwrap();
        assert_eq!(json, r#"{"type":"test_complete"}"#);
    }

    #[test]
    fn test_ping_without_id_is_accepted() {
        let parsed = ClientMessage::parse(r#"{"type":"ping","timestamp":1700000000000}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Ping {
                timestamp: 1_700_000_000_000,
                id: None
            }
        );
    }

    #[test]
    fn test_server_message_parsing() {
        let pong = ServerMessage::parse(
            r#"{"type":"pong","clientTimestamp":1,"serverTimestamp":2,"serverProcessingTime":0.25}"#,
        )
        .unwrap();
        assert_eq!(
            pong,
            ServerMessage::Pong {
                client_timestamp: 1,
                server_timestamp: 2,
                server_processing_time: Some(0.25),
                id: None
            }
        );

        let ack = ServerMessage::parse(r#"{"type":"upload_ack","bytesReceived":1024}"#).unwrap();
        assert_eq!(
            ack,
            ServerMessage::UploadAck {
                bytes_received: 1024,
                total_bytes_received: 0,
                id: None
            }
        );

        let json = ClientMessage::UploadData {
            byte_length: 512,
            id: Some(9),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"upload_data","byteLength":512,"id":9}"#);

        let ready = ServerMessage::parse(r#"{"type":"upload_ready"}"#).unwrap();
        assert_eq!(ready, ServerMessage::UploadReady);
    }

    #[test]
    fn test_unknown_message_is_protocol_error() {
        let error = ServerMessage::parse(r#"{"type":"teleport"}"#).unwrap_err();
        assert_eq!(error.category(), "PROTOCOL");
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_ws_frame_header_len() {
        assert_eq!(ws_frame_header_len(0), 2);
        assert_eq!(ws_frame_header_len(125), 2);
        assert_eq!(ws_frame_header_len(126), 4);
        assert_eq!(ws_frame_header_len(65_535), 4);
        assert_eq!(ws_frame_header_len(DUPLEX_CHUNK_BYTES), 10);
    }

    #[test]
    fn test_upload_receipt_field_names() {
        let receipt = UploadReceipt {
            status: "ok".to_string(),
            received_at: 1,
            byte_length: 1_048_576,
            duration: 80.0,
            throughput_megabytes_per_sec: 13.1,
            throughput_mbps: 104.9,
        };
        let value = serde_json::to_value(&receipt).unwrap();
        assert_eq!(value["byteLength"], 1_048_576);
        assert_eq!(value["throughputMBps"], 13.1);
        assert_eq!(value["throughputMbps"], 104.9);
    }
}
