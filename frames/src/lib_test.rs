use super::*;

const INFO_CHUNKED: &str = concat!(
    "HTTP/1.1 200 OK\r\n",
    "Server: Tydom-001A2502951F\r\n",
    "Uri-Origin: /info\r\n",
    "Content-Type: application/json\r\n",
    "Transfer-Encoding: chunked\r\n",
    "Transac-Id: request_1\r\n",
    "\r\n",
    "1\r\n",
    "{\r\n",
    "18\r\n",
    "\"productName\": \"TYDOM2\",\r\n",
    "16\r\n",
    "\"mac\": \"001A2502951F\",\r\n",
    "F\r\n",
    "\"bddStatus\": 0,\r\n",
    "B\r\n",
    "\"geoloc\": {\r\n",
    "14\r\n",
    "\"latitude\": 48897412\r\n",
    "2\r\n",
    "}}\r\n",
    "0\r\n",
    "\r\n",
);

const DEVICES_DATA_PUSH: &str = concat!(
    "PUT /devices/data HTTP/1.1\r\n",
    "Server: Tydom-001A2502951F\r\n",
    "content-type: application/json\r\n",
    "Transfer-Encoding: chunked\r\n",
    "\r\n",
    "74\r\n",
    "[{\"id\":1531745761,\"endpoints\":[{\"id\":1531745761,\"error\":0,\"data\":[{\"name\":\"level\",\"validity\":\"upToDate\",\"value\":100}\r\n",
    "3F\r\n",
    ",{\"name\":\"onFavPos\",\"validity\":\"upToDate\",\"value\":false}]}]}]\r\n",
    "\r\n",
    "0\r\n",
    "\r\n",
);

fn http(data: &[u8]) -> HttpMessage {
    match decode_message(data).expect("decode should succeed") {
        ProtocolMessage::Http(message) => message,
        ProtocolMessage::Binary(_) => panic!("expected an HTTP message"),
    }
}

fn json_response(headers: &str, body: &str) -> Vec<u8> {
    format!("HTTP/1.1 200 OK\r\n{headers}Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
}

// =============================================================================
// KIND DETECTION
// =============================================================================

#[test]
fn detects_response_from_status_line() {
    assert_eq!(detect_kind(b"HTTP/1.1 200 OK\r\n"), MessageKind::Response);
}

#[test]
fn detects_request_from_request_line() {
    assert_eq!(detect_kind(b"GET /x HTTP/1.1\r\n"), MessageKind::Request);
}

#[test]
fn detects_binary_for_anything_else() {
    assert_eq!(detect_kind(&[0x00, 0xff, 0x10, 0x42]), MessageKind::Binary);
    assert_eq!(detect_kind(b"hello world\r\n"), MessageKind::Binary);
    assert_eq!(detect_kind(b"get /lowercase HTTP/1.1\r\n"), MessageKind::Binary);
    assert_eq!(detect_kind(b""), MessageKind::Binary);
}

#[test]
fn response_line_without_reason_is_still_a_response() {
    assert_eq!(detect_kind(b"HTTP/1.1 204\r\n"), MessageKind::Response);
}

#[test]
fn binary_frames_decode_to_raw_bytes() {
    let data = [0x01_u8, 0x02, 0x03];
    let message = decode_message(&data).expect("binary never fails");
    assert_eq!(message.kind(), MessageKind::Binary);
    assert_eq!(message, ProtocolMessage::Binary(data.to_vec()));
}

// =============================================================================
// RESPONSES
// =============================================================================

#[test]
fn chunked_info_response_is_reassembled_and_parsed() {
    let message = http(INFO_CHUNKED.as_bytes());
    assert_eq!(message.kind, MessageKind::Response);
    assert_eq!(message.status, Some(200));
    assert_eq!(message.method, None);
    assert_eq!(message.uri, "/info");
    assert_eq!(message.transaction_id(), Some("request_1"));
    assert_eq!(message.headers.get("server"), Some("Tydom-001A2502951F"));
    assert_eq!(
        message.body,
        serde_json::json!({
            "productName": "TYDOM2",
            "mac": "001A2502951F",
            "bddStatus": 0,
            "geoloc": { "latitude": 48897412 }
        })
    );
}

#[test]
fn chunked_and_unchunked_bodies_are_byte_identical() {
    let body = r#"{"a":[1,2,3],"b":{"c":"d"},"e":null}"#;
    let unchunked = json_response("Content-Type: application/json\r\n", body);

    let mut chunked = String::from("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n");
    for piece in [&body[..5], &body[5..17], &body[17..]] {
        chunked.push_str(&format!("{:X}\r\n{piece}\r\n", piece.len()));
    }
    chunked.push_str("0\r\n\r\n");

    let mut parser = MessageParser::new();
    let raw = parser.feed(chunked.as_bytes()).expect("feed").expect("complete");
    assert_eq!(raw.body, body.as_bytes());

    let value: Value = serde_json::from_str(body).expect("fixture json");
    assert_eq!(http(&unchunked).body, value);
    assert_eq!(http(chunked.as_bytes()).body, value);
}

#[test]
fn response_without_uri_origin_defaults_to_root() {
    let message = http(&json_response("Content-Type: application/json\r\n", "{}"));
    assert_eq!(message.uri, "/");
}

#[test]
fn response_without_body_yields_empty_object() {
    let message = http(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(message.body, serde_json::json!({}));
}

#[test]
fn non_json_content_type_yields_empty_object() {
    let message = http(&json_response("Content-Type: text/plain\r\n", "plain text"));
    assert_eq!(message.body, serde_json::json!({}));
}

#[test]
fn response_without_framing_reads_to_end_of_frame() {
    let message = http(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"ok\":true}");
    assert_eq!(message.body, serde_json::json!({ "ok": true }));
}

#[test]
fn html_body_declared_as_json_is_flagged_as_error() {
    let html = "<!doctype html>\r\n<html><body>Error 500</body></html>";
    let message = http(&json_response("Content-Type: application/json\r\n", html));
    assert_eq!(message.status, Some(400));
    assert_eq!(message.body, serde_json::json!({ "error": 1, "body": html }));
}

#[test]
fn html_error_keeps_non_200_status() {
    let html = "<!DOCTYPE html><html></html>";
    let raw = format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{html}",
        html.len()
    );
    let message = http(raw.as_bytes());
    assert_eq!(message.status, Some(404));
    assert_eq!(message.body["error"], serde_json::json!(1));
}

#[test]
fn malformed_json_body_is_a_decode_error() {
    let err = decode_message(&json_response("Content-Type: application/json\r\n", "{nope"))
        .expect_err("json should fail");
    assert!(matches!(err, DecodeError::Json(_)));
}

// =============================================================================
// REQUESTS (PUSHED NOTIFICATIONS)
// =============================================================================

#[test]
fn pushed_request_is_parsed_with_method_and_uri() {
    let message = http(DEVICES_DATA_PUSH.as_bytes());
    assert_eq!(message.kind, MessageKind::Request);
    assert_eq!(message.method.as_deref(), Some("PUT"));
    assert_eq!(message.uri, "/devices/data");
    assert_eq!(message.status, None);
    assert_eq!(message.transaction_id(), None);
    assert_eq!(message.body[0]["endpoints"][0]["data"][1]["name"], "onFavPos");
}

#[test]
fn request_without_framing_has_no_body() {
    let message = http(b"GET /ping HTTP/1.1\r\nContent-Type: application/json\r\n\r\n");
    assert_eq!(message.body, serde_json::json!({}));
}

// =============================================================================
// HEADERS
// =============================================================================

#[test]
fn headers_are_case_insensitive_and_last_value_wins() {
    let message = http(b"HTTP/1.1 200 OK\r\nX-Thing: one\r\nx-thing: two\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(message.headers.get("X-THING"), Some("two"));
    assert!(message.headers.contains("x-Thing"));
}

#[test]
fn header_line_without_separator_is_rejected() {
    let err = decode_message(b"HTTP/1.1 200 OK\r\nbroken header\r\n\r\n").expect_err("header should fail");
    assert!(matches!(err, DecodeError::HeaderLine(_)));
}

#[test]
fn invalid_content_length_is_rejected() {
    let err = decode_message(b"HTTP/1.1 200 OK\r\nContent-Length: lots\r\n\r\n").expect_err("length should fail");
    assert!(matches!(err, DecodeError::ContentLength(_)));
}

// =============================================================================
// INCREMENTAL PARSING
// =============================================================================

#[test]
fn byte_at_a_time_feeding_completes_on_last_byte() {
    let bytes = INFO_CHUNKED.as_bytes();
    let mut parser = MessageParser::new();
    for byte in &bytes[..bytes.len() - 1] {
        assert!(parser.feed(std::slice::from_ref(byte)).expect("feed").is_none());
    }
    let raw = parser.feed(&bytes[bytes.len() - 1..]).expect("feed").expect("complete");
    assert_eq!(raw.status, Some(200));
    assert!(raw.body.starts_with(b"{\"productName\""));
}

#[test]
fn truncated_chunked_body_is_incomplete() {
    let err = decode_message(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nA\r\n12345")
        .expect_err("should be incomplete");
    assert!(matches!(err, DecodeError::Incomplete));
}

#[test]
fn missing_header_terminator_is_incomplete() {
    let err = decode_message(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n").expect_err("should be incomplete");
    assert!(matches!(err, DecodeError::Incomplete));
}

#[test]
fn invalid_chunk_size_is_rejected() {
    let err = decode_message(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nab\r\n0\r\n\r\n")
        .expect_err("chunk should fail");
    assert!(matches!(err, DecodeError::ChunkSize(_)));
}

#[test]
fn oversized_chunk_size_is_rejected_without_overflow() {
    for size in ["ffffffffffffffff", "fffffffffffffffe", "fffffffffffffffd"] {
        let raw = format!("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{size}\r\nxyz\r\n");
        let err = decode_message(raw.as_bytes()).expect_err("chunk should fail");
        assert!(matches!(err, DecodeError::ChunkSize(ref line) if line == size), "{size}: {err:?}");
    }
}

#[test]
fn final_chunk_without_trailing_blank_line_still_completes() {
    let message = http(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n{}\r\n0\r\n");
    assert_eq!(message.body, serde_json::json!({}));
}

// =============================================================================
// ENCODING
// =============================================================================

#[test]
fn encode_request_without_body_matches_wire_layout() {
    let raw = encode_request(
        Method::Get,
        "/info",
        &[("content-length", "0".to_owned()), ("transac-id", "42".to_owned())],
        "",
    );
    assert_eq!(raw, "GET /info HTTP/1.1\r\ncontent-length: 0\r\ntransac-id: 42\r\n\r\n\r\n");
}

#[test]
fn encode_request_with_body_appends_separator() {
    let raw = encode_request(Method::Put, "/devices/1", &[("content-length", "2".to_owned())], "{}");
    assert_eq!(raw, "PUT /devices/1 HTTP/1.1\r\ncontent-length: 2\r\n\r\n\r\n{}\r\n\r\n");
}

#[test]
fn encoded_request_decodes_back_as_request() {
    let raw = encode_request(Method::Delete, "/scenarios/3", &[("transac-id", "7".to_owned())], "");
    let message = http(raw.as_bytes());
    assert_eq!(message.method.as_deref(), Some("DELETE"));
    assert_eq!(message.uri, "/scenarios/3");
    assert_eq!(message.transaction_id(), Some("7"));
}

// =============================================================================
// TRANSPORT FRAMING
// =============================================================================

#[test]
fn relay_host_selects_relay_transport() {
    assert_eq!(Transport::for_host("mediation.tydom.com", "mediation.tydom.com"), Transport::Relay);
    assert_eq!(Transport::for_host("192.168.1.2", "mediation.tydom.com"), Transport::Direct);
}

#[test]
fn relay_outbound_prefixes_control_byte() {
    assert_eq!(Transport::Relay.outbound(b"GET"), vec![RELAY_CONTROL_BYTE, b'G', b'E', b'T']);
    assert_eq!(Transport::Direct.outbound(b"GET"), b"GET".to_vec());
}

#[test]
fn relay_inbound_strips_control_byte() {
    let framed = [RELAY_CONTROL_BYTE, b'H', b'T'];
    assert_eq!(Transport::Relay.inbound(&framed), b"HT");
    assert_eq!(Transport::Direct.inbound(&framed), &framed[..]);
}

#[test]
fn relay_inbound_leaves_unprefixed_frames_alone() {
    assert_eq!(Transport::Relay.inbound(b"HTTP"), b"HTTP");
}

#[test]
fn kind_serializes_as_lowercase_json() {
    assert_eq!(serde_json::to_string(&MessageKind::Response).expect("serialize"), "\"response\"");
}
