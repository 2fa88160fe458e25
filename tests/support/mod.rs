//! Helpers for scripting an NDT server on a blocking thread.

use std::io::{Read, Write};
use std::net::TcpStream;

/// Frames `msg` as `{"msg": ...}` under the given message type.
pub fn send_frame(stream: &mut TcpStream, ty: u8, msg: &str) {
    let body = serde_json::json!({ "msg": msg }).to_string();
    let mut frame = vec![ty];
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(body.as_bytes());
    stream.write_all(&frame).unwrap();
}

/// Reads one framed message and parses its JSON payload.
pub fn recv_frame(stream: &mut TcpStream) -> (u8, serde_json::Value) {
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).unwrap();
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (header[0], serde_json::from_slice(&body).unwrap())
}
