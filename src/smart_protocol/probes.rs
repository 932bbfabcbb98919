//! Probe packets and socket-level reachability checks
//!
//! A probe sends one protocol-shaped packet and treats any reply inside the
//! timeout as proof the port is serviced. OpenVPN needs a properly
//! HMAC-authenticated handshake packet or the server silently drops it;
//! WireGuard and IKEv2 endpoints answer a minimal datagram.

use hmac::{Hmac, Mac};
use log::debug;
use sha2::Sha512;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

type HmacSha512 = Hmac<Sha512>;

/// Opcode of the first client packet of an OpenVPN TLS handshake.
const P_CONTROL_HARD_RESET_CLIENT_V2: u8 = 7;
const OPCODE_SHIFT: u8 = 3;
const SESSION_ID_LEN: usize = 8;
/// The tls-auth HMAC key is the last 64 bytes of the 256-byte static key.
const TLS_AUTH_KEY_TAIL: usize = 64;

const DISCOVERY_FRAME_TYPE: u8 = 0xD1;
const DISCOVERY_NONCE_LEN: usize = 8;

pub(crate) fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Build the `P_CONTROL_HARD_RESET_CLIENT_V2` packet a tls-auth server will
/// accept. Deterministic for a given session id and timestamp; the TCP
/// variant carries the 2-byte big-endian length prefix.
pub(crate) fn openvpn_handshake_packet(
    static_key_hex: &str,
    session_id: [u8; SESSION_ID_LEN],
    timestamp: u32,
    with_length_prefix: bool,
) -> Option<Vec<u8>> {
    let key = hex_to_bytes(static_key_hex)?;
    if key.len() < TLS_AUTH_KEY_TAIL {
        return None;
    }
    let hmac_key = &key[key.len() - TLS_AUTH_KEY_TAIL..];

    let opcode = P_CONTROL_HARD_RESET_CLIENT_V2 << OPCODE_SHIFT;
    let ts = timestamp.to_be_bytes();

    // The server authenticates packet id and timestamp ahead of the header
    // fields, not in wire order.
    let mut authenticated = Vec::with_capacity(4 + 4 + 1 + SESSION_ID_LEN + 5);
    authenticated.extend_from_slice(&[0, 0, 0, 1]);
    authenticated.extend_from_slice(&ts);
    authenticated.push(opcode);
    authenticated.extend_from_slice(&session_id);
    authenticated.extend_from_slice(&[0, 0, 0, 0, 0]);

    let mut mac = HmacSha512::new_from_slice(hmac_key).ok()?;
    mac.update(&authenticated);
    let digest = mac.finalize().into_bytes();

    let mut packet = Vec::with_capacity(1 + SESSION_ID_LEN + digest.len() + 4 + 4 + 5);
    packet.push(opcode);
    packet.extend_from_slice(&session_id);
    packet.extend_from_slice(&digest);
    packet.extend_from_slice(&[0, 0, 0, 1]);
    packet.extend_from_slice(&ts);
    packet.extend_from_slice(&[0, 0, 0, 0, 0]);

    if with_length_prefix {
        let mut framed = Vec::with_capacity(packet.len() + 2);
        framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        framed.extend_from_slice(&packet);
        Some(framed)
    } else {
        Some(packet)
    }
}

/// Handshake packet with a fresh session id and the current time.
pub(crate) fn openvpn_probe_packet(
    static_key_hex: &str,
    with_length_prefix: bool,
) -> Option<Vec<u8>> {
    let mut session_id = [0u8; SESSION_ID_LEN];
    getrandom(&mut session_id);
    let timestamp = chrono::Utc::now().timestamp() as u32;
    openvpn_handshake_packet(static_key_hex, session_id, timestamp, with_length_prefix)
}

/// Minimal datagram for endpoints that answer anything addressed to them
/// (WireGuard, IKEv2). The nonce keeps middleboxes from replaying a cached
/// answer.
pub(crate) fn discovery_datagram() -> Vec<u8> {
    let mut frame = vec![0u8; 1 + DISCOVERY_NONCE_LEN];
    frame[0] = DISCOVERY_FRAME_TYPE;
    getrandom(&mut frame[1..]);
    frame
}

fn getrandom(buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

/// Send `payload` over UDP and wait for any reply. One timeout covers the
/// whole exchange.
pub(crate) async fn udp_probe(addr: SocketAddr, payload: &[u8], timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, udp_exchange(addr, payload)).await {
        Ok(answered) => answered,
        Err(_) => {
            debug!("UDP probe to {} timed out", addr);
            false
        }
    }
}

async fn udp_exchange(addr: SocketAddr, payload: &[u8]) -> bool {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("UDP probe bind failed: {}", e);
            return false;
        }
    };
    if let Err(e) = socket.connect(addr).await {
        debug!("UDP probe connect to {} failed: {}", addr, e);
        return false;
    }
    if let Err(e) = socket.send(payload).await {
        debug!("UDP probe send to {} failed: {}", addr, e);
        return false;
    }

    let mut response = [0u8; 1024];
    match socket.recv(&mut response).await {
        Ok(_) => true,
        Err(e) => {
            debug!("UDP probe receive from {} failed: {}", addr, e);
            false
        }
    }
}

/// Connect, send `payload`, and wait for at least one byte back. One timeout
/// covers connect, send and receive.
pub(crate) async fn tcp_probe(addr: SocketAddr, payload: &[u8], timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, tcp_exchange(addr, payload)).await {
        Ok(answered) => answered,
        Err(_) => {
            debug!("TCP probe to {} timed out", addr);
            false
        }
    }
}

async fn tcp_exchange(addr: SocketAddr, payload: &[u8]) -> bool {
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("TCP probe connect to {} failed: {}", addr, e);
            return false;
        }
    };

    if let Err(e) = stream.write_all(payload).await {
        debug!("TCP probe send to {} failed: {}", addr, e);
        return false;
    }

    let mut response = [0u8; 1024];
    match stream.read(&mut response).await {
        // Zero bytes is an orderly close without an answer
        Ok(n) => n > 0,
        Err(e) => {
            debug!("TCP probe receive from {} failed: {}", addr, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key_hex() -> String {
        "0123456789abcdef".repeat(32)
    }

    #[test]
    fn test_hex_to_bytes_decodes() {
        assert_eq!(hex_to_bytes("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(hex_to_bytes(""), Some(vec![]));
    }

    #[test]
    fn test_hex_to_bytes_rejects_odd_length() {
        assert_eq!(hex_to_bytes("abc"), None);
    }

    #[test]
    fn test_hex_to_bytes_rejects_non_hex() {
        assert_eq!(hex_to_bytes("zz"), None);
    }

    #[test]
    fn test_openvpn_packet_layout() {
        let session_id = [1, 2, 3, 4, 5, 6, 7, 8];
        let packet =
            openvpn_handshake_packet(&test_key_hex(), session_id, 0x0102_0304, false).unwrap();

        // opcode + session id + hmac + packet id + timestamp + tail
        assert_eq!(packet.len(), 1 + 8 + 64 + 4 + 4 + 5);
        assert_eq!(packet[0], 7 << 3);
        assert_eq!(&packet[1..9], &session_id);
        assert_eq!(&packet[73..77], &[0, 0, 0, 1]);
        assert_eq!(&packet[77..81], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&packet[81..86], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_openvpn_packet_tcp_length_prefix() {
        let session_id = [0u8; 8];
        let packet = openvpn_handshake_packet(&test_key_hex(), session_id, 1, true).unwrap();
        assert_eq!(packet.len(), 88);
        assert_eq!(&packet[..2], &[0, 86]);
        assert_eq!(packet[2], 7 << 3);
    }

    #[test]
    fn test_openvpn_packet_is_deterministic() {
        let session_id = [9u8; 8];
        let a = openvpn_handshake_packet(&test_key_hex(), session_id, 42, false).unwrap();
        let b = openvpn_handshake_packet(&test_key_hex(), session_id, 42, false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_openvpn_packet_hmac_depends_on_key() {
        let session_id = [9u8; 8];
        let a = openvpn_handshake_packet(&test_key_hex(), session_id, 42, false).unwrap();
        let other_key = "fedcba9876543210".repeat(32);
        let b = openvpn_handshake_packet(&other_key, session_id, 42, false).unwrap();
        assert_eq!(&a[..9], &b[..9]);
        assert_ne!(&a[9..73], &b[9..73]);
    }

    #[test]
    fn test_openvpn_packet_rejects_short_key() {
        assert!(openvpn_handshake_packet("00ff", [0u8; 8], 1, false).is_none());
        assert!(openvpn_handshake_packet("not hex", [0u8; 8], 1, false).is_none());
    }

    #[test]
    fn test_openvpn_probe_packet_uses_fresh_session_ids() {
        let a = openvpn_probe_packet(&test_key_hex(), false).unwrap();
        let b = openvpn_probe_packet(&test_key_hex(), false).unwrap();
        assert_ne!(&a[1..9], &b[1..9]);
    }

    #[test]
    fn test_discovery_datagram_shape() {
        let a = discovery_datagram();
        let b = discovery_datagram();
        assert_eq!(a.len(), 1 + DISCOVERY_NONCE_LEN);
        assert_eq!(a[0], DISCOVERY_FRAME_TYPE);
        assert_ne!(a[1..], b[1..]);
    }

    #[tokio::test]
    async fn test_udp_probe_detects_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            if let Ok((n, peer)) = responder.recv_from(&mut buf).await {
                let _ = responder.send_to(&buf[..n], peer).await;
            }
        });

        assert!(udp_probe(addr, &discovery_datagram(), Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_udp_probe_times_out_without_responder() {
        // Bound but never answered
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        assert!(!udp_probe(addr, &discovery_datagram(), Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_detects_responder() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                if let Ok(n) = socket.read(&mut buf).await {
                    let _ = socket.write_all(&buf[..n]).await;
                }
            }
        });

        let packet = openvpn_probe_packet(&test_key_hex(), true).unwrap();
        assert!(tcp_probe(addr, &packet, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_rejects_close_without_data() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hang up without answering
            let _ = listener.accept().await;
        });

        let packet = openvpn_probe_packet(&test_key_hex(), true).unwrap();
        assert!(!tcp_probe(addr, &packet, Duration::from_secs(2)).await);
    }
}
