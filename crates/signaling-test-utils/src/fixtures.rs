//! Test fixtures for signals and bookings.

use call_signaling::models::{IceCandidate, NewSignal, SessionDescription, SignalKind};
use common::types::{CallId, Role};
use serde_json::{json, Value};

/// Booking ID unique to the calling test.
pub fn unique_booking_id() -> String {
    format!("booking-{}", uuid::Uuid::new_v4())
}

/// Host candidate `n` on the first audio section.
pub fn host_candidate(n: u16) -> IceCandidate {
    IceCandidate::new(
        format!(
            "candidate:{n} 1 udp 2122260223 192.168.1.{} 5{n:04} typ host",
            10 + n
        ),
        "0",
        0,
    )
}

pub fn offer_payload(sdp: &str) -> Value {
    SessionDescription::offer(sdp)
        .to_payload()
        .expect("offer payload serializes")
}

pub fn answer_payload(sdp: &str) -> Value {
    SessionDescription::answer(sdp)
        .to_payload()
        .expect("answer payload serializes")
}

pub fn ice_payload(candidate: &IceCandidate) -> Value {
    candidate.to_payload().expect("candidate payload serializes")
}

/// `ice` payload with neither `sdpMid` nor `sdpMLineIndex`.
pub fn malformed_ice_payload() -> Value {
    json!({
        "candidate": "candidate:9 1 udp 1 10.0.0.9 9 typ host",
        "sdpMid": null,
        "sdpMLineIndex": null
    })
}

/// SDP the mock capability accepts as a remote description.
pub fn mock_sdp(tag: &str) -> String {
    format!("v=0\r\no=test {tag} 1 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n")
}

pub fn new_signal(call_id: CallId, sender_role: Role, kind: SignalKind, payload: Value) -> NewSignal {
    NewSignal {
        call_id,
        sender_role,
        kind,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_candidates_are_distinct_and_parse() {
        let a = host_candidate(1);
        let b = host_candidate(2);
        assert_ne!(a, b);
        assert_eq!(IceCandidate::from_payload(&ice_payload(&a)).unwrap(), a);
    }

    #[test]
    fn test_malformed_ice_payload_is_rejected() {
        assert!(IceCandidate::from_payload(&malformed_ice_payload()).is_err());
    }
}
