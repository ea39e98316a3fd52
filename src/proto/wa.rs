//! Hand-written protobuf message definitions.
//!
//! Covers the handshake frames, the post-handshake client payload, device
//! pairing data, the signed device identity, the Signal wire messages and
//! the transport envelope wrapped inside every encrypted message.
//! Application payloads stay opaque bytes throughout.

use prost::Message;

// ---------------------------------------------------------------------------
// Noise handshake
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct HandshakeMessage {
    #[prost(message, optional, tag = "2")]
    pub client_hello: Option<ClientHello>,
    #[prost(message, optional, tag = "3")]
    pub server_hello: Option<ServerHello>,
    #[prost(message, optional, tag = "4")]
    pub client_finish: Option<ClientFinish>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClientHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClientFinish {
    #[prost(bytes, optional, tag = "1")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
}

/// Certificate chain the server presents inside the handshake; the leaf
/// binds the server's static Noise key.
#[derive(Clone, PartialEq, Message)]
pub struct CertChain {
    #[prost(message, optional, tag = "1")]
    pub leaf: Option<NoiseCertificate>,
    #[prost(message, optional, tag = "2")]
    pub intermediate: Option<NoiseCertificate>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NoiseCertificate {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub signature: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NoiseCertificateDetails {
    #[prost(uint32, optional, tag = "1")]
    pub serial: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub issuer_serial: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub key: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "4")]
    pub not_before: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub not_after: Option<u64>,
}

// ---------------------------------------------------------------------------
// Client payload
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct ClientPayload {
    #[prost(uint64, optional, tag = "1")]
    pub username: Option<u64>,
    #[prost(bool, optional, tag = "3")]
    pub passive: Option<bool>,
    #[prost(message, optional, tag = "5")]
    pub user_agent: Option<UserAgent>,
    #[prost(message, optional, tag = "6")]
    pub web_info: Option<WebInfo>,
    #[prost(string, optional, tag = "7")]
    pub push_name: Option<String>,
    #[prost(int32, optional, tag = "9")]
    pub session_id: Option<i32>,
    #[prost(bool, optional, tag = "10")]
    pub short_connect: Option<bool>,
    #[prost(int32, optional, tag = "12")]
    pub connect_type: Option<i32>,
    #[prost(int32, optional, tag = "13")]
    pub connect_reason: Option<i32>,
    #[prost(uint32, optional, tag = "16")]
    pub connect_attempt_count: Option<u32>,
    #[prost(uint32, optional, tag = "18")]
    pub device: Option<u32>,
    #[prost(message, optional, tag = "19")]
    pub device_pairing_data: Option<DevicePairingData>,
    #[prost(bool, optional, tag = "23")]
    pub oc: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserAgent {
    #[prost(int32, optional, tag = "1")]
    pub platform: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub app_version: Option<AppVersion>,
    #[prost(int32, optional, tag = "3")]
    pub release_channel: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub mcc: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub os_version: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub device: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub locale: Option<String>,
    #[prost(string, optional, tag = "15")]
    pub manufacturer: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppVersion {
    #[prost(uint32, optional, tag = "1")]
    pub primary: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub secondary: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub tertiary: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub quaternary: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WebInfo {
    #[prost(string, optional, tag = "2")]
    pub version: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub web_sub_platform: Option<i32>,
}

/// Registration bundle carried by the first connection of an unpaired
/// device.
#[derive(Clone, PartialEq, Message)]
pub struct DevicePairingData {
    #[prost(bytes, optional, tag = "1")]
    pub e_regid: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub e_keytype: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub e_ident: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub e_skey_id: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "5")]
    pub e_skey_val: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "6")]
    pub e_skey_sig: Option<Vec<u8>>,
}

pub mod platform {
    pub const WEB: i32 = 14;
}

pub mod connect_type {
    pub const WIFI: i32 = 1;
}

pub mod connect_reason {
    pub const USER_ACTIVATED: i32 = 1;
}

// ---------------------------------------------------------------------------
// Signed device identity (ADV)
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct AdvSignedDeviceIdentityHmac {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub hmac: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AdvSignedDeviceIdentity {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub account_signature_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub account_signature: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub device_signature: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AdvDeviceIdentity {
    #[prost(uint32, optional, tag = "1")]
    pub raw_id: Option<u32>,
    #[prost(uint64, optional, tag = "2")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "3")]
    pub key_index: Option<u32>,
}

// ---------------------------------------------------------------------------
// Signal wire messages
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct SignalMessageProto {
    #[prost(bytes, optional, tag = "1")]
    pub ratchet_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "2")]
    pub counter: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub previous_counter: Option<u32>,
    #[prost(bytes, optional, tag = "4")]
    pub ciphertext: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PreKeySignalMessageProto {
    #[prost(uint32, optional, tag = "1")]
    pub pre_key_id: Option<u32>,
    #[prost(bytes, optional, tag = "2")]
    pub base_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub identity_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub message: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "5")]
    pub registration_id: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub signed_pre_key_id: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SenderKeyMessageProto {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub iteration: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub ciphertext: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SenderKeyDistributionMessageProto {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub iteration: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub chain_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub signing_key: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Transport envelope
// ---------------------------------------------------------------------------

/// The plaintext carried inside every `enc` body (before padding). The
/// application payload is an opaque protobuf; group sends additionally
/// piggyback the serialized sender key distribution message on the pairwise
/// copies.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(bytes, optional, tag = "1")]
    pub payload: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub sender_key_distribution_message: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Client payload for a device that is already paired.
pub fn login_payload(username: u64, device: u16, platform_name: &str, version: [u32; 4]) -> ClientPayload {
    ClientPayload {
        username: Some(username),
        passive: Some(true),
        user_agent: Some(user_agent(platform_name, version)),
        device: Some(u32::from(device)),
        connect_type: Some(connect_type::WIFI),
        connect_reason: Some(connect_reason::USER_ACTIVATED),
        ..Default::default()
    }
}

/// Client payload carrying the registration bundle of an unpaired device.
pub fn registration_payload(
    registration_id: u32,
    identity_public: &[u8; 33],
    signed_pre_key_id: u32,
    signed_pre_key_public: &[u8; 33],
    signed_pre_key_signature: &[u8; 64],
    platform_name: &str,
    version: [u32; 4],
) -> ClientPayload {
    let pairing_data = DevicePairingData {
        e_regid: Some(registration_id.to_be_bytes().to_vec()),
        e_keytype: Some(vec![crate::crypto::DJB_TYPE]),
        e_ident: Some(identity_public.to_vec()),
        e_skey_id: Some(signed_pre_key_id.to_be_bytes()[1..].to_vec()),
        e_skey_val: Some(signed_pre_key_public.to_vec()),
        e_skey_sig: Some(signed_pre_key_signature.to_vec()),
    };
    ClientPayload {
        passive: Some(false),
        user_agent: Some(user_agent(platform_name, version)),
        web_info: Some(WebInfo {
            version: Some(format!("{}.{}.{}", version[0], version[1], version[2])),
            web_sub_platform: Some(0),
        }),
        device_pairing_data: Some(pairing_data),
        connect_type: Some(connect_type::WIFI),
        connect_reason: Some(connect_reason::USER_ACTIVATED),
        oc: Some(false),
        ..Default::default()
    }
}

fn user_agent(_platform_name: &str, version: [u32; 4]) -> UserAgent {
    UserAgent {
        platform: Some(platform::WEB),
        app_version: Some(AppVersion {
            primary: Some(version[0]),
            secondary: Some(version[1]),
            tertiary: Some(version[2]),
            quaternary: Some(version[3]),
        }),
        release_channel: Some(0),
        os_version: Some("10.15.7".to_string()),
        device: Some("Desktop".to_string()),
        locale: Some("en".to_string()),
        manufacturer: Some("Mozilla".to_string()),
        ..Default::default()
    }
}

/// Encode any prost message to bytes.
pub fn encode_proto<M: Message>(msg: &M) -> Vec<u8> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf).expect("Vec<u8> write cannot fail");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope {
            payload: Some(b"opaque app payload".to_vec()),
            sender_key_distribution_message: None,
        };
        let bytes = encode_proto(&env);
        let back = Envelope::decode(&bytes[..]).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn registration_payload_carries_bundle() {
        let payload = registration_payload(
            0x0102_0304,
            &[5u8; 33],
            1,
            &[6u8; 33],
            &[7u8; 64],
            "web",
            [2, 3000, 1, 0],
        );
        let pd = payload.device_pairing_data.unwrap();
        assert_eq!(pd.e_regid.unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(pd.e_skey_id.unwrap(), vec![0, 0, 1]);
        assert_eq!(pd.e_keytype.unwrap(), vec![0x05]);
    }
}
