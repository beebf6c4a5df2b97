//! Telink mesh pairing and per-session payload encryption.
//!
//! Pairing writes a request to the pair characteristic and reads the reply:
//! ```text
//! request: ┌──────┬──────────────┬─────────────────────────────────┐
//!          │ 0x0C │ client nonce │ encrypt(nonce, name ^ pass)[..8] │
//!          └──────┴──────────────┴─────────────────────────────────┘
//! reply:   0x0D + device nonce (accepted) | 0x0E (rejected)
//! ```
//! The session key is `encrypt(name ^ pass, client nonce || device nonce)`.
//! It lives in a [`MeshSession`] that is dropped with the session.

pub mod crypto;

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::error::{Error, FrameError, Result};
use crate::types::MacAddress;

use crypto::Block;

/// Opcode of a pair request.
pub const PAIR_REQUEST: u8 = 0x0C;

/// Reply opcode when credentials are accepted.
pub const PAIR_ACCEPTED: u8 = 0x0D;

/// Reply opcode when credentials are refused.
pub const PAIR_REJECTED: u8 = 0x0E;

/// Length of each side's pairing nonce.
pub const NONCE_LEN: usize = 8;

/// Plaintext command payloads are padded to this length.
const COMMAND_PAYLOAD_LEN: usize = 15;

/// Bytes preceding the encrypted body of a mesh packet.
const PACKET_HEADER_LEN: usize = 7;

/// Mesh network credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshCredentials {
    /// Mesh network name, at most 16 bytes are used.
    pub name: String,
    /// Mesh password, at most 16 bytes are used.
    pub password: String,
    /// Vendor identifier carried in every command.
    pub mesh_uuid: u16,
}

impl MeshCredentials {
    /// Creates credentials.
    pub fn new(name: impl Into<String>, password: impl Into<String>, mesh_uuid: u16) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            mesh_uuid,
        }
    }
}

impl Default for MeshCredentials {
    fn default() -> Self {
        Self::new("ZenggeMesh", "ZenggeTechnology", 0x0211)
    }
}

/// An outstanding pair request.
#[derive(Debug, Clone)]
pub struct PairRequest {
    nonce: [u8; NONCE_LEN],
    packet: Bytes,
}

impl PairRequest {
    /// The bytes to write to the pair characteristic.
    #[must_use]
    pub fn packet(&self) -> &Bytes {
        &self.packet
    }

    /// The client nonce.
    #[must_use]
    pub const fn nonce(&self) -> [u8; NONCE_LEN] {
        self.nonce
    }
}

/// Pairing handshake for one set of credentials.
#[derive(Debug, Clone)]
pub struct MeshCrypto {
    name_pass: Block,
    mesh_uuid: u16,
}

impl MeshCrypto {
    /// Creates the handshake helper.
    #[must_use]
    pub fn new(credentials: &MeshCredentials) -> Self {
        let name = crypto::pad(credentials.name.as_bytes());
        let password = crypto::pad(credentials.password.as_bytes());
        Self {
            name_pass: crypto::xor(&name, &password),
            mesh_uuid: credentials.mesh_uuid,
        }
    }

    /// Builds a pair request with a fresh random nonce.
    #[must_use]
    pub fn pair_request(&self) -> PairRequest {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.pair_request_with(nonce)
    }

    /// Builds a pair request for a given nonce.
    #[must_use]
    pub fn pair_request_with(&self, nonce: [u8; NONCE_LEN]) -> PairRequest {
        let proof = crypto::encrypt(&crypto::pad(&nonce), &self.name_pass);
        let mut packet = BytesMut::with_capacity(1 + 2 * NONCE_LEN);
        packet.put_u8(PAIR_REQUEST);
        packet.put_slice(&nonce);
        packet.put_slice(&proof[..NONCE_LEN]);
        PairRequest {
            nonce,
            packet: packet.freeze(),
        }
    }

    /// Interprets the pair characteristic reply and derives the session.
    ///
    /// A rejection is fatal. Anything unexpected is a retryable transport
    /// error.
    pub fn complete(
        &self,
        request: &PairRequest,
        reply: &[u8],
        mac: MacAddress,
    ) -> Result<MeshSession> {
        match reply.first() {
            Some(&PAIR_ACCEPTED) if reply.len() > NONCE_LEN => {
                let mut nonces = [0u8; 2 * NONCE_LEN];
                nonces[..NONCE_LEN].copy_from_slice(&request.nonce);
                nonces[NONCE_LEN..].copy_from_slice(&reply[1..=NONCE_LEN]);
                let key = crypto::encrypt(&self.name_pass, &nonces);
                Ok(MeshSession::new(key, mac, self.mesh_uuid))
            }
            Some(&PAIR_REJECTED) => Err(Error::PairingRejected),
            _ => Err(Error::transport(format!(
                "unexpected pair reply: {}",
                hex::encode(reply)
            ))),
        }
    }
}

/// Session key and counters for one paired connection.
#[derive(Debug)]
pub struct MeshSession {
    key: Block,
    mac: [u8; 6],
    mesh_uuid: u16,
    sequence: AtomicU32,
}

impl MeshSession {
    fn new(key: Block, mac: MacAddress, mesh_uuid: u16) -> Self {
        Self {
            key,
            mac: mac.reversed(),
            mesh_uuid,
            sequence: AtomicU32::new(rand::thread_rng().next_u32() & 0x00FF_FFFF),
        }
    }

    /// Encrypts a command.
    ///
    /// `command` is `[dest_lo, dest_hi, opcode, params...]`.
    pub fn seal(&self, command: &[u8]) -> Result<Bytes> {
        if command.len() < 3 {
            return Err(FrameError::TooShort {
                need: 3,
                got: command.len(),
            }
            .into());
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed).to_le_bytes();

        let mut nonce = [0u8; 8];
        nonce[..4].copy_from_slice(&self.mac[..4]);
        nonce[4] = 0x01;
        nonce[5..].copy_from_slice(&sequence[..3]);

        let mut payload = Vec::with_capacity(COMMAND_PAYLOAD_LEN);
        payload.extend_from_slice(&command[..3]);
        payload.extend_from_slice(&self.mesh_uuid.to_le_bytes());
        payload.extend_from_slice(&command[3..]);
        if payload.len() < COMMAND_PAYLOAD_LEN {
            payload.resize(COMMAND_PAYLOAD_LEN, 0);
        }

        let check = crypto::checksum(&self.key, &nonce, &payload);
        crypto::crypt(&self.key, &nonce, &mut payload);

        let mut packet = BytesMut::with_capacity(5 + payload.len());
        packet.put_slice(&sequence[..3]);
        packet.put_slice(&check[..2]);
        packet.put_slice(&payload);
        Ok(packet.freeze())
    }

    /// Decrypts a notification, returning the header followed by plaintext.
    pub fn open(&self, packet: &[u8]) -> std::result::Result<Bytes, FrameError> {
        if packet.len() <= PACKET_HEADER_LEN {
            return Err(FrameError::TooShort {
                need: PACKET_HEADER_LEN + 1,
                got: packet.len(),
            });
        }
        let mut nonce = [0u8; 8];
        nonce[..3].copy_from_slice(&self.mac[..3]);
        nonce[3..].copy_from_slice(&packet[..5]);

        let mut body = packet[PACKET_HEADER_LEN..].to_vec();
        crypto::crypt(&self.key, &nonce, &mut body);
        let check = crypto::checksum(&self.key, &nonce, &body);
        if check[..2] != packet[5..PACKET_HEADER_LEN] {
            return Err(FrameError::Corrupt {
                reason: "mesh checksum mismatch".into(),
            });
        }

        let mut out = BytesMut::with_capacity(packet.len());
        out.put_slice(&packet[..PACKET_HEADER_LEN]);
        out.put_slice(&body);
        Ok(out.freeze())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MAC: MacAddress = MacAddress::new([0xA4, 0xC1, 0x38, 0x01, 0x02, 0x03]);

    /// Accessory side of the handshake, for tests.
    pub(crate) struct SimulatedNode {
        pub(crate) name_pass: Block,
        pub(crate) nonce: [u8; NONCE_LEN],
    }

    impl SimulatedNode {
        pub(crate) fn new(credentials: &MeshCredentials) -> Self {
            Self {
                name_pass: MeshCrypto::new(credentials).name_pass,
                nonce: [9, 8, 7, 6, 5, 4, 3, 2],
            }
        }

        pub(crate) fn reply(&self, request: &[u8]) -> Vec<u8> {
            let nonce = crypto::pad(&request[1..=NONCE_LEN]);
            let proof = crypto::encrypt(&nonce, &self.name_pass);
            if request[0] != PAIR_REQUEST || proof[..NONCE_LEN] != request[1 + NONCE_LEN..] {
                return vec![PAIR_REJECTED];
            }
            let mut reply = vec![PAIR_ACCEPTED];
            reply.extend_from_slice(&self.nonce);
            reply
        }

        pub(crate) fn session_key(&self, client_nonce: &[u8]) -> Block {
            let mut nonces = [0u8; 16];
            nonces[..8].copy_from_slice(client_nonce);
            nonces[8..].copy_from_slice(&self.nonce);
            crypto::encrypt(&self.name_pass, &nonces)
        }

        /// Encrypts a notification the way a node does.
        pub(crate) fn notify(&self, key: &Block, header: [u8; 5], body: &[u8]) -> Vec<u8> {
            let mac = MAC.reversed();
            let mut nonce = [0u8; 8];
            nonce[..3].copy_from_slice(&mac[..3]);
            nonce[3..].copy_from_slice(&header);
            let check = crypto::checksum(key, &nonce, body);
            let mut body = body.to_vec();
            crypto::crypt(key, &nonce, &mut body);
            let mut packet = header.to_vec();
            packet.extend_from_slice(&check[..2]);
            packet.extend_from_slice(&body);
            packet
        }

        /// Decrypts a command the way a node does.
        pub(crate) fn receive(&self, key: &Block, packet: &[u8]) -> Option<Vec<u8>> {
            let mac = MAC.reversed();
            let mut nonce = [0u8; 8];
            nonce[..4].copy_from_slice(&mac[..4]);
            nonce[4] = 0x01;
            nonce[5..].copy_from_slice(&packet[..3]);
            let mut body = packet[5..].to_vec();
            crypto::crypt(key, &nonce, &mut body);
            let check = crypto::checksum(key, &nonce, &body);
            (check[..2] == packet[3..5]).then_some(body)
        }
    }

    fn paired() -> (SimulatedNode, MeshSession, Block) {
        let credentials = MeshCredentials::default();
        let node = SimulatedNode::new(&credentials);
        let crypto = MeshCrypto::new(&credentials);
        let request = crypto.pair_request_with([0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80]);
        let reply = node.reply(request.packet());
        let session = crypto.complete(&request, &reply, MAC).unwrap();
        let key = node.session_key(&request.nonce());
        (node, session, key)
    }

    #[test]
    fn test_pair_request_layout() {
        let crypto = MeshCrypto::new(&MeshCredentials::default());
        let request = crypto.pair_request_with([1, 2, 3, 4, 5, 6, 7, 8]);
        let packet = request.packet();
        assert_eq!(packet.len(), 17);
        assert_eq!(packet[0], PAIR_REQUEST);
        assert_eq!(&packet[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        // Nonces differ between requests
        assert_ne!(crypto.pair_request().nonce(), crypto.pair_request().nonce());
    }

    #[test]
    fn test_pairing_accepted_derives_shared_key() {
        let (_, session, key) = paired();
        assert_eq!(session.key, key);
    }

    #[test]
    fn test_pairing_rejected_with_wrong_credentials() {
        let node = SimulatedNode::new(&MeshCredentials::default());
        let crypto = MeshCrypto::new(&MeshCredentials::new("OtherMesh", "secret", 0x0211));
        let request = crypto.pair_request();
        let reply = node.reply(request.packet());
        assert_eq!(reply, vec![PAIR_REJECTED]);
        assert!(matches!(
            crypto.complete(&request, &reply, MAC),
            Err(Error::PairingRejected)
        ));
    }

    #[test]
    fn test_unexpected_pair_reply_is_retryable() {
        let crypto = MeshCrypto::new(&MeshCredentials::default());
        let request = crypto.pair_request();
        for reply in [&[][..], &[0x00][..], &[PAIR_ACCEPTED, 1, 2][..]] {
            let err = crypto.complete(&request, reply, MAC).unwrap_err();
            assert_eq!(err.classify(), crate::retry::Classification::Retryable);
        }
    }

    #[test]
    fn test_seal_is_readable_by_node() {
        let (node, session, key) = paired();
        let packet = session
            .seal(&[0xFF, 0xFF, 0xD0, 0xFF, 0x01, 0xFF])
            .unwrap();
        assert_eq!(packet.len(), 5 + COMMAND_PAYLOAD_LEN);

        let plain = node.receive(&key, &packet).unwrap();
        assert_eq!(&plain[..3], &[0xFF, 0xFF, 0xD0]);
        assert_eq!(&plain[3..5], &[0x11, 0x02]);
        assert_eq!(&plain[5..8], &[0xFF, 0x01, 0xFF]);
        assert!(plain[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_seal_advances_sequence() {
        let (_, session, _) = paired();
        let first = session.seal(&[0x00, 0x00, 0x01]).unwrap();
        let second = session.seal(&[0x00, 0x00, 0x01]).unwrap();
        assert_ne!(first[..3], second[..3]);
        assert!(session.seal(&[0x00, 0x00]).is_err());
    }

    #[test]
    fn test_open_notification() {
        let (node, session, key) = paired();
        let body: Vec<u8> = (0..13).collect();
        let packet = node.notify(&key, [0x81, 0x98, 0x5D, 0x00, 0x00], &body);

        let plain = session.open(&packet).unwrap();
        assert_eq!(&plain[..5], &[0x81, 0x98, 0x5D, 0x00, 0x00]);
        assert_eq!(&plain[7..], &body[..]);
    }

    #[test]
    fn test_open_rejects_tampered_packet() {
        let (node, session, key) = paired();
        let mut packet = node.notify(&key, [1, 2, 3, 4, 5], &[0xDC; 13]);
        packet[10] ^= 0x01;
        assert!(matches!(
            session.open(&packet),
            Err(FrameError::Corrupt { .. })
        ));
        assert!(matches!(
            session.open(&[0; 4]),
            Err(FrameError::TooShort { .. })
        ));
    }
}
