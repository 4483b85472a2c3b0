//! S0: the legacy security scheme.
//!
//! Every encapsulation consumes one fresh receiver nonce obtained through
//! a Nonce Get / Nonce Report round-trip. The payload is encrypted with
//! AES-OFB under a key derived from the network key, and authenticated
//! with an AES CBC-MAC (truncated to 8 bytes) under a second derived key.
//!
//! Nonces are single-use and expire after `timeouts.nonce`; the manager
//! owns both tables — nonces we issued to peers and nonces peers issued
//! to us.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use subtle::ConstantTimeEq;
use zwire_proto::NodeId;

use crate::{env::Environment, error::SecurityError};

/// S0 Nonce Get
pub const NONCE_GET: u8 = 0x40;
/// S0 Nonce Report
pub const NONCE_REPORT: u8 = 0x80;
/// S0 Message Encapsulation
pub const MESSAGE_ENCAP: u8 = 0x81;
/// S0 Message Encapsulation + Nonce Get
pub const MESSAGE_ENCAP_NONCE_GET: u8 = 0xC1;

type Aes128Ofb = ofb::Ofb<Aes128>;

const NONCE_LEN: usize = 8;
const MAC_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
struct StoredNonce {
    nonce: [u8; NONCE_LEN],
    issued_at: Instant,
}

/// S0 security manager: derived keys plus both nonce tables.
pub struct S0Manager<E: Environment> {
    env: E,
    /// Encryption key: AES(network_key, 0xAA * 16)
    enc_key: [u8; 16],
    /// Authentication key: AES(network_key, 0x55 * 16)
    auth_key: [u8; 16],
    /// Nonces peers reported to us, keyed by peer; consumed on use
    peer_nonces: HashMap<NodeId, Vec<StoredNonce>>,
    /// Nonces we reported to peers, keyed by their first byte (nonce id)
    own_nonces: HashMap<u8, StoredNonce>,
    nonce_timeout: Duration,
}

impl<E: Environment> S0Manager<E> {
    /// Derive the working keys from the S0 network key.
    #[must_use]
    pub fn new(network_key: [u8; 16], env: E, nonce_timeout: Duration) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(&network_key));

        let mut enc_key = GenericArray::clone_from_slice(&[0xAA; 16]);
        cipher.encrypt_block(&mut enc_key);
        let mut auth_key = GenericArray::clone_from_slice(&[0x55; 16]);
        cipher.encrypt_block(&mut auth_key);

        Self {
            env,
            enc_key: enc_key.into(),
            auth_key: auth_key.into(),
            peer_nonces: HashMap::new(),
            own_nonces: HashMap::new(),
            nonce_timeout,
        }
    }

    /// Produce a fresh nonce for a peer's Nonce Get. The first byte is the
    /// nonce id the peer echoes back; it must be unique among outstanding
    /// nonces and non-zero.
    pub fn issue_nonce(&mut self, now: Instant) -> [u8; NONCE_LEN] {
        self.expire(now);
        let mut nonce: [u8; NONCE_LEN];
        loop {
            nonce = self.env.random_array();
            nonce[0] = self.env.random_nonzero_u8();
            if !self.own_nonces.contains_key(&nonce[0]) {
                break;
            }
        }
        self.own_nonces.insert(nonce[0], StoredNonce { nonce, issued_at: now });
        nonce
    }

    /// Record a nonce a peer reported to us.
    pub fn store_peer_nonce(&mut self, node_id: NodeId, nonce: [u8; NONCE_LEN], now: Instant) {
        self.peer_nonces
            .entry(node_id)
            .or_default()
            .push(StoredNonce { nonce, issued_at: now });
    }

    /// True when a fresh (unexpired) nonce from this peer is cached, i.e.
    /// an encapsulation can proceed without a handshake.
    #[must_use]
    pub fn has_peer_nonce(&self, node_id: NodeId, now: Instant) -> bool {
        self.peer_nonces
            .get(&node_id)
            .is_some_and(|nonces| {
                nonces.iter().any(|stored| now.duration_since(stored.issued_at) < self.nonce_timeout)
            })
    }

    /// Encrypt and authenticate `inner_pdu` for `receiver`.
    ///
    /// Returns the Message Encapsulation payload: sender nonce, ciphertext,
    /// receiver nonce id, MAC.
    ///
    /// # Errors
    ///
    /// [`SecurityError::NoNonce`] when no fresh receiver nonce is cached;
    /// the caller must run a Nonce Get handshake first.
    pub fn encapsulate(
        &mut self,
        inner_pdu: &[u8],
        sender: NodeId,
        receiver: NodeId,
        now: Instant,
    ) -> Result<Vec<u8>, SecurityError> {
        let receiver_nonce = self
            .take_peer_nonce(receiver, now)
            .ok_or(SecurityError::NoNonce { node_id: receiver })?;

        let mut sender_nonce: [u8; NONCE_LEN] = self.env.random_array();
        sender_nonce[0] = self.env.random_nonzero_u8();

        // Plaintext leads with the sequencing byte (unfragmented: 0).
        let mut ciphertext = Vec::with_capacity(inner_pdu.len() + 1);
        ciphertext.push(0x00);
        ciphertext.extend_from_slice(inner_pdu);

        let iv = concat_nonces(&sender_nonce, &receiver_nonce);
        let mut cipher = Aes128Ofb::new(
            GenericArray::from_slice(&self.enc_key),
            GenericArray::from_slice(&iv),
        );
        cipher.apply_keystream(&mut ciphertext);

        let mac = self.compute_mac(&iv, MESSAGE_ENCAP, sender, receiver, &ciphertext);

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len() + 1 + MAC_LEN);
        payload.extend_from_slice(&sender_nonce);
        payload.extend_from_slice(&ciphertext);
        payload.push(receiver_nonce[0]);
        payload.extend_from_slice(&mac);
        Ok(payload)
    }

    /// Verify and decrypt a Message Encapsulation payload from `sender`.
    ///
    /// # Errors
    ///
    /// [`SecurityError::NoNonce`] when the referenced receiver nonce is
    /// unknown or expired, [`SecurityError::AuthenticationFailed`] on MAC
    /// mismatch, [`SecurityError::MalformedEnvelope`] on truncation.
    pub fn decapsulate(
        &mut self,
        payload: &[u8],
        sender: NodeId,
        receiver: NodeId,
        now: Instant,
    ) -> Result<Vec<u8>, SecurityError> {
        // sender nonce + sequencing byte + one PDU byte + nonce id + MAC
        if payload.len() < NONCE_LEN + 2 + 1 + MAC_LEN {
            return Err(SecurityError::MalformedEnvelope {
                scheme: "S0",
                reason: "envelope shorter than fixed layout",
            });
        }

        let sender_nonce: [u8; NONCE_LEN] =
            payload[..NONCE_LEN].try_into().expect("length checked above");
        let mac_start = payload.len() - MAC_LEN;
        let nonce_id = payload[mac_start - 1];
        let ciphertext = &payload[NONCE_LEN..mac_start - 1];
        let mac = &payload[mac_start..];

        self.expire(now);
        let receiver_nonce = self
            .own_nonces
            .remove(&nonce_id)
            .ok_or(SecurityError::NoNonce { node_id: sender })?
            .nonce;

        let iv = concat_nonces(&sender_nonce, &receiver_nonce);
        let expected = self.compute_mac(&iv, MESSAGE_ENCAP, sender, receiver, ciphertext);
        if bool::from(expected.as_slice().ct_ne(mac)) {
            return Err(SecurityError::AuthenticationFailed { node_id: sender });
        }

        let mut plaintext = ciphertext.to_vec();
        let mut cipher = Aes128Ofb::new(
            GenericArray::from_slice(&self.enc_key),
            GenericArray::from_slice(&iv),
        );
        cipher.apply_keystream(&mut plaintext);

        // Strip the sequencing byte; fragmented S0 is not in use.
        Ok(plaintext.split_off(1))
    }

    /// Drop all state for a removed node.
    pub fn purge_node(&mut self, node_id: NodeId) {
        self.peer_nonces.remove(&node_id);
    }

    fn take_peer_nonce(&mut self, node_id: NodeId, now: Instant) -> Option<[u8; NONCE_LEN]> {
        let nonces = self.peer_nonces.get_mut(&node_id)?;
        nonces.retain(|stored| now.duration_since(stored.issued_at) < self.nonce_timeout);
        if nonces.is_empty() { None } else { Some(nonces.remove(0).nonce) }
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.nonce_timeout;
        self.own_nonces
            .retain(|_, stored| now.duration_since(stored.issued_at) < timeout);
    }

    fn compute_mac(
        &self,
        iv: &[u8; 16],
        command: u8,
        sender: NodeId,
        receiver: NodeId,
        ciphertext: &[u8],
    ) -> [u8; MAC_LEN] {
        let mut data = Vec::with_capacity(16 + 4 + ciphertext.len());
        data.extend_from_slice(iv);
        data.push(command);
        data.push(sender.0);
        data.push(receiver.0);
        data.push(ciphertext.len() as u8);
        data.extend_from_slice(ciphertext);

        let full = cbc_mac(&self.auth_key, &data);
        full[..MAC_LEN].try_into().expect("MAC_LEN < block size")
    }
}

fn concat_nonces(sender: &[u8; NONCE_LEN], receiver: &[u8; NONCE_LEN]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..NONCE_LEN].copy_from_slice(sender);
    iv[NONCE_LEN..].copy_from_slice(receiver);
    iv
}

/// AES-128 CBC-MAC with zero IV and implicit zero padding.
fn cbc_mac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut state = [0u8; 16];
    for chunk in data.chunks(16) {
        for (byte, input) in state.iter_mut().zip(chunk) {
            *byte ^= input;
        }
        let mut block = GenericArray::clone_from_slice(&state);
        cipher.encrypt_block(&mut block);
        state.copy_from_slice(&block);
    }
    state
}
