//! S2: the modern security scheme.
//!
//! Instead of a nonce round-trip per message, each peer pair synchronizes
//! a SPAN: a deterministic nonce generator instantiated from entropy both
//! sides contributed. The receiver hands out its entropy input (EI) in a
//! Nonce Report; the sender mixes in its own EI, carries it in the first
//! encapsulation's SPAN extension, and from then on both sides advance
//! the generator in lockstep. Lost messages are tolerated by trying a
//! short window of upcoming nonces on decryption.
//!
//! # SPAN State Machine (per peer)
//!
//! ```text
//!          handle_nonce_get /              peer's SPAN ext
//!          decode failure                  + our stored EI
//!   None ───────────────────> LocalEi ───────────────────> Established
//!     │                                                        ↑
//!     │    peer's Nonce Report            our first encap      │
//!     └──────────────────────> RemoteEi ──────────────────────-┘
//! ```
//!
//! Four security classes hold independent keys; a temporary bootstrap key
//! overrides them during inclusion and is retired on completion or abort.

use std::collections::{HashMap, HashSet};

use aes::cipher::consts::{U13, U8};
use aes::cipher::generic_array::GenericArray;
use aes::Aes128;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::Ccm;
use cmac::{Cmac, Mac};
use zwire_proto::NodeId;

use super::{NetworkKeys, SecurityClass};
use crate::{env::Environment, error::SecurityError};

/// S2 Nonce Get
pub const NONCE_GET: u8 = 0x01;
/// S2 Nonce Report
pub const NONCE_REPORT: u8 = 0x02;
/// S2 Message Encapsulation
pub const MESSAGE_ENCAP: u8 = 0x03;
/// S2 KEX Fail: tears down a key exchange in progress
pub const KEX_FAIL: u8 = 0x07;

/// Failure codes carried by a KEX Fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KexFailType {
    /// None of the requested keys can be granted
    NoKeyMatch = 0x01,
    /// A key exchange frame failed to decrypt
    Decrypt = 0x05,
    /// Bootstrapping was canceled
    BootstrappingCanceled = 0x06,
}

/// How many upcoming nonces decryption tries before declaring the SPAN
/// out of sync.
const DECRYPT_WINDOW: usize = 5;

/// Authentication tag length in bytes.
const TAG_LEN: usize = 8;

const SOS_FLAG: u8 = 0b0000_0001;
const MOS_FLAG: u8 = 0b0000_0010;

const EXT_FLAG: u8 = 0b0000_0001;
const EXT_TYPE_SPAN: u8 = 0x01;
const SPAN_EXT_LEN: u8 = 18; // length byte + type byte + 16-byte EI

type Aes128Ccm = Ccm<Aes128, U8, U13>;

/// Where SPAN synchronization with a peer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanPhase {
    /// No state at all
    None,
    /// We handed out our EI and wait for the peer's first encapsulation
    LocalEi,
    /// The peer handed us its EI; our next encapsulation establishes
    RemoteEi,
    /// Generator running; messages flow without handshakes
    Established,
}

enum SpanState {
    LocalEi([u8; 16]),
    RemoteEi([u8; 16]),
    Established(NoncePrng),
}

/// Deterministic nonce generator, advanced in lockstep by both peers.
#[derive(Clone)]
struct NoncePrng {
    key: [u8; 16],
    v: [u8; 16],
}

impl NoncePrng {
    /// Instantiate from the two entropy inputs via the CMAC-based key
    /// derivation chain. Argument order matters and is fixed as
    /// (sender EI, receiver EI), where "sender" is the side that carries
    /// the SPAN extension.
    fn instantiate(sender_ei: &[u8; 16], receiver_ei: &[u8; 16]) -> Self {
        let mut mixed = [0u8; 32];
        mixed[..16].copy_from_slice(sender_ei);
        mixed[16..].copy_from_slice(receiver_ei);

        let prk = cmac16(&NONCE_PRK_KEY, &mixed);
        Self {
            key: cmac16(&prk, &[EXPAND_CONSTANT, 0x01]),
            v: cmac16(&prk, &[EXPAND_CONSTANT, 0x02]),
        }
    }

    fn next(&mut self) -> [u8; 13] {
        self.v = cmac16(&self.key, &self.v);
        self.v[..13].try_into().expect("13 < 16")
    }
}

const NONCE_PRK_KEY: [u8; 16] = [0x26; 16];
const EXPAND_CONSTANT: u8 = 0x88;
const CCM_KEY_EXPAND: [u8; 16] = [
    0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88,
    0x01,
];

/// S2 security manager: class keys, per-peer SPAN, multicast MPAN.
pub struct S2Manager<E: Environment> {
    env: E,
    keys: NetworkKeys,
    bootstrap_key: Option<[u8; 16]>,
    spans: HashMap<NodeId, SpanState>,
    mpans: HashMap<u8, [u8; 16]>,
    seq: u8,
    nonce_report_pending: HashSet<NodeId>,
}

impl<E: Environment> S2Manager<E> {
    /// Create a manager over the configured keys.
    #[must_use]
    pub fn new(keys: NetworkKeys, env: E) -> Self {
        Self {
            env,
            keys,
            bootstrap_key: None,
            spans: HashMap::new(),
            mpans: HashMap::new(),
            seq: 0,
            nonce_report_pending: HashSet::new(),
        }
    }

    /// SPAN phase with a peer, for policy decisions and tests.
    #[must_use]
    pub fn span_phase(&self, node_id: NodeId) -> SpanPhase {
        match self.spans.get(&node_id) {
            None => SpanPhase::None,
            Some(SpanState::LocalEi(_)) => SpanPhase::LocalEi,
            Some(SpanState::RemoteEi(_)) => SpanPhase::RemoteEi,
            Some(SpanState::Established(_)) => SpanPhase::Established,
        }
    }

    /// Install the temporary key used while bootstrapping a node.
    pub fn set_bootstrap_key(&mut self, key: [u8; 16]) {
        self.bootstrap_key = Some(key);
    }

    /// Retire the temporary key on bootstrap completion or abort.
    pub fn clear_bootstrap_key(&mut self) {
        self.bootstrap_key = None;
    }

    /// True while a bootstrap key is installed.
    #[must_use]
    pub fn has_bootstrap_key(&self) -> bool {
        self.bootstrap_key.is_some()
    }

    /// Mark that a Nonce Report to `node_id` is pending. Returns `false`
    /// when one is already outstanding — a repeated decode failure within
    /// the same window must not enqueue another.
    pub fn mark_nonce_report_pending(&mut self, node_id: NodeId) -> bool {
        self.nonce_report_pending.insert(node_id)
    }

    /// Payload for a Nonce Get we send to a peer.
    pub fn nonce_get(&mut self) -> Vec<u8> {
        vec![self.next_seq()]
    }

    /// Answer a peer's Nonce Get (or a decode failure): generate our EI,
    /// remember it, and build the singlecast-out-of-sync Nonce Report.
    pub fn build_nonce_report(&mut self, node_id: NodeId) -> Vec<u8> {
        let our_ei: [u8; 16] = self.env.random_array();
        self.spans.insert(node_id, SpanState::LocalEi(our_ei));

        let mut payload = Vec::with_capacity(18);
        payload.push(self.next_seq());
        payload.push(SOS_FLAG);
        payload.extend_from_slice(&our_ei);
        payload
    }

    /// Digest a peer's Nonce Report.
    ///
    /// # Errors
    ///
    /// [`SecurityError::MalformedEnvelope`] when the SOS flag is set but
    /// the EI is missing.
    pub fn handle_nonce_report(
        &mut self,
        node_id: NodeId,
        payload: &[u8],
    ) -> Result<(), SecurityError> {
        if payload.len() < 2 {
            return Err(SecurityError::MalformedEnvelope {
                scheme: "S2",
                reason: "nonce report shorter than fixed header",
            });
        }
        let flags = payload[1];

        if flags & SOS_FLAG != 0 {
            let ei: [u8; 16] = payload
                .get(2..18)
                .and_then(|slice| slice.try_into().ok())
                .ok_or(SecurityError::MalformedEnvelope {
                    scheme: "S2",
                    reason: "SOS report without entropy input",
                })?;
            // Peer lost sync (or never had it): our old SPAN is void.
            self.spans.insert(node_id, SpanState::RemoteEi(ei));
        }
        if flags & MOS_FLAG != 0 {
            self.mpans.clear();
        }
        Ok(())
    }

    /// Encrypt `inner_pdu` for `receiver` at `class`.
    ///
    /// # Errors
    ///
    /// [`SecurityError::NotInitialized`] when no key covers the class,
    /// [`SecurityError::NoSpan`] when no SPAN can be established yet (the
    /// caller must run a Nonce Get first).
    pub fn encapsulate(
        &mut self,
        inner_pdu: &[u8],
        sender: NodeId,
        receiver: NodeId,
        class: SecurityClass,
    ) -> Result<Vec<u8>, SecurityError> {
        let ccm_key = self.ccm_key(class)?;
        let seq = self.next_seq();

        // Establish or advance the SPAN, collecting the extension to send.
        let (nonce, span_ext) = match self.spans.remove(&receiver) {
            Some(SpanState::Established(mut prng)) => {
                let nonce = prng.next();
                self.spans.insert(receiver, SpanState::Established(prng));
                (nonce, None)
            },
            Some(SpanState::RemoteEi(receiver_ei)) => {
                let sender_ei: [u8; 16] = self.env.random_array();
                let mut prng = NoncePrng::instantiate(&sender_ei, &receiver_ei);
                let nonce = prng.next();
                self.spans.insert(receiver, SpanState::Established(prng));
                (nonce, Some(sender_ei))
            },
            other => {
                if let Some(state) = other {
                    self.spans.insert(receiver, state);
                }
                return Err(SecurityError::NoSpan { node_id: receiver });
            },
        };

        let mut header = Vec::with_capacity(2 + SPAN_EXT_LEN as usize);
        header.push(seq);
        match span_ext {
            Some(sender_ei) => {
                header.push(EXT_FLAG);
                header.push(SPAN_EXT_LEN);
                header.push(EXT_TYPE_SPAN);
                header.extend_from_slice(&sender_ei);
            },
            None => header.push(0),
        }

        let aad = build_aad(sender, receiver, &header);
        let cipher = Aes128Ccm::new(GenericArray::from_slice(&ccm_key));
        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), Payload { msg: inner_pdu, aad: &aad })
            .map_err(|_| SecurityError::MalformedEnvelope {
                scheme: "S2",
                reason: "payload too large for CCM",
            })?;

        let mut payload = header;
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    /// Verify and decrypt a Message Encapsulation payload from `sender`.
    ///
    /// # Errors
    ///
    /// [`SecurityError::NoSpan`] when no SPAN exists and the envelope
    /// carries no establishing extension; [`SecurityError::CannotDecode`]
    /// when authentication fails within the decrypt window (SPAN out of
    /// sync or wrong key); [`SecurityError::NotInitialized`] when no key
    /// covers the class.
    pub fn decapsulate(
        &mut self,
        payload: &[u8],
        sender: NodeId,
        receiver: NodeId,
        class: SecurityClass,
    ) -> Result<Vec<u8>, SecurityError> {
        let ccm_key = self.ccm_key(class)?;

        if payload.len() < 2 + TAG_LEN {
            return Err(SecurityError::MalformedEnvelope {
                scheme: "S2",
                reason: "envelope shorter than fixed layout",
            });
        }

        let (header_len, span_ext) = parse_extensions(payload)?;
        let header = &payload[..header_len];
        let ciphertext = &payload[header_len..];
        let aad = build_aad(sender, receiver, header);

        // Choose the generator: an establishing extension mixes the
        // sender's EI with the EI we handed out earlier. The stored state
        // is left untouched until a decryption succeeds, so a garbage
        // envelope cannot knock out a working SPAN.
        let prng = match (self.spans.get(&sender), span_ext) {
            (Some(SpanState::LocalEi(our_ei)), Some(sender_ei)) => {
                NoncePrng::instantiate(&sender_ei, our_ei)
            },
            (Some(SpanState::Established(prng)), _) => prng.clone(),
            _ => return Err(SecurityError::NoSpan { node_id: sender }),
        };

        // Try a window of upcoming nonces to tolerate lost messages.
        let cipher = Aes128Ccm::new(GenericArray::from_slice(&ccm_key));
        let mut attempt = prng;
        for _ in 0..DECRYPT_WINDOW {
            let nonce = attempt.next();
            if let Ok(plaintext) = cipher.decrypt(
                GenericArray::from_slice(&nonce),
                Payload { msg: ciphertext, aad: &aad },
            ) {
                self.spans.insert(sender, SpanState::Established(attempt));
                self.nonce_report_pending.remove(&sender);
                return Ok(plaintext);
            }
        }

        Err(SecurityError::CannotDecode { node_id: sender })
    }

    /// Advance the multicast MPAN for `group`, creating it on first use.
    pub fn next_mpan(&mut self, group: u8) -> [u8; 16] {
        let env = &self.env;
        let state = self.mpans.entry(group).or_insert_with(|| env.random_array());
        *state = cmac16(state, &[group]);
        *state
    }

    /// Drop all per-peer state for a removed node.
    pub fn purge_node(&mut self, node_id: NodeId) {
        self.spans.remove(&node_id);
        self.nonce_report_pending.remove(&node_id);
    }

    fn ccm_key(&self, class: SecurityClass) -> Result<[u8; 16], SecurityError> {
        let base = match self.bootstrap_key {
            Some(key) => key,
            None => self.keys.for_class(class).ok_or(SecurityError::NotInitialized)?,
        };
        Ok(cmac16(&base, &CCM_KEY_EXPAND))
    }

    fn next_seq(&mut self) -> u8 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}

/// Parse the extension area. Returns `(header length, SPAN EI if present)`.
fn parse_extensions(payload: &[u8]) -> Result<(usize, Option<[u8; 16]>), SecurityError> {
    let malformed = |reason| SecurityError::MalformedEnvelope { scheme: "S2", reason };

    if payload[1] & EXT_FLAG == 0 {
        return Ok((2, None));
    }
    if payload.len() < 2 + SPAN_EXT_LEN as usize {
        return Err(malformed("extension area truncated"));
    }
    if payload[2] != SPAN_EXT_LEN || payload[3] != EXT_TYPE_SPAN {
        return Err(malformed("unsupported extension"));
    }
    let ei: [u8; 16] =
        payload[4..20].try_into().map_err(|_| malformed("extension area truncated"))?;
    Ok((2 + SPAN_EXT_LEN as usize, Some(ei)))
}

fn build_aad(sender: NodeId, receiver: NodeId, header: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(2 + header.len());
    aad.push(sender.0);
    aad.push(receiver.0);
    aad.extend_from_slice(header);
    aad
}

fn cmac16(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key).expect("CMAC accepts 16-byte keys");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct TestEnv {
        counter: std::sync::Arc<std::sync::atomic::AtomicU8>,
    }

    impl TestEnv {
        fn new(seed: u8) -> Self {
            Self { counter: std::sync::Arc::new(std::sync::atomic::AtomicU8::new(seed)) }
        }
    }

    impl Environment for TestEnv {
        fn fill_random(&self, buffer: &mut [u8]) {
            let base = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            for (index, byte) in buffer.iter_mut().enumerate() {
                *byte = base.wrapping_mul(31).wrapping_add(index as u8) | 1;
            }
        }
    }

    fn keys() -> NetworkKeys {
        NetworkKeys {
            s0_legacy: None,
            s2_unauthenticated: Some([0x11; 16]),
            s2_authenticated: Some([0x22; 16]),
            s2_access_control: None,
        }
    }

    const CLASS: SecurityClass = SecurityClass::S2Authenticated;
    const HOST: NodeId = NodeId(1);
    const NODE: NodeId = NodeId(9);

    /// Run the establishment handshake: host obtains the node's EI.
    fn establish(host: &mut S2Manager<TestEnv>, node: &mut S2Manager<TestEnv>) {
        let report = node.build_nonce_report(HOST);
        host.handle_nonce_report(NODE, &report).unwrap();
        assert_eq!(host.span_phase(NODE), SpanPhase::RemoteEi);
        assert_eq!(node.span_phase(HOST), SpanPhase::LocalEi);
    }

    #[test]
    fn handshake_then_round_trip() {
        let mut host = S2Manager::new(keys(), TestEnv::new(1));
        let mut node = S2Manager::new(keys(), TestEnv::new(77));
        establish(&mut host, &mut node);

        let pdu = [0x25, 0x01, 0xFF];
        let envelope = host.encapsulate(&pdu, HOST, NODE, CLASS).unwrap();
        let opened = node.decapsulate(&envelope, HOST, NODE, CLASS).unwrap();
        assert_eq!(opened, pdu);

        assert_eq!(host.span_phase(NODE), SpanPhase::Established);
        assert_eq!(node.span_phase(HOST), SpanPhase::Established);

        // Subsequent messages need no extension and still decode.
        let envelope = host.encapsulate(&[0x26, 0x02], HOST, NODE, CLASS).unwrap();
        assert_eq!(node.decapsulate(&envelope, HOST, NODE, CLASS).unwrap(), vec![0x26, 0x02]);
    }

    #[test]
    fn lost_messages_within_window_are_tolerated() {
        let mut host = S2Manager::new(keys(), TestEnv::new(1));
        let mut node = S2Manager::new(keys(), TestEnv::new(77));
        establish(&mut host, &mut node);

        let first = host.encapsulate(&[0x01], HOST, NODE, CLASS).unwrap();
        node.decapsulate(&first, HOST, NODE, CLASS).unwrap();

        // Three envelopes vanish in the air; the fourth still decodes.
        for _ in 0..3 {
            host.encapsulate(&[0x02], HOST, NODE, CLASS).unwrap();
        }
        let survivor = host.encapsulate(&[0x03], HOST, NODE, CLASS).unwrap();
        assert_eq!(node.decapsulate(&survivor, HOST, NODE, CLASS).unwrap(), vec![0x03]);
    }

    #[test]
    fn desync_beyond_window_cannot_decode() {
        let mut host = S2Manager::new(keys(), TestEnv::new(1));
        let mut node = S2Manager::new(keys(), TestEnv::new(77));
        establish(&mut host, &mut node);

        let first = host.encapsulate(&[0x01], HOST, NODE, CLASS).unwrap();
        node.decapsulate(&first, HOST, NODE, CLASS).unwrap();

        for _ in 0..DECRYPT_WINDOW {
            host.encapsulate(&[0x02], HOST, NODE, CLASS).unwrap();
        }
        let too_far = host.encapsulate(&[0x03], HOST, NODE, CLASS).unwrap();
        assert!(matches!(
            node.decapsulate(&too_far, HOST, NODE, CLASS),
            Err(SecurityError::CannotDecode { .. })
        ));
    }

    #[test]
    fn no_span_without_handshake() {
        let mut host = S2Manager::new(keys(), TestEnv::new(1));
        assert!(matches!(
            host.encapsulate(&[0x01], HOST, NODE, CLASS),
            Err(SecurityError::NoSpan { .. })
        ));

        let mut node = S2Manager::new(keys(), TestEnv::new(77));
        let mut other_host = S2Manager::new(keys(), TestEnv::new(1));
        let mut other_node = S2Manager::new(keys(), TestEnv::new(77));
        establish(&mut other_host, &mut other_node);
        let envelope = other_host.encapsulate(&[0x01], HOST, NODE, CLASS).unwrap();

        // Same envelope at a node that never handed out its EI.
        assert!(matches!(
            node.decapsulate(&envelope, HOST, NODE, CLASS),
            Err(SecurityError::NoSpan { .. })
        ));
    }

    #[test]
    fn nonce_report_pending_deduplicates() {
        let mut node = S2Manager::new(keys(), TestEnv::new(77));
        assert!(node.mark_nonce_report_pending(HOST));
        assert!(!node.mark_nonce_report_pending(HOST));

        // A successful decapsulation clears the flag.
        let mut host = S2Manager::new(keys(), TestEnv::new(1));
        establish(&mut host, &mut node);
        let envelope = host.encapsulate(&[0x01], HOST, NODE, CLASS).unwrap();
        node.decapsulate(&envelope, HOST, NODE, CLASS).unwrap();
        assert!(node.mark_nonce_report_pending(HOST));
    }

    #[test]
    fn wrong_class_key_cannot_decode() {
        let mut host = S2Manager::new(keys(), TestEnv::new(1));
        let mut node = S2Manager::new(keys(), TestEnv::new(77));
        establish(&mut host, &mut node);

        let envelope = host.encapsulate(&[0x01], HOST, NODE, CLASS).unwrap();
        assert!(matches!(
            node.decapsulate(&envelope, HOST, NODE, SecurityClass::S2Unauthenticated),
            Err(SecurityError::CannotDecode { .. })
        ));
    }

    #[test]
    fn bootstrap_key_overrides_class_keys() {
        let mut host = S2Manager::new(keys(), TestEnv::new(1));
        let mut node = S2Manager::new(keys(), TestEnv::new(77));
        host.set_bootstrap_key([0x77; 16]);
        node.set_bootstrap_key([0x77; 16]);
        establish(&mut host, &mut node);

        let envelope = host.encapsulate(&[0x01], HOST, NODE, CLASS).unwrap();
        assert_eq!(node.decapsulate(&envelope, HOST, NODE, CLASS).unwrap(), vec![0x01]);

        // Retiring the key on one side breaks the channel.
        node.clear_bootstrap_key();
        let envelope = host.encapsulate(&[0x02], HOST, NODE, CLASS).unwrap();
        assert!(node.decapsulate(&envelope, HOST, NODE, CLASS).is_err());
    }

    #[test]
    fn missing_class_key_is_not_initialized() {
        let mut manager = S2Manager::new(keys(), TestEnv::new(1));
        assert!(matches!(
            manager.encapsulate(&[0x01], HOST, NODE, SecurityClass::S2AccessControl),
            Err(SecurityError::NotInitialized)
        ));
    }

    #[test]
    fn mpan_advances_deterministically() {
        let mut a = S2Manager::new(keys(), TestEnv::new(5));
        let mut b = S2Manager::new(keys(), TestEnv::new(5));
        assert_eq!(a.next_mpan(3), b.next_mpan(3));
        assert_eq!(a.next_mpan(3), b.next_mpan(3));
        assert_ne!(a.next_mpan(3), a.next_mpan(4));
    }
}
