//! Peer transport: framing and the authenticated handshake (§4.2).
//!
//! Framing is a fixed 4-byte header (version + big-endian uint24 total size)
//! followed by a protobuf-encoded [`Payload`]. The handshake mixes an
//! ephemeral and a long-lived X25519 keypair on both sides (a Noise-XX-style
//! mutual authentication) and derives a transcript key whose holder can only
//! be someone who knows the peer's static private key; that, not the frame
//! bytes themselves, is what proves identity.

use std::fmt;
use std::time::Duration;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use prost::Message as _;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::pb::Payload;

const VERSION: u8 = 0x01;
const HEADER_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 0x00FF_FFFF;

/// Stable identity derived from a node's long-lived X25519 public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    fn from_static_public(public: &PublicKey) -> Self {
        let digest = Sha256::digest(public.as_bytes());
        PeerId(bs58::encode(&digest[..20]).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node's long-lived peer keypair, generated fresh at process start.
pub struct Keypair {
    pub peer_id: PeerId,
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let peer_id = PeerId::from_static_public(&public);
        Keypair { peer_id, secret, public }
    }

    fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

fn confirm_tag(transcript_key: &[u8; 32], static_pub_bytes: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(transcript_key).expect("hmac accepts any key length");
    mac.update(b"noty-handshake-confirm");
    mac.update(static_pub_bytes);
    mac.finalize().into_bytes().into()
}

/// Runs the mutual handshake over an already-connected stream. Identical on
/// both the dialing and the accepting side.
pub async fn handshake<S>(stream: &mut S, keypair: &Keypair, timeout: Duration) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, handshake_inner(stream, keypair))
        .await
        .map_err(|_| Error::Transport("peer handshake timed out".into()))?
}

async fn handshake_inner<S>(stream: &mut S, keypair: &Keypair) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_public = PublicKey::from(&eph_secret);

    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&keypair.public_bytes());
    out[32..].copy_from_slice(eph_public.as_bytes());
    stream.write_all(&out).await?;

    let mut inbuf = [0u8; 64];
    stream.read_exact(&mut inbuf).await?;
    let peer_static_bytes: [u8; 32] = inbuf[..32].try_into().unwrap();
    let peer_eph_bytes: [u8; 32] = inbuf[32..].try_into().unwrap();
    let peer_static = PublicKey::from(peer_static_bytes);
    let peer_eph = PublicKey::from(peer_eph_bytes);

    let dh_a = eph_secret.diffie_hellman(&peer_static);
    let dh_b = keypair.secret.diffie_hellman(&peer_eph);
    let mut pair = [*dh_a.as_bytes(), *dh_b.as_bytes()];
    pair.sort();
    let ikm = [pair[0], pair[1]].concat();

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut transcript_key = [0u8; 32];
    hk.expand(b"noty-peer-handshake", &mut transcript_key)
        .map_err(|e| Error::Transport(format!("handshake key derivation failed: {e}")))?;

    let own_confirm = confirm_tag(&transcript_key, &keypair.public_bytes());
    stream.write_all(&own_confirm).await?;

    let mut peer_confirm = [0u8; 32];
    stream.read_exact(&mut peer_confirm).await?;
    let expected = confirm_tag(&transcript_key, &peer_static_bytes);
    if peer_confirm != expected {
        return Err(Error::Transport("peer failed to prove its static key".into()));
    }

    Ok(PeerId::from_static_public(&peer_static))
}

pub fn encode_frame(payload: &Payload) -> Vec<u8> {
    let body = payload.encode_to_vec();
    let total = HEADER_LEN + body.len();
    let mut out = Vec::with_capacity(total);
    out.push(VERSION);
    let len = total as u32;
    out.push((len >> 16) as u8);
    out.push((len >> 8) as u8);
    out.push(len as u8);
    out.extend_from_slice(&body);
    out
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &Payload) -> Result<()> {
    w.write_all(&encode_frame(payload)).await?;
    Ok(())
}

/// Reads one frame. A version byte other than 1 is a fatal read error, per
/// the wire contract.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Payload> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Error::Transport(format!("unsupported frame version {}", header[0])));
    }
    let total = ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize;
    if total < HEADER_LEN || total > MAX_FRAME_LEN {
        return Err(Error::Transport(format!("frame size {total} out of bounds")));
    }
    let mut body = vec![0u8; total - HEADER_LEN];
    r.read_exact(&mut body).await?;
    Payload::decode(body.as_slice()).map_err(Into::into)
}

/// An established, authenticated peer connection. Readers run single-
/// threaded (owned by the directory's reader task); writers serialize
/// through `writer`'s mutex so concurrent publishers don't interleave
/// frames.
pub struct PeerConn {
    remote_peer: PeerId,
    remote_addr: std::net::SocketAddr,
    writer: AsyncMutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl PeerConn {
    pub fn new(remote_peer: PeerId, remote_addr: std::net::SocketAddr, writer: OwnedWriteHalf) -> Self {
        PeerConn {
            remote_peer,
            remote_addr,
            writer: AsyncMutex::new(writer),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn write(&self, payload: &Payload) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Transport("connection closed".into()));
        }
        let mut w = self.writer.lock().await;
        let result = write_frame(&mut *w, payload).await;
        if result.is_err() {
            self.cancel.cancel();
        }
        result
    }

    /// Idempotent, concurrent-safe: cancelling a token twice is a no-op.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.remote_addr
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::PayloadType;

    #[tokio::test]
    async fn frame_round_trips() {
        let payload = Payload {
            r#type: PayloadType::TopicNotify as i32,
            tenant_id: "t1".into(),
            topic_name: "hello".into(),
            topic_data: b"hi".to_vec(),
            ..Default::default()
        };
        let encoded = encode_frame(&payload);
        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.topic_name, "hello");
        assert_eq!(decoded.topic_data, b"hi");
    }

    #[tokio::test]
    async fn bad_version_byte_is_fatal() {
        let mut bogus = vec![0x02, 0, 0, 4];
        bogus.extend_from_slice(b"");
        let mut cursor = std::io::Cursor::new(bogus);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn handshake_authenticates_both_sides() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let expected_a = kp_a.peer_id.clone();
        let expected_b = kp_b.peer_id.clone();

        let (ra, rb) = tokio::join!(
            handshake(&mut a, &kp_a, Duration::from_secs(3)),
            handshake(&mut b, &kp_b, Duration::from_secs(3)),
        );
        assert_eq!(ra.unwrap(), expected_b);
        assert_eq!(rb.unwrap(), expected_a);
    }
}
