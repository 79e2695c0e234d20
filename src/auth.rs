//! Keyed challenge/response handshake run once per connection.
//!
//! The server sends a random 40-character challenge; the client proves it
//! knows the shared secret by answering `base64(HMAC-SHA512(secret, challenge))`.
//! The server answers with a single status byte.

use crate::protocol::{read_string, write_string, ProtocolError, AUTH_OK, AUTH_REJECTED};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha512;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha512 = Hmac<Sha512>;

/// Number of characters in a challenge.
pub const CHALLENGE_LEN: usize = 40;

// Greek and Cyrillic letters make every challenge exercise multi-byte UTF-8.
const CHALLENGE_ALPHABET: &str = concat!(
    "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
    "abcdefghijklmnopqrstuvwxyz",
    "0123456789",
    "ΑΒΓΔΕΖΗΘΙΚΛΜΝΞΟΠΡΣΤΥΦΧΨΩ",
    "αβγδεζηθικλμνξοπρστυφχψω",
    "АБВГДЕЖЗИЙКЛМНОПРСТУФХЦЧШЩЭЮЯ",
    "абвгдежзийклмнопрстуфхцчшщэюя",
);

#[derive(Clone)]
pub struct Authenticator {
    mac: HmacSha512,
}

impl Authenticator {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(anyhow!("shared secret must not be empty"));
        }
        let mac = HmacSha512::new_from_slice(secret)
            .map_err(|err| anyhow!("invalid shared secret: {err}"))?;
        Ok(Self { mac })
    }

    pub fn challenge(&self) -> String {
        generate_challenge(&mut rand::thread_rng())
    }

    /// The answer a client holding the same secret gives to `challenge`.
    pub fn respond(&self, challenge: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(challenge.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a client's answer.
    pub fn verify(&self, challenge: &str, response: &str) -> bool {
        let Ok(tag) = STANDARD.decode(response.trim()) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(challenge.as_bytes());
        mac.verify_slice(&tag).is_ok()
    }

    /// Server side of the handshake. Returns whether the peer authenticated;
    /// the status byte has been sent either way.
    pub async fn accept<S>(&self, stream: &mut S) -> Result<bool, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let challenge = self.challenge();
        write_string(stream, &challenge).await?;
        let response = read_string(stream).await?;
        let accepted = self.verify(&challenge, &response);
        stream
            .write_u8(if accepted { AUTH_OK } else { AUTH_REJECTED })
            .await?;
        stream.flush().await?;
        Ok(accepted)
    }

    /// Client side of the handshake. Returns whether the server accepted us.
    pub async fn answer<S>(&self, stream: &mut S) -> Result<bool, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let challenge = read_string(stream).await?;
        write_string(stream, &self.respond(&challenge)).await?;
        match stream.read_u8().await? {
            AUTH_OK => Ok(true),
            AUTH_REJECTED => Ok(false),
            other => Err(ProtocolError::UnexpectedStatus(other)),
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

pub fn generate_challenge<R: Rng + ?Sized>(rng: &mut R) -> String {
    let alphabet: Vec<char> = CHALLENGE_ALPHABET.chars().collect();
    (0..CHALLENGE_LEN)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn challenge_has_fixed_length_and_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let challenge = generate_challenge(&mut rng);
            assert_eq!(challenge.chars().count(), CHALLENGE_LEN);
            assert!(challenge.chars().all(|c| CHALLENGE_ALPHABET.contains(c)));
        }
    }

    #[test]
    fn matching_secret_verifies() {
        let server = Authenticator::new("s3cret").unwrap();
        let client = Authenticator::new("s3cret").unwrap();
        let challenge = "abcΩжXYZ0123456789abcdefghijklmnopqrstu";
        let response = client.respond(challenge);
        // 64-byte tag, padded base64
        assert_eq!(response.len(), 88);
        assert!(server.verify(challenge, &response));
        assert!(!server.verify("another challenge", &response));
    }

    #[test]
    fn wrong_secret_or_garbage_fails() {
        let server = Authenticator::new("s3cret").unwrap();
        let intruder = Authenticator::new("guess").unwrap();
        let challenge = server.challenge();
        assert!(!server.verify(&challenge, &intruder.respond(&challenge)));
        assert!(!server.verify(&challenge, "not base64 at all!"));
        assert!(!server.verify(&challenge, ""));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(Authenticator::new("").is_err());
    }

    #[tokio::test]
    async fn handshake_over_duplex_stream() {
        let (mut server_end, mut client_end) = tokio::io::duplex(1024);
        let server = Authenticator::new("s3cret").unwrap();
        let client = Authenticator::new("s3cret").unwrap();

        let (accepted, answered) = tokio::join!(
            server.accept(&mut server_end),
            client.answer(&mut client_end)
        );
        assert!(accepted.unwrap());
        assert!(answered.unwrap());
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_secret() {
        let (mut server_end, mut client_end) = tokio::io::duplex(1024);
        let server = Authenticator::new("s3cret").unwrap();
        let client = Authenticator::new("wrong").unwrap();

        let (accepted, answered) = tokio::join!(
            server.accept(&mut server_end),
            client.answer(&mut client_end)
        );
        assert!(!accepted.unwrap());
        assert!(!answered.unwrap());
    }
}
