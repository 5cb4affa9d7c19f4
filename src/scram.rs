//! Password authentication: SCRAM-SHA-256 and MD5.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::PgError;

type HmacSha256 = Hmac<Sha256>;

/// Name of the only SASL mechanism offered to the server.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Where the exchange stands.
enum Exchange {
    /// client-first-message sent.
    Started,
    /// client-final-message sent; the server signature is checked against
    /// these.
    ProofSent {
        salted_password: [u8; 32],
        auth_message: String,
    },
}

/// SCRAM-SHA-256 client side of one SASL exchange.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    exchange: Exchange,
}

/// Attributes of a server-first-message (`r=<nonce>,s=<salt>,i=<iterations>`).
struct ServerFirst<'a> {
    nonce: &'a str,
    salt: Vec<u8>,
    iterations: u32,
}

impl<'a> ServerFirst<'a> {
    fn parse(message: &'a str) -> Result<Self, ScramError> {
        let attr = |key: &str| {
            message
                .split(',')
                .find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
        };

        let nonce = attr("r").ok_or(ScramError::MissingNonce)?;
        let salt = attr("s")
            .ok_or(ScramError::MissingSalt)
            .and_then(|s| BASE64.decode(s).map_err(|_| ScramError::InvalidSalt))?;
        let iterations = attr("i")
            .ok_or(ScramError::MissingIterations)
            .and_then(|i| i.parse().map_err(|_| ScramError::InvalidIterations))?;

        Ok(Self {
            nonce,
            salt,
            iterations,
        })
    }
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes base64-encode to 24 chars
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            exchange: Exchange::Started,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// `n,,n=<user>,r=<client-nonce>`, without channel binding.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Answer the server-first-message with the client proof.
    pub fn process_server_first(&mut self, data: &[u8]) -> Result<Vec<u8>, ScramError> {
        let message = std::str::from_utf8(data).map_err(|_| ScramError::InvalidServerMessage)?;
        let server = ServerFirst::parse(message)?;
        if !server.nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::NonceVerificationFailed);
        }

        let without_proof = format!("c=biws,r={}", server.nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare(), message, without_proof);

        let salted_password = hi(&self.password, &server.salt, server.iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let signature = hmac_sha256(&sha256(&client_key), auth_message.as_bytes())?;
        let proof = xor_bytes(&client_key, &signature);

        self.exchange = Exchange::ProofSent {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server signature in `v=<signature>`.
    pub fn verify_server_final(&self, data: &[u8]) -> Result<(), ScramError> {
        let Exchange::ProofSent {
            salted_password,
            auth_message,
        } = &self.exchange
        else {
            return Err(ScramError::InvalidState);
        };

        let signature = std::str::from_utf8(data)
            .ok()
            .and_then(|s| s.strip_prefix("v="))
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or(ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        if signature != hmac_sha256(&server_key, auth_message.as_bytes())? {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }
        Ok(())
    }
}

/// SCRAM authentication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing nonce in server message")]
    MissingNonce,
    #[error("Missing salt in server message")]
    MissingSalt,
    #[error("Missing iterations in server message")]
    MissingIterations,
    #[error("Server nonce verification failed")]
    NonceVerificationFailed,
    #[error("Invalid server signature")]
    InvalidServerSignature,
    #[error("Server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("Invalid SCRAM state")]
    InvalidState,
}

impl From<ScramError> for PgError {
    fn from(e: ScramError) -> Self {
        PgError::Auth(e.to_string())
    }
}

/// Compute the MD5 password response: `md5` + hex(MD5(hex(MD5(password + user)) + salt)).
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner_hash = md5::compute(format!("{}{}", password, user).as_bytes());

    let mut outer_input = format!("{:x}", inner_hash).into_bytes();
    outer_input.extend_from_slice(salt);

    format!("md5{:x}", md5::compute(&outer_input))
}

// ============================================================================
// Helper Functions
// ============================================================================

/// `Hi()` from RFC 5802: PBKDF2 over HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidState)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::InvalidState)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b)) {
        *out = x ^ y;
    }
    result
}
