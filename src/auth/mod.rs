//! Caller identity.
//!
//! Every mutating call is bound to the account derived from an ed25519
//! verifying key. Requests carry the signer's key, a per-account nonce and the
//! command, signed over a domain-separated SHA-256 digest.

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    ledger::LedgerCommand,
    types::{amount_be_bytes, Account, ACCOUNT_LEN},
};

const REQUEST_DOMAIN: &[u8] = b"token-ledger-request-v1";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid key hex: {0}")]
    KeyHex(String),
    #[error("key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("malformed verifying key")]
    MalformedKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("invalid signature from {0}")]
    InvalidSignature(Account),
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn parse_signing_key(sk_hex: &str) -> Result<SigningKey, AuthError> {
    Ok(SigningKey::from_bytes(&decode_key_hex(sk_hex)?))
}

pub fn parse_verifying_key(pk_hex: &str) -> Result<VerifyingKey, AuthError> {
    VerifyingKey::from_bytes(&decode_key_hex(pk_hex)?).map_err(|_| AuthError::MalformedKey)
}

fn decode_key_hex(value: &str) -> Result<[u8; 32], AuthError> {
    let value = value.trim();
    let bytes = hex::decode(value).map_err(|e| AuthError::KeyHex(e.to_string()))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| AuthError::KeyLength(len))
}

/// Account bound to `key`: the last 20 bytes of SHA-256 over the key bytes.
pub fn account_for_key(key: &VerifyingKey) -> Account {
    let digest: [u8; 32] = Sha256::digest(key.as_bytes()).into();
    let mut bytes = [0u8; ACCOUNT_LEN];
    bytes.copy_from_slice(&digest[32 - ACCOUNT_LEN..]);
    Account::from_bytes(bytes)
}

/// A command bound to the key that signed it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedRequest {
    #[serde(with = "hex_key")]
    pub signer: [u8; 32],
    pub nonce: u64,
    pub command: LedgerCommand,
    #[serde(with = "base64_sig")]
    pub signature: Vec<u8>,
}

impl SignedRequest {
    pub fn sign(key: &SigningKey, nonce: u64, command: LedgerCommand) -> Self {
        let signer = key.verifying_key().to_bytes();
        let digest = request_digest(&signer, nonce, &command);
        let signature = key.sign(&digest).to_bytes().to_vec();
        Self {
            signer,
            nonce,
            command,
            signature,
        }
    }

    pub fn digest(&self) -> [u8; 32] {
        request_digest(&self.signer, self.nonce, &self.command)
    }

    /// Checks the signature and returns the authenticated caller.
    pub fn verify(&self) -> Result<Account, AuthError> {
        let key = VerifyingKey::from_bytes(&self.signer).map_err(|_| AuthError::MalformedKey)?;
        let caller = account_for_key(&key);
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| AuthError::MalformedSignature)?;
        key.verify_strict(&self.digest(), &signature)
            .map_err(|_| AuthError::InvalidSignature(caller))?;
        Ok(caller)
    }
}

fn request_digest(signer: &[u8; 32], nonce: u64, command: &LedgerCommand) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(REQUEST_DOMAIN);
    hasher.update(signer);
    hasher.update(nonce.to_le_bytes());
    hasher.update(command_commitment(command));
    hasher.finalize().into()
}

/// Fixed-layout encoding of a command: tag byte, accounts, 32-byte amount.
fn command_commitment(command: &LedgerCommand) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 2 * ACCOUNT_LEN + 32);
    match command {
        LedgerCommand::Transfer { to, amount } => {
            buf.push(1);
            buf.extend_from_slice(to.as_bytes());
            buf.extend_from_slice(&amount_be_bytes(amount));
        }
        LedgerCommand::Approve { spender, amount } => {
            buf.push(2);
            buf.extend_from_slice(spender.as_bytes());
            buf.extend_from_slice(&amount_be_bytes(amount));
        }
        LedgerCommand::TransferFrom { owner, to, amount } => {
            buf.push(3);
            buf.extend_from_slice(owner.as_bytes());
            buf.extend_from_slice(to.as_bytes());
            buf.extend_from_slice(&amount_be_bytes(amount));
        }
    }
    buf
}

mod hex_key {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        super::decode_key_hex(&encoded).map_err(D::Error::custom)
    }
}

mod base64_sig {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)
    }
}

/// Short base64 form of a request signature, for log lines.
pub fn signature_tag(request: &SignedRequest) -> String {
    let encoded = general_purpose::STANDARD_NO_PAD.encode(&request.signature);
    encoded.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use ethereum_types::U256;

    use super::*;

    fn transfer(to: u8, amount: u64) -> LedgerCommand {
        LedgerCommand::Transfer {
            to: Account::from_bytes([to; ACCOUNT_LEN]),
            amount: U256::from(amount),
        }
    }

    #[test]
    fn signed_request_verifies_to_signer_account() {
        let sk = generate_signing_key();
        let request = SignedRequest::sign(&sk, 0, transfer(2, 100));
        let caller = request.verify().unwrap();
        assert_eq!(caller, account_for_key(&sk.verifying_key()));
    }

    #[test]
    fn tampered_request_fails_verification() {
        let sk = generate_signing_key();
        let mut request = SignedRequest::sign(&sk, 3, transfer(2, 100));
        request.command = transfer(2, 101);
        assert!(matches!(
            request.verify().unwrap_err(),
            AuthError::InvalidSignature(_)
        ));

        let mut request = SignedRequest::sign(&sk, 3, transfer(2, 100));
        request.nonce = 4;
        assert!(request.verify().is_err());

        let mut request = SignedRequest::sign(&sk, 3, transfer(2, 100));
        request.signature.truncate(10);
        assert!(matches!(
            request.verify().unwrap_err(),
            AuthError::MalformedSignature
        ));
    }

    #[test]
    fn foreign_signer_cannot_claim_a_request() {
        let alice = generate_signing_key();
        let mallory = generate_signing_key();
        let mut request = SignedRequest::sign(&mallory, 0, transfer(9, 1));
        request.signer = alice.verifying_key().to_bytes();
        assert!(request.verify().is_err());
    }

    #[test]
    fn request_json_keeps_signature_valid() {
        let sk = generate_signing_key();
        let request = SignedRequest::sign(
            &sk,
            7,
            LedgerCommand::TransferFrom {
                owner: Account::from_bytes([1; ACCOUNT_LEN]),
                to: Account::from_bytes([2; ACCOUNT_LEN]),
                amount: U256::MAX,
            },
        );
        let json = serde_json::to_string(&request).unwrap();
        let decoded: SignedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, request);
        decoded.verify().unwrap();
    }

    #[test]
    fn key_parsing_checks_length() {
        let sk = generate_signing_key();
        let parsed = parse_signing_key(&hex::encode(sk.to_bytes())).unwrap();
        assert_eq!(parsed.to_bytes(), sk.to_bytes());
        assert!(matches!(
            parse_signing_key("abcd").unwrap_err(),
            AuthError::KeyLength(2)
        ));
        let vk = parse_verifying_key(&hex::encode(sk.verifying_key().as_bytes())).unwrap();
        assert_eq!(account_for_key(&vk), account_for_key(&sk.verifying_key()));
    }

    #[test]
    fn commands_commit_to_distinct_bytes() {
        let account = Account::from_bytes([5; ACCOUNT_LEN]);
        let a = command_commitment(&LedgerCommand::Transfer {
            to: account,
            amount: U256::one(),
        });
        let b = command_commitment(&LedgerCommand::Approve {
            spender: account,
            amount: U256::one(),
        });
        assert_ne!(a, b);
    }
}
