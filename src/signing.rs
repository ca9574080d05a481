use bitcoin::hashes::{Hash, sha256d};
use bitcoin::secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::time;

/// Prefix of the Lightning signed-message envelope. Signatures over user
/// payloads commit to `double-SHA256(prefix || message)`.
const SIGNED_MSG_PREFIX: &[u8] = b"Lightning Signed Message:";

/// Maximum accepted clock skew for any request carrying a `time` field.
pub const REPLAY_WINDOW_SECS: i64 = 60;

/// Z-base-32 encoding alphabet
/// This alphabet is designed to be human-friendly and avoid ambiguous characters
const ZBASE32_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature")]
    Malformed,
    #[error("signature recovery failed")]
    Recovery,
    #[error("timestamp outside the replay window")]
    StaleTimestamp,
}

/// Rejects requests whose `time` field is more than [`REPLAY_WINDOW_SECS`]
/// away from the server clock, in either direction.
pub fn check_replay_window(time: i64) -> Result<(), SignatureError> {
    if (time::now() - time).abs() > REPLAY_WINDOW_SECS {
        return Err(SignatureError::StaleTimestamp);
    }
    Ok(())
}

/// Recovers the compressed public key that produced `signature` over
/// `message`, using the Lightning signed-message envelope: the signature is
/// a zbase32-encoded 65-byte recoverable compact ECDSA signature
/// (`byte[0] = recovery_id + 31`) over the double-SHA256 of the prefixed
/// message bytes.
pub fn verify_message(message: &[u8], signature: &str) -> Result<PublicKey, SignatureError> {
    let sig_bytes = decode_zbase32(signature).ok_or(SignatureError::Malformed)?;
    if sig_bytes.len() != 65 {
        return Err(SignatureError::Malformed);
    }

    let recovery_id = RecoveryId::from_i32(i32::from(sig_bytes[0]) - 31)
        .map_err(|_| SignatureError::Malformed)?;
    let signature = RecoverableSignature::from_compact(&sig_bytes[1..], recovery_id)
        .map_err(|_| SignatureError::Malformed)?;

    let digest = message_digest(message);
    Secp256k1::new()
        .recover_ecdsa(&digest, &signature)
        .map_err(|_| SignatureError::Recovery)
}

/// Produces a signature [`verify_message`] accepts. Counterpart used by
/// clients and by the test suite.
pub fn sign_message(message: &[u8], secret_key: &SecretKey) -> String {
    let digest = message_digest(message);
    let signature = Secp256k1::new().sign_ecdsa_recoverable(&digest, secret_key);
    let (recovery_id, compact) = signature.serialize_compact();

    let mut bytes = Vec::with_capacity(65);
    bytes.push(31 + recovery_id.to_i32() as u8);
    bytes.extend_from_slice(&compact);
    encode_zbase32(&bytes)
}

fn message_digest(message: &[u8]) -> Message {
    let mut buf = Vec::with_capacity(SIGNED_MSG_PREFIX.len() + message.len());
    buf.extend_from_slice(SIGNED_MSG_PREFIX);
    buf.extend_from_slice(message);
    Message::from_digest(sha256d::Hash::hash(&buf).to_byte_array())
}

/// Encode bytes as z-base-32 string, 5 bits per character, padded to full
/// byte boundaries.
pub fn encode_zbase32(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }

    let mut result = Vec::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u16 = 0;
    let mut bits_in_buffer: u8 = 0;

    for &byte in data {
        buffer = (buffer << 8) | u16::from(byte);
        bits_in_buffer += 8;

        while bits_in_buffer >= 5 {
            bits_in_buffer -= 5;
            let index = ((buffer >> bits_in_buffer) & 0x1F) as usize;
            result.push(ZBASE32_ALPHABET[index]);
        }
    }

    if bits_in_buffer > 0 {
        let index = ((buffer << (5 - bits_in_buffer)) & 0x1F) as usize;
        result.push(ZBASE32_ALPHABET[index]);
    }

    String::from_utf8(result).expect("zbase32 alphabet is valid UTF-8")
}

/// Decode a z-base-32 string. Returns `None` on any character outside the
/// alphabet. Trailing sub-byte bits are discarded.
pub fn decode_zbase32(input: &str) -> Option<Vec<u8>> {
    let mut lookup = [255u8; 128];
    for (i, &ch) in ZBASE32_ALPHABET.iter().enumerate() {
        lookup[ch as usize] = i as u8;
    }

    let mut bits: u64 = 0;
    let mut num_bits: u32 = 0;
    let mut output = Vec::with_capacity(input.len() * 5 / 8 + 1);

    for &byte in input.as_bytes() {
        if byte >= 128 {
            return None;
        }
        let val = lookup[byte as usize];
        if val == 255 {
            return None;
        }
        bits = (bits << 5) | u64::from(val);
        num_bits += 5;
        if num_bits >= 8 {
            num_bits -= 8;
            output.push((bits >> num_bits) as u8);
            bits &= (1u64 << num_bits) - 1;
        }
    }
    Some(output)
}
