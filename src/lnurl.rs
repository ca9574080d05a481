use serde::{Deserialize, Serialize};

// https://datatracker.ietf.org/doc/html/rfc5322#section-3.4.1
// https://stackoverflow.com/a/201378
pub const USERNAME_VALIDATION_REGEX: &str = "^(?:[a-zA-Z0-9!#$%&'*+\\/=?^_`{|}~-]+(?:\\.[a-z0-9!#$%&'*+\\/=?^_`{|}~-]+)*|\"(?:[\x01-\x08\x0b\x0c\x0e-\x1f\x21\x23-\x5b\x5d-\x7f]|\\[\x01-\x09\x0b\x0c\x0e-\x7f])*\")$";

// https://www.rfc-editor.org/errata/eid1690
pub const MAX_USERNAME_LENGTH: usize = 64;

/// On-wire format is: `{"status": "ERROR", "reason": "error details..."}`.
/// LNURL endpoints report failures through this envelope with HTTP 200, per
/// LUD-03.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LnurlErrorStatus {
    pub status: String,
    pub reason: String,
}

impl LnurlErrorStatus {
    pub fn new(reason: &str) -> Self {
        Self {
            status: "ERROR".to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Validates a username against the RFC-5322 local-part subset and the
/// length cap, and canonicalizes it to lowercase. Usernames are stored and
/// compared in lowercase only.
pub fn normalize_username(username: &str) -> Option<String> {
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LENGTH {
        return None;
    }
    let regex = regex::Regex::new(USERNAME_VALIDATION_REGEX).expect("valid username regex");
    if !regex.is_match(username) {
        return None;
    }
    Some(username.to_lowercase())
}

/// A BOLT12 offer is only checked for its `lno` framing here; decoding the
/// offer is the wallet's business.
pub fn validate_offer(offer: &str) -> bool {
    offer.starts_with("lno")
}

/// Encodes an lnurl as a bech32 string with the `lnurl` HRP.
pub fn encode_lnurl(url: &str) -> Result<String, bech32::EncodeError> {
    let hrp = bech32::Hrp::parse("lnurl").expect("valid hrp");
    let encoded = bech32::encode::<bech32::Bech32>(hrp, url.as_bytes())?;
    Ok(encoded.to_lowercase())
}
