use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;

use crate::canonical::canonicalize;
use crate::error::{GateError, GateResult};
use crate::request::{QueryParams, EXPIRE_AT_PARAM, SIGNATURE_PARAM, SITE_PARAM};

type HmacSha256 = Hmac<Sha256>;

/// Decode a base64url signature, restoring standard alphabet and padding.
fn decode_signature(signature: &str) -> Option<Vec<u8>> {
    let mut standard: String = signature
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while standard.len() % 4 != 0 {
        standard.push('=');
    }
    STANDARD.decode(standard.as_bytes()).ok()
}

/// Check `signature` against HMAC-SHA256(`secret`, `canonical`).
///
/// Tag comparison goes through `Mac::verify_slice`, which is constant time.
/// Any decoding problem is a plain `false`.
pub fn verify(canonical: &str, signature: &str, secret: &str) -> bool {
    if signature.is_empty() || secret.is_empty() {
        return false;
    }

    let Some(tag) = decode_signature(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(canonical.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

/// Issuer side: base64url (unpadded) HMAC-SHA256 tag over `canonical`.
pub fn sign(canonical: &str, secret: &str) -> GateResult<String> {
    if secret.is_empty() {
        return Err(GateError::Config("cannot sign with an empty secret".into()));
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| GateError::Config(format!("invalid signing key: {err}")))?;
    mac.update(canonical.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Build a complete signed query string for `site`.
///
/// The returned string is the canonical parameter string followed by `sig`,
/// so it can be appended to the gate URL as-is.
pub fn sign_query(
    site: &str,
    expire_at_millis: i64,
    extra: &[(&str, &str)],
    secret: &str,
) -> GateResult<String> {
    let mut params = QueryParams::default();
    params.push(SITE_PARAM, site);
    params.push(EXPIRE_AT_PARAM, expire_at_millis.to_string());
    for (key, value) in extra {
        if *key == SIGNATURE_PARAM {
            continue;
        }
        params.push(*key, *value);
    }

    let canonical = canonicalize(&params);
    let signature = sign(&canonical, secret)?;
    let suffix = form_urlencoded::Serializer::new(String::new())
        .append_pair(SIGNATURE_PARAM, &signature)
        .finish();

    Ok(format!("{canonical}&{suffix}"))
}
