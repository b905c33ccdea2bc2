//! Canonical parameter string.
//!
//! Rule: take the query pairs exactly as decoded once from the wire, drop every
//! `sig` pair, sort by key then value, and re-encode with
//! `application/x-www-form-urlencoded`. Signers and the verifier both go
//! through [`canonicalize`], so the two sides cannot drift.

use url::form_urlencoded;

use crate::request::{QueryParams, SIGNATURE_PARAM};

pub fn canonicalize(params: &QueryParams) -> String {
    let mut pairs: Vec<(&str, &str)> = params
        .pairs()
        .iter()
        .filter(|(key, _)| key != SIGNATURE_PARAM)
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    pairs.sort_unstable();

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}
