/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/jwt.rs
*
* Parses just enough of a JWT to judge its validity without ever verifying
* its signature (spec §3 "Token (JWT)"): the header's `kid` and the claims'
* `nbf`/`exp`. A JWT is three base64url (no padding) segments joined by '.';
* the third (signature) segment is never inspected here.
*
* SPDX-License-Identifier: Apache-2.0
*/

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("token does not have three dot-separated segments")]
    Malformed,
    #[error("segment is not valid base64url: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("segment is not valid UTF-8")]
    InvalidUtf8,
    #[error("segment is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("claims are missing a required field")]
    MissingClaim,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    /// The signer key-ID. Absent for malformed or key-less tokens.
    pub kid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Not-before, seconds since epoch.
    pub nbf: Option<i64>,
    /// Expiry, seconds since epoch.
    pub exp: Option<i64>,
}

/// A decoded, unverified JWT: header and claims only.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    pub header: Header,
    pub claims: Claims,
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, JwtError> {
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(segment)?)
}

/// Decodes a JWT's header and claims, without verifying its signature.
pub fn decode(token: &str) -> Result<DecodedToken, JwtError> {
    let mut parts = token.split('.');
    let (header_b64, payload_b64, _sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if parts.next().is_none() => (h, p, s),
        _ => return Err(JwtError::Malformed),
    };

    let header_bytes = decode_segment(header_b64)?;
    let payload_bytes = decode_segment(payload_b64)?;

    let header: Header = serde_json::from_slice(&header_bytes)?;
    let claims: Claims = serde_json::from_slice(&payload_bytes)?;

    Ok(DecodedToken { header, claims })
}

/// Decodes only the header, e.g. for the key-ID observer's fallback path
/// (spec §4.2), where the claims are irrelevant.
pub fn decode_header(token: &str) -> Result<Header, JwtError> {
    let header_b64 = token.split('.').next().ok_or(JwtError::Malformed)?;
    let bytes = decode_segment(header_b64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// The instant after which a token with validity window `[nbf, exp]` must
/// be refreshed: `exp - 0.4 * (exp - nbf)` (spec §3 "Refresh threshold").
///
/// If `exp <= nbf` the window is empty or inverted and the refresh time is
/// the zero instant — the token is always stale (spec §8 boundary case).
pub fn refresh_time(nbf: DateTime<Utc>, exp: DateTime<Utc>) -> DateTime<Utc> {
    if exp <= nbf {
        return Utc.timestamp_opt(0, 0).single().expect("epoch is representable");
    }
    let window = exp - nbf;
    let retained = chrono::Duration::milliseconds((window.num_milliseconds() as f64 * 0.4) as i64);
    exp - retained
}

impl DecodedToken {
    /// Returns `(nbf, exp)` as `DateTime<Utc>`, or `None` if either claim is
    /// absent — callers treat a missing claim as "malformed", per spec §7
    /// ("Malformed observed data ... treated as stale").
    pub fn validity_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let nbf = Utc.timestamp_opt(self.claims.nbf?, 0).single()?;
        let exp = Utc.timestamp_opt(self.claims.exp?, 0).single()?;
        Some((nbf, exp))
    }

    /// Whether this token must be refreshed at `now`, per the refresh
    /// threshold. Returns `None` if the claims don't carry a usable window.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> Option<bool> {
        let (nbf, exp) = self.validity_window()?;
        Some(now >= refresh_time(nbf, exp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_jwt(header: &str, payload: &str) -> String {
        let e = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!("{}.{}.{}", e.encode(header), e.encode(payload), e.encode("sig"))
    }

    #[test]
    fn decodes_header_and_claims() {
        let token = encode_jwt(r#"{"alg":"RS256","kid":"abc123"}"#, r#"{"nbf":1000,"exp":2000}"#);
        let decoded = decode(&token).unwrap();
        assert_eq!(decoded.header.kid.as_deref(), Some("abc123"));
        let (nbf, exp) = decoded.validity_window().unwrap();
        assert_eq!(nbf.timestamp(), 1000);
        assert_eq!(exp.timestamp(), 2000);
    }

    #[test]
    fn rejects_malformed_token() {
        assert!(matches!(decode("not-a-jwt"), Err(JwtError::Malformed)));
        assert!(matches!(decode("a.b"), Err(JwtError::Malformed)));
    }

    #[test]
    fn refresh_time_leaves_sixty_percent_of_window() {
        let nbf = Utc.timestamp_opt(0, 0).unwrap();
        let exp = nbf + chrono::Duration::seconds(3600);
        let refresh = refresh_time(nbf, exp);
        // 40% of the hour consumed before refresh is due -> refresh at +36m.
        assert_eq!((refresh - nbf).num_minutes(), 36);
    }

    #[test]
    fn equal_nbf_and_exp_is_always_stale() {
        let t = Utc.timestamp_opt(500, 0).unwrap();
        let refresh = refresh_time(t, t);
        assert_eq!(refresh.timestamp(), 0);
    }

    #[test]
    fn staleness_is_monotone_as_now_advances() {
        let nbf = Utc.timestamp_opt(0, 0).unwrap();
        let exp = nbf + chrono::Duration::seconds(1000);
        let token = DecodedToken {
            header: Header { kid: Some("k".into()) },
            claims: Claims { nbf: Some(0), exp: Some(1000) },
        };
        let mut was_stale = false;
        for secs in (0..1200).step_by(50) {
            let now = nbf + chrono::Duration::seconds(secs);
            let stale = token.is_stale_at(now).unwrap();
            if was_stale {
                assert!(stale, "staleness must not un-set itself as time advances");
            }
            was_stale = stale;
        }
        assert!(was_stale, "token must eventually become stale");
    }

    #[test]
    fn missing_claims_report_as_unusable() {
        let token = DecodedToken {
            header: Header { kid: None },
            claims: Claims { nbf: None, exp: Some(2000) },
        };
        assert!(token.validity_window().is_none());
        assert!(token.is_stale_at(Utc::now()).is_none());
    }
}
