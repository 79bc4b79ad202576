// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `WWW-Authenticate` challenges and `Authorization` headers for RTSP.
//!
//! Supports the two schemes cheap cameras actually use: `Basic` and `Digest`
//! with the MD5 algorithm and no qop, as described in
//! [RFC 2069](https://datatracker.ietf.org/doc/html/rfc2069) /
//! [RFC 2617 section 3.2.2](https://datatracker.ietf.org/doc/html/rfc2617#section-3.2.2).
//! Everything here is a pure function of its inputs; the only state is the
//! per-instance server nonce.

use base64::Engine as _;
use md5::{Digest as _, Md5};
use rand::Rng as _;

/// Authentication scheme of a challenge or response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

/// A challenge parsed from a `WWW-Authenticate` header (client role).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: AuthScheme,
    pub realm: Option<String>,
    pub nonce: Option<String>,
}

/// Server-side credential checking for one downstream relay.
///
/// The nonce is a random 9-digit decimal string generated once per instance,
/// not per challenge. That narrows digest security (it widens the replay
/// window) but matches how deployed RTSP servers of this style behave, and
/// the relay keeps a single instance for its whole lifetime.
pub struct Authentication {
    username: String,
    password: String,
    realm: String,
    nonce: String,
    scheme: AuthScheme,
}

impl Authentication {
    pub fn new(username: &str, password: &str, realm: &str, scheme: AuthScheme) -> Self {
        let nonce = rand::thread_rng().gen_range(100_000_000..=999_999_999u32);
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
            realm: realm.to_owned(),
            nonce: nonce.to_string(),
            scheme,
        }
    }

    /// Returns the `WWW-Authenticate` header value to send with a 401.
    pub fn challenge_header(&self) -> String {
        match self.scheme {
            AuthScheme::Basic => format!("Basic realm=\"{}\"", self.realm),
            AuthScheme::Digest => format!(
                "Digest realm=\"{}\", nonce=\"{}\"",
                self.realm, self.nonce
            ),
        }
    }

    /// Checks an incoming `Authorization` header value against the configured
    /// credentials, for a request with the given method.
    ///
    /// Any parse failure or missing attribute rejects; this never panics on
    /// attacker-controlled input.
    pub fn is_valid(&self, authorization: &str, method: &str) -> bool {
        match self.scheme {
            AuthScheme::Basic => self.is_valid_basic(authorization),
            AuthScheme::Digest => self.is_valid_digest(authorization, method),
        }
    }

    fn is_valid_basic(&self, authorization: &str) -> bool {
        let b64 = match authorization.strip_prefix("Basic ") {
            Some(b) => b.trim(),
            None => return false,
        };
        let decoded = match base64::engine::general_purpose::STANDARD.decode(b64) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let decoded = match String::from_utf8(decoded) {
            Ok(d) => d,
            Err(_) => return false,
        };
        // Split at the first colon only; passwords may contain colons.
        match decoded.split_once(':') {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }

    fn is_valid_digest(&self, authorization: &str, method: &str) -> bool {
        let attrs = match authorization.strip_prefix("Digest ") {
            Some(a) => a,
            None => return false,
        };
        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut auth_uri = None;
        let mut response = None;
        for attr in attrs.split(',') {
            let (key, value) = match attr.trim().split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "username" => username = Some(value),
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "uri" => auth_uri = Some(value),
                "response" => response = Some(value),
                _ => {}
            }
        }
        let (username, realm, nonce, auth_uri, response) =
            match (username, realm, nonce, auth_uri, response) {
                (Some(u), Some(r), Some(n), Some(au), Some(resp)) => (u, r, n, au, resp),
                _ => return false,
            };

        // The client hashed the uri attribute it sent (which for SETUP may
        // carry a track suffix), so recompute with that value; the identity
        // attributes must match ours exactly.
        let expected = digest_response(username, realm, &self.password, nonce, method, auth_uri);
        username == self.username
            && realm == self.realm
            && nonce == self.nonce
            && response == expected
    }
}

/// Computes the RFC 2069 digest response, as lowercase hex:
/// `MD5(MD5(user:realm:password):nonce:MD5(method:uri))`.
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(2 * digest.len());
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Produces an `Authorization` header value for the client role, or `None`
/// when a required field for the chosen scheme is missing (callers must treat
/// that as "do not attempt authorization").
pub fn generate_authorization(
    username: &str,
    password: &str,
    scheme: AuthScheme,
    realm: &str,
    nonce: Option<&str>,
    url: &str,
    method: &str,
) -> Option<String> {
    if username.is_empty() || password.is_empty() || realm.is_empty() {
        return None;
    }
    match scheme {
        AuthScheme::Basic => {
            let credentials = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            Some(format!("Basic {credentials}"))
        }
        AuthScheme::Digest => {
            let nonce = match nonce {
                Some(n) if !n.is_empty() => n,
                _ => return None,
            };
            let response = digest_response(username, realm, password, nonce, method, url);
            Some(format!(
                "Digest username=\"{username}\", realm=\"{realm}\", nonce=\"{nonce}\", \
                 uri=\"{url}\", response=\"{response}\""
            ))
        }
    }
}

/// Parses a `WWW-Authenticate` header value into a [`Challenge`] (client role).
///
/// Note this doesn't handle commas inside quoted attribute values; camera
/// challenges in practice quote only realm/nonce tokens without commas.
pub(crate) fn parse_challenge(www_authenticate: &str) -> Option<Challenge> {
    let (scheme, attrs) = if let Some(rest) = strip_prefix_ignore_case(www_authenticate, "basic") {
        (AuthScheme::Basic, rest)
    } else if let Some(rest) = strip_prefix_ignore_case(www_authenticate, "digest") {
        (AuthScheme::Digest, rest)
    } else {
        return None;
    };
    let mut realm = None;
    let mut nonce = None;
    for attr in attrs.split(',') {
        let (key, value) = match attr.trim().split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "realm" => realm = Some(value.to_owned()),
            "nonce" => nonce = Some(value.to_owned()),
            _ => {}
        }
    }
    Some(Challenge {
        scheme,
        realm,
        nonce,
    })
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
