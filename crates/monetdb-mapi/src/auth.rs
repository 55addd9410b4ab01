//! MAPI challenge-response authentication.
//!
//! The server opens every connection with one challenge line:
//!
//! ```text
//! salt:server_type:protocol_version:hash1,hash2,...:endianness:password_hash:
//! ```
//!
//! The client answers with
//!
//! ```text
//! BIG:user:{ALGO}hexdigest:language:database:
//! ```
//!
//! where `hexdigest = hex(ALGO(password + salt))` and `ALGO` is the strongest
//! algorithm offered in the hash list. Protocol version 9 first replaces the
//! password by `hex(PWALGO(password))`, `PWALGO` being the sixth challenge
//! field.
//!
//! Response builders are plain functions looked up by protocol version in a
//! [`HandshakeStrategies`] table owned by the caller.

use std::collections::HashMap;

use monetdb_core::error::{ProtocolError, UnsupportedError, UnsupportedKind};
use monetdb_core::{Error, Result};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

/// Hash algorithms in order of preference.
const PREFERRED_HASHES: &[&str] = &["SHA512", "SHA384", "SHA256", "SHA224", "SHA1", "MD5"];

/// Parsed server challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub salt: String,
    pub server_type: String,
    pub version: u32,
    /// Hash algorithms the server accepts for the response
    pub hashes: Vec<String>,
    pub endian: String,
    /// Algorithm the server stores passwords with (protocol 9)
    pub password_hash: Option<String>,
}

impl Challenge {
    /// Parse a challenge line.
    ///
    /// At least five `:`-separated fields are required.
    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split(':').collect();
        if tokens.len() < 5 {
            return Err(Error::Protocol(ProtocolError {
                message: format!(
                    "server challenge has {} fields, expected at least 5",
                    tokens.len()
                ),
                line: Some(line.to_string()),
                source: None,
            }));
        }
        let version = tokens[2].parse().map_err(|_| {
            Error::Unsupported(UnsupportedError {
                kind: UnsupportedKind::ProtocolVersion,
                message: format!("unknown MAPI protocol version {:?}", tokens[2]),
            })
        })?;

        Ok(Self {
            salt: tokens[0].to_string(),
            server_type: tokens[1].to_string(),
            version,
            hashes: tokens[3]
                .split(',')
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect(),
            endian: tokens[4].to_string(),
            password_hash: tokens
                .get(5)
                .filter(|h| !h.is_empty())
                .map(|h| (*h).to_string()),
        })
    }

    /// Strongest supported algorithm the server offers.
    pub fn preferred_hash(&self) -> Option<&'static str> {
        PREFERRED_HASHES
            .iter()
            .copied()
            .find(|algo| self.hashes.iter().any(|h| h == algo))
    }
}

/// What the client logs in with.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub database: String,
    pub language: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("database", &self.database)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

/// Builds the login line for one protocol version.
pub type ResponseBuilder = fn(&Credentials, &Challenge) -> Result<String>;

/// Protocol version to response builder lookup.
#[derive(Debug, Clone)]
pub struct HandshakeStrategies {
    builders: HashMap<u32, ResponseBuilder>,
}

impl Default for HandshakeStrategies {
    fn default() -> Self {
        let mut strategies = Self {
            builders: HashMap::new(),
        };
        strategies.register(8, respond_v8);
        strategies.register(9, respond_v9);
        strategies
    }
}

impl HandshakeStrategies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the builder for `version`.
    pub fn register(&mut self, version: u32, builder: ResponseBuilder) {
        self.builders.insert(version, builder);
    }

    pub fn supports(&self, version: u32) -> bool {
        self.builders.contains_key(&version)
    }

    /// Build the login line answering `challenge`.
    pub fn respond(&self, credentials: &Credentials, challenge: &Challenge) -> Result<String> {
        let builder = self.builders.get(&challenge.version).ok_or_else(|| {
            Error::Unsupported(UnsupportedError {
                kind: UnsupportedKind::ProtocolVersion,
                message: format!("unsupported MAPI protocol version {}", challenge.version),
            })
        })?;
        builder(credentials, challenge)
    }
}

/// Protocol 8: the password is hashed together with the salt as is.
pub fn respond_v8(credentials: &Credentials, challenge: &Challenge) -> Result<String> {
    login_line(credentials, &credentials.password, challenge)
}

/// Protocol 9: the password is pre-hashed with the server's storage algorithm.
pub fn respond_v9(credentials: &Credentials, challenge: &Challenge) -> Result<String> {
    let algo = challenge.password_hash.as_deref().ok_or_else(|| {
        Error::Protocol(ProtocolError {
            message: "protocol 9 challenge without password hash algorithm".to_string(),
            line: None,
            source: None,
        })
    })?;
    let password = hex_digest(algo, credentials.password.as_bytes())?;
    login_line(credentials, &password, challenge)
}

fn login_line(credentials: &Credentials, password: &str, challenge: &Challenge) -> Result<String> {
    let algo = challenge.preferred_hash().ok_or_else(|| {
        Error::Unsupported(UnsupportedError {
            kind: UnsupportedKind::Operation,
            message: format!(
                "no supported hash algorithm in server list {:?}",
                challenge.hashes
            ),
        })
    })?;

    let mut salted = String::with_capacity(password.len() + challenge.salt.len());
    salted.push_str(password);
    salted.push_str(&challenge.salt);
    let digest = hex_digest(algo, salted.as_bytes())?;

    Ok(format!(
        "BIG:{}:{{{algo}}}{digest}:{}:{}:",
        credentials.user, credentials.language, credentials.database
    ))
}

/// Lowercase hex digest of `data` under the named algorithm.
pub fn hex_digest(algo: &str, data: &[u8]) -> Result<String> {
    Ok(match algo.to_ascii_uppercase().as_str() {
        "SHA512" => to_hex(&Sha512::digest(data)),
        "SHA384" => to_hex(&Sha384::digest(data)),
        "SHA256" => to_hex(&Sha256::digest(data)),
        "SHA224" => to_hex(&Sha224::digest(data)),
        "SHA1" => to_hex(&Sha1::digest(data)),
        "MD5" => format!("{:x}", md5::compute(data)),
        _ => {
            return Err(Error::Unsupported(UnsupportedError {
                kind: UnsupportedKind::Operation,
                message: format!("unsupported hash algorithm {algo}"),
            }));
        }
    })
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            user: "monetdb".to_string(),
            password: "monetdb".to_string(),
            database: "demo".to_string(),
            language: "sql".to_string(),
        }
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(
            hex_digest("MD5", b"").unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            hex_digest("SHA1", b"abc").unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hex_digest("sha256", b"abc").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(matches!(
            hex_digest("RIPEMD160", b"abc"),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_parse_challenge() {
        let challenge =
            Challenge::parse("s4lt:merovingian:9:RIPEMD160,SHA256,SHA1,MD5:LIT:SHA512:").unwrap();
        assert_eq!(challenge.salt, "s4lt");
        assert_eq!(challenge.server_type, "merovingian");
        assert_eq!(challenge.version, 9);
        assert_eq!(challenge.password_hash.as_deref(), Some("SHA512"));
        assert_eq!(challenge.preferred_hash(), Some("SHA256"));
    }

    #[test]
    fn test_short_challenge_is_protocol_error() {
        assert!(matches!(
            Challenge::parse("salt:mserver:9:SHA1"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_version_is_unsupported() {
        let strategies = HandshakeStrategies::default();
        let challenge = Challenge::parse("salt:mserver:7:SHA1:LIT:").unwrap();
        match strategies.respond(&credentials(), &challenge) {
            Err(Error::Unsupported(e)) => assert_eq!(e.kind, UnsupportedKind::ProtocolVersion),
            other => panic!("expected unsupported version, got {other:?}"),
        }
        assert!(matches!(
            Challenge::parse("salt:mserver:nine:SHA1:LIT:"),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_v8_response() {
        let challenge = Challenge::parse("salt:mserver:8:MD5:LIT:").unwrap();
        let expected = hex_digest("MD5", b"monetdbsalt").unwrap();
        assert_eq!(
            HandshakeStrategies::default()
                .respond(&credentials(), &challenge)
                .unwrap(),
            format!("BIG:monetdb:{{MD5}}{expected}:sql:demo:")
        );
    }

    #[test]
    fn test_v9_response_prehashes_password() {
        let challenge = Challenge::parse("salt:mserver:9:SHA1,MD5:LIT:SHA512:").unwrap();
        let prehashed = hex_digest("SHA512", b"monetdb").unwrap();
        let expected = hex_digest("SHA1", format!("{prehashed}salt").as_bytes()).unwrap();
        assert_eq!(
            respond_v9(&credentials(), &challenge).unwrap(),
            format!("BIG:monetdb:{{SHA1}}{expected}:sql:demo:")
        );
    }

    #[test]
    fn test_v9_requires_password_hash() {
        let challenge = Challenge::parse("salt:mserver:9:SHA1:LIT:").unwrap();
        assert!(matches!(
            respond_v9(&credentials(), &challenge),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_registered_strategy_overrides_default() {
        fn plain(credentials: &Credentials, _challenge: &Challenge) -> Result<String> {
            Ok(format!("PLAIN:{}", credentials.user))
        }
        let mut strategies = HandshakeStrategies::new();
        strategies.register(10, plain);
        assert!(strategies.supports(10));
        let challenge = Challenge::parse("salt:mserver:10:SHA1:LIT:").unwrap();
        assert_eq!(
            strategies.respond(&credentials(), &challenge).unwrap(),
            "PLAIN:monetdb"
        );
    }

    #[test]
    fn test_no_common_hash() {
        let challenge = Challenge::parse("salt:mserver:8:RIPEMD160:LIT:").unwrap();
        assert!(matches!(
            respond_v8(&credentials(), &challenge),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_debug_hides_password() {
        let rendered = format!("{:?}", credentials());
        assert!(rendered.contains("monetdb"));
        assert!(!rendered.contains("password"));
    }
}
