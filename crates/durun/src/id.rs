//! # Object Identity
//!
//! Mints and parses the identifiers that address durable objects.
//!
//! An identity is a tagged variant: the namespace it belongs to, how it was
//! derived (from a name, or at random), and a 32-byte payload. Name-derived
//! identities hash `(namespace, name)` with SHA-256, so independent callers
//! in independent processes always converge on the same instance.
//!
//! ## Wire Format
//!
//! ```text
//! {namespace}:{kind}:{payload}
//!     chat   : n    : 3f9a...e1   (64 hex chars)
//! ```
//!
//! `kind` is `n` for name-derived and `u` for unique identities.

use std::fmt;
use std::fmt::Write as _;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Digest;
use sha2::Sha256;

const PAYLOAD_LEN: usize = 32;
const NAME_DOMAIN: &[u8] = b"durun:name\0";
const MAX_NAMESPACE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A serialized identity could not be parsed.
    InvalidIdFormat(String),
    /// A namespace name contains forbidden characters or has a bad length.
    InvalidNamespace(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdFormat(msg) => write!(f, "Invalid id format: {}", msg),
            Self::InvalidNamespace(name) => write!(f, "Invalid namespace name: {:?}", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// How an identity was derived.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum IdKind {
    /// Deterministic hash of `(namespace, name)`.
    Named,
    /// 256 bits from the operating system's CSPRNG.
    Unique,
}

impl IdKind {
    fn tag(self) -> char {
        match self {
            Self::Named => 'n',
            Self::Unique => 'u',
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "n" => Some(Self::Named),
            "u" => Some(Self::Unique),
            _ => None,
        }
    }
}

/// Checks that a namespace name is usable inside tokens and URL paths.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    let valid_len = !namespace.is_empty() && namespace.len() <= MAX_NAMESPACE_LEN;
    let valid_chars = namespace
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));

    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(Error::InvalidNamespace(namespace.to_string()))
    }
}

/// Immutable identity of a durable object.
///
/// Equality and hashing cover the namespace, kind and payload. The optional
/// human-readable name travels with name-derived ids but is never compared,
/// so an id parsed back from its token equals the id it was minted as.
#[derive(Clone, Debug)]
pub struct ObjectId {
    namespace: Arc<str>,
    kind: IdKind,
    payload: [u8; PAYLOAD_LEN],
    name: Option<Arc<str>>,
}

impl ObjectId {
    /// Derives the identity for `name` within `namespace`.
    pub fn from_name(namespace: &str, name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(NAME_DOMAIN);
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();

        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&digest);

        Self {
            namespace: Arc::from(namespace),
            kind: IdKind::Named,
            payload,
            name: Some(Arc::from(name)),
        }
    }

    /// Mints a fresh random identity.
    pub fn new_unique(namespace: &str) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        OsRng.fill_bytes(&mut payload);

        Self {
            namespace: Arc::from(namespace),
            kind: IdKind::Unique,
            payload,
            name: None,
        }
    }

    /// Parses a token that must belong to `namespace`.
    pub fn from_string(namespace: &str, token: &str) -> Result<Self> {
        let id = Self::parse(token)?;
        if &*id.namespace != namespace {
            return Err(Error::InvalidIdFormat(format!(
                "id belongs to namespace '{}', expected '{}'",
                id.namespace, namespace
            )));
        }
        Ok(id)
    }

    /// Parses a token, taking the namespace from the token itself.
    pub fn parse(token: &str) -> Result<Self> {
        let mut parts = token.splitn(3, ':');
        let (Some(namespace), Some(kind), Some(hex)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidIdFormat(format!(
                "expected '{{namespace}}:{{kind}}:{{payload}}', got {:?}",
                token
            )));
        };

        validate_namespace(namespace)
            .map_err(|_| Error::InvalidIdFormat(format!("bad namespace {:?}", namespace)))?;

        let kind = IdKind::from_tag(kind)
            .ok_or_else(|| Error::InvalidIdFormat(format!("unknown id kind {:?}", kind)))?;

        let payload = decode_hex(hex)?;

        Ok(Self {
            namespace: Arc::from(namespace),
            kind,
            payload,
            name: None,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    /// The name this id was derived from, when it was minted locally by name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn payload(&self) -> &[u8; PAYLOAD_LEN] {
        &self.payload
    }

    /// Re-attaches a human-readable name, e.g. one carried in a routing header.
    pub(crate) fn with_name(mut self, name: Option<&str>) -> Self {
        if self.kind == IdKind::Named {
            self.name = name.map(Arc::from);
        }
        self
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.payload == other.payload
            && self.namespace == other.namespace
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.kind.hash(state);
        self.payload.hash(state);
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.kind.tag(), encode_hex(&self.payload))
    }
}

impl std::str::FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        // Writing into a String cannot fail.
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn decode_hex(hex: &str) -> Result<[u8; PAYLOAD_LEN]> {
    if hex.len() != PAYLOAD_LEN * 2 {
        return Err(Error::InvalidIdFormat(format!(
            "payload must be {} hex chars, got {}",
            PAYLOAD_LEN * 2,
            hex.len()
        )));
    }

    let mut payload = [0u8; PAYLOAD_LEN];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let hi = hex_value(chunk[0])?;
        let lo = hex_value(chunk[1])?;
        payload[i] = (hi << 4) | lo;
    }
    Ok(payload)
}

fn hex_value(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::InvalidIdFormat(format!("non-hex character {:?}", c as char))),
    }
}
