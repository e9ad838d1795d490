use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::base32;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

/// Declares a fixed-size binary wire type with Crockford base32 text form.
///
/// Generates `from_bytes`/`as_bytes`, `Display` (base32), `FromStr`
/// (base32, strict length) and serde impls that put the base32 string on
/// the wire, matching how these values appear in headers, URLs and JSON.
macro_rules! wire_bytes {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_bytes(b: [u8; $len]) -> Self {
                Self(b)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Fill from cryptographically secure randomness.
            pub fn random() -> Self {
                let mut b = [0u8; $len];
                rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut b);
                Self(b)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", base32::encode(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let enc = base32::encode(&self.0);
                write!(f, concat!(stringify!($name), "({}…)"), &enc[..8.min(enc.len())])
            }
        }

        impl FromStr for $name {
            type Err = base32::Base32Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes: [u8; $len] = base32::decode_fixed(s)?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&base32::encode(&self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct V;
                impl<'de> Visitor<'de> for V {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                        write!(f, "a base32 string of {} bytes", $len)
                    }

                    fn visit_str<E: de::Error>(self, s: &str) -> Result<$name, E> {
                        s.parse().map_err(de::Error::custom)
                    }
                }
                deserializer.deserialize_str(V)
            }
        }
    };
}

wire_bytes!(
    /// Ed25519 public key naming an account at this provider.
    AccountPublicKey, 32
);

wire_bytes!(
    /// Ed25519 signature made with an account key.
    AccountSignature, 64
);

wire_bytes!(
    /// Client-chosen 32-byte identifier of a truth object.
    TruthUuid, 32
);

wire_bytes!(
    /// Random 32-byte secret that doubles as the merchant order id
    /// (in base32 form) for the payment it identifies.
    PaymentSecret, 32
);

wire_bytes!(
    /// SHA-512 output: recovery-document hashes, hashed challenge
    /// answers, user identifiers.
    HashCode, 64
);

wire_bytes!(
    /// Symmetric key a client uses to let the provider decrypt a truth.
    TruthKey, 32
);

wire_bytes!(
    /// One random key share; a policy key is derived from several.
    KeyShare, 32
);

wire_bytes!(
    /// Per-policy key derived from that policy's key shares.
    PolicyKey, 64
);

wire_bytes!(
    /// Salt mixed into the policy-key derivation, chosen per backup.
    MasterSalt, 64
);

wire_bytes!(
    /// Client-side salt for hashing security-question answers.
    QuestionSalt, 32
);

wire_bytes!(
    /// Per-provider salt; makes identical identity data derive
    /// different account keys at different providers.
    ProviderSalt, 16
);

wire_bytes!(
    /// Nonce for the authenticated encryption layer.
    Nonce, 24
);

wire_bytes!(
    /// The 72-byte blob released on successful authentication:
    /// nonce ‖ MAC ‖ encrypted 32-byte key share.
    EncryptedKeyShare, 72
);

impl TruthUuid {
    /// Shortened form for log lines; enough to identify a truth to a human.
    pub fn short(&self) -> String {
        let enc = base32::encode(&self.0);
        enc[..6].to_string()
    }
}
