//! Namespaced network identifiers.
//!
//! Networks are always `namespace:reference` (CAIP-2 shape), e.g. `stacks:1`.
//! Human labels like `"mainnet"` cannot be turned into a [`Network`]: both
//! [`FromStr`] and deserialization reject them.

use crate::errors::X402Error;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Namespace used by Stacks networks.
pub const STACKS_NAMESPACE: &str = "stacks";

/// Chain id of Stacks mainnet.
pub const STACKS_MAINNET_CHAIN_ID: &str = "1";

/// Chain id of Stacks testnet.
pub const STACKS_TESTNET_CHAIN_ID: &str = "2147483648";

/// A validated, namespaced network identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Network {
    namespace: String,
    reference: String,
}

impl Network {
    /// Builds a network from its parts, validating both.
    ///
    /// # Examples
    ///
    /// ```
    /// use x402_stacks::network::Network;
    ///
    /// let net = Network::new("stacks", "1").unwrap();
    /// assert_eq!(net.to_string(), "stacks:1");
    /// assert!(Network::new("", "1").is_err());
    /// ```
    pub fn new(
        namespace: impl Into<String>,
        reference: impl Into<String>,
    ) -> Result<Self, X402Error> {
        let namespace = namespace.into();
        let reference = reference.into();
        validate_namespace(&namespace)?;
        validate_reference(&reference)?;
        Ok(Self {
            namespace,
            reference,
        })
    }

    /// Stacks mainnet (`stacks:1`).
    pub fn stacks_mainnet() -> Self {
        Self {
            namespace: STACKS_NAMESPACE.to_string(),
            reference: STACKS_MAINNET_CHAIN_ID.to_string(),
        }
    }

    /// Stacks testnet (`stacks:2147483648`).
    pub fn stacks_testnet() -> Self {
        Self {
            namespace: STACKS_NAMESPACE.to_string(),
            reference: STACKS_TESTNET_CHAIN_ID.to_string(),
        }
    }

    /// Returns the namespace component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the reference (chain id) component.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// True for any network in the `stacks` namespace.
    pub fn is_stacks(&self) -> bool {
        self.namespace == STACKS_NAMESPACE
    }
}

fn validate_namespace(namespace: &str) -> Result<(), X402Error> {
    let ok = (3..=8).contains(&namespace.len())
        && namespace
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(X402Error::InvalidNetwork(format!(
            "namespace '{namespace}' must be 3-8 chars of [-a-z0-9]"
        )))
    }
}

fn validate_reference(reference: &str) -> Result<(), X402Error> {
    let ok = (1..=32).contains(&reference.len())
        && reference
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(X402Error::InvalidNetwork(format!(
            "reference '{reference}' must be 1-32 chars of [-_a-zA-Z0-9]"
        )))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

impl FromStr for Network {
    type Err = X402Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, reference)) => Self::new(namespace, reference),
            None => Err(X402Error::InvalidNetwork(format!(
                "'{s}' is a bare label; expected namespace:reference such as stacks:1"
            ))),
        }
    }
}

impl Serialize for Network {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}
