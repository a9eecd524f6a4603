//! Signing capabilities for the payer.
//!
//! A [`PaymentSigner`] turns an [`UnsignedTransfer`] into a [`SignedTransfer`]
//! without ever broadcasting it. Two implementations are provided:
//!
//! - [`LocalKeySigner`] holds a secp256k1 private key in process.
//! - [`DelegatedSigner`] forwards the request to an [`ExternalWallet`] (a
//!   browser extension, hardware wallet bridge, ...) and bounds the wait for the
//!   user with a timeout.

use crate::errors::{Result, X402Error};
use crate::network::{Network, STACKS_MAINNET_CHAIN_ID, STACKS_TESTNET_CHAIN_ID};
use crate::types::{SignedTransfer, UnsignedTransfer};
use crate::utils::strip_hex_prefix;
use async_trait::async_trait;
use ethers::core::k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A capability that can sign transfers for one payer principal.
#[async_trait]
pub trait PaymentSigner: Send + Sync {
    /// The payer principal transfers are sent from.
    fn address(&self) -> &str;

    /// Whether this signer can pay with `asset` on `network`.
    fn supports(&self, network: &Network, asset: &str) -> bool;

    /// Signs `transfer`. Must not broadcast anything.
    async fn sign_transfer(&self, transfer: &UnsignedTransfer) -> Result<SignedTransfer>;
}

/// Which networks and assets a signer is willing to pay with.
#[derive(Debug, Clone)]
struct Capabilities {
    networks: Vec<Network>,
    /// `None` accepts any asset.
    assets: Option<Vec<String>>,
}

impl Capabilities {
    fn new(network: Network) -> Self {
        Self {
            networks: vec![network],
            assets: None,
        }
    }

    fn supports(&self, network: &Network, asset: &str) -> bool {
        self.networks.contains(network)
            && self
                .assets
                .as_ref()
                .map_or(true, |assets| assets.iter().any(|a| a == asset))
    }
}

/// Signs with a private key held in memory.
#[derive(Clone)]
pub struct LocalKeySigner {
    key: SigningKey,
    address: String,
    capabilities: Capabilities,
}

impl LocalKeySigner {
    /// Creates a signer from a hex private key.
    ///
    /// Accepts 32-byte keys and the 33-byte Stacks form with a trailing `01`
    /// compression flag, with or without `0x`. `address` must be the
    /// single-signature principal the key controls on `network`.
    ///
    /// # Examples
    ///
    /// ```
    /// use x402_stacks::network::Network;
    /// use x402_stacks::signer::{LocalKeySigner, PaymentSigner};
    ///
    /// let signer = LocalKeySigner::from_hex(
    ///     "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
    ///     "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1",
    ///     Network::stacks_testnet(),
    /// ).unwrap();
    /// assert!(signer.supports(&Network::stacks_testnet(), "STX"));
    /// assert!(!signer.supports(&Network::stacks_mainnet(), "STX"));
    /// ```
    pub fn from_hex(
        private_key: &str,
        address: impl Into<String>,
        network: Network,
    ) -> Result<Self> {
        let bytes = hex::decode(strip_hex_prefix(private_key.trim()))
            .map_err(|e| X402Error::ConfigError(format!("Invalid private key hex: {}", e)))?;
        let secret = match bytes.len() {
            32 => &bytes[..],
            33 if bytes[32] == 0x01 => &bytes[..32],
            n => {
                return Err(X402Error::ConfigError(format!(
                    "Private key must be 32 bytes (or 33 with compression flag), got {n}"
                )))
            }
        };
        let key = SigningKey::from_slice(secret)
            .map_err(|e| X402Error::ConfigError(format!("Invalid private key: {}", e)))?;
        let address = address.into();
        let owned = principal_for_key(key.verifying_key(), &network)?;
        if owned != address {
            return Err(X402Error::ConfigError(format!(
                "private key controls {owned} on {network}, not {address}"
            )));
        }
        Ok(Self {
            key,
            address,
            capabilities: Capabilities::new(network),
        })
    }

    /// Allows paying on an additional network.
    ///
    /// Principals are network-specific, so transfers on a network where the
    /// configured address is not the key's principal are still refused.
    pub fn with_network(mut self, network: Network) -> Self {
        if !self.capabilities.networks.contains(&network) {
            self.capabilities.networks.push(network);
        }
        self
    }

    /// Restricts payments to the listed assets.
    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.assets = Some(assets.into_iter().map(Into::into).collect());
        self
    }

    /// Compressed public key as hex.
    pub fn public_key_hex(&self) -> String {
        public_key_hex(self.key.verifying_key())
    }
}

impl fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.address)
            .field("public_key", &self.public_key_hex())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[async_trait]
impl PaymentSigner for LocalKeySigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn supports(&self, network: &Network, asset: &str) -> bool {
        self.capabilities.supports(network, asset)
    }

    async fn sign_transfer(&self, transfer: &UnsignedTransfer) -> Result<SignedTransfer> {
        if transfer.from != self.address {
            return Err(X402Error::SigningDeclined(format!(
                "transfer is from {}, signer holds {}",
                transfer.from, self.address
            )));
        }
        if principal_for_key(self.key.verifying_key(), &transfer.network)? != self.address {
            return Err(X402Error::SigningDeclined(format!(
                "{} is not this key's principal on {}",
                self.address, transfer.network
            )));
        }
        let digest = transfer.signing_digest()?;
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| X402Error::SignatureError(e.to_string()))?;

        let mut sig_bytes = Vec::with_capacity(65);
        sig_bytes.push(recovery_id.to_byte());
        sig_bytes.extend_from_slice(&signature.to_bytes());

        Ok(SignedTransfer {
            transfer: transfer.clone(),
            public_key: self.public_key_hex(),
            signature: hex::encode(sig_bytes),
        })
    }
}

/// A signature produced by an external wallet.
#[derive(Debug, Clone)]
pub struct WalletSignature {
    /// Compressed public key (hex)
    pub public_key: String,
    /// Recovery id byte followed by r and s (hex)
    pub signature: String,
}

/// Why an external wallet did not sign.
#[derive(Debug, Error)]
pub enum WalletRejection {
    /// The user dismissed the signing prompt
    #[error("user rejected the signing request")]
    UserRejected,
    /// The wallet failed for another reason
    #[error("wallet error: {0}")]
    Wallet(String),
}

/// A wallet living outside this process that can be asked for signatures.
#[async_trait]
pub trait ExternalWallet: Send + Sync {
    /// Prompts for a signature over `transfer`.
    async fn request_signature(
        &self,
        transfer: &UnsignedTransfer,
    ) -> std::result::Result<WalletSignature, WalletRejection>;
}

/// Signs through an [`ExternalWallet`], bounded by a user-interaction timeout.
pub struct DelegatedSigner<W> {
    wallet: W,
    address: String,
    capabilities: Capabilities,
    timeout: Duration,
}

impl<W: ExternalWallet> DelegatedSigner<W> {
    /// Default time the user gets to approve a signature.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    /// Wraps `wallet` for payments from `address` on `network`.
    pub fn new(wallet: W, address: impl Into<String>, network: Network) -> Self {
        Self {
            wallet,
            address: address.into(),
            capabilities: Capabilities::new(network),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Sets the user-interaction timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allows paying on an additional network.
    pub fn with_network(mut self, network: Network) -> Self {
        if !self.capabilities.networks.contains(&network) {
            self.capabilities.networks.push(network);
        }
        self
    }

    /// Restricts payments to the listed assets.
    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.assets = Some(assets.into_iter().map(Into::into).collect());
        self
    }
}

impl<W> fmt::Debug for DelegatedSigner<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedSigner")
            .field("address", &self.address)
            .field("capabilities", &self.capabilities)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl<W: ExternalWallet> PaymentSigner for DelegatedSigner<W> {
    fn address(&self) -> &str {
        &self.address
    }

    fn supports(&self, network: &Network, asset: &str) -> bool {
        self.capabilities.supports(network, asset)
    }

    async fn sign_transfer(&self, transfer: &UnsignedTransfer) -> Result<SignedTransfer> {
        let answer = tokio::time::timeout(self.timeout, self.wallet.request_signature(transfer))
            .await
            .map_err(|_| X402Error::SigningTimeout(self.timeout))?
            .map_err(|rejection| X402Error::SigningDeclined(rejection.to_string()))?;

        let signed = SignedTransfer {
            transfer: transfer.clone(),
            public_key: answer.public_key,
            signature: answer.signature,
        };
        verify_transfer_signature(&signed).map_err(|e| {
            X402Error::SigningDeclined(format!("wallet returned an unusable signature: {e}"))
        })?;
        Ok(signed)
    }
}

fn public_key_hex(key: &VerifyingKey) -> String {
    hex::encode(key.to_encoded_point(true).as_bytes())
}

const C32_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Single-signature address version bytes (`P` on mainnet, `T` on testnet).
const MAINNET_SINGLE_SIG: u8 = 22;
const TESTNET_SINGLE_SIG: u8 = 26;

fn address_version(network: &Network) -> Result<u8> {
    if !network.is_stacks() {
        return Err(X402Error::InvalidNetwork(format!("no single-signature address version for {network}")));
    }
    match network.reference() {
        STACKS_MAINNET_CHAIN_ID => Ok(MAINNET_SINGLE_SIG),
        STACKS_TESTNET_CHAIN_ID => Ok(TESTNET_SINGLE_SIG),
        _ => Err(X402Error::InvalidNetwork(format!("no single-signature address version for {network}"))),
    }
}

/// Crockford-style base32 as used by Stacks, keeping leading zero bytes.
fn c32_encode(input: &[u8]) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(input.len() * 8 / 5 + 1);
    let mut carry: u16 = 0;
    let mut carry_bits: u16 = 0;

    for &byte in input.iter().rev() {
        carry |= u16::from(byte) << carry_bits;
        carry_bits += 8;
        while carry_bits >= 5 {
            out.push(C32_ALPHABET[usize::from(carry & 0x1f)]);
            carry >>= 5;
            carry_bits -= 5;
        }
    }
    if carry_bits > 0 {
        out.push(C32_ALPHABET[usize::from(carry & 0x1f)]);
    }

    while out.last() == Some(&C32_ALPHABET[0]) {
        out.pop();
    }
    for _ in input.iter().take_while(|b| **b == 0) {
        out.push(C32_ALPHABET[0]);
    }
    out.iter().rev().map(|&c| char::from(c)).collect()
}

/// The single-signature principal controlled by `key` on `network`.
///
/// hash160 of the compressed key, c32check-encoded with the network's
/// version byte.
pub fn principal_for_key(key: &VerifyingKey, network: &Network) -> Result<String> {
    let version = address_version(network)?;
    let hash160 = Ripemd160::digest(Sha256::digest(key.to_encoded_point(true).as_bytes()));

    let mut versioned = Vec::with_capacity(21);
    versioned.push(version);
    versioned.extend_from_slice(&hash160);
    let checksum = Sha256::digest(Sha256::digest(&versioned));

    let mut payload = hash160.to_vec();
    payload.extend_from_slice(&checksum[..4]);
    Ok(format!(
        "S{}{}",
        char::from(C32_ALPHABET[usize::from(version)]),
        c32_encode(&payload)
    ))
}

/// Like [`principal_for_key`], for a hex-encoded SEC1 public key.
///
/// ```
/// use x402_stacks::network::Network;
/// use x402_stacks::signer::principal_for_public_key;
///
/// let key = "038318535b54105d4a7aae60c08fc45f9687181b4fdfc625bd1a753fa7397fed75";
/// assert_eq!(
///     principal_for_public_key(key, &Network::stacks_testnet()).unwrap(),
///     "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1"
/// );
/// assert_eq!(
///     principal_for_public_key(key, &Network::stacks_mainnet()).unwrap(),
///     "SP2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5V2TKDCT"
/// );
/// ```
pub fn principal_for_public_key(public_key: &str, network: &Network) -> Result<String> {
    let bytes = hex::decode(strip_hex_prefix(public_key))
        .map_err(|e| X402Error::InvalidPayload(format!("Invalid public key hex: {}", e)))?;
    let key = VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| X402Error::SignatureError(format!("Invalid public key: {}", e)))?;
    principal_for_key(&key, network)
}

/// Checks that `signed.signature` is a valid signature by `signed.public_key`
/// over the transfer digest, and that the key controls `transfer.from`.
pub fn verify_transfer_signature(signed: &SignedTransfer) -> Result<()> {
    let digest = signed.transfer.signing_digest()?;

    let sig_bytes = hex::decode(strip_hex_prefix(&signed.signature))
        .map_err(|e| X402Error::InvalidPayload(format!("Invalid signature hex: {}", e)))?;
    if sig_bytes.len() != 65 {
        return Err(X402Error::SignatureError(format!(
            "signature must be 65 bytes, got {}",
            sig_bytes.len()
        )));
    }
    let recovery_id = RecoveryId::from_byte(sig_bytes[0])
        .ok_or_else(|| X402Error::SignatureError("invalid recovery id".to_string()))?;
    let signature = Signature::from_slice(&sig_bytes[1..])
        .map_err(|e| X402Error::SignatureError(e.to_string()))?;

    let recovered = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|e| X402Error::SignatureError(e.to_string()))?;

    let key_bytes = hex::decode(strip_hex_prefix(&signed.public_key))
        .map_err(|e| X402Error::InvalidPayload(format!("Invalid public key hex: {}", e)))?;
    let claimed = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|e| X402Error::SignatureError(format!("Invalid public key: {}", e)))?;

    if recovered != claimed {
        return Err(X402Error::SignatureError(
            "signature was not produced by the declared public key".to_string(),
        ));
    }

    let owner = principal_for_key(&claimed, &signed.transfer.network)?;
    if owner != signed.transfer.from {
        return Err(X402Error::SignatureError(format!(
            "signing key controls {owner}, not the sender {}",
            signed.transfer.from
        )));
    }
    Ok(())
}
