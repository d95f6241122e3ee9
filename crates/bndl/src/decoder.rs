//! 🔓 The Transaction Decoder: raw signed hex in, [`DecodedTransaction`] out.
//!
//! Pure function territory. No state, no I/O, no feelings. You hand it a string,
//! it hands you a struct or a [`DecodeError`], and nobody else is affected.
//! Safe to call from every bundle at once, which is exactly what happens at peak.
//!
//! 🧠 Knowledge graph:
//! - Envelope decode: `TxEnvelope::decode_2718` handles legacy RLP and typed (EIP-2718) txs
//! - Sender: recovered from the signature (`SignerRecoverable`), EIP-55 checksummed
//! - Hash: keccak of the 2718 encoding, lowercase 0x-hex
//! - Fees: legacy/2930 carry `gas_price`; dynamic-fee types carry `max_fee_per_gas` +
//!   `max_priority_fee_per_gas`. The absent side is `None`, never zero.
//!
//! 🦆 The duck cannot sign transactions. It has no private key. It has no hands.

use std::collections::HashSet;

use alloy::consensus::transaction::SignerRecoverable;
use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::{Decodable2718, Eip2718Error};
use alloy::primitives::hex;

use crate::common::DecodedTransaction;

/// 💀 Everything that can go wrong turning hex into a transaction.
///
/// None of these are fatal to a bundle. The converter logs them and moves on.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty transaction payload")]
    Empty,
    #[error("transaction is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("transaction envelope is malformed: {0}")]
    Envelope(String),
    #[error("numeric field overflowed while decoding: {0}")]
    Overflow(String),
    #[error("{0} trailing bytes after the transaction envelope")]
    TrailingBytes(usize),
    #[error("could not recover the signer: {0}")]
    Signature(String),
}

impl From<Eip2718Error> for DecodeError {
    fn from(err: Eip2718Error) -> Self {
        match err {
            // -- 🔢 RLP says the number didn't fit. Nonce of 2^65? Bold. Rejected.
            Eip2718Error::RlpError(alloy::rlp::Error::Overflow) => {
                DecodeError::Overflow(err.to_string())
            }
            other => DecodeError::Envelope(other.to_string()),
        }
    }
}

/// 🛡️ The set of hashes a submitter marked as allowed-to-revert, lowercased once.
///
/// Built per bundle, consulted per transaction. Lowercasing at construction means
/// the per-tx check is one hash lookup instead of N string comparisons.
#[derive(Debug, Clone, Default)]
pub struct RevertingHashes {
    hashes: HashSet<String>,
}

impl RevertingHashes {
    pub fn new<I, S>(hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hashes: hashes
                .into_iter()
                .map(|hash| hash.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Case-insensitive membership.
    pub fn contains(&self, hash: &str) -> bool {
        !self.hashes.is_empty() && self.hashes.contains(&hash.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// 🔓 Decode one raw transaction with nobody's revert protection.
pub fn decode(raw: &str) -> Result<DecodedTransaction, DecodeError> {
    decode_with(raw, &RevertingHashes::default())
}

/// 🔓 Decode one raw transaction, flagging `may_revert` from `reverting`.
pub fn decode_with(
    raw: &str,
    reverting: &RevertingHashes,
) -> Result<DecodedTransaction, DecodeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "0x" {
        return Err(DecodeError::Empty);
    }
    // -- 🧹 hex::decode eats an optional 0x prefix for us. Small mercies.
    let the_bytes = hex::decode(trimmed)?;

    let mut the_cursor = the_bytes.as_slice();
    let the_envelope = TxEnvelope::decode_2718(&mut the_cursor)?;
    if !the_cursor.is_empty() {
        return Err(DecodeError::TrailingBytes(the_cursor.len()));
    }

    let the_sender = the_envelope
        .recover_signer()
        .map_err(|e| DecodeError::Signature(e.to_string()))?;
    let the_hash = hex::encode_prefixed(the_envelope.tx_hash());

    let (max_fee_per_gas, max_priority_fee_per_gas) = if the_envelope.is_dynamic_fee() {
        (
            Some(the_envelope.max_fee_per_gas().to_string()),
            the_envelope
                .max_priority_fee_per_gas()
                .map(|fee| fee.to_string()),
        )
    } else {
        (None, None)
    };

    let may_revert = reverting.contains(&the_hash);

    Ok(DecodedTransaction {
        nonce: the_envelope.nonce(),
        max_fee_per_gas,
        max_priority_fee_per_gas,
        gas_price: the_envelope.gas_price().map(|price| price.to_string()),
        gas_limit: the_envelope.gas_limit().to_string(),
        to: the_envelope.to().map(|to| to.to_checksum(None)),
        from: the_sender.to_checksum(None),
        value: the_envelope.value().to_string(),
        data: hex::encode_prefixed(the_envelope.input()),
        hash: the_hash,
        may_revert,
    })
}
