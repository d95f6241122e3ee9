//! 📦 Common data structures: the building blocks of bndl.
//!
//! 🎬 COLD OPEN: INT. MEMPOOL. A bundle arrives. Forty thousand signed transactions,
//! hex-encoded, wrapped in JSON, wrapped in an HTTP request, wrapped in hope.
//! It wants to be decoded. It wants to be uploaded. It mostly wants to not be OOM-killed.
//!
//! These are the structs that ferry a bundle from "raw hex strings the submitter sent"
//! to "structured JSON sitting in a bucket". They don't ask questions. They carry the data.
//!
//! 🧠 Knowledge graph:
//! - [`RawBundle`]: what came in over the wire. Owned by the request, drained by the converter.
//! - [`DecodedTransaction`]: one decoded, sender-recovered transaction. Immutable once made.
//! - [`StructuredBundle`]: what goes out to storage. Serialized camelCase for the analytics side.
//!
//! 🦆

use serde::{Deserialize, Serialize};

/// 📥 A bundle exactly as the submitter sent it, minus the JSON-RPC envelope.
///
/// The converter empties `transactions` as it decodes, so the raw and decoded forms
/// never both exist in full. Like moving house one box at a time instead of
/// renting a second house.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawBundle {
    /// 🧾 0x-prefixed hex of each signed transaction, in submission order.
    #[serde(rename = "txs")]
    pub transactions: Vec<String>,
    /// 🔢 Target block, as a numeric string (decimal, or 0x-hex if the client is feeling spicy).
    pub block_number: String,
    /// 🛡️ Hashes the submitter is fine seeing revert. Compared case-insensitively.
    #[serde(default, rename = "revertingTxHashes")]
    pub revert_protected_hashes: Option<Vec<String>>,
}

impl RawBundle {
    /// 🔢 Parses `block_number` the forgiving way: decimal, or `0x`-prefixed hex.
    ///
    /// Returns `None` for anything else. The endpoint turns that `None` into a 400,
    /// so nothing past admission ever sees an unparseable block number.
    pub fn parsed_block_number(&self) -> Option<u64> {
        parse_block_number(&self.block_number)
    }
}

/// 🔢 Decimal or 0x-hex block number. Whitespace is trimmed; signs are not welcome.
pub fn parse_block_number(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if let Some(hex_digits) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        if hex_digits.is_empty() {
            return None;
        }
        return u64::from_str_radix(hex_digits, 16).ok();
    }
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

/// 🎯 One decoded transaction. Born in the decoder, never mutated afterwards.
///
/// Numeric fee/value fields are decimal strings because the downstream consumer
/// reads JSON and JSON numbers stop being honest after 2^53.
/// Optional fee fields are omitted (not `null`) when the tx type doesn't carry them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedTransaction {
    pub nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
    pub gas_limit: String,
    /// 📭 `None` for contract creation. Serialized as `null`, because it genuinely has no recipient.
    pub to: Option<String>,
    /// 🔏 EIP-55 checksummed sender, recovered from the signature.
    pub from: String,
    pub value: String,
    /// 📜 Calldata, lowercase 0x-hex.
    pub data: String,
    /// #️⃣ Transaction hash, lowercase 0x-hex.
    pub hash: String,
    /// 🛡️ True iff `hash` appears in the bundle's reverting hashes.
    pub may_revert: bool,
}

/// 📤 The bundle as it will be written to storage.
///
/// `bundle_id` is `<blockNumber>_<requestId>`: a breadcrumb for humans, not a storage key.
/// The storage key is timestamp-derived (see `uploader`), so two bundles with the same
/// id still land in two different objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredBundle {
    pub bundle_id: String,
    /// ⏱️ Epoch millis, assigned once at admission.
    pub timestamp: u64,
    pub block_number: u64,
    pub transactions: Vec<DecodedTransaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

impl StructuredBundle {
    /// 🗑️ Drops the decoded transactions and hands their memory back.
    ///
    /// `clear()` alone keeps the capacity around, which for a 50k-tx bundle is
    /// not nothing. `shrink_to_fit` finishes the job.
    pub fn release_transactions(&mut self) {
        self.transactions.clear();
        self.transactions.shrink_to_fit();
    }
}

/// 🪪 Builds the human-traceable bundle id: `<blockNumber>_<requestId>`.
pub fn bundle_id_for(block_number: u64, request_id: &str) -> String {
    format!("{block_number}_{request_id}")
}
