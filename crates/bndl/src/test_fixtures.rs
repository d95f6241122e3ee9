//! 🧪 Test fixtures: real signed transactions, minted on demand.
//!
//! Hardcoding hex blobs in tests is how you end up with a fixture nobody can regenerate.
//! Instead we sign fresh ones with anvil's famous first dev key. It has zero ETH on
//! mainnet and infinite ETH in our hearts.

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes, Signature, TxKind, U256, hex};
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;

use crate::common::RawBundle;

/// 🔑 anvil / hardhat account #0. Public knowledge. Please do not fund it.
const ANVIL_ZERO_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// 🔏 The EIP-55 address of [`ANVIL_ZERO_KEY`].
pub(crate) const ANVIL_ZERO_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

/// 🧾 A signed transaction in both the shapes tests care about.
#[derive(Debug, Clone)]
pub(crate) struct SignedFixture {
    pub raw: String,
    pub hash: String,
}

pub(crate) fn the_signer() -> PrivateKeySigner {
    ANVIL_ZERO_KEY
        .parse()
        .expect("💀 the anvil key is a valid private key, it says so on the tin")
}

fn seal<T>(signer: &PrivateKeySigner, tx: T) -> SignedFixture
where
    T: SignableTransaction<alloy::primitives::Signature>,
    TxEnvelope: From<alloy::consensus::Signed<T>>,
{
    let the_signature = signer
        .sign_hash_sync(&tx.signature_hash())
        .expect("💀 local signing does not fail unless the universe does");
    let the_envelope = TxEnvelope::from(tx.into_signed(the_signature));
    SignedFixture {
        raw: hex::encode_prefixed(the_envelope.encoded_2718()),
        hash: hex::encode_prefixed(the_envelope.tx_hash()),
    }
}

pub(crate) fn signed_eip1559(signer: &PrivateKeySigner, nonce: u64) -> SignedFixture {
    seal(
        signer,
        TxEip1559 {
            chain_id: 1,
            nonce,
            gas_limit: 21_000,
            max_fee_per_gas: 30_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Call(Address::repeat_byte(0x42)),
            value: U256::from(1_000u64),
            input: Bytes::from_static(&[0xde, 0xad]),
            ..Default::default()
        },
    )
}

pub(crate) fn signed_legacy(signer: &PrivateKeySigner, nonce: u64) -> SignedFixture {
    seal(
        signer,
        TxLegacy {
            chain_id: Some(1),
            nonce,
            gas_price: 20_000_000_000,
            gas_limit: 50_000,
            to: TxKind::Call(Address::repeat_byte(0x24)),
            value: U256::from(5u64),
            input: Bytes::new(),
        },
    )
}

pub(crate) fn signed_contract_creation(signer: &PrivateKeySigner, nonce: u64) -> SignedFixture {
    seal(
        signer,
        TxEip1559 {
            chain_id: 1,
            nonce,
            gas_limit: 1_000_000,
            max_fee_per_gas: 30_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Create,
            value: U256::ZERO,
            input: Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]),
            ..Default::default()
        },
    )
}

/// 🔢 A legacy RLP list whose nonce is nine bytes long. Nothing that big fits in a u64.
pub(crate) fn legacy_with_oversized_nonce() -> String {
    let mut the_payload: Vec<u8> = Vec::new();
    // -- nonce: 9-byte string, 0x01..=0x09
    the_payload.push(0x89);
    the_payload.extend(1u8..=9);
    // -- gas price 1, gas limit 21000
    the_payload.push(0x01);
    the_payload.extend([0x82, 0x52, 0x08]);
    // -- to: 20 bytes of 0x42
    the_payload.push(0x94);
    the_payload.extend([0x42; 20]);
    // -- value 1, empty data, v = 27, r = 1, s = 1
    the_payload.extend([0x01, 0x80, 0x1b, 0x01, 0x01]);

    let mut the_tx = vec![0xc0 + the_payload.len() as u8];
    the_tx.extend(the_payload);
    hex::encode_prefixed(the_tx)
}

/// 🙅 A perfectly encoded 1559 envelope carrying a signature no key could have made (r = 0).
pub(crate) fn eip1559_with_unrecoverable_signature(nonce: u64) -> String {
    let the_tx = TxEip1559 {
        chain_id: 1,
        nonce,
        gas_limit: 21_000,
        max_fee_per_gas: 30_000_000_000,
        max_priority_fee_per_gas: 1_000_000_000,
        to: TxKind::Call(Address::repeat_byte(0x42)),
        value: U256::from(1u64),
        input: Bytes::new(),
        ..Default::default()
    };
    let the_signature = Signature::new(U256::ZERO, U256::from(1u64), false);
    let the_envelope = TxEnvelope::from(the_tx.into_signed(the_signature));
    hex::encode_prefixed(the_envelope.encoded_2718())
}

/// 📦 A raw bundle of `count` valid 1559 txs with sequential nonces.
pub(crate) fn raw_bundle_of(count: u64, block_number: &str) -> (RawBundle, Vec<SignedFixture>) {
    let signer = the_signer();
    let fixtures: Vec<SignedFixture> = (0..count).map(|n| signed_eip1559(&signer, n)).collect();
    let raw = RawBundle {
        transactions: fixtures.iter().map(|f| f.raw.clone()).collect(),
        block_number: block_number.to_string(),
        revert_protected_hashes: None,
    };
    (raw, fixtures)
}
