// Signed-order construction is explicitly out of scope for this system
// (§1 "treated as a black-box SDK operation"); this module is a thin
// wrapper around an EIP-712-style signature, not a reimplementation of the
// exchange's signature scheme. `GuardedExecutor` calls `sign_order`
// immediately before `ExchangeClient::submit_order` and never inspects the
// signature itself.
use crate::model::Side;
use ethers_core::types::H256;
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
    pub v: u8,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrder {
    pub token_id: String,
    pub side: Side,
    pub amount: String,
    pub price: String,
    pub signature: Signature,
    pub salt: H256,
}

/// Signs a CLOB order for submission. The hash fed to the wallet is a
/// simple digest of the order fields — real exchange SDKs use an EIP-712
/// typed-data hash specific to their contract; reproducing that scheme is
/// out of scope here, so this stands in for "whatever the SDK's signer
/// would compute" without claiming to match it byte-for-byte.
pub async fn sign_order(
    private_key: &str,
    token_id: &str,
    side: Side,
    amount: Decimal,
    price: Decimal,
) -> Result<SignedOrder, String> {
    let wallet = LocalWallet::from_str(private_key).map_err(|e| e.to_string())?;

    let salt = H256::random();
    let digest = keccak256(
        format!("{token_id}:{side:?}:{amount}:{price}:{salt:?}").as_bytes(),
    );
    let sig = wallet.sign_hash(H256::from(digest)).map_err(|e| e.to_string())?;

    let mut r_bytes = [0u8; 32];
    let mut s_bytes = [0u8; 32];
    sig.r.to_big_endian(&mut r_bytes);
    sig.s.to_big_endian(&mut s_bytes);

    Ok(SignedOrder {
        token_id: token_id.to_string(),
        side,
        amount: amount.to_string(),
        price: price.to_string(),
        signature: Signature { r: hex::encode(r_bytes), s: hex::encode(s_bytes), v: sig.v as u8 },
        salt,
    })
}

