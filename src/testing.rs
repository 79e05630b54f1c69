//! テスト用の固定データと署名者。

use std::cell::Cell;
use std::collections::HashSet;

use bitcoin::{
    hashes::Hash,
    secp256k1::{Secp256k1, SecretKey},
    Amount, CompressedPublicKey, Network, OutPoint, PrivateKey, ScriptBuf, Transaction, TxOut,
    Txid, WPubkeyHash, Witness,
};

use crate::{
    error::AppError,
    signer::{KeySigner, SignOutcome, Signer},
    types::{ProcessedUtxo, ScriptType, UnspentOutput},
};

/// BIP173 のテストネット P2WPKH アドレス
pub const RECIPIENT: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

/// P2PKH の scriptSig と同じ長さ (1 + 72 + 1 + 33)
pub const FIXED_SCRIPT_SIG_LEN: usize = 107;

pub fn change_script() -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([0x22; 20]))
}

pub fn outpoint(tag: u8, vout: u32) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([tag; 32]), vout)
}

pub fn utxo(tag: u8, amount: u64) -> UnspentOutput {
    UnspentOutput {
        out_point: outpoint(tag, 0),
        amount: Amount::from_sat(amount),
        confirmations: 6,
    }
}

/// 全ての入力に固定長の scriptSig を付ける署名者。`refusing` で指定した入力は署名しない。
#[derive(Default)]
pub struct FixedSizeSigner {
    refused: HashSet<OutPoint>,
    calls: Cell<usize>,
}

impl FixedSizeSigner {
    pub fn new() -> Self {
        FixedSizeSigner::default()
    }

    pub fn refusing(mut self, out_point: OutPoint) -> Self {
        self.refused.insert(out_point);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Signer for FixedSizeSigner {
    fn sign(&self, tx: &Transaction) -> Result<SignOutcome, AppError> {
        self.calls.set(self.calls.get() + 1);
        let mut signed = tx.clone();
        let mut complete = true;
        for txin in signed.input.iter_mut() {
            txin.witness = Witness::new();
            if self.refused.contains(&txin.previous_output) {
                txin.script_sig = ScriptBuf::new();
                complete = false;
            } else {
                txin.script_sig = ScriptBuf::from_bytes(vec![0x01; FIXED_SCRIPT_SIG_LEN]);
            }
        }
        Ok(SignOutcome { complete, transaction: signed })
    }
}

fn private_key(tag: u8) -> PrivateKey {
    let secret = SecretKey::from_slice(&[tag.max(1); 32]).expect("valid secret key");
    PrivateKey::new(secret, Network::Testnet)
}

pub fn p2wpkh_coin(tag: u8, amount: u64) -> ProcessedUtxo {
    let secp = Secp256k1::new();
    let private_key = private_key(tag);
    let public_key = private_key.public_key(&secp);
    let compressed = CompressedPublicKey::from_private_key(&secp, &private_key).expect("compressed");
    ProcessedUtxo {
        out_point: outpoint(tag, 0),
        tx_out: TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()),
        },
        private_key,
        public_key,
        script_type: ScriptType::P2WPKH,
        confirmations: 6,
    }
}

pub fn p2pkh_coin(tag: u8, amount: u64) -> ProcessedUtxo {
    let secp = Secp256k1::new();
    let private_key = private_key(tag);
    let public_key = private_key.public_key(&secp);
    ProcessedUtxo {
        out_point: outpoint(tag, 0),
        tx_out: TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
        },
        private_key,
        public_key,
        script_type: ScriptType::P2PKH,
        confirmations: 6,
    }
}

pub fn key_signer(coins: Vec<ProcessedUtxo>) -> KeySigner {
    KeySigner::new(Secp256k1::new(), coins)
}
