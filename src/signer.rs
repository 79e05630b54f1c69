use std::collections::HashMap;

use bitcoin::{
    script::PushBytesBuf,
    secp256k1::{All, Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
    OutPoint, ScriptBuf, Transaction, Witness,
};

use crate::{
    error::AppError,
    types::{ProcessedUtxo, ScriptType},
};

/// 署名結果。`complete == false` の場合、鍵の無い入力は未署名のまま返る。
#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub complete: bool,
    pub transaction: Transaction,
}

impl SignOutcome {
    /// 署名されていない最初の入力のインデックス。
    pub fn first_unsigned_input(&self) -> Option<usize> {
        self.transaction
            .input
            .iter()
            .position(|txin| txin.script_sig.is_empty() && txin.witness.is_empty())
    }
}

pub trait Signer {
    fn sign(&self, tx: &Transaction) -> Result<SignOutcome, AppError>;
}

// 署名に必要な情報を一時的に保持するための構造体
struct SigningInfo {
    input_index: usize,
    sighash_message: Message,
    out_point: OutPoint,
}

/// WIF秘密鍵で P2PKH / P2WPKH 入力に署名する。
pub struct KeySigner {
    secp: Secp256k1<All>,
    keys: HashMap<OutPoint, ProcessedUtxo>,
}

impl KeySigner {
    pub fn new(secp: Secp256k1<All>, utxos: Vec<ProcessedUtxo>) -> Self {
        let keys = utxos.into_iter().map(|pu| (pu.out_point, pu)).collect();
        KeySigner { secp, keys }
    }
}

impl Signer for KeySigner {
    fn sign(&self, tx: &Transaction) -> Result<SignOutcome, AppError> {
        let mut signed = tx.clone();
        let mut signing_infos: Vec<SigningInfo> = Vec::new();
        let mut complete = true;

        // 1. 署名ハッシュ計算フェーズ (元の下書きを借用する)
        {
            let mut sighash_cache = SighashCache::new(tx);

            for (input_index, txin) in tx.input.iter().enumerate() {
                let Some(p_utxo) = self.keys.get(&txin.previous_output) else {
                    log::debug!("入力 {} ({}) の鍵がありません。未署名のままにします。", input_index, txin.previous_output);
                    signed.input[input_index].script_sig = ScriptBuf::new();
                    signed.input[input_index].witness = Witness::new();
                    complete = false;
                    continue;
                };

                let sighash_type = EcdsaSighashType::All;
                let sighash_message = match p_utxo.script_type {
                    ScriptType::P2PKH => {
                        let sighash = sighash_cache
                            .legacy_signature_hash(
                                input_index,
                                &p_utxo.tx_out.script_pubkey,
                                sighash_type.to_u32(),
                            )
                            .map_err(|e| AppError::LegacySighash { input_index, source: e })?;
                        Message::from(sighash)
                    }
                    ScriptType::P2WPKH => {
                        let sighash = sighash_cache
                            .p2wpkh_signature_hash(
                                input_index,
                                &p_utxo.tx_out.script_pubkey,
                                p_utxo.tx_out.value,
                                sighash_type,
                            )
                            .map_err(|e| AppError::SegwitSighash { input_index, source: e })?;
                        Message::from(sighash)
                    }
                };

                signing_infos.push(SigningInfo {
                    input_index,
                    sighash_message,
                    out_point: txin.previous_output,
                });
            }
        }

        // 2. 署名生成と適用フェーズ
        for info in signing_infos {
            let p_utxo = &self.keys[&info.out_point];
            // low-R で署名長を安定させる (サイズ計測の再現性のため)
            let secp_sig = self.secp.sign_ecdsa_low_r(&info.sighash_message, &p_utxo.private_key.inner);
            let btc_ecdsa_sig = bitcoin::ecdsa::Signature::sighash_all(secp_sig);

            let txin = &mut signed.input[info.input_index];
            match p_utxo.script_type {
                ScriptType::P2PKH => {
                    let push = PushBytesBuf::try_from(btc_ecdsa_sig.to_vec()).map_err(|_| {
                        AppError::Internal(format!("P2PKH署名のPushBytes変換失敗 (input {})", info.input_index))
                    })?;
                    txin.script_sig = bitcoin::script::Builder::new()
                        .push_slice(push)
                        .push_key(&p_utxo.public_key)
                        .into_script();
                    txin.witness = Witness::new();
                }
                ScriptType::P2WPKH => {
                    let mut witness = Witness::new();
                    witness.push(btc_ecdsa_sig.to_vec());
                    witness.push(p_utxo.public_key.to_bytes());
                    txin.script_sig = ScriptBuf::new();
                    txin.witness = witness;
                }
            }
            log::trace!("入力 {} ({:?}) の署名適用完了。", info.input_index, p_utxo.script_type);
        }

        Ok(SignOutcome { complete, transaction: signed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{key_signer, outpoint, p2pkh_coin, p2wpkh_coin};
    use bitcoin::{absolute::LockTime, transaction::Version, Amount, Sequence, TxIn, TxOut};

    fn spending(inputs: &[OutPoint]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|op| TxIn {
                    previous_output: *op,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() }],
        }
    }

    #[test]
    fn signs_p2pkh_and_p2wpkh_inputs() {
        let legacy = p2pkh_coin(1, 50_000);
        let segwit = p2wpkh_coin(2, 70_000);
        let signer = key_signer(vec![legacy.clone(), segwit.clone()]);

        let outcome = signer.sign(&spending(&[legacy.out_point, segwit.out_point])).unwrap();

        assert!(outcome.complete);
        assert_eq!(outcome.first_unsigned_input(), None);
        let tx = &outcome.transaction;
        assert!(!tx.input[0].script_sig.is_empty());
        assert!(tx.input[0].witness.is_empty());
        assert!(tx.input[1].script_sig.is_empty());
        assert_eq!(tx.input[1].witness.len(), 2);
    }

    #[test]
    fn resigning_the_same_draft_is_deterministic() {
        let coin = p2wpkh_coin(3, 90_000);
        let signer = key_signer(vec![coin.clone()]);
        let draft = spending(&[coin.out_point]);

        let first = signer.sign(&draft).unwrap().transaction;
        let second = signer.sign(&first).unwrap().transaction;
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_inputs_leave_the_outcome_incomplete() {
        let coin = p2pkh_coin(4, 10_000);
        let signer = key_signer(vec![coin.clone()]);

        let mut draft = spending(&[outpoint(9, 1), coin.out_point]);
        draft.input[0].script_sig = ScriptBuf::from_bytes(vec![1, 2, 3]);
        let outcome = signer.sign(&draft).unwrap();

        assert!(!outcome.complete);
        assert_eq!(outcome.first_unsigned_input(), Some(0));
        assert!(!outcome.transaction.input[1].script_sig.is_empty());
    }
}
