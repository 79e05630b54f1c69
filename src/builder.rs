//! 下書きトランザクションの構築と変更操作。
//!
//! 出力の順序は固定: インデックス0がおつり出力、インデックス1が支払い出力。
//! 順序はシリアライズ後のサイズには影響しないが、置換時に「先頭の出力だけを残す」
//! ことで支払いを取り消すため、この順序に依存している。

use std::str::FromStr;

use bitcoin::{
    absolute::LockTime, network::Network as BitcoinNetwork, transaction::Version, Address, Amount,
    OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::{error::AppError, types::checked_total};

pub const CHANGE_INDEX: usize = 0;
pub const PAYMENT_INDEX: usize = 1;

/// 置換可能を明示するシーケンス番号 (0xFFFFFFFD)。
pub const REPLACEABLE_SEQUENCE: Sequence = Sequence::ENABLE_RBF_NO_LOCKTIME;

/// 構築中のトランザクション。署名済みのコピーは `Signer` が返す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    tx: Transaction,
}

impl Draft {
    /// 既存のトランザクションから下書きを作る (置換用)。
    pub fn from_transaction(tx: Transaction) -> Self {
        Draft { tx }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn inputs(&self) -> &[TxIn] {
        &self.tx.input
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.tx.output
    }

    pub fn total_output_value(&self) -> Result<Amount, AppError> {
        checked_total(self.tx.output.iter().map(|o| o.value))
    }

    pub fn change_amount(&self) -> Result<Amount, AppError> {
        self.tx
            .output
            .get(CHANGE_INDEX)
            .map(|o| o.value)
            .ok_or_else(|| AppError::Internal("おつり出力が存在しません".to_string()))
    }

    /// 署名済みトランザクションの scriptSig / witness を取り込む。
    /// 入力・出力の構造が一致しない場合はエラー。
    pub fn adopt_signatures(&mut self, signed: &Transaction) -> Result<(), AppError> {
        if signed.input.len() != self.tx.input.len() || signed.output != self.tx.output {
            return Err(AppError::Internal(
                "署名済みトランザクションの構造が下書きと一致しません".to_string(),
            ));
        }
        for (draft_in, signed_in) in self.tx.input.iter_mut().zip(&signed.input) {
            draft_in.script_sig = signed_in.script_sig.clone();
            draft_in.witness = signed_in.witness.clone();
        }
        Ok(())
    }
}

/// おつり出力と支払い出力を持つ、入力ゼロの下書きを作る。
pub fn start_payment(
    recipient_address: &str,
    network: BitcoinNetwork,
    payment_amount: u64,
    change_script: ScriptBuf,
) -> Result<Draft, AppError> {
    let recipient = Address::from_str(recipient_address)
        .and_then(|addr| addr.require_network(network))
        .map_err(|e| AppError::InvalidAddress {
            address: recipient_address.to_string(),
            source: e,
        })?;

    if payment_amount == 0 || payment_amount > Amount::MAX_MONEY.to_sat() {
        return Err(AppError::InvalidAmount(payment_amount));
    }

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: vec![
            TxOut { value: Amount::ZERO, script_pubkey: change_script },
            TxOut {
                value: Amount::from_sat(payment_amount),
                script_pubkey: recipient.script_pubkey(),
            },
        ],
    };
    log::debug!("支払い下書きを作成: 宛先={}, 金額={} sats", recipient, payment_amount);
    Ok(Draft { tx })
}

/// 空の scriptSig で入力を追加する。使用可能性の検証は呼び出し側の責任。
pub fn append_input(draft: &mut Draft, out_point: OutPoint, sequence: Sequence) {
    draft.tx.input.push(TxIn {
        previous_output: out_point,
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::new(),
    });
}

/// おつり出力の金額を上書きする。
pub fn set_change_amount(draft: &mut Draft, amount: i64) -> Result<(), AppError> {
    if amount < 0 {
        return Err(AppError::NegativeAmount(amount));
    }
    let change = draft
        .tx
        .output
        .get_mut(CHANGE_INDEX)
        .ok_or_else(|| AppError::Internal("おつり出力が存在しません".to_string()))?;
    change.value = Amount::from_sat(amount.unsigned_abs());
    Ok(())
}

/// 先頭 (おつり) 以外の出力を全て削除する。支払いの取り消しに使う。
pub fn truncate_to_change_only(draft: &mut Draft) {
    draft.tx.output.truncate(CHANGE_INDEX + 1);
}
