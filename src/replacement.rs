//! 送信済みトランザクションの置換 (Replace-By-Fee)。
//!
//! 元のトランザクションと同じ入力を使い、おつり出力だけを残すことで支払いを取り消す。
//! おつりは入力合計と同額から始め (マージン0)、より高い目標手数料率で収束ループを再実行する。

use bitcoin::{Amount, Txid};

use crate::{
    builder::{set_change_amount, truncate_to_change_only, Draft},
    coin_selector::{CoinSelector, FundedDraft},
    error::AppError,
    ledger::Ledger,
    pool::UnspentOutputPool,
    signer::Signer,
    types::{signed_sats, FeeRate},
};

pub struct ReplacementEngine<'a, L: Ledger + ?Sized, S: Signer + ?Sized> {
    ledger: &'a L,
    selector: CoinSelector<'a, S>,
}

impl<'a, L: Ledger + ?Sized, S: Signer + ?Sized> ReplacementEngine<'a, L, S> {
    pub fn new(ledger: &'a L, pool: &'a UnspentOutputPool, signer: &'a S) -> Self {
        ReplacementEngine {
            ledger,
            selector: CoinSelector::new(pool, signer),
        }
    }

    /// `original_txid` を二重使用する下書きを `new_fee_rate` で資金調達する。
    pub fn build_replacement(
        &self,
        original_txid: Txid,
        new_fee_rate: FeeRate,
    ) -> Result<FundedDraft, AppError> {
        let original = self.ledger.get_transaction(original_txid)?;

        if !original.input.iter().any(|txin| txin.sequence.is_rbf()) {
            return Err(AppError::NotReplaceable(original_txid));
        }

        // 入力合計 (前回出力の金額) を求める
        let mut value_in = Amount::ZERO;
        for txin in &original.input {
            let prevout = self.ledger.get_output(txin.previous_output)?;
            value_in = value_in.checked_add(prevout.value).ok_or_else(|| {
                AppError::Internal(format!("入力合計がオーバーフローしました: {}", original_txid))
            })?;
        }
        log::info!(
            "置換を開始: 元のtxid={}, 入力数={}, 入力合計={} sats, 目標手数料率={}",
            original_txid, original.input.len(), value_in.to_sat(), new_fee_rate
        );

        // 二重使用! おつり以外の出力を削除する
        let mut draft = Draft::from_transaction(original);
        truncate_to_change_only(&mut draft);
        set_change_amount(&mut draft, signed_sats(value_in)?)?;

        self.selector.fund(draft, value_in, new_fee_rate)
    }
}
