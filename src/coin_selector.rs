//! 手数料率の収束ループ。
//!
//! 署名 → 計測 → (不足なら) 最大のUTXOを追加、を目標手数料率に達するまで繰り返す。
//! scriptSig の長さは署名するまで分からないため、構造を変更するたびに必ず署名し直し、
//! 署名済みのシリアライズ長で判定する。
//!
//! 追加した入力の金額は、まず全額を手数料マージンとして扱い、再署名後の実サイズで
//! 目標を上回った分 (余剰) だけをおつりに預ける。全額をおつりに入れるとマージンが
//! 増えず、元本を満たした後にループが終わらなくなる。

use bitcoin::Amount;

use crate::{
    builder::{append_input, set_change_amount, Draft, REPLACEABLE_SEQUENCE},
    error::AppError,
    pool::UnspentOutputPool,
    serializer::serialized_length,
    signer::Signer,
    types::{signed_sats, FeeRate, UnspentOutput},
};

// Bitcoin Coreのデフォルトダスト閾値 (P2PKH/P2WPKH出力に対して)
pub const DUST_THRESHOLD_SATS: i64 = 546;

/// 目標手数料率を満たした署名済みの下書き。
#[derive(Debug, Clone)]
pub struct FundedDraft {
    pub draft: Draft,
    pub value_in: Amount,
    pub size: usize,
    /// このループがプールから確保した出力。ブロードキャストに失敗したら返却すること。
    pub claimed: Vec<UnspentOutput>,
    fee: i64,
}

impl FundedDraft {
    pub fn fee(&self) -> i64 {
        self.fee
    }

    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::achieved(self.fee, self.size)
    }

    pub fn meets(&self, target: FeeRate) -> bool {
        self.fee >= target.fee_for(self.size)
    }
}

/// 入力合計から出力合計を引いた手数料。
fn fee_of(draft: &Draft, value_in: Amount) -> Result<i64, AppError> {
    Ok(signed_sats(value_in)? - signed_sats(draft.total_output_value()?)?)
}

enum Funding {
    Sign,
    Measure,
    Select { deficit: i64 },
}

pub struct CoinSelector<'a, S: Signer + ?Sized> {
    pool: &'a UnspentOutputPool,
    signer: &'a S,
}

impl<'a, S: Signer + ?Sized> CoinSelector<'a, S> {
    pub fn new(pool: &'a UnspentOutputPool, signer: &'a S) -> Self {
        CoinSelector { pool, signer }
    }

    /// `draft` を `target` 以上の手数料率になるまで資金調達する。
    /// `value_in` は既存の入力の合計金額。失敗時は確保した出力をプールに返却する。
    pub fn fund(
        &self,
        mut draft: Draft,
        value_in: Amount,
        target: FeeRate,
    ) -> Result<FundedDraft, AppError> {
        let mut claimed = Vec::new();
        match self.converge(&mut draft, value_in, target, &mut claimed) {
            Ok((value_in, size, fee)) => Ok(FundedDraft { draft, value_in, size, claimed, fee }),
            Err(e) => {
                if !claimed.is_empty() {
                    log::warn!("資金調達に失敗したため {} 個のUTXOをプールに返却します。", claimed.len());
                    self.pool.release(claimed);
                }
                Err(e)
            }
        }
    }

    fn converge(
        &self,
        draft: &mut Draft,
        mut value_in: Amount,
        target: FeeRate,
        claimed: &mut Vec<UnspentOutput>,
    ) -> Result<(Amount, usize, i64), AppError> {
        // このループでおつりに預けた額。サイズが後から増えた場合はここから手数料に戻す
        let mut deposited: i64 = 0;
        // 入力を追加した直後で、余剰をまだ配分していない
        let mut unsettled = false;
        let mut iteration = 0usize;
        let mut state = Funding::Sign;

        loop {
            state = match state {
                Funding::Sign => {
                    let outcome = self.signer.sign(draft.transaction())?;
                    if !outcome.complete {
                        let input_index = outcome.first_unsigned_input().unwrap_or_default();
                        log::error!("入力 {} の署名を完了できませんでした。", input_index);
                        return Err(AppError::SigningIncomplete { input_index });
                    }
                    draft.adopt_signatures(&outcome.transaction)?;
                    Funding::Measure
                }
                Funding::Measure => {
                    iteration += 1;
                    let size = serialized_length(draft.transaction());
                    let fee = fee_of(draft, value_in)?;
                    let surplus = fee - target.fee_for(size);
                    log::debug!(
                        "反復 {}: 入力数={}, サイズ={} B, 手数料={} sats, 目標={}, 余剰={} sats",
                        iteration, draft.inputs().len(), size, fee, target, surplus
                    );

                    if surplus < 0 {
                        let deficit = -surplus;
                        unsettled = false;
                        if deposited >= deficit {
                            let change = signed_sats(draft.change_amount()?)?;
                            if change - deficit < DUST_THRESHOLD_SATS {
                                log::warn!(
                                    "おつり {} sats はダスト閾値 {} sats 未満になるため全額を手数料に含めます。",
                                    change - deficit, DUST_THRESHOLD_SATS
                                );
                                set_change_amount(draft, 0)?;
                            } else {
                                // 再署名でサイズが増えた分をおつりから戻す
                                set_change_amount(draft, change - deficit)?;
                                log::debug!("おつりから {} sats を手数料に戻します。", deficit);
                            }
                            deposited = (deposited - deficit).min(signed_sats(draft.change_amount()?)?);
                            Funding::Sign
                        } else {
                            Funding::Select { deficit }
                        }
                    } else if unsettled && surplus > 0 {
                        unsettled = false;
                        let change = signed_sats(draft.change_amount()?)?;
                        if change + surplus < DUST_THRESHOLD_SATS {
                            log::warn!(
                                "おつり {} sats はダスト閾値 {} sats 未満のため手数料に含めます。",
                                change + surplus, DUST_THRESHOLD_SATS
                            );
                            return Ok((value_in, size, fee));
                        }
                        set_change_amount(draft, change + surplus)?;
                        deposited += surplus;
                        log::debug!("余剰 {} sats をおつりに預けます。", surplus);
                        Funding::Sign
                    } else {
                        log::info!(
                            "目標手数料率 {} を達成しました: 手数料 {} sats / {} B (入力 {} 個)",
                            target, fee, size, draft.inputs().len()
                        );
                        return Ok((value_in, size, fee));
                    }
                }
                Funding::Select { deficit } => {
                    let Some(utxo) = self.pool.take_largest() else {
                        log::error!("UTXOが尽きました。不足額: {} sats", deficit);
                        return Err(AppError::InsufficientFunds {
                            target: target.sat_per_byte(),
                            value_in: value_in.to_sat(),
                            shortfall: deficit.unsigned_abs(),
                        });
                    };
                    log::debug!(
                        "新しい入力を追加: {} ({} sats), 不足額 {} sats",
                        utxo.out_point, utxo.amount.to_sat(), deficit
                    );
                    append_input(draft, utxo.out_point, REPLACEABLE_SEQUENCE);
                    let added = value_in.checked_add(utxo.amount);
                    claimed.push(utxo);
                    value_in = added.ok_or_else(|| {
                        AppError::Internal("入力合計がオーバーフローしました".to_string())
                    })?;
                    unsettled = true;
                    Funding::Sign
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{start_payment, CHANGE_INDEX, PAYMENT_INDEX};
    use crate::signer::SignOutcome;
    use crate::testing::{change_script, outpoint, utxo, FixedSizeSigner, RECIPIENT};
    use bitcoin::{network::Network as BitcoinNetwork, OutPoint, ScriptBuf, Transaction};
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn payment(amount: u64) -> Draft {
        start_payment(RECIPIENT, BitcoinNetwork::Testnet, amount, change_script()).unwrap()
    }

    #[test]
    fn largest_output_alone_funds_the_payment() {
        let pool = UnspentOutputPool::new(vec![utxo(1, 500_000), utxo(2, 2_000_000)]);
        let signer = FixedSizeSigner::new();

        let funded = CoinSelector::new(&pool, &signer)
            .fund(payment(1_200_000), Amount::ZERO, FeeRate(11))
            .unwrap();

        // 1入力 (148 B) + 2出力 (31 B ずつ) = 220 B
        assert_eq!(funded.size, 220);
        assert_eq!(funded.draft.inputs().len(), 1);
        assert_eq!(funded.draft.inputs()[0].previous_output, utxo(2, 0).out_point);
        assert_eq!(funded.fee(), 2_420);
        assert_eq!(funded.draft.outputs()[PAYMENT_INDEX].value, Amount::from_sat(1_200_000));
        assert_eq!(funded.draft.outputs()[CHANGE_INDEX].value, Amount::from_sat(797_580));
        assert_eq!(funded.fee_rate(), FeeRate(11));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn adds_inputs_until_principal_and_fee_are_covered() {
        let pool = UnspentOutputPool::new(vec![utxo(1, 600_000), utxo(2, 500_000), utxo(3, 10_000)]);
        let signer = FixedSizeSigner::new();

        let funded = CoinSelector::new(&pool, &signer)
            .fund(payment(1_000_000), Amount::ZERO, FeeRate(10))
            .unwrap();

        assert_eq!(funded.draft.inputs().len(), 2);
        assert_eq!(funded.size, 368);
        assert_eq!(funded.fee(), 3_680);
        assert_eq!(funded.value_in, Amount::from_sat(1_100_000));
        assert_eq!(funded.claimed.len(), 2);
        assert!(funded.draft.inputs().iter().all(|txin| txin.sequence.is_rbf()));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn exact_funding_terminates_after_one_selection() {
        // 220 B × 10 sat/B = 2,200 sats
        let pool = UnspentOutputPool::new(vec![utxo(1, 12_200)]);
        let signer = FixedSizeSigner::new();

        let funded = CoinSelector::new(&pool, &signer)
            .fund(payment(10_000), Amount::ZERO, FeeRate(10))
            .unwrap();

        assert_eq!(funded.draft.inputs().len(), 1);
        assert_eq!(funded.fee(), 2_200);
        assert_eq!(funded.draft.change_amount().unwrap(), Amount::ZERO);
        // 空の下書きへの署名と、入力追加直後の署名の2回だけ
        assert_eq!(signer.calls(), 2);
    }

    #[test]
    fn empty_pool_is_insufficient() {
        let pool = UnspentOutputPool::default();
        let signer = FixedSizeSigner::new();

        let res = CoinSelector::new(&pool, &signer).fund(payment(1), Amount::ZERO, FeeRate(1));
        assert!(matches!(res, Err(AppError::InsufficientFunds { target: 1, value_in: 0, .. })));
    }

    #[test]
    fn claimed_outputs_are_released_when_funds_run_out() {
        let pool = UnspentOutputPool::new(vec![utxo(1, 1_000), utxo(2, 500)]);
        let signer = FixedSizeSigner::new();

        let res =
            CoinSelector::new(&pool, &signer).fund(payment(1_000_000), Amount::ZERO, FeeRate(5));

        assert!(matches!(res, Err(AppError::InsufficientFunds { value_in: 1_500, .. })));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn dust_surplus_is_left_as_fee() {
        let pool = UnspentOutputPool::new(vec![utxo(1, 12_500)]);
        let signer = FixedSizeSigner::new();

        let funded = CoinSelector::new(&pool, &signer)
            .fund(payment(10_000), Amount::ZERO, FeeRate(10))
            .unwrap();

        assert_eq!(funded.draft.change_amount().unwrap(), Amount::ZERO);
        assert_eq!(funded.fee(), 2_500);
        assert_eq!(funded.fee_rate(), FeeRate(12));
    }

    #[test]
    fn unsignable_existing_input_is_fatal_and_claims_nothing() {
        let pool = UnspentOutputPool::new(vec![utxo(1, 1_000_000)]);
        let signer = FixedSizeSigner::new().refusing(outpoint(42, 0));

        let mut draft = payment(10_000);
        append_input(&mut draft, outpoint(42, 0), REPLACEABLE_SEQUENCE);

        let res = CoinSelector::new(&pool, &signer).fund(draft, Amount::from_sat(50_000), FeeRate(1));
        assert!(matches!(res, Err(AppError::SigningIncomplete { input_index: 0 })));
        assert_eq!(pool.len(), 1);
    }

    /// 同じ入力を2回目以降に署名すると scriptSig が1バイト長くなる署名者。
    struct GrowingSigner {
        seen: RefCell<HashMap<OutPoint, usize>>,
    }

    impl Signer for GrowingSigner {
        fn sign(&self, tx: &Transaction) -> Result<SignOutcome, AppError> {
            let mut signed = tx.clone();
            let mut seen = self.seen.borrow_mut();
            for txin in signed.input.iter_mut() {
                let count = seen.entry(txin.previous_output).or_insert(0);
                let len = if *count == 0 { 106 } else { 107 };
                *count += 1;
                txin.script_sig = ScriptBuf::from_bytes(vec![0x01; len]);
            }
            Ok(SignOutcome { complete: true, transaction: signed })
        }
    }

    #[test]
    fn signature_growth_after_deposit_is_taken_back_from_change() {
        let pool = UnspentOutputPool::new(vec![utxo(1, 2_000_000)]);
        let signer = GrowingSigner { seen: RefCell::new(HashMap::new()) };

        let funded = CoinSelector::new(&pool, &signer)
            .fund(payment(1_200_000), Amount::ZERO, FeeRate(11))
            .unwrap();

        assert_eq!(funded.size, 220);
        assert_eq!(funded.fee(), 2_420);
        assert_eq!(funded.draft.inputs().len(), 1);
        assert!(funded.meets(FeeRate(11)));
    }

    #[test]
    fn withdrawal_that_would_leave_dust_folds_change_into_fee() {
        // 106 B 署名で 550 sats を預けた後、107 B に伸びて 11 sats を戻すとおつりが 539 sats になる
        let pool = UnspentOutputPool::new(vec![utxo(1, 12_959)]);
        let signer = GrowingSigner { seen: RefCell::new(HashMap::new()) };

        let funded = CoinSelector::new(&pool, &signer)
            .fund(payment(10_000), Amount::ZERO, FeeRate(11))
            .unwrap();

        assert_eq!(funded.draft.change_amount().unwrap(), Amount::ZERO);
        assert_eq!(funded.size, 220);
        assert_eq!(funded.fee(), 2_959);
        assert!(funded.meets(FeeRate(11)));
    }

    #[test]
    fn out_of_range_input_value_is_an_error_not_a_negative_fee() {
        let pool = UnspentOutputPool::new(vec![utxo(1, u64::MAX)]);
        let signer = FixedSizeSigner::new();

        let res = CoinSelector::new(&pool, &signer).fund(payment(10_000), Amount::ZERO, FeeRate(1));

        assert!(matches!(res, Err(AppError::Internal(_))));
        assert_eq!(pool.len(), 1);
    }

    proptest! {
        #[test]
        fn funded_drafts_meet_their_target(
            amounts in prop::collection::vec(1_000u64..5_000_000, 0..12),
            pay in 1u64..10_000_000,
            rate in 1u64..200,
        ) {
            let pool = UnspentOutputPool::new(amounts.iter().enumerate().map(|(i, a)| utxo(i as u8 + 1, *a)));
            let signer = FixedSizeSigner::new();

            match CoinSelector::new(&pool, &signer).fund(payment(pay), Amount::ZERO, FeeRate(rate)) {
                Ok(funded) => {
                    prop_assert!(funded.fee() >= 0);
                    prop_assert!(funded.meets(FeeRate(rate)));
                    prop_assert!(funded.draft.inputs().iter().all(|txin| txin.sequence.is_rbf()));
                    prop_assert_eq!(funded.size, serialized_length(funded.draft.transaction()));
                    prop_assert_eq!(pool.len() + funded.claimed.len(), amounts.len());
                }
                Err(AppError::InsufficientFunds { .. }) => {
                    prop_assert_eq!(pool.len(), amounts.len());
                }
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }
        }
    }
}
