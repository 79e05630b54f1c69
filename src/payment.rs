//! 一つの支払いのライフサイクル。
//!
//! `Unfunded → Funding → Signed → Broadcast → {Confirmed | Replaced}`
//! 置換時は新しい下書きが再び `Funding` から始まり、成功すれば前の世代は `Replaced` になる。

use bitcoin::Txid;

use crate::{
    builder::Draft,
    coin_selector::{CoinSelector, FundedDraft},
    config::{FeePolicy, ReplacementState},
    error::AppError,
    ledger::{Broadcaster, Ledger},
    pool::UnspentOutputPool,
    replacement::ReplacementEngine,
    serializer::serialized_length,
    signer::Signer,
    types::FeeRate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentPhase {
    Unfunded,
    Funding,
    Signed,
    Broadcast,
    Confirmed,
    Replaced,
    Failed,
}

impl PaymentPhase {
    /// `expected` から `to` へ進める。現在の状態が `expected` でなければエラー。
    fn advance(&mut self, expected: PaymentPhase, to: PaymentPhase) -> Result<(), AppError> {
        if *self != expected {
            return Err(AppError::InvalidState { from: self.name(), to: to.name() });
        }
        *self = to;
        Ok(())
    }

    fn name(self) -> &'static str {
        match self {
            PaymentPhase::Unfunded => "Unfunded",
            PaymentPhase::Funding => "Funding",
            PaymentPhase::Signed => "Signed",
            PaymentPhase::Broadcast => "Broadcast",
            PaymentPhase::Confirmed => "Confirmed",
            PaymentPhase::Replaced => "Replaced",
            PaymentPhase::Failed => "Failed",
        }
    }
}

/// 外部の協力者 (台帳・プール・署名者・ブロードキャスト) をまとめたもの。
pub struct Collaborators<'a, L: ?Sized, S: ?Sized, B: ?Sized> {
    pub ledger: &'a L,
    pub pool: &'a UnspentOutputPool,
    pub signer: &'a S,
    pub broadcaster: &'a B,
}

pub struct PaymentSession<'a, L, S, B>
where
    L: Ledger + ?Sized,
    S: Signer + ?Sized,
    B: Broadcaster + ?Sized,
{
    deps: Collaborators<'a, L, S, B>,
    policy: FeePolicy,
    phase: PaymentPhase,
    state: Option<ReplacementState>,
    /// これまでにブロードキャストした世代とその状態 (古い順)
    generations: Vec<(Txid, PaymentPhase)>,
}

impl<'a, L, S, B> PaymentSession<'a, L, S, B>
where
    L: Ledger + ?Sized,
    S: Signer + ?Sized,
    B: Broadcaster + ?Sized,
{
    pub fn new(deps: Collaborators<'a, L, S, B>, policy: FeePolicy) -> Self {
        PaymentSession {
            deps,
            policy,
            phase: PaymentPhase::Unfunded,
            state: None,
            generations: Vec::new(),
        }
    }

    /// 以前にブロードキャストした支払いを引き継ぐ (置換用)。
    pub fn resume(
        deps: Collaborators<'a, L, S, B>,
        policy: FeePolicy,
        state: ReplacementState,
    ) -> Self {
        PaymentSession {
            deps,
            policy,
            phase: PaymentPhase::Broadcast,
            generations: vec![(state.original_txid, PaymentPhase::Broadcast)],
            state: Some(state),
        }
    }

    pub fn phase(&self) -> PaymentPhase {
        self.phase
    }

    pub fn state(&self) -> Option<&ReplacementState> {
        self.state.as_ref()
    }

    fn transition(&mut self, expected: PaymentPhase, to: PaymentPhase) -> Result<(), AppError> {
        self.phase.advance(expected, to)?;
        log::debug!("状態遷移: {} -> {}", expected.name(), to.name());
        Ok(())
    }

    /// 支払いの下書きを基本手数料率で資金調達し、署名してブロードキャストする。
    pub fn pay(&mut self, draft: Draft) -> Result<ReplacementState, AppError> {
        self.transition(PaymentPhase::Unfunded, PaymentPhase::Funding)?;
        let target = self.policy.base_fee_rate();

        let funded = CoinSelector::new(self.deps.pool, self.deps.signer)
            .fund(draft, bitcoin::Amount::ZERO, target)
            .inspect_err(|_| self.phase = PaymentPhase::Failed)?;

        self.sign_and_broadcast(funded, target)
            .inspect_err(|_| self.phase = PaymentPhase::Failed)
    }

    /// 直近の世代を、前回の達成手数料率 × 置換比率 で置き換える。
    /// 失敗した場合、直近の世代はブロードキャスト済みのまま残る。
    pub fn replace(&mut self) -> Result<ReplacementState, AppError> {
        self.transition(PaymentPhase::Broadcast, PaymentPhase::Funding)?;
        let previous = self
            .state
            .clone()
            .ok_or_else(|| AppError::Internal("置換対象の状態がありません".to_string()))?;
        let target = self.policy.replacement_fee_rate(previous.last_fee_rate);
        log::info!(
            "置換手数料率: {} × {} -> {}",
            previous.last_fee_rate, self.policy.replacement_ratio, target
        );

        let engine = ReplacementEngine::new(self.deps.ledger, self.deps.pool, self.deps.signer);
        let result = engine
            .build_replacement(previous.original_txid, target)
            .and_then(|funded| self.sign_and_broadcast(funded, target));

        match result {
            Ok(state) => {
                log::info!("{} は {} に置き換えられました。", previous.original_txid, state.original_txid);
                Ok(state)
            }
            Err(e) => {
                self.phase = PaymentPhase::Broadcast;
                Err(e)
            }
        }
    }

    /// 直近の世代が承認された。
    pub fn mark_confirmed(&mut self) -> Result<(), AppError> {
        self.transition(PaymentPhase::Broadcast, PaymentPhase::Confirmed)?;
        if let Some((txid, phase)) = self.generations.last_mut() {
            phase.advance(PaymentPhase::Broadcast, PaymentPhase::Confirmed)?;
            log::info!("{} が承認されました。", txid);
        }
        Ok(())
    }

    /// 最終署名 → 検証 → ブロードキャスト。ブロードキャストに失敗したら確保した出力を返却する。
    fn sign_and_broadcast(
        &mut self,
        funded: FundedDraft,
        target: FeeRate,
    ) -> Result<ReplacementState, AppError> {
        let pool = self.deps.pool;
        let claimed = funded.claimed.clone();

        let signed = match self.finalize(funded, target) {
            Ok(signed) => signed,
            Err(e) => {
                pool.release(claimed);
                return Err(e);
            }
        };
        self.transition(PaymentPhase::Funding, PaymentPhase::Signed)?;

        let txid = match self.deps.broadcaster.broadcast(signed.draft.transaction()) {
            Ok(txid) => txid,
            Err(e) => {
                log::error!("ブロードキャストに失敗しました: {}", e);
                pool.release(claimed);
                return Err(e);
            }
        };

        if let Some((previous, phase)) = self.generations.last_mut() {
            phase.advance(PaymentPhase::Broadcast, PaymentPhase::Replaced)?;
            log::debug!("世代 {} -> Replaced", previous);
        }
        self.generations.push((txid, PaymentPhase::Broadcast));
        self.transition(PaymentPhase::Signed, PaymentPhase::Broadcast)?;

        let state = ReplacementState {
            original_txid: txid,
            last_fee_rate: signed.fee_rate(),
        };
        log::info!(
            "ブロードキャスト完了: txid={}, 手数料={} sats, サイズ={} B, 達成手数料率={}",
            txid, signed.fee(), signed.size, state.last_fee_rate
        );
        self.state = Some(state.clone());
        Ok(state)
    }

    /// 最終署名。署名が完全で、実際のサイズで目標を満たしていることを再確認する。
    fn finalize(&self, mut funded: FundedDraft, target: FeeRate) -> Result<FundedDraft, AppError> {
        let outcome = self.deps.signer.sign(funded.draft.transaction())?;
        if !outcome.complete {
            return Err(AppError::SigningIncomplete {
                input_index: outcome.first_unsigned_input().unwrap_or_default(),
            });
        }
        funded.draft.adopt_signatures(&outcome.transaction)?;
        funded.size = serialized_length(funded.draft.transaction());

        if funded.fee() < 0 || !funded.meets(target) {
            return Err(AppError::Internal(format!(
                "最終署名後に目標手数料率 {} を満たしていません (手数料 {} sats / {} B)",
                target, funded.fee(), funded.size
            )));
        }
        Ok(funded)
    }

    /// ブロードキャストした各世代の状態 (古い順)。
    pub fn generations(&self) -> &[(Txid, PaymentPhase)] {
        &self.generations
    }

    pub fn generation_phase(&self, txid: Txid) -> Option<PaymentPhase> {
        self.generations
            .iter()
            .find(|(generation, _)| *generation == txid)
            .map(|(_, phase)| *phase)
    }

    pub fn replaced_generations(&self) -> Vec<Txid> {
        self.generations
            .iter()
            .filter(|(_, phase)| *phase == PaymentPhase::Replaced)
            .map(|(txid, _)| *txid)
            .collect()
    }
}
