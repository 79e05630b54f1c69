use std::fmt;

use bitcoin::{script::ScriptBuf, Amount, OutPoint, PrivateKey, PublicKey, TxOut};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScriptType {
    P2PKH,
    P2WPKH,
    // 他のタイプも追加可能
}

impl ScriptType {
    pub fn from_script_buf(script: &ScriptBuf) -> Result<Self, AppError> {
        if script.is_p2pkh() {
            Ok(ScriptType::P2PKH)
        } else if script.is_p2wpkh() {
            Ok(ScriptType::P2WPKH)
        } else {
            Err(AppError::UnknownScriptType { script_hex: script.to_hex_string() })
        }
    }
}

/// ウォレットが所有する使用可能な出力。プールから選択された時点で一度だけ消費される。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub out_point: OutPoint,
    pub amount: Amount,
    pub confirmations: u32,
}

/// 検証済みのUTXOと、その署名に必要な鍵情報。
#[derive(Debug, Clone)]
pub struct ProcessedUtxo {
    pub out_point: OutPoint,
    pub tx_out: TxOut, // 元の value と script_pubkey を含む
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
    pub script_type: ScriptType,
    pub confirmations: u32,
}

impl ProcessedUtxo {
    pub fn unspent(&self) -> UnspentOutput {
        UnspentOutput {
            out_point: self.out_point,
            amount: self.tx_out.value,
            confirmations: self.confirmations,
        }
    }
}

/// 手数料率 (sats / シリアライズ後のバイト数)。
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeeRate(pub u64);

impl FeeRate {
    pub fn sat_per_byte(self) -> u64 {
        self.0
    }

    /// `size` バイトのトランザクションがこの手数料率を満たすのに必要な手数料。
    pub fn fee_for(self, size: usize) -> i64 {
        i64::try_from(self.0)
            .unwrap_or(i64::MAX)
            .saturating_mul(i64::try_from(size).unwrap_or(i64::MAX))
    }

    /// 実際に達成された手数料率 (切り上げ)。負の手数料は0として扱う。
    pub fn achieved(fee: i64, size: usize) -> FeeRate {
        if fee <= 0 || size == 0 {
            return FeeRate(0);
        }
        FeeRate((fee as u64).div_ceil(size as u64))
    }

    /// 置換用の目標手数料率 `ceil(self × ratio)`。
    pub fn scaled(self, ratio: f64) -> FeeRate {
        // 10 × 1.1 = 11.000000000000002 のような浮動小数点誤差で1段上に丸めない
        let product = self.0 as f64 * ratio;
        FeeRate((product - SCALE_EPSILON).ceil().max(0.0) as u64)
    }
}

const SCALE_EPSILON: f64 = 1e-9;

/// 金額の合計。`u64` を超える場合はエラー。
pub fn checked_total<I>(amounts: I) -> Result<Amount, AppError>
where
    I: IntoIterator<Item = Amount>,
{
    amounts
        .into_iter()
        .try_fold(Amount::ZERO, |total, amount| total.checked_add(amount))
        .ok_or_else(|| AppError::Internal("金額の合計がオーバーフローしました".to_string()))
}

/// 手数料計算用に符号付きのsatsへ変換する。
pub fn signed_sats(amount: Amount) -> Result<i64, AppError> {
    i64::try_from(amount.to_sat())
        .map_err(|_| AppError::Internal(format!("金額が範囲外です: {} sats", amount.to_sat())))
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/B", self.0)
    }
}
