use std::fs;
use std::path::Path;
use std::str::FromStr;

use bitcoin::{
    network::Network as BitcoinNetwork, secp256k1::{All, Secp256k1}, Address, Amount, OutPoint,
    PrivateKey, ScriptBuf, TxOut, Txid,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::AppError,
    types::{FeeRate, ProcessedUtxo, ScriptType},
};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    pub network: String, // "bitcoin", "testnet", "regtest"
    pub utxos: Vec<UtxoInput>,
    pub change_address: String,
    /// 既知のトランザクション (raw hex)。置換対象の解決に使う。
    #[serde(default)]
    pub transactions: Vec<String>,
    #[serde(default)]
    pub policy: FeePolicy,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UtxoInput {
    pub txid: String,
    pub vout: u32,
    pub script_pubkey_hex: String,
    pub value_sats: u64,
    pub private_key_wif: String,
    #[serde(default = "default_confirmations")]
    pub confirmations: u32,
}

fn default_confirmations() -> u32 {
    1
}

/// 手数料ポリシー。呼び出しごとに明示的に渡す (グローバルな設定は持たない)。
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeePolicy {
    pub fee_rate_sats_per_byte: u64,
    /// 置換時に前回の手数料率に掛ける比率 (> 1)
    pub replacement_ratio: f64,
    pub min_confirmations: u32,
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy {
            fee_rate_sats_per_byte: 11,
            replacement_ratio: 2.0,
            min_confirmations: 1,
        }
    }
}

impl FeePolicy {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.fee_rate_sats_per_byte == 0 {
            return Err(AppError::InputValidation("手数料率は1 sat/B以上である必要があります".to_string()));
        }
        if !(self.replacement_ratio > 1.0) || !self.replacement_ratio.is_finite() {
            return Err(AppError::InputValidation(format!(
                "置換比率は1より大きい必要があります: {}",
                self.replacement_ratio
            )));
        }
        Ok(())
    }

    pub fn base_fee_rate(&self) -> FeeRate {
        FeeRate(self.fee_rate_sats_per_byte)
    }

    /// 前回達成した手数料率から次の置換の目標手数料率を求める。
    pub fn replacement_fee_rate(&self, previous: FeeRate) -> FeeRate {
        previous.scaled(self.replacement_ratio)
    }
}

/// 直近にブロードキャストしたトランザクションと、その達成手数料率。
/// 次の置換はこのトランザクションを二重使用し、`last_fee_rate` を基準に目標を決める。
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementState {
    pub original_txid: Txid,
    pub last_fee_rate: FeeRate,
}

impl ReplacementState {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = fs::read_to_string(path).map_err(|e| {
            log::error!("状態ファイルの読み込みに失敗しました: {:?}", path);
            AppError::Io(e)
        })?;
        serde_json::from_str(&content).map_err(|e| AppError::JsonParse {
            file_path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            log::error!("状態ファイルへの書き込みに失敗しました: {:?}", path);
            AppError::Io(e)
        })
    }
}

impl WalletConfig {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = fs::read_to_string(path).map_err(|e| {
            log::error!("入力ファイルの読み込みに失敗しました: {:?}", path);
            AppError::Io(e)
        })?;
        let config: WalletConfig = serde_json::from_str(&content).map_err(|e| {
            log::error!("入力JSONのパースに失敗しました。");
            AppError::JsonParse {
                file_path: path.to_path_buf(),
                source: e,
            }
        })?;
        config.policy.validate()?;
        Ok(config)
    }

    pub fn change_script(&self, cli_network: BitcoinNetwork) -> Result<ScriptBuf, AppError> {
        let change_address = Address::from_str(&self.change_address)
            .and_then(|addr| addr.require_network(cli_network))
            .map_err(|e| AppError::InvalidAddress {
                address: self.change_address.clone(),
                source: e,
            })?;
        Ok(change_address.script_pubkey())
    }

    /// 入力データの検証とProcessedUtxoへの変換
    pub fn process_utxos(
        &self,
        cli_network: BitcoinNetwork,
        secp: &Secp256k1<All>,
    ) -> Result<Vec<ProcessedUtxo>, AppError> {
        let mut processed_utxos = Vec::with_capacity(self.utxos.len());

        for utxo_input in self.utxos.iter() {
            if utxo_input.value_sats > Amount::MAX_MONEY.to_sat() {
                return Err(AppError::InputValidation(format!(
                    "UTXOの金額が最大供給量を超えています: txid={}, vout={}, valueSats={}",
                    utxo_input.txid, utxo_input.vout, utxo_input.value_sats
                )));
            }
            let private_key = PrivateKey::from_wif(&utxo_input.private_key_wif)
                .map_err(AppError::BitcoinKey)?;
            if private_key.network != cli_network.into() {
                return Err(AppError::NetworkMismatch {
                    cli_network: format!("{:?}", cli_network),
                    inferred_network: format!("{:?}", private_key.network),
                });
            }
            let public_key = private_key.public_key(secp);

            let txid = Txid::from_str(&utxo_input.txid).map_err(|e| {
                AppError::InputValidation(format!("無効なTXID形式 ({}): {}", utxo_input.txid, e))
            })?;
            let out_point = OutPoint::new(txid, utxo_input.vout);

            let script_pubkey_bytes = hex::decode(&utxo_input.script_pubkey_hex).map_err(|e| {
                AppError::InputValidation(format!("scriptPubKeyHexのデコード失敗: {}", e))
            })?;
            let script_pubkey = ScriptBuf::from_bytes(script_pubkey_bytes);
            let script_type = ScriptType::from_script_buf(&script_pubkey)?;

            processed_utxos.push(ProcessedUtxo {
                out_point,
                tx_out: TxOut {
                    value: Amount::from_sat(utxo_input.value_sats),
                    script_pubkey,
                },
                private_key,
                public_key,
                script_type,
                confirmations: utxo_input.confirmations,
            });
            log::debug!(
                "処理済みUTXO追加: txid={}, vout={}, value={}, type={:?}, confirmations={}",
                utxo_input.txid, utxo_input.vout, utxo_input.value_sats, script_type, utxo_input.confirmations
            );
        }

        Ok(processed_utxos)
    }
}
