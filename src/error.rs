use std::path::PathBuf;
use bitcoin::address::ParseError as BitcoinAddressError;
use bitcoin::consensus::encode::Error as BitcoinEncodeError;
use bitcoin::key::FromWifError as BitcoinKeyError; // WIFデコードエラー用
use bitcoin::sighash::P2wpkhError;
use bitcoin::transaction::InputsIndexError;
use bitcoin::{OutPoint, Txid};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSONシリアライズエラー: {0}")]
    JsonWrite(#[from] serde_json::Error),

    #[error("Bitcoinコンセンサスエンコードエラー: {0}")]
    BitcoinConsensus(#[from] BitcoinEncodeError),

    #[error("Bitcoin秘密鍵(WIF)処理エラー: {0}")]
    BitcoinKey(#[from] BitcoinKeyError),

    #[error("Sighash計算エラー (入力インデックス {input_index}): {source}")]
    LegacySighash {
        input_index: usize,
        #[source]
        source: InputsIndexError,
    },

    #[error("Sighash計算エラー (入力インデックス {input_index}): {source}")]
    SegwitSighash {
        input_index: usize,
        #[source]
        source: P2wpkhError,
    },

    #[error("ネットワーク不整合: CLI指定 ({cli_network}) vs WIF/アドレス ({inferred_network})")]
    NetworkMismatch {
        cli_network: String,
        inferred_network: String,
    },

    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("無効なアドレス ({address}): {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: BitcoinAddressError,
    },

    #[error("無効な金額: {0} sats (正の整数である必要があります)")]
    InvalidAmount(u64),

    #[error("負の金額は設定できません: {0} sats")]
    NegativeAmount(i64),

    #[error("署名が完了しませんでした (入力インデックス {input_index})")]
    SigningIncomplete { input_index: usize },

    #[error("資金不足: 目標手数料率 {target} sat/B に対して {shortfall} sats 不足しています (入力合計 {value_in} sats)")]
    InsufficientFunds {
        target: u64,
        value_in: u64,
        shortfall: u64,
    },

    #[error("不明なトランザクション: {0}")]
    UnknownTransaction(Txid),

    #[error("前回出力を解決できません: {0}")]
    UnknownOutput(OutPoint),

    #[error("置換不可能なトランザクション (RBFシグナルなし): {0}")]
    NotReplaceable(Txid),

    #[error("不正な状態遷移: {from} から {to} へは遷移できません")]
    InvalidState { from: &'static str, to: &'static str },

    #[error("不明なスクリプトタイプ: {script_hex}")]
    UnknownScriptType { script_hex: String },

    #[error("内部エラー: {0}")]
    Internal(String),
}
