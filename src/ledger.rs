use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use bitcoin::consensus::encode;
use bitcoin::{Amount, OutPoint, Transaction, TxOut, Txid};

use crate::{
    error::AppError,
    types::{checked_total, ProcessedUtxo, UnspentOutput},
};

/// ノード (台帳) へのインターフェース。
pub trait Ledger {
    fn get_unspent_outputs(&self, min_confirmations: u32) -> Result<Vec<UnspentOutput>, AppError>;
    fn get_transaction(&self, txid: Txid) -> Result<Transaction, AppError>;
    fn get_output(&self, out_point: OutPoint) -> Result<TxOut, AppError>;
}

pub trait Broadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, AppError>;
}

/// ウォレットファイルから構築するオフラインの台帳。
/// 既知のトランザクションが使用したコインは未使用として報告しない。
#[derive(Debug, Default)]
pub struct SnapshotLedger {
    coins: Vec<UnspentOutput>,
    outputs: HashMap<OutPoint, TxOut>,
    transactions: HashMap<Txid, Transaction>,
}

impl SnapshotLedger {
    pub fn new(utxos: &[ProcessedUtxo]) -> Self {
        let mut ledger = SnapshotLedger::default();
        for pu in utxos {
            ledger.coins.push(pu.unspent());
            ledger.outputs.insert(pu.out_point, pu.tx_out.clone());
        }
        ledger
    }

    /// 既知のトランザクションを登録し、その出力も解決可能にする。
    pub fn insert_transaction(&mut self, tx: Transaction) -> Txid {
        let txid = tx.compute_txid();
        for (vout, txout) in tx.output.iter().enumerate() {
            self.outputs.insert(OutPoint::new(txid, vout as u32), txout.clone());
        }
        self.transactions.insert(txid, tx);
        txid
    }

    pub fn insert_raw_transaction(&mut self, raw_hex: &str) -> Result<Txid, AppError> {
        let bytes = hex::decode(raw_hex.trim()).map_err(|e| {
            AppError::InputValidation(format!("raw transaction hexのデコード失敗: {}", e))
        })?;
        let tx: Transaction = encode::deserialize(&bytes)?;
        let total = checked_total(tx.output.iter().map(|o| o.value))?;
        if total > Amount::MAX_MONEY {
            return Err(AppError::InputValidation(format!(
                "出力合計が最大供給量を超えています: {} ({} sats)",
                tx.compute_txid(), total.to_sat()
            )));
        }
        Ok(self.insert_transaction(tx))
    }

    fn spent_out_points(&self) -> HashSet<OutPoint> {
        self.transactions
            .values()
            .flat_map(|tx| tx.input.iter().map(|txin| txin.previous_output))
            .collect()
    }
}

impl Ledger for SnapshotLedger {
    fn get_unspent_outputs(&self, min_confirmations: u32) -> Result<Vec<UnspentOutput>, AppError> {
        let spent = self.spent_out_points();
        Ok(self
            .coins
            .iter()
            .filter(|u| u.confirmations >= min_confirmations && !spent.contains(&u.out_point))
            .cloned()
            .collect())
    }

    fn get_transaction(&self, txid: Txid) -> Result<Transaction, AppError> {
        self.transactions
            .get(&txid)
            .cloned()
            .ok_or(AppError::UnknownTransaction(txid))
    }

    fn get_output(&self, out_point: OutPoint) -> Result<TxOut, AppError> {
        self.outputs
            .get(&out_point)
            .cloned()
            .ok_or(AppError::UnknownOutput(out_point))
    }
}

/// 署名済みトランザクションの raw hex をファイルと標準出力に書き出す。
pub struct FileBroadcaster {
    output_file: PathBuf,
}

impl FileBroadcaster {
    pub fn new(output_file: PathBuf) -> Self {
        FileBroadcaster { output_file }
    }
}

impl Broadcaster for FileBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, AppError> {
        let serialized_tx = encode::serialize_hex(tx);
        log::info!("Raw transaction hex: {}", serialized_tx);

        println!("{}", serialized_tx);

        let mut output_file = File::create(&self.output_file).map_err(|e| {
            log::error!("出力ファイルの作成に失敗しました: {:?}", self.output_file);
            AppError::Io(e)
        })?;
        output_file.write_all(serialized_tx.as_bytes()).map_err(|e| {
            log::error!("出力ファイルへの書き込みに失敗しました。");
            AppError::Io(e)
        })?;
        log::info!("Raw transactionを {:?} に保存しました。", self.output_file);

        Ok(tx.compute_txid())
    }
}
