use clap::{Parser, Subcommand};
use std::path::PathBuf;
use bitcoin::Network as BitcoinNetwork;
use crate::error::AppError;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// UTXOと鍵を記述したウォレットJSONファイルへのパス
    #[clap(short, long, value_parser)]
    pub input_file: PathBuf,

    /// 生成されたraw transaction hexを保存するファイルへのパス
    #[clap(short, long, value_parser)]
    pub output_file: PathBuf,

    /// 使用するネットワーク ("bitcoin", "testnet", "regtest")
    #[clap(short, long, value_parser, default_value = "testnet")]
    pub network: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 置換可能な支払いトランザクションを作成してブロードキャストする
    Send {
        /// 受取人アドレス
        #[clap(long)]
        to: String,

        /// 送金額 (sats)
        #[clap(long)]
        amount: u64,

        /// 置換用の状態を保存するファイル
        #[clap(long, value_parser, default_value = "rbf-state.json")]
        state_file: PathBuf,
    },
    /// 前回の支払いを、より高い手数料率のおつりのみのトランザクションで置き換える
    Bump {
        /// `send` または前回の `bump` が保存した状態ファイル
        #[clap(long, value_parser, default_value = "rbf-state.json")]
        state_file: PathBuf,

        /// 置換対象のraw transaction hexファイル (ウォレットファイルに含まれていない場合)
        #[clap(long, value_parser)]
        original_tx_file: Option<PathBuf>,
    },
}

pub fn parse_network(network_str: &str) -> Result<BitcoinNetwork, AppError> {
    match network_str.to_lowercase().as_str() {
        "bitcoin" | "mainnet" => Ok(BitcoinNetwork::Bitcoin),
        "testnet" => Ok(BitcoinNetwork::Testnet),
        "regtest" => Ok(BitcoinNetwork::Regtest),
        s => Err(AppError::InputValidation(format!("無効なネットワークが指定されました: {}", s))),
    }
}
