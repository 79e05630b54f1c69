use std::fs;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::secp256k1::All as AllContext; // エイリアス
use clap::Parser;

use rbf_fee_bumper::{
    builder,
    cli::{parse_network, CliArgs, Command},
    config::{ReplacementState, WalletConfig},
    error::AppError,
    ledger::{FileBroadcaster, Ledger, SnapshotLedger},
    payment::{Collaborators, PaymentSession},
    pool::UnspentOutputPool,
    signer::KeySigner,
};

fn main() -> Result<(), AppError> {
    env_logger::init();

    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。引数: {:?}", args);

    let cli_network = parse_network(&args.network)?;
    log::info!("指定されたネットワーク: {:?}", cli_network);

    let config = WalletConfig::load(&args.input_file)?;
    log::debug!("入力設定ファイルのパース成功: {:?}", config);

    let config_network = parse_network(&config.network)?;
    if config_network != cli_network {
        return Err(AppError::NetworkMismatch {
            cli_network: format!("{:?}", cli_network),
            inferred_network: format!("{:?}", config_network),
        });
    }

    let secp: Secp256k1<AllContext> = Secp256k1::new();
    let utxos = config.process_utxos(cli_network, &secp)?;

    let mut ledger = SnapshotLedger::new(&utxos);
    for raw_tx in &config.transactions {
        let txid = ledger.insert_raw_transaction(raw_tx)?;
        log::debug!("既知のトランザクションを登録: {}", txid);
    }

    if let Command::Bump { original_tx_file: Some(path), .. } = &args.command {
        let raw_tx = fs::read_to_string(path).map_err(|e| {
            log::error!("置換対象ファイルの読み込みに失敗しました: {:?}", path);
            AppError::Io(e)
        })?;
        let txid = ledger.insert_raw_transaction(&raw_tx)?;
        log::info!("置換対象のトランザクションを登録: {}", txid);
    }

    let pool = UnspentOutputPool::new(ledger.get_unspent_outputs(config.policy.min_confirmations)?);
    log::info!("使用可能なUTXO: {} 個, 合計 {} sats", pool.len(), pool.total_amount()?.to_sat());

    let signer = KeySigner::new(secp, utxos);
    let broadcaster = FileBroadcaster::new(args.output_file.clone());
    let deps = Collaborators {
        ledger: &ledger,
        pool: &pool,
        signer: &signer,
        broadcaster: &broadcaster,
    };

    match &args.command {
        Command::Send { to, amount, state_file } => {
            let change_script = config.change_script(cli_network)?;
            let draft = builder::start_payment(to, cli_network, *amount, change_script)?;

            let mut session = PaymentSession::new(deps, config.policy.clone());
            let state = session.pay(draft)?;
            log::info!("支払いの状態: {:?}", session.phase());
            state.save(state_file)?;
            log::info!("置換用の状態を {:?} に保存しました。", state_file);
        }
        Command::Bump { state_file, .. } => {
            let previous = ReplacementState::load(state_file)?;
            let mut session = PaymentSession::resume(deps, config.policy.clone(), previous);
            let state = session.replace()?;
            state.save(state_file)?;
            log::info!(
                "置換済みの世代: {:?}, 状態を {:?} に保存しました。",
                session.replaced_generations(), state_file
            );
        }
    }

    log::info!("処理が正常に完了しました。");
    Ok(())
}
