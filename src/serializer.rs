use bitcoin::consensus::encode;
use bitcoin::Transaction;

/// 現在の状態 (scriptSig / witness を含む) でシリアライズした場合のバイト長。
/// 手数料率の判定は必ず署名済みのトランザクションに対して行うこと。
pub fn serialized_length(tx: &Transaction) -> usize {
    encode::serialize(tx).len()
}
