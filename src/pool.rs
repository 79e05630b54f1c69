//! 使用可能な出力のプール。
//!
//! アウトポイントをキーにした格納領域と、金額順のインデックスを持つ。
//! 「最大の残りを取り出す」操作は単一のロックの下で選択と削除を行うため、
//! 並行して走る二つの下書きが同じ出力を確保することはない。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use bitcoin::{Amount, OutPoint};

use crate::{
    error::AppError,
    types::{checked_total, UnspentOutput},
};

#[derive(Debug, Default)]
struct PoolInner {
    entries: HashMap<OutPoint, UnspentOutput>,
    by_amount: BTreeSet<(Amount, OutPoint)>,
}

impl PoolInner {
    fn insert(&mut self, utxo: UnspentOutput) -> bool {
        if self.entries.contains_key(&utxo.out_point) {
            return false;
        }
        self.by_amount.insert((utxo.amount, utxo.out_point));
        self.entries.insert(utxo.out_point, utxo);
        true
    }
}

#[derive(Debug, Default)]
pub struct UnspentOutputPool {
    inner: Mutex<PoolInner>,
}

impl UnspentOutputPool {
    pub fn new<I>(utxos: I) -> Self
    where
        I: IntoIterator<Item = UnspentOutput>,
    {
        let mut inner = PoolInner::default();
        for utxo in utxos {
            if !inner.insert(utxo.clone()) {
                log::warn!("重複したUTXOを無視します: {}", utxo.out_point);
            }
        }
        UnspentOutputPool { inner: Mutex::new(inner) }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // 保持中にパニックしても中身は常に整合しているので、そのまま使う
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 金額が最大の出力を取り出し、プールから削除する。
    /// 同額の場合はアウトポイントの大きい方を選ぶ (決定的)。
    pub fn take_largest(&self) -> Option<UnspentOutput> {
        let mut inner = self.lock();
        let (_, out_point) = inner.by_amount.pop_last()?;
        inner.entries.remove(&out_point)
    }

    /// 確保済みだが使用されなかった出力をプールに戻す。
    pub fn release<I>(&self, utxos: I)
    where
        I: IntoIterator<Item = UnspentOutput>,
    {
        let mut inner = self.lock();
        for utxo in utxos {
            log::debug!("UTXOをプールに返却: {} ({} sats)", utxo.out_point, utxo.amount.to_sat());
            inner.insert(utxo);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_amount(&self) -> Result<Amount, AppError> {
        checked_total(self.lock().entries.values().map(|u| u.amount))
    }
}
