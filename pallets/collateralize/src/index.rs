//! Secondary-Index Maintenance
//!
//! The four listing indexes (vault-by-status, vault-by-owner,
//! record-by-status, record-by-borrower) are derived purely from the
//! receipts the action handlers emit — never by re-reading the vault. Each
//! receipt carries the `(pre_status, pre_index)` → `(status, index)` pair
//! for exactly this purpose: the old entry is deleted and the new one
//! written in the same transaction, so folding a block's receipts always
//! reproduces the index state, even against a replayed snapshot.
//!
//! Index values are pointers into the primary vault store, never copies of
//! the data they list.

use crate::pallet::{
    Config, LoanStatus, Pallet, RecordPointer, RecordReceipt, RecordsByBorrower, RecordsByStatus,
    VaultPointer, VaultReceipt, VaultsByOwner, VaultsByStatus,
};

impl<T: Config> Pallet<T> {
    /// Create and retrieve re-key the vault in both vault indexes.
    pub(crate) fn reindex_vault(receipt: &VaultReceipt<T>) {
        VaultsByStatus::<T>::remove(receipt.pre_status, receipt.pre_index);
        VaultsByOwner::<T>::remove(&receipt.creator, receipt.pre_index);
        VaultsByStatus::<T>::insert(receipt.status, receipt.index, receipt.vault_id);
        VaultsByOwner::<T>::insert(
            &receipt.creator,
            receipt.index,
            VaultPointer { vault_id: receipt.vault_id, status: receipt.status },
        );
    }

    /// A borrow is a loan's first appearance: insert into both record
    /// indexes, nothing to delete.
    pub(crate) fn index_new_record(receipt: &RecordReceipt<T>) {
        let pointer = RecordPointer { vault_id: receipt.vault_id, record_id: receipt.record_id };
        RecordsByStatus::<T>::insert(receipt.status, receipt.index, pointer.clone());
        RecordsByBorrower::<T>::insert(&receipt.borrower, receipt.index, pointer);
    }

    /// Repay and feed transitions move the loan's status-index entry.
    pub(crate) fn reindex_record(receipt: &RecordReceipt<T>) {
        RecordsByStatus::<T>::remove(receipt.pre_status, receipt.pre_index);
        RecordsByStatus::<T>::insert(
            receipt.status,
            receipt.index,
            RecordPointer { vault_id: receipt.vault_id, record_id: receipt.record_id },
        );
    }

    /// Appends rewrite the status index only when the loan stayed in
    /// warning; a warning-clearing append leaves the old entry in place
    /// until the next indexed transition.
    pub(crate) fn reindex_record_on_append(receipt: &RecordReceipt<T>) {
        if receipt.status == LoanStatus::Warning {
            Self::reindex_record(receipt);
        }
    }
}
