use crate::money::Money;
use crate::types::{Transaction, Withdrawal, WithdrawalStatus};
use serde::{Deserialize, Serialize};

/// Aggregates a store reads to derive a user's withdrawable balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceInputs {
    /// Σ net amount of approved/retained transactions.
    pub sales_net: Money,
    /// Σ requested amount of approved/completed withdrawals.
    pub settled_withdrawals: Money,
    /// Σ requested amount of pending withdrawals.
    pub pending_withdrawals: Money,
}

impl BalanceInputs {
    /// Aggregate raw records. Backends that can push the sums into the
    /// database must apply exactly the same status filters.
    pub fn from_records<'a>(
        transactions: impl IntoIterator<Item = &'a Transaction>,
        withdrawals: impl IntoIterator<Item = &'a Withdrawal>,
    ) -> Self {
        let sales_net = transactions
            .into_iter()
            .filter(|tx| tx.status.contributes())
            .map(|tx| tx.fees.net_amount)
            .sum();

        let mut settled_withdrawals = Money::ZERO;
        let mut pending_withdrawals = Money::ZERO;
        for withdrawal in withdrawals {
            match withdrawal.status {
                WithdrawalStatus::Approved | WithdrawalStatus::Completed => {
                    settled_withdrawals = settled_withdrawals + withdrawal.requested_amount;
                }
                WithdrawalStatus::Pending => {
                    pending_withdrawals = pending_withdrawals + withdrawal.requested_amount;
                }
                WithdrawalStatus::Rejected => {}
            }
        }

        Self {
            sales_net,
            settled_withdrawals,
            pending_withdrawals,
        }
    }

    /// `max(0, sales_net - settled - pending)`.
    pub fn available(&self) -> Money {
        (self.sales_net - self.settled_withdrawals - self.pending_withdrawals).floor_zero()
    }
}
