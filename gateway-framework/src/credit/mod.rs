//! Credit accounting: subgraphs never own a pool, so any credit-consuming
//! operation is first resolved to its billing (parent) graph id.
//!
//! No single source file owns this; the substitution rule mirrors the one
//! already built for allocation (`AllocationManager::find_database_location`)
//! and the subgraph service, and the CAS-without-mutation-on-insufficient-
//! balance contract mirrors the billing models' `current_balance` fields.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Error;
use crate::identity::{self, GraphId};

/// The credit ledger itself is an external collaborator (a database-backed
/// store in production); the control plane only needs an atomic
/// compare-and-swap consume and a balance read.
#[async_trait]
pub trait CreditPool: Send + Sync {
    async fn current_balance(&self, parent_graph_id: &str) -> Result<f64, Error>;

    /// Atomically deduct `amount` if the balance covers it. Returns `true`
    /// when the deduction happened, `false` (with no mutation) otherwise.
    async fn try_consume(&self, parent_graph_id: &str, amount: f64) -> Result<bool, Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub remaining_balance: Option<f64>,
}

/// No-op pool for deployments (or embeddings) that haven't wired a real
/// billing store yet: balance reads as unlimited, every consume succeeds.
pub struct NoopCreditPool;

#[async_trait]
impl CreditPool for NoopCreditPool {
    async fn current_balance(&self, _parent_graph_id: &str) -> Result<f64, Error> {
        Ok(f64::INFINITY)
    }

    async fn try_consume(&self, _parent_graph_id: &str, _amount: f64) -> Result<bool, Error> {
        Ok(true)
    }
}

pub struct CreditRouter {
    pool: Arc<dyn CreditPool>,
}

impl CreditRouter {
    pub fn new(pool: Arc<dyn CreditPool>) -> Self {
        CreditRouter { pool }
    }

    /// Subgraph ids bill to their parent; every other kind bills to itself.
    pub fn billing_graph_id(graph_id: &str) -> String {
        match identity::parse(graph_id) {
            GraphId::Subgraph { parent, .. } => parent,
            _ => graph_id.to_string(),
        }
    }

    pub async fn balance(&self, graph_id: &str) -> Result<f64, Error> {
        let billing_id = Self::billing_graph_id(graph_id);
        self.pool.current_balance(&billing_id).await
    }

    pub async fn consume(&self, graph_id: &str, op_type: &str, cost: f64) -> Result<ConsumeOutcome, Error> {
        let billing_id = Self::billing_graph_id(graph_id);
        let consumed = self.pool.try_consume(&billing_id, cost).await?;

        if consumed {
            let remaining = self.pool.current_balance(&billing_id).await.ok();
            tracing::info!(graph_id, billing_graph_id = %billing_id, op_type, cost, "credit consumed");
            Ok(ConsumeOutcome { success: true, error: None, remaining_balance: remaining })
        } else {
            tracing::warn!(graph_id, billing_graph_id = %billing_id, op_type, cost, "insufficient credit balance");
            Ok(ConsumeOutcome { success: false, error: Some("insufficient".to_string()), remaining_balance: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;

    struct InMemoryCreditPool {
        balances: Mutex<HashMap<String, f64>>,
    }

    impl InMemoryCreditPool {
        fn new(balances: &[(&str, f64)]) -> Self {
            InMemoryCreditPool {
                balances: Mutex::new(balances.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
            }
        }
    }

    #[async_trait]
    impl CreditPool for InMemoryCreditPool {
        async fn current_balance(&self, parent_graph_id: &str) -> Result<f64, Error> {
            Ok(*self.balances.lock().get(parent_graph_id).unwrap_or(&0.0))
        }

        async fn try_consume(&self, parent_graph_id: &str, amount: f64) -> Result<bool, Error> {
            let mut balances = self.balances.lock();
            let balance = balances.entry(parent_graph_id.to_string()).or_insert(0.0);
            if *balance >= amount {
                *balance -= amount;
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }

    #[tokio::test]
    async fn consume_substitutes_parent_for_subgraph_id() {
        let pool = Arc::new(InMemoryCreditPool::new(&[("kg0123456789abcdef", 100.0)]));
        let router = CreditRouter::new(pool);

        let outcome = router.consume("kg0123456789abcdef_analytics", "query", 10.0).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.remaining_balance, Some(90.0));

        assert_eq!(router.balance("kg0123456789abcdef_analytics").await.unwrap(), 90.0);
    }

    #[tokio::test]
    async fn consume_fails_without_mutation_on_insufficient_balance() {
        let pool = Arc::new(InMemoryCreditPool::new(&[("kg0123456789abcdef", 5.0)]));
        let router = CreditRouter::new(pool);

        let outcome = router.consume("kg0123456789abcdef", "ingest", 10.0).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("insufficient"));
        assert_eq!(outcome.remaining_balance, None);

        assert_eq!(router.balance("kg0123456789abcdef").await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn shared_repository_id_bills_to_itself() {
        let pool = Arc::new(InMemoryCreditPool::new(&[("sec", 50.0)]));
        let router = CreditRouter::new(pool);

        assert_eq!(CreditRouter::billing_graph_id("sec"), "sec");
        let outcome = router.consume("sec", "query", 1.0).await.unwrap();
        assert!(outcome.success);
    }
}
