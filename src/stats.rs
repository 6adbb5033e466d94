//! Summary counts for the admin dashboard
//!
//! `total_products` comes from the ledger counter; role counts are a tally
//! of the gate's mirror as it stands now.

use serde::Serialize;
use std::time::Duration;

use crate::error::RegistryError;
use crate::gate::AuthorizationGate;
use crate::ledger::{bounded, Ledger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_products: u64,
    pub admin_count: u64,
    pub manager_count: u64,
    pub user_count: u64,
}

pub async fn collect(
    ledger: &dyn Ledger,
    gate: &AuthorizationGate,
    ledger_timeout: Duration,
) -> Result<RegistryStats, RegistryError> {
    let total_products = bounded(
        ledger_timeout,
        "totalProductCount",
        None,
        ledger.total_product_count(),
    )
    .await?;
    let roles = gate.role_counts();

    Ok(RegistryStats {
        total_products,
        admin_count: roles.admins,
        manager_count: roles.managers,
        user_count: roles.users,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::model::{Address, Role};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_counts_mirror_and_ledger() {
        let owner: Address = "0xowner".parse().unwrap();
        let ledger = Arc::new(MemoryLedger::new(owner.clone()));
        let gate = AuthorizationGate::new(ledger.clone(), Duration::from_secs(5));
        gate.bootstrap().await.unwrap();

        for (i, role) in [Role::Manager, Role::Manager, Role::User, Role::User, Role::User]
            .into_iter()
            .enumerate()
        {
            let target: Address = format!("0x{}", i).parse().unwrap();
            gate.assign_role(&owner, &target, role).await.unwrap();
        }

        let stats = collect(ledger.as_ref(), &gate, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            stats,
            RegistryStats {
                total_products: 0,
                admin_count: 1,
                manager_count: 2,
                user_count: 3,
            }
        );
    }
}
