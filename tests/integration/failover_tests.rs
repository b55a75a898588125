//! Failover scenarios: losing the primary must promote a standby

use postgres_e2e::PodRole;

use crate::replication_tests::{provision, setup};

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_primary_deletion_promotes_standby() {
    let ctx = setup("e2e-failover", None).await;
    let oracle = &ctx.oracle;
    provision(oracle, 3, true).await;

    oracle.create_schema().await.into_result().expect("create schema");
    oracle.create_tables(3).await.into_result().expect("create tables");
    assert_eq!(oracle.count_tables_from_primary(3).await.into_result().unwrap(), 3);

    let old_primary = oracle.delete_primary_pod().await.expect("delete primary");
    tracing::info!("Deleted primary {}", old_primary);

    oracle
        .wait_for_pod_running(&old_primary)
        .await
        .into_result()
        .expect("Deleted pod was never recreated");

    oracle
        .check_primary_role()
        .await
        .into_result()
        .expect("No writable primary after failover");

    let new_primary = oracle
        .resolver()
        .primary_pod_name(oracle.reference())
        .await
        .unwrap();
    assert_eq!(
        oracle.resolver().role_of(oracle.reference(), &new_primary).await.unwrap(),
        PodRole::Primary
    );

    // Data written before the failover survives it
    assert_eq!(oracle.count_tables_from_primary(3).await.into_result().unwrap(), 3);

    ctx.cleanup().await;
}
