mod common;
use anyhow::Result;
use common::*;
use orchestra::{proto::Decision, storage::UpdateLog, TxnStatus};
use orchestra_storage_sled::SledUpdateStore;

#[tokio::test]
async fn test_scenarios_over_sled() -> Result<()> {
    let store = SledUpdateStore::new_test()?;
    let q = Quartet::new(|name| sled_peer(&store, name)).await?;
    q.up_to_conflict().await?;

    let log = store.log("B")?;
    assert_eq!(log.decisions_through(3).await?, vec![Decision::accept(tid(1, "A"), 1)]);
    assert_eq!(log.current_round().await?, 3);

    let outcome = q.b.outcome(3).await.expect("round 3 ran");
    assert_eq!(outcome.statuses.get(&tid(2, "A")), Some(&TxnStatus::DeferConflict));
    assert_eq!(q.b.dump().await?, vec![r(1, "x")]);
    assert_eq!(q.d.dump().await?, vec![r(1, "w")]);
    Ok(())
}
