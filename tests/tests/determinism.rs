mod common;
use anyhow::Result;
use common::*;
use orchestra::storage::memory::MemoryUpdateStore;

/// The same publications in the same order give every run the same decisions, conflicts and replica
#[tokio::test]
async fn test_independent_runs_agree() -> Result<()> {
    let mut runs = Vec::new();
    for _ in 0..3 {
        let store = MemoryUpdateStore::new();
        let q = Quartet::new(|name| Ok(memory_peer(&store, name))).await?;
        q.up_to_conflict().await?;
        q.a.publish(insert(2, "a2")).await?;
        q.d.publish(insert(3, "d3")).await?;
        q.b.reconcile().await?;

        let mut outcomes = Vec::new();
        for recno in 1..=4 {
            outcomes.push(q.b.outcome(recno).await);
        }
        runs.push((outcomes, q.b.dump().await?));
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
    Ok(())
}

/// Peers that trust the same sources the same way end up with the same replica
#[tokio::test]
async fn test_peers_with_equal_trust_converge() -> Result<()> {
    let store = MemoryUpdateStore::new();
    let q = Quartet::new(|name| Ok(memory_peer(&store, name))).await?;
    let e = memory_peer(&store, "E");
    e.add_trust_condition("A", "R", 5, None).await?;
    e.add_trust_condition("D", "R", 5, None).await?;

    q.a.publish(insert(1, "x")).await?;
    q.d.publish(insert(2, "y")).await?;
    q.c.publish(insert(3, "c")).await?;
    q.b.reconcile().await?;
    e.reconcile().await?;

    assert_eq!(q.b.dump().await?, vec![r(1, "x"), r(2, "y")]);
    assert_eq!(q.b.dump().await?, e.dump().await?);
    Ok(())
}
