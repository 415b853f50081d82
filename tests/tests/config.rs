mod common;
use std::sync::Arc;

use anyhow::Result;
use orchestra::{
    storage::memory::{MemoryStateStore, MemoryUpdateStore},
    Peer,
};

#[tokio::test]
async fn test_priority_ceiling_from_config_file() -> Result<()> {
    let path = std::env::temp_dir().join(format!("orchestra-config-{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "max_priority": 10, "verify_replay": false }"#)?;
    let config = orchestra::load_config(&path).map_err(|e| anyhow::anyhow!(e))?;
    std::fs::remove_file(&path)?;
    assert_eq!(config.max_priority, 10);
    assert!(!config.verify_replay);

    let store = MemoryUpdateStore::new();
    let peer = Peer::new(Arc::new(store.log("B")), Arc::new(MemoryStateStore::new()), ["R".into()], config);
    peer.add_trust_condition("A", "R", 10, None).await?;
    assert!(peer.add_trust_condition("A", "R", 11, None).await.is_err());
    assert!(peer.add_trust_condition("A", "S", 3, None).await.is_err());
    Ok(())
}

#[test]
fn test_missing_config_file() { assert!(orchestra::load_config("/nonexistent/orchestra.json").is_err()); }
