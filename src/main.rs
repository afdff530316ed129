use cairn_crdt::{CrdtOptions, CrdtStore, Key, MemoryDatastore};
use cairn_merkle::{
    BlockSwarm, BroadcastConfig, PeerId, PubSubBroadcaster, PubSubHub, SwarmConfig,
    SwarmDagSyncer,
};
use std::sync::Arc;
use stress_test::{stress_test_convergence, stress_test_scaling, StressResult};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn main() -> StressResult<()> {
    init_logging();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn async_main() -> StressResult<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CONCURRENT WRITE WALKTHROUGH                    ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    concurrent_write_walkthrough().await?;

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CONVERGENCE STRESS TESTS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: small cluster, frequent publishes
    let stats = stress_test_convergence(4, 100, 5, false).await?;
    stats.print();

    // Test 2: larger deltas
    let stats = stress_test_convergence(4, 200, 50, false).await?;
    stats.print();

    // Test 3: one replica misses the first half of the announcements
    let stats = stress_test_convergence(6, 100, 10, true).await?;
    stats.print();

    // Test 4: scaling analysis
    stress_test_scaling(12, 4).await?;

    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}

/// Two isolated replicas write the same key at the same height, then
/// exchange heads and settle on the same winner.
async fn concurrent_write_walkthrough() -> StressResult<()> {
    let hub = PubSubHub::new();
    let swarm = BlockSwarm::new(SwarmConfig::default());
    let open = |name: &str| {
        let peer = PeerId::new(name);
        CrdtStore::new(
            Arc::new(MemoryDatastore::new()),
            Key::new("/walkthrough"),
            SwarmDagSyncer::join(peer.clone(), swarm.clone()),
            PubSubBroadcaster::join(hub.clone(), "walkthrough", peer, BroadcastConfig::default()),
            CrdtOptions::default(),
        )
    };
    let x = open("x")?;
    let y = open("y")?;
    hub.set_partitioned(&PeerId::new("x"), true);
    hub.set_partitioned(&PeerId::new("y"), true);

    let key = Key::new("/a");
    x.put(&key, b"1".to_vec())?;
    let x_head = x.publish().await?.ok_or("nothing published on x")?;
    y.put(&key, b"2".to_vec())?;
    let y_head = y.publish().await?.ok_or("nothing published on y")?;
    println!("  x wrote a=1 as {}", x_head.short());
    println!("  y wrote a=2 as {}", y_head.short());

    x.resolve(y_head).await?;
    y.resolve(x_head).await?;

    let on_x = String::from_utf8_lossy(&x.get(&key)?).into_owned();
    let on_y = String::from_utf8_lossy(&y.get(&key)?).into_owned();
    println!("  after exchanging heads: x reads a={}, y reads a={}", on_x, on_y);
    println!("\n  DAG on x:\n{}", x.print_dag().await?);

    x.close().await?;
    y.close().await?;
    Ok(())
}
