use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use replica_interest::config::{InterestConfig, SimConfig};
use replica_interest::interest::{
    AttributeData, HandlerKind, InterestCommandSender, InterestHandlerSlot, InterestManager, PeerId, ReplicaId,
    RuleFilter, RuleNetworkId,
};
use replica_interest::metrics::{self, InterestMetrics};
use replica_interest::replication::ReplicationPlanner;
use replica_interest::throttle::{EpsilonThrottle, ThrottleKey, ThrottleMap, POSITION_EPSILON};
use replica_interest::util::vec3::Vec3;

/// Field id for replica positions in the throttle map
const FIELD_POSITION: u16 = 0;

/// Number of team tags handed out to peers and replicas
const TEAM_COUNT: u32 = 4;

struct SimReplica {
    id: ReplicaId,
    position: Vec3,
    velocity: Vec3,
}

struct SimPeer {
    id: PeerId,
    camera: Vec3,
    view_rule: RuleNetworkId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Replica interest simulator v{}", env!("CARGO_PKG_VERSION"));

    let interest_config = InterestConfig::load_or_default();
    interest_config.validate().map_err(anyhow::Error::msg)?;
    let sim = SimConfig::load_or_default();
    sim.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: {} peers, {} replicas, {} Hz, cell size {}",
        sim.peers, sim.replicas, sim.tick_rate, interest_config.grid_cell_size
    );

    let metrics = Arc::new(InterestMetrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = sim.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let mut manager = InterestManager::new(interest_config).with_metrics(metrics.clone());
    let spatial = manager.register_handler(HandlerKind::Proximity)?;
    let teams = manager.register_handler(HandlerKind::Bitmask)?;

    let mut rng = StdRng::from_entropy();
    let (mut peers, mut replicas) = populate(&mut manager, &sim, spatial, teams, &mut rng)?;

    let spectator = tokio::spawn(spectator_churn(manager.command_sender(), teams, sim.peers));

    let planner = ReplicationPlanner::with_metrics(metrics.clone());
    let mut throttles = ThrottleMap::new(EpsilonThrottle::new(Vec3::ZERO, POSITION_EPSILON));

    let dt = 1.0 / sim.tick_rate as f32;
    let stats_every = u64::from(sim.tick_rate) * 5;
    let mut ticker = tokio::time::interval(Duration::from_secs_f32(dt));
    let mut tick: u64 = 0;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                info!("Shutting down...");
                break;
            }
        }
        tick += 1;

        step_world(&mut manager, &mut peers, &mut replicas, spatial, &sim, dt, &mut rng);

        manager.run_matching_pass();
        let result = manager.current_result();
        let delta = manager.delta();
        let changes = replicas
            .iter()
            .map(|r| (ThrottleKey::new(r.id, FIELD_POSITION), r.position));
        let plan = planner.plan(result, &delta, &throttles, changes);

        if tick % stats_every == 0 {
            let stats = plan.stats();
            let report = manager.last_report();
            info!(
                "Tick {}: {} pairs, +{} -{} interest, {} sent, {} suppressed, {} faults, pass {:?}",
                tick,
                report.matched_pairs,
                delta.joined.len(),
                delta.left.len(),
                stats.values_sent,
                stats.values_suppressed,
                report.faults.len(),
                report.duration
            );
        }

        // The transport would write the plan here
        planner.commit(plan, &mut throttles);
    }

    spectator.abort();
    info!("Simulator stopped after {} ticks", tick);
    Ok(())
}

fn populate(
    manager: &mut InterestManager,
    sim: &SimConfig,
    spatial: InterestHandlerSlot,
    teams: InterestHandlerSlot,
    rng: &mut StdRng,
) -> anyhow::Result<(Vec<SimPeer>, Vec<SimReplica>)> {
    let mut peers = Vec::with_capacity(sim.peers as usize);
    for p in 0..sim.peers {
        let id = PeerId(p);
        let camera = random_point(rng, sim.world_radius);
        let view_rule = manager.register_rule(id, spatial, RuleFilter::sphere(camera, sim.view_radius))?;
        manager.register_rule(id, teams, RuleFilter::Bitmask(1 << (p % TEAM_COUNT)))?;
        peers.push(SimPeer { id, camera, view_rule });
    }

    let mut replicas = Vec::with_capacity(sim.replicas as usize);
    for r in 0..sim.replicas {
        let id = ReplicaId(r);
        let position = random_point(rng, sim.world_radius);
        let velocity = Vec3::new(rng.gen_range(-20.0..20.0), rng.gen_range(-20.0..20.0), 0.0);
        manager.register_attribute(id, spatial, AttributeData::Position(position))?;
        // Every tenth replica is team-visible regardless of distance
        if r % 10 == 0 {
            let team = rng.gen_range(0..TEAM_COUNT);
            manager.register_attribute(id, teams, AttributeData::Bitmask(1 << team))?;
        }
        replicas.push(SimReplica { id, position, velocity });
    }

    info!("Populated {} peers and {} replicas", peers.len(), replicas.len());
    Ok((peers, replicas))
}

fn step_world(
    manager: &mut InterestManager,
    peers: &mut [SimPeer],
    replicas: &mut [SimReplica],
    spatial: InterestHandlerSlot,
    sim: &SimConfig,
    dt: f32,
    rng: &mut StdRng,
) {
    let bound = sim.world_radius;
    for replica in replicas.iter_mut() {
        replica.position += replica.velocity * dt;
        if replica.position.x.abs() > bound {
            replica.velocity.x = -replica.velocity.x;
        }
        if replica.position.y.abs() > bound {
            replica.velocity.y = -replica.velocity.y;
        }
        replica.position = replica.position.clamp(Vec3::splat(-bound), Vec3::splat(bound));
        if let Err(e) = manager.register_attribute(replica.id, spatial, AttributeData::Position(replica.position)) {
            warn!("Failed to move {}: {}", replica.id, e);
        }
    }

    // Cameras wander slowly
    for peer in peers.iter_mut() {
        let drift = Vec3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), 0.0) * (30.0 * dt);
        peer.camera = (peer.camera + drift).clamp(Vec3::splat(-bound), Vec3::splat(bound));
        if let Err(e) = manager.update_rule(peer.view_rule, RuleFilter::sphere(peer.camera, sim.view_radius)) {
            warn!("Failed to move camera of {}: {}", peer.id, e);
        }
    }
}

/// A spectator peer joins and leaves from another task, going through the
/// command queue instead of the manager.
async fn spectator_churn(sender: InterestCommandSender, teams: InterestHandlerSlot, peer_count: u32) {
    let spectator = PeerId(peer_count);
    let mut rng = StdRng::from_entropy();
    let mut interval = tokio::time::interval(Duration::from_secs(3));
    let mut current: Option<RuleNetworkId> = None;

    loop {
        interval.tick().await;
        match current.take() {
            Some(rule) => {
                if let Err(e) = sender.unregister_rule(rule) {
                    warn!("Spectator leave failed: {}", e);
                }
            }
            None => {
                let team = rng.gen_range(0..TEAM_COUNT);
                match sender.register_rule(spectator, teams, RuleFilter::Bitmask(1 << team)) {
                    Ok(rule) => current = Some(rule),
                    Err(e) => warn!("Spectator join failed: {}", e),
                }
            }
        }
    }
}

fn random_point(rng: &mut StdRng, radius: f32) -> Vec3 {
    Vec3::new(rng.gen_range(-radius..radius), rng.gen_range(-radius..radius), 0.0)
}
