//! Headless resource-collection run: collector ships pull `collect` tasks,
//! mine a shared field and switch to `return_to_base` until they have unloaded.
//!
//! `AGENTEX_LOG` picks the log level (defaults to the config's).
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use agentex::{
    Agent, Swarm, SwarmConfig, TaskContext, TaskError,
    logging::{self, LogLevel},
};
use anyhow::Result;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use uuid::Uuid;

const COLLECT: &str = "collect";
const RETURN_TO_BASE: &str = "return_to_base";
const FLEET: &str = "fleet";
const SHIP_SPEED: f64 = 40.0;
const TICK: Duration = Duration::from_millis(30);
const ASSIGN_INTERVAL: Duration = Duration::from_millis(100);

const CONFIG: &str = r#"{
    "name": "ResourceCollectionSwarm",
    "log_level": "info",
    "backend": { "type": "local", "queue_capacity": 256 },
    "agents": [
        { "name": "CollectorShip_0", "groups": ["fleet"], "capabilities": ["collect"], "poll_interval_ms": 50 },
        { "name": "CollectorShip_1", "groups": ["fleet"], "capabilities": ["collect"], "poll_interval_ms": 50 },
        { "name": "CollectorShip_2", "groups": ["fleet"], "capabilities": ["collect"], "poll_interval_ms": 50 },
        { "name": "CollectorShip_3", "groups": ["fleet"], "capabilities": ["collect"], "poll_interval_ms": 50 }
    ]
}"#;

type Point = (i64, i64);

/// Units left at each resource point.
type Field = Arc<Mutex<BTreeMap<Point, i64>>>;

#[derive(Debug, Clone)]
struct Ship {
    position: (f64, f64),
    base: Point,
    cargo: i64,
    delivered: i64,
}

type Fleet = Arc<DashMap<String, Ship>>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = SwarmConfig::from_json_str(CONFIG)?;
    let level = std::env::var("AGENTEX_LOG")
        .map(|level| LogLevel::from(level.as_str()))
        .unwrap_or(config.log_level);
    let _log = logging::init(level)?;

    let field: Field = Arc::new(Mutex::new(
        (0..5)
            .map(|i| ((50 + 140 * i, 60 + 90 * (i % 3)), 10 + 2 * i))
            .collect(),
    ));
    let fleet: Fleet = Arc::new(DashMap::new());
    for (i, agent) in config.agents.iter().enumerate() {
        let base = (100 + 250 * i as i64, 700);
        fleet.insert(
            agent.name.clone(),
            Ship {
                position: (base.0 as f64, base.1 as f64),
                base,
                cargo: 0,
                delivered: 0,
            },
        );
    }

    let swarm = Swarm::from_config(&config)?;
    swarm.connect().await?;
    register_tasks(&swarm, &field, &fleet)?;

    let ships = swarm.spawn_agents(&config).await?;
    let mut handles = Vec::new();
    for ship in &ships {
        let worker = Arc::clone(ship);
        handles.push(tokio::spawn(async move { worker.work().await }));
        let listener = Arc::clone(ship);
        handles.push(tokio::spawn(async move { listener.consume_messages().await }));
    }

    assign_tasks(&swarm, &ships, &field, &fleet).await?;

    for ship in &ships {
        ship.shutdown();
    }
    for handle in handles {
        handle.await??;
    }

    let mut total = 0;
    for ship in &ships {
        let delivered = fleet.get(ship.name()).map(|s| s.delivered).unwrap_or(0);
        let stats = ship.stats();
        total += delivered;
        logging::log(
            &format!(
                "{} delivered {} units ({} tasks completed, {} failed)",
                ship.name(),
                delivered,
                stats.completed,
                stats.failed
            ),
            LogLevel::Info,
        );
    }
    logging::log(&format!("Fleet delivered {total} units"), LogLevel::Info);

    swarm.close().await?;
    Ok(())
}

fn register_tasks(swarm: &Swarm, field: &Field, fleet: &Fleet) -> Result<()> {
    let (collect_field, collect_fleet) = (Arc::clone(field), Arc::clone(fleet));
    swarm
        .task_manager()
        .register_task_type(COLLECT, move |ctx: TaskContext| {
            collect(ctx, Arc::clone(&collect_field), Arc::clone(&collect_fleet))
        })?;

    let return_fleet = Arc::clone(fleet);
    swarm
        .task_manager()
        .register_task_type(RETURN_TO_BASE, move |ctx: TaskContext| {
            return_to_base(ctx, Arc::clone(&return_fleet))
        })?;
    Ok(())
}

async fn collect(ctx: TaskContext, field: Field, fleet: Fleet) -> Result<Value, TaskError> {
    let point = serde_json::from_value::<Point>(ctx.payload["point"].clone())
        .map_err(TaskError::failed)?;
    fly_to(&ctx, &fleet, (point.0 as f64, point.1 as f64)).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let wanted = 3 + (ctx.task_id.as_u128() % 3) as i64;
    let taken = {
        let mut field = field.lock().await;
        let remaining = field.get_mut(&point).ok_or_else(|| TaskError::failed("no such point"))?;
        if *remaining <= 0 {
            return Err(TaskError::failed(format!("resource at {point:?} already depleted")));
        }
        let taken = wanted.min(*remaining);
        *remaining -= taken;
        taken
    };

    if let Some(mut ship) = fleet.get_mut(&ctx.agent_name) {
        ship.cargo += taken;
    }
    logging::log(
        &format!("{} collected {} units at {:?}", ctx.agent_name, taken, point),
        LogLevel::Info,
    );
    Ok(json!({ "point": point, "collected": taken }))
}

async fn return_to_base(ctx: TaskContext, fleet: Fleet) -> Result<Value, TaskError> {
    let base = fleet
        .get(&ctx.agent_name)
        .map(|ship| ship.base)
        .ok_or_else(|| TaskError::failed("unknown ship"))?;
    fly_to(&ctx, &fleet, (base.0 as f64, base.1 as f64)).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let unloaded = match fleet.get_mut(&ctx.agent_name) {
        Some(mut ship) => {
            let cargo = std::mem::take(&mut ship.cargo);
            ship.delivered += cargo;
            cargo
        }
        None => 0,
    };
    logging::log(
        &format!("{} unloaded {} units at base", ctx.agent_name, unloaded),
        LogLevel::Info,
    );
    Ok(json!({ "unloaded": unloaded }))
}

/// Move the executing ship toward `target` one tick at a time.
async fn fly_to(ctx: &TaskContext, fleet: &Fleet, target: (f64, f64)) -> Result<(), TaskError> {
    loop {
        ctx.checkpoint()?;
        let arrived = {
            let mut ship = fleet
                .get_mut(&ctx.agent_name)
                .ok_or_else(|| TaskError::failed("unknown ship"))?;
            let (dx, dy) = (target.0 - ship.position.0, target.1 - ship.position.1);
            let distance = dx.hypot(dy);
            if distance <= SHIP_SPEED {
                ship.position = target;
                true
            } else {
                ship.position.0 += SHIP_SPEED * dx / distance;
                ship.position.1 += SHIP_SPEED * dy / distance;
                false
            }
        };
        if arrived {
            return Ok(());
        }
        tokio::time::sleep(TICK).await;
    }
}

/// Scan the fleet at a fixed interval and queue work for idle ships until the
/// field is empty and every ship has unloaded.
async fn assign_tasks(swarm: &Swarm, ships: &[Arc<Agent>], field: &Field, fleet: &Fleet) -> Result<()> {
    let mut depleted = Vec::new();
    loop {
        let (available, newly_depleted) = {
            let field = field.lock().await;
            let (available, empty): (Vec<_>, Vec<_>) =
                field.iter().partition(|(_, remaining)| **remaining > 0);
            let newly_depleted = empty
                .into_iter()
                .map(|(point, _)| *point)
                .filter(|point| !depleted.contains(point))
                .collect::<Vec<_>>();
            (
                available.into_iter().map(|(point, _)| *point).collect::<Vec<_>>(),
                newly_depleted,
            )
        };
        for point in newly_depleted {
            depleted.push(point);
            swarm
                .send_to_group(FLEET, format!("Resource at {point:?} depleted"))
                .await?;
        }

        let mut idle_collectors = 0;
        let mut waiting_returns = 0;
        let mut busy = 0;
        for ship in ships {
            if ship.is_busy().await {
                busy += 1;
                continue;
            }
            let cargo = fleet.get(ship.name()).map(|s| s.cargo).unwrap_or(0);
            let capabilities = ship.capabilities().await;
            if capabilities.contains(COLLECT) && cargo > 0 {
                ship.remove_capability(COLLECT).await?;
                ship.add_capability(RETURN_TO_BASE).await?;
                waiting_returns += 1;
            } else if capabilities.contains(RETURN_TO_BASE) && cargo == 0 {
                ship.remove_capability(RETURN_TO_BASE).await?;
                ship.add_capability(COLLECT).await?;
                idle_collectors += 1;
            } else if capabilities.contains(RETURN_TO_BASE) {
                waiting_returns += 1;
            } else {
                idle_collectors += 1;
            }
        }

        let manager = swarm.task_manager();
        while manager.pending(RETURN_TO_BASE) < waiting_returns {
            swarm.assign_task(RETURN_TO_BASE, Value::Null)?;
        }
        if !available.is_empty() {
            while manager.pending(COLLECT) < idle_collectors {
                let point = available[(Uuid::new_v4().as_u128() % available.len() as u128) as usize];
                swarm.assign_task(COLLECT, json!({ "point": point }))?;
            }
        }

        let carrying = fleet.iter().any(|ship| ship.cargo > 0);
        if available.is_empty()
            && !carrying
            && busy == 0
            && manager.pending(COLLECT) == 0
            && manager.pending(RETURN_TO_BASE) == 0
        {
            swarm.send_to_group(FLEET, "Field exhausted, all ships stand down").await?;
            return Ok(());
        }
        tokio::time::sleep(ASSIGN_INTERVAL).await;
    }
}
