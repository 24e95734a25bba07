//! Basic demonstration of the Aegis combat core.
//!
//! Run with: RUST_LOG=aegis_sim=debug cargo run --example basic_demo

use aegis_sim::{
    CombatSim, DamageKind, DamageSpecifier, Projectile, ShieldEffect, ShieldField, ShipWeaponProjectile,
    TempSpeedChangeEffect,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Aegis - Combat Core Demo ===\n");

    let mut sim = CombatSim::new();

    // A station with a full-circle phasing shield
    let station = sim.spawn_grid(0.0, 0.0);
    let shield = ShieldField::new(40.0, 360.0)
        .with_effect(ShieldEffect::TempSpeedChange(TempSpeedChangeEffect::phasing(0.25)));
    let field = sim.spawn_field(station, shield);
    match sim.toggle_field(field) {
        Ok(enabled) => println!("Shield enabled: {enabled}"),
        Err(err) => println!("Shield refused: {err}"),
    }

    // A row of bulkheads between an attacker and the station
    for i in 0..4 {
        sim.spawn_target(-120.0 + i as f32 * 25.0, 0.0, 2.0, 60.0);
    }
    let core = sim.spawn_target(0.0, 0.0, 4.0, 500.0);

    // Penetrating slugs from the left
    for i in 0..6 {
        let slug = Projectile::new(DamageSpecifier::single(DamageKind::Piercing, 45.0))
            .with_penetration_threshold(120.0)
            .with_impact_effect("SlugImpact");
        let entity = sim.spawn_projectile(slug, -200.0, (i as f32 - 2.5) * 1.5, 150.0, 0.0);
        sim.world_mut().entity_mut(entity).insert(ShipWeaponProjectile);
    }

    println!("Running 4 seconds at 60 Hz...\n");
    for second in 0..4 {
        sim.step(1.0);
        let events = sim.drain_events();
        let snapshot = sim.snapshot();
        println!(
            "--- t={:.1}s tick={} --- hits={} impacts={} projectiles={} queued={}",
            sim.current_time(),
            sim.current_tick(),
            events.hits.len(),
            events.impacts.len(),
            snapshot.projectiles.len(),
            snapshot.queues.queued_collisions,
        );
        for p in &snapshot.projectiles {
            println!(
                "    projectile {}: pos=({:.1}, {:.1}) v=({:.1}, {:.1}) pen={:.0} [{}]",
                p.id, p.x, p.y, p.vx, p.vy, p.penetration, p.state
            );
        }
        if second == 1 {
            println!("    (dropping shield power)");
            if let Err(err) = sim.on_power_changed(field, false) {
                println!("    power change failed: {err}");
            }
        }
    }

    let core_damage = sim
        .world()
        .get::<aegis_sim::Damageable>(core)
        .map(|d| d.total())
        .unwrap_or(0.0);
    println!("\nCore damage taken: {core_damage:.0}");

    println!("\n=== Final State (JSON) ===\n");
    match sim.snapshot().to_json_pretty() {
        Ok(json) => println!("{json}"),
        Err(err) => println!("snapshot failed: {err}"),
    }

    sim.teardown();
}
