// Headless sight demo: scatters wall blocks, walks a vision source through
// them and drags a token under a sweeping pointer, logging per-frame cost.
//
// Usage: sightline [config.toml]

use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{Quat, Vec2, Vec3};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use sightline::engine::camera::RtsCamera;
use sightline::engine::drag::DragCollisionResolver;
use sightline::engine::mesh::{cuboid, MeshNode, MeshPart, PartTags};
use sightline::engine::visibility::PolygonConfig;
use sightline::engine::{BlockingTags, SceneContext, SightError, Transform, VisionConfig};

const FRAMES: u32 = 240;
const WALL_COUNT: usize = 60;
const VIEWPORT: (f32, f32) = (1280.0, 720.0);

// ============================================================================
// SCENE SETUP
// ============================================================================

fn load_config() -> Result<VisionConfig, SightError> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| SightError::Config(format!("{}: {}", path, e)))?;
            log::info!("loaded config from {}", path);
            VisionConfig::from_toml_str(&text)
        }
        None => Ok(VisionConfig::default()),
    }
}

fn spawn_walls(scene: &mut SceneContext, count: usize) {
    let mut rng = StdRng::seed_from_u64(7);
    let slab = Arc::new(MeshNode::single(cuboid(
        Vec3::new(-2.0, 0.0, -0.25),
        Vec3::new(2.0, 3.0, 0.25),
    )));

    for _ in 0..count {
        let position = Vec3::new(rng.gen_range(-40.0..40.0), 0.0, rng.gen_range(-40.0..40.0));
        let rotation = Quat::from_rotation_y(rng.gen_range(0.0..std::f32::consts::PI));
        scene.spawn_blocker(
            slab.clone(),
            Transform { position, rotation, scale: Vec3::ONE },
            BlockingTags::WALL,
        );
    }

    log::info!("spawned {} walls", count);
}

fn spawn_door(scene: &mut SceneContext) -> bevy_ecs::entity::Entity {
    let frame_left = cuboid(Vec3::new(-2.0, 0.0, -0.2), Vec3::new(-0.75, 3.0, 0.2));
    let frame_right = cuboid(Vec3::new(0.75, 0.0, -0.2), Vec3::new(2.0, 3.0, 0.2));
    let leaf = cuboid(Vec3::new(-0.75, 0.0, -0.1), Vec3::new(0.75, 2.5, 0.1));
    let node = MeshNode::from_parts(vec![
        MeshPart::new("frame_left", frame_left).with_tags(PartTags::solid()),
        MeshPart::new("frame_right", frame_right).with_tags(PartTags::solid()),
        MeshPart::new("leaf", leaf).with_tags(PartTags::door(0)),
    ]);
    scene.spawn_blocker(
        Arc::new(node),
        Transform::from_position(Vec3::new(0.0, 0.0, 6.0)),
        BlockingTags::WALL,
    )
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> Result<(), SightError> {
    env_logger::init();

    let config = load_config()?;
    let mut scene = SceneContext::new(config)?;
    spawn_walls(&mut scene, WALL_COUNT);
    let door = spawn_door(&mut scene);

    let token = scene.spawn_blocker(
        Arc::new(MeshNode::single(cuboid(Vec3::splat(-0.3), Vec3::splat(0.3)))),
        Transform::from_position(Vec3::new(0.0, 0.3, 0.0)),
        BlockingTags::NONE,
    );
    let mut drag = DragCollisionResolver::new(Vec3::new(0.0, 0.3, 0.0));
    let camera = RtsCamera::new();

    let mut slowest = Duration::ZERO;
    let mut total = Duration::ZERO;
    let mut tentative_frames = 0;

    for frame in 0..FRAMES {
        let t = frame as f32 / FRAMES as f32;
        let now = Instant::now();

        if frame % 60 == 30 {
            scene.set_door_open(door, 0, frame % 120 == 30);
        }

        let walker = Vec2::new((t * std::f32::consts::TAU).cos() * 15.0, (t * std::f32::consts::TAU).sin() * 15.0);
        let omni = PolygonConfig::omni(walker, 20.0, 1.5);
        let cone = PolygonConfig::cone(Vec2::new(0.0, -10.0), 25.0, 1.5, t * 360.0, 60.0);

        let started = Instant::now();
        let poly = scene.visibility_polygon(1, &omni, now);
        let lamp = scene.visibility_polygon(2, &cone, now);
        let elapsed = started.elapsed();

        if poly.tentative > 0 || lamp.tentative > 0 {
            tentative_frames += 1;
        }
        slowest = slowest.max(elapsed);
        total += elapsed;

        let px = VIEWPORT.0 * (0.25 + 0.5 * t);
        if let Some(ray) = camera.screen_ray(px, VIEWPORT.1 * 0.5, VIEWPORT.0, VIEWPORT.1) {
            let placed = drag.resolve(&mut scene, ray.origin, ray.dir, Some(token));
            scene.set_transform(token, Transform::from_position(placed + Vec3::Y * 0.3));
        }

        if frame % 60 == 0 {
            log::info!(
                "frame {}: {} + {} polygon points in {:.2} ms, token at {:?}",
                frame,
                poly.points.len(),
                lamp.points.len(),
                elapsed.as_secs_f32() * 1000.0,
                drag.last_point()
            );
        }
        if let Some(worker) = scene.vision_mut().worker_mut() {
            worker.poll();
        }
    }

    log::info!(
        "{} frames: avg {:.3} ms, worst {:.3} ms, {} frames with tentative points, {} BVH builds",
        FRAMES,
        total.as_secs_f32() * 1000.0 / FRAMES as f32,
        slowest.as_secs_f32() * 1000.0,
        tentative_frames,
        scene.raycaster().rebuilds()
    );
    if let Some(worker) = scene.vision().worker() {
        log::info!("sight worker merged {} triangles", worker.merged_triangles());
    }

    Ok(())
}
