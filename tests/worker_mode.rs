// Visibility served by the background worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec2, Vec3};

use sightline::engine::mesh::{cuboid, MeshNode, MeshPart};
use sightline::engine::visibility::PolygonConfig;
use sightline::engine::worker::{HostMessage, RaycastWorker, WorkerMessage, WorkerState};
use sightline::engine::{BlockingTags, SceneContext, Transform, VisionConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

fn worker_config() -> VisionConfig {
    VisionConfig { resolution: 32, use_worker: true, merge_debounce_ms: 10, ..Default::default() }
}

#[test]
fn remove_then_add_restores_merged_buffer() {
    let config = VisionConfig::default();
    let mut state = WorkerState::new(&config);
    let t0 = Instant::now();
    let node = MeshNode::single(cuboid(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0)));
    let add = |id: u64, transform: Mat4| HostMessage::Add {
        id,
        mesh: node.to_bytes().unwrap(),
        transform,
        sight: true,
        has_tags: false,
        open_doors: vec![],
    };

    state.handle(add(1, Mat4::from_translation(Vec3::X * 5.0)), t0);
    state.handle(add(2, Mat4::IDENTITY), t0);
    let debounce = config.merge_debounce();
    state.poll(t0 + debounce);
    let reference = state.merged().vertex_bytes().to_vec();

    let t1 = t0 + debounce * 2;
    state.handle(HostMessage::Remove { id: 1 }, t1);
    state.handle(add(1, Mat4::from_translation(Vec3::X * 5.0)), t1);
    assert!(state.poll(t1 + debounce / 2).is_empty());
    let replies = state.poll(t1 + debounce);
    assert!(replies.contains(&WorkerMessage::MergedGeometry { triangles: 24 }));
    assert_eq!(state.merged().vertex_bytes(), reference.as_slice());
}

#[test]
fn worker_replies_are_matched_by_request_id() {
    let mut worker = RaycastWorker::spawn(&worker_config()).unwrap();
    worker
        .add(7, &MeshNode::single(cuboid(Vec3::new(3.0, -1.0, -9.0), Vec3::new(3.5, 2.0, 9.0))), Mat4::IDENTITY, true, vec![])
        .unwrap();
    assert!(worker.wait_for_merge(TIMEOUT));

    let near = PolygonConfig::omni(Vec2::new(0.0, 0.1), 10.0, 0.5);
    let far = PolygonConfig::omni(Vec2::ZERO, 2.0, 0.5);
    let first = worker.request(1, &near).unwrap();
    let second = worker.request(2, &far).unwrap();
    assert!(second > first);

    assert!(worker.wait_for_response(second, TIMEOUT));
    worker.poll();
    if worker.latest(1).is_none() {
        assert!(worker.wait_for_response(first, TIMEOUT));
    }
    assert_eq!(worker.latest(1).unwrap().request_id, first);
    assert_eq!(worker.latest(2).unwrap().request_id, second);
    assert!(worker.latest(1).unwrap().points.iter().any(|p| p.x > 2.9 && p.x < 3.1));
    assert!(worker.latest(2).unwrap().points.iter().all(|p| p.length() < 2.0 + 1e-3));
}

#[test]
fn scene_in_worker_mode_serves_worker_polygons() {
    let mut scene = SceneContext::new(worker_config()).unwrap();
    assert!(scene.vision().uses_worker());
    scene.spawn_blocker(
        Arc::new(MeshNode::single(cuboid(Vec3::new(0.0, -1.0, -20.0), Vec3::new(0.5, 2.0, 20.0)))),
        Transform::from_position(Vec3::X * 4.0),
        BlockingTags::WALL,
    );
    let worker = scene.vision_mut().worker_mut().unwrap();
    assert!(worker.wait_for_merge(TIMEOUT));

    let params = PolygonConfig::omni(Vec2::new(0.0, 0.1), 10.0, 0.5);
    let local = scene.visibility_polygon(9, &params, Instant::now());
    let worker = scene.vision_mut().worker_mut().unwrap();
    assert!(worker.wait_for_response(1, TIMEOUT));
    let served = scene.visibility_polygon(9, &params, Instant::now());

    assert_eq!(served.points.len(), local.points.len());
    for (a, b) in served.points.iter().zip(&local.points) {
        assert!((*a - *b).length() < 1e-3, "{a:?} vs {b:?}");
    }
}

#[test]
fn hiding_an_entity_removes_it_from_the_mirror() {
    let mut scene = SceneContext::new(worker_config()).unwrap();
    let e = scene.spawn_blocker(
        Arc::new(MeshNode::single(cuboid(Vec3::ZERO, Vec3::ONE))),
        Transform::default(),
        BlockingTags::WALL,
    );
    assert!(scene.vision_mut().worker_mut().unwrap().wait_for_merge(TIMEOUT));
    assert_eq!(scene.vision().worker().unwrap().merged_triangles(), 12);

    scene.set_visible(e, false);
    assert!(scene.vision_mut().worker_mut().unwrap().wait_for_merge(TIMEOUT));
    assert_eq!(scene.vision().worker().unwrap().merged_triangles(), 0);
}

#[test]
fn clip_height_matches_between_local_and_worker_modes() {
    let low_wall = Arc::new(MeshNode::from_parts(vec![
        MeshPart::new("low", cuboid(Vec3::new(3.0, 0.0, -20.0), Vec3::new(3.5, 2.0, 20.0)))
            .with_clip_height(0.5),
    ]));
    let polygon = |use_worker: bool, elevation: f32| {
        let mut scene = SceneContext::new(VisionConfig { use_worker, ..worker_config() }).unwrap();
        scene.spawn_blocker(low_wall.clone(), Transform::default(), BlockingTags::WALL);
        let params = PolygonConfig::omni(Vec2::new(0.0, 0.1), 10.0, elevation);
        if use_worker {
            assert!(scene.vision_mut().worker_mut().unwrap().wait_for_merge(TIMEOUT));
            scene.visibility_polygon(1, &params, Instant::now());
            assert!(scene.vision_mut().worker_mut().unwrap().wait_for_response(1, TIMEOUT));
        }
        scene.visibility_polygon(1, &params, Instant::now())
    };

    for elevation in [1.0, 0.25] {
        let local = polygon(false, elevation);
        let served = polygon(true, elevation);
        assert_eq!(served.points.len(), local.points.len());
        for (a, b) in served.points.iter().zip(&local.points) {
            assert!((*a - *b).length() < 1e-3, "elevation {elevation}: {a:?} vs {b:?}");
        }
    }

    let max_x = |elevation| polygon(true, elevation).points.iter().map(|p| p.x).fold(f32::MIN, f32::max);
    // sight passes over the clipped wall and stops at it below the clip height
    assert!(max_x(1.0) > 9.9);
    assert!(max_x(0.25) < 3.0 + 1e-3);
}
