// RTS-style camera used to turn pointer positions into world rays.
//
// Camera model:
//   - A "target" point on the XZ ground plane (Y=0) that the camera looks at
//   - Fixed pitch (elevation angle) and yaw (horizontal rotation)
//   - Zoom by adjusting distance along the look vector
//
// Screen rays unproject the pointer through the inverse view-projection; they
// feed drag resolution and click picking.

use glam::{Mat4, Vec2, Vec3, Vec4};

use super::bvh::Ray;

pub struct RtsCamera {
    /// Point on the ground plane (X/Z) the camera orbits around.
    /// Private: always clamped to bounds. Use target() to read.
    target: Vec2,

    /// Distance from target along the look direction.
    /// Private: always clamped to [min_distance, max_distance]. Use distance() to read.
    distance: f32,
    pub min_distance: f32,
    pub max_distance: f32,

    /// Elevation angle in radians (0 = horizontal, PI/2 = straight down)
    pub pitch: f32,

    /// Horizontal rotation in radians (0 = looking along -Z axis)
    pub yaw: f32,

    /// Vertical field of view in radians
    pub fov: f32,
    pub near: f32,
    pub far: f32,

    /// Map bounds: target is clamped to [bounds_min, bounds_max] on X/Z
    pub bounds_min: Vec2,
    pub bounds_max: Vec2,
}

impl Default for RtsCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl RtsCamera {
    pub fn new() -> Self {
        Self {
            target: Vec2::ZERO,
            distance: 30.0,
            min_distance: 10.0,
            max_distance: 60.0,
            pitch: 55.0_f32.to_radians(),
            yaw: 0.0,
            fov: 20.0_f32.to_radians(),
            near: 0.1,
            far: 200.0,
            bounds_min: Vec2::new(-50.0, -50.0),
            bounds_max: Vec2::new(50.0, 50.0),
        }
    }

    /// Move the target by `offset` in camera-relative XZ (x = right, y = forward).
    pub fn pan(&mut self, offset: Vec2) {
        // yaw=0 means camera faces along -Z, so forward is (0, -1) in (X, Z).
        let forward = Vec2::new(-self.yaw.sin(), -self.yaw.cos());
        let right = Vec2::new(self.yaw.cos(), -self.yaw.sin());
        self.set_target(self.target + right * offset.x + forward * offset.y);
    }

    pub fn set_target(&mut self, target: Vec2) {
        self.target = target.clamp(self.bounds_min, self.bounds_max);
    }

    /// Positive `amount` zooms in.
    pub fn zoom(&mut self, amount: f32) {
        self.distance = (self.distance - amount).clamp(self.min_distance, self.max_distance);
    }

    /// World-space position of the camera eye.
    pub fn camera_position(&self) -> Vec3 {
        let target_3d = Vec3::new(self.target.x, 0.0, self.target.y);
        target_3d + self.eye_offset()
    }

    /// View matrix: looks from the camera eye toward the target.
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.camera_position(), Vec3::new(self.target.x, 0.0, self.target.y), Vec3::Y)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov, aspect, self.near, self.far)
    }

    pub fn view_projection(&self, aspect: f32) -> Mat4 {
        self.projection_matrix(aspect) * self.view_matrix()
    }

    pub fn target(&self) -> Vec2 { self.target }
    pub fn distance(&self) -> f32 { self.distance }

    /// World ray through pixel (`px`, `py`) of a `width` x `height` viewport.
    /// Pixel origin is the top-left corner. `None` for an empty viewport.
    pub fn screen_ray(&self, px: f32, py: f32, width: f32, height: f32) -> Option<Ray> {
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        let ndc = Vec2::new(px / width * 2.0 - 1.0, 1.0 - py / height * 2.0);
        let inv = self.view_projection(width / height).inverse();
        // perspective_rh maps depth to [0, 1]
        let unproject = |z: f32| {
            let p = inv * Vec4::new(ndc.x, ndc.y, z, 1.0);
            p.truncate() / p.w
        };
        let near = unproject(0.0);
        let far = unproject(1.0);
        let dir = (far - near).normalize_or_zero();
        (dir != Vec3::ZERO).then(|| Ray::new(near, dir))
    }

    // Offset from target to camera eye based on pitch, yaw, and distance.
    fn eye_offset(&self) -> Vec3 {
        Vec3::new(
            self.yaw.sin() * self.pitch.cos() * self.distance,
            self.pitch.sin() * self.distance,
            self.yaw.cos() * self.pitch.cos() * self.distance,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn centre_pixel_looks_at_target() {
        let mut camera = RtsCamera::new();
        camera.set_target(Vec2::new(4.0, -3.0));
        let ray = camera.screen_ray(400.0, 300.0, 800.0, 600.0).unwrap();

        let t = -ray.origin.y / ray.dir.y;
        let ground = ray.at(t);
        assert_relative_eq!(ground.x, 4.0, epsilon = 1e-2);
        assert_relative_eq!(ground.z, -3.0, epsilon = 1e-2);
        assert!(ray.dir.y < 0.0);
    }

    #[test]
    fn top_of_screen_lands_further_away() {
        let camera = RtsCamera::new();
        let ground_z = |py: f32| {
            let ray = camera.screen_ray(400.0, py, 800.0, 600.0).unwrap();
            ray.at(-ray.origin.y / ray.dir.y).z
        };
        // yaw 0 looks along -Z
        assert!(ground_z(0.0) < ground_z(300.0));
        assert!(ground_z(600.0) > ground_z(300.0));
    }

    #[test]
    fn pan_and_zoom_stay_in_bounds() {
        let mut camera = RtsCamera::new();
        camera.pan(Vec2::new(0.0, 500.0));
        assert_eq!(camera.target(), Vec2::new(0.0, -50.0));
        camera.zoom(100.0);
        assert_eq!(camera.distance(), camera.min_distance);
        assert!(camera.screen_ray(0.0, 0.0, 0.0, 600.0).is_none());
    }
}
