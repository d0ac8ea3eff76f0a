// Line-of-sight and collision raycasting over a dynamic 3D scene

pub mod engine;
