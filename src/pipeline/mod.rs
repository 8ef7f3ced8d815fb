//! Camera, detector and the session that owns both.

pub mod camera;
pub mod detector;
pub mod session;
pub mod subprocess;
