// tracker-test-utils: Shared test utilities for the tracker gateway.
//
// Provides GT06 frame builders and a mock tracker TCP client for exercising
// the gateway listener end to end.

pub mod frames;
pub mod mock_tracker;

pub use frames::{GpsReport, heartbeat_frame, login_frame, status_frame};
pub use mock_tracker::MockTracker;
