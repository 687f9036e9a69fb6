//! Integration tests for video-tracking.

pub mod executor_test;
pub mod tracking_test;
