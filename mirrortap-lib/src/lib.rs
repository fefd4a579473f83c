//! Multi-worker Linux packet tap: mirrors traffic from one interface to
//! another or into a userspace VXLAN/GRE overlay, through an ordered ACL
//! and optional truncation. Linux-only (AF_PACKET rings, TC classifiers).
#![cfg(target_os = "linux")]

pub mod capture;
pub mod config;
pub mod error;
pub mod filter;
pub mod forward;
pub mod iface;
pub mod packet;
pub mod stats;
pub mod sys;
pub mod truncate;
pub mod tunnel;
pub mod tx_ring;

pub use capture::Capture;
pub use config::{load_from_path, Action, CaptureMode, Config};
pub use error::{Result, TapError};
pub use filter::FilterEngine;
pub use stats::{ResourceSampler, StatsSnapshot};
pub use tunnel::Tunnel;
