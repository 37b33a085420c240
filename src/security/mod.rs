//! Process hardening for the python sandbox (Linux)
//!
//! # Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Layer 1: CAPABILITIES                                          │
//! │  Clear every capability set in the forked child                 │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Layer 2: SECCOMP BPF                                           │
//! │  socket/connect/... fail with EACCES; everything else allowed   │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                    exec(python3 -I -u -c runner)
//! ```
//!
//! Both are applied from `Command::pre_exec`, so the agent process itself is
//! never restricted.

pub mod capabilities;
pub mod seccomp;

pub use capabilities::CapabilityDropper;
pub use seccomp::NetworkSeccomp;
