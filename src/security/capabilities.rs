//! Linux capability dropping for sandboxed children
//!
//! # Capability Sets
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Permitted (P)    │ Maximum caps this process CAN have            │
//! ├───────────────────┼───────────────────────────────────────────────┤
//! │  Effective (E)    │ Caps currently ACTIVE right now               │
//! ├───────────────────┼───────────────────────────────────────────────┤
//! │  Inheritable (I)  │ Caps passed across exec                       │
//! ├───────────────────┼───────────────────────────────────────────────┤
//! │  Bounding (B)     │ Absolute limit (cannot be exceeded)           │
//! └───────────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! The sandboxed interpreter needs none of them, so everything is dropped.
//! When the agent runs unprivileged all sets are already empty and this is
//! a no-op apart from the bounding set.

use std::io;

use caps::{CapSet, Capability};

// ═══════════════════════════════════════════════════════════════════════════
// CapabilityDropper
// ═══════════════════════════════════════════════════════════════════════════
// USAGE:
//   Build in the parent, call apply() AFTER fork but BEFORE exec.
//   Order inside apply(): bounding (per cap), then effective, permitted,
//   inheritable. Effective must be cleared before permitted or capset
//   rejects the state.
// ═══════════════════════════════════════════════════════════════════════════

pub struct CapabilityDropper {
    /// Capabilities removed from the bounding set
    caps_to_drop: Vec<Capability>,
}

impl CapabilityDropper {
    pub fn new() -> Self {
        Self {
            caps_to_drop: Vec::new(),
        }
    }

    /// Drop every capability the kernel headers know about
    pub fn drop_all() -> Self {
        let mut dropper = Self::new();
        let mut all: Vec<Capability> = caps::all().into_iter().collect();
        all.sort_by_key(|c| c.index());
        for cap in all {
            dropper.drop_cap(cap);
        }
        dropper
    }

    pub fn drop_cap(&mut self, cap: Capability) -> &mut Self {
        self.caps_to_drop.push(cap);
        self
    }

    pub fn drop_count(&self) -> usize {
        self.caps_to_drop.len()
    }

    /// Drop the capabilities from the calling thread
    ///
    /// Irreversible. Bounding-set drops need CAP_SETPCAP and are
    /// best-effort; clearing the other sets must succeed.
    pub fn apply(&self) -> Result<(), io::Error> {
        for &cap in &self.caps_to_drop {
            let _ = caps::drop(None, CapSet::Bounding, cap);
        }

        for set in [CapSet::Effective, CapSet::Permitted, CapSet::Inheritable] {
            caps::clear(None, set)
                .map_err(|e| io::Error::new(io::ErrorKind::PermissionDenied, e.to_string()))?;
        }

        Ok(())
    }
}

impl Default for CapabilityDropper {
    fn default() -> Self {
        Self::drop_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_all_covers_known_caps() {
        let dropper = CapabilityDropper::drop_all();
        assert_eq!(dropper.drop_count(), caps::all().len());
        assert!(dropper.caps_to_drop.contains(&Capability::CAP_NET_RAW));
        assert!(dropper.caps_to_drop.contains(&Capability::CAP_SYS_ADMIN));
    }
}
