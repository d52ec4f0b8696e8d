use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PermissionClass;

/// Cache lifetimes per permission class, plus a separate lifetime for denials.
///
/// Denials get their own knob so repeated unauthorized probing can be absorbed
/// by the cache independently of how fresh allowed decisions must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionTtls {
    pub read: Duration,
    pub write: Duration,
    pub admin: Duration,
    pub denied: Duration,
}

impl Default for DecisionTtls {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(300),
            write: Duration::from_secs(60),
            admin: Duration::from_secs(30),
            denied: Duration::from_secs(120),
        }
    }
}

impl DecisionTtls {
    pub fn for_outcome(&self, class: PermissionClass, allowed: bool) -> Duration {
        if !allowed {
            return self.denied;
        }
        match class {
            PermissionClass::Read => self.read,
            PermissionClass::Write => self.write,
            PermissionClass::Admin => self.admin,
        }
    }
}
