//! Owner quota checks made before a create.
//!
//! Billing owns the real rules; [`QuotaPolicy`] is the seam it plugs into.

use kiln_id::OwnerId;
use kiln_protocol::Resources;

use crate::error::{ControlPlaneError, ControlPlaneResult};

/// What an owner already holds when a create is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnerUsage {
    pub servers: usize,
    pub committed: Resources,
}

pub trait QuotaPolicy: Send + Sync {
    fn check(&self, owner: &OwnerId, usage: &OwnerUsage, plan: &Resources)
        -> ControlPlaneResult<()>;
}

/// Caps the number of servers per owner.
#[derive(Debug, Clone, Copy)]
pub struct ServerCountQuota {
    pub max_servers: usize,
}

impl QuotaPolicy for ServerCountQuota {
    fn check(
        &self,
        owner: &OwnerId,
        usage: &OwnerUsage,
        _plan: &Resources,
    ) -> ControlPlaneResult<()> {
        if usage.servers >= self.max_servers {
            return Err(ControlPlaneError::Forbidden(format!(
                "owner {owner} reached the limit of {} servers",
                self.max_servers
            )));
        }
        Ok(())
    }
}
