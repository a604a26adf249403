//! Id types used across the control plane and agents.

use crate::define_id;

// Fleet

define_id!(NodeId, "node");
define_id!(ServerId, "srv");

// Callers and sessions

define_id!(OwnerId, "usr");
define_id!(ViewerId, "view");
define_id!(RequestId, "req");
