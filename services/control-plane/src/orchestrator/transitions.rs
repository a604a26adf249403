//! Which lifecycle calls are legal from which states.

use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::registry::{ServerInstance, ServerStatus};

/// A lifecycle call issued by an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Restart,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Delete => "delete",
        }
    }

    /// State the instance enters as soon as the command is dispatched.
    pub fn transitional_state(self) -> ServerStatus {
        match self {
            Self::Start => ServerStatus::Starting,
            Self::Stop | Self::Restart => ServerStatus::Stopping,
            Self::Delete => ServerStatus::Deleting,
        }
    }
}

/// Check that `op` may be dispatched against `server` right now.
///
/// Commands are serialized per instance, so a server with work outstanding
/// rejects everything.
pub fn check(server: &ServerInstance, op: Operation) -> ControlPlaneResult<()> {
    let legal = !server.is_busy()
        && match op {
            // A failed create leaves nothing to start.
            Operation::Start => match server.status {
                ServerStatus::Stopped => true,
                ServerStatus::Error => server.container_ref.is_some(),
                _ => false,
            },
            Operation::Stop | Operation::Restart => server.status == ServerStatus::Running,
            Operation::Delete => matches!(
                server.status,
                ServerStatus::Running | ServerStatus::Stopped | ServerStatus::Error
            ),
        };

    if legal {
        Ok(())
    } else {
        Err(ControlPlaneError::InvalidTransition {
            server_id: server.id,
            from: server.status,
            operation: op.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_id::{OwnerId, ServerId};
    use kiln_protocol::{ContainerRef, Resources};
    use rstest::rstest;
    use ServerStatus::*;

    fn server(status: ServerStatus, has_container: bool) -> ServerInstance {
        let mut s = ServerInstance::new(
            ServerId::new(),
            OwnerId::new(),
            "survival".into(),
            "minecraft".into(),
            Resources::new(100, 1024, 0),
            Utc::now(),
        );
        s.status = status;
        if has_container {
            s.container_ref = Some(ContainerRef::new("ctr-1"));
        }
        s
    }

    #[rstest]
    #[case(Stopped, Operation::Start, true)]
    #[case(Error, Operation::Start, true)]
    #[case(Running, Operation::Start, false)]
    #[case(Provisioning, Operation::Start, false)]
    #[case(Starting, Operation::Start, false)]
    #[case(Running, Operation::Stop, true)]
    #[case(Stopped, Operation::Stop, false)]
    #[case(Stopping, Operation::Stop, false)]
    #[case(Running, Operation::Restart, true)]
    #[case(Stopped, Operation::Restart, false)]
    #[case(Error, Operation::Restart, false)]
    #[case(Running, Operation::Delete, true)]
    #[case(Stopped, Operation::Delete, true)]
    #[case(Error, Operation::Delete, true)]
    #[case(Provisioning, Operation::Delete, false)]
    #[case(Starting, Operation::Delete, false)]
    #[case(Deleting, Operation::Delete, false)]
    fn test_legal_source_states(
        #[case] from: ServerStatus,
        #[case] op: Operation,
        #[case] legal: bool,
    ) {
        let s = server(from, true);
        assert_eq!(check(&s, op).is_ok(), legal, "{op:?} from {from}");
        if legal {
            assert!(from.can_transition_to(op.transitional_state()));
        }
    }

    #[test]
    fn test_start_from_error_needs_container() {
        let s = server(Error, false);
        assert!(matches!(
            check(&s, Operation::Start),
            Err(ControlPlaneError::InvalidTransition { operation: "start", .. })
        ));
    }

    #[test]
    fn test_busy_server_rejects_everything() {
        let mut s = server(Running, true);
        s.in_flight = true;
        for op in [
            Operation::Start,
            Operation::Stop,
            Operation::Restart,
            Operation::Delete,
        ] {
            assert!(check(&s, op).is_err());
        }
    }
}
