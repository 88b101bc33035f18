use crate::error::LifecycleError;

/// The collection lifecycle.
///
/// The transition graph is fixed; [`validate_transition`] is consulted on
/// every status change and any deviation is an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionStatus {
    Idle,
    Loading,
    InitialCommit,
    Ready,
    Error,
    CleanedUp,
}

impl CollectionStatus {
    pub fn is_ready(self) -> bool {
        self == CollectionStatus::Ready
    }
}

pub(crate) fn validate_transition(
    from: CollectionStatus,
    to: CollectionStatus,
) -> Result<(), LifecycleError> {
    use CollectionStatus::*;
    let ok = match from {
        Idle => matches!(to, Loading | Error | CleanedUp),
        Loading => matches!(to, InitialCommit | Ready | Error | CleanedUp),
        InitialCommit => matches!(to, Ready | Error | CleanedUp),
        Ready => matches!(to, CleanedUp | Error),
        Error => matches!(to, CleanedUp | Idle),
        CleanedUp => matches!(to, Loading | Error),
    };
    if ok {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::CollectionStatus::*;
    use super::*;

    #[test]
    fn transition_graph_matches_the_state_machine() {
        let allowed = [
            (Idle, Loading),
            (Idle, Error),
            (Idle, CleanedUp),
            (Loading, InitialCommit),
            (Loading, Ready),
            (Loading, Error),
            (Loading, CleanedUp),
            (InitialCommit, Ready),
            (InitialCommit, Error),
            (InitialCommit, CleanedUp),
            (Ready, CleanedUp),
            (Ready, Error),
            (Error, CleanedUp),
            (Error, Idle),
            (CleanedUp, Loading),
            (CleanedUp, Error),
        ];
        let all = [Idle, Loading, InitialCommit, Ready, Error, CleanedUp];
        for from in all {
            for to in all {
                let expect = allowed.contains(&(from, to));
                assert_eq!(
                    validate_transition(from, to).is_ok(),
                    expect,
                    "transition {from:?} -> {to:?}"
                );
            }
        }
    }
}
