/// The lifecycle of a worker, as recorded in its control block.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerState {
    NotStarted = 0,
    /// A launch has been requested through the start handshake.
    Starting,
    /// The worker attached to its control block.
    Ready,
    /// The worker serves its inbox.
    Running,
    Terminating,
    Terminated,
}

impl WorkerState {
    /// Unknown words read as `Terminated`, nothing can be served from a corrupt block.
    pub fn from_u32(word: u32) -> Self {
        match word {
            0 => WorkerState::NotStarted,
            1 => WorkerState::Starting,
            2 => WorkerState::Ready,
            3 => WorkerState::Running,
            4 => WorkerState::Terminating,
            _ => WorkerState::Terminated,
        }
    }

    /// Start-up advances one step at a time; termination may be entered from any earlier state.
    pub fn can_advance_to(self, next: WorkerState) -> bool {
        match next {
            WorkerState::NotStarted => false,
            WorkerState::Starting | WorkerState::Ready | WorkerState::Running => {
                next as u32 == self as u32 + 1
            }
            WorkerState::Terminating | WorkerState::Terminated => next > self,
        }
    }

    pub fn is_terminal(self) -> bool {
        self >= WorkerState::Terminating
    }
}

#[test]
fn only_forward() {
    use WorkerState::*;
    assert!(NotStarted.can_advance_to(Starting));
    assert!(Starting.can_advance_to(Ready));
    assert!(Ready.can_advance_to(Running));
    assert!(Running.can_advance_to(Terminating));
    assert!(Terminating.can_advance_to(Terminated));

    assert!(!NotStarted.can_advance_to(Running));
    assert!(!Running.can_advance_to(Ready));
    assert!(!Terminated.can_advance_to(Terminating));
    assert!(!Terminated.can_advance_to(Terminated));
    assert!(Starting.can_advance_to(Terminated));

    assert_eq!(WorkerState::from_u32(77), Terminated);
}
