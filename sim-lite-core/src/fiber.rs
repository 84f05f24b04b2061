use crate::error::{SimError, SimResult};
use crate::executive::{ExecShared, Executive};
use crate::types::{EventKey, FiberId, SimDuration, SimTime};
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

/// Where a detachable event thread currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FiberPhase {
    /// Body is on the stack or runnable.
    Running,
    /// Parked at a suspension point, waiting for a resume.
    Suspended,
    Finished,
}

pub(crate) struct FiberState {
    pub id: FiberId,
    pub phase: FiberPhase,
    /// Key of the pending scheduled resume event, if the suspension is timed.
    pub resume_key: Option<EventKey>,
    pub resume_granted: bool,
    pub abort_requested: bool,
    /// Inherited from the spawning event; resume events reuse it.
    pub priority: f64,
}

/// A live detachable event thread: the parked continuation plus its
/// shared control block. Owned by the executive.
pub(crate) struct FiberCell {
    pub future: Option<LocalBoxFuture<'static, SimResult<()>>>,
    pub state: Rc<RefCell<FiberState>>,
    pub controller: EventController,
}

/// Handle for the running (or suspended) detachable event. Obtainable
/// inside the body, or from `Executive::current_controller()` during
/// dispatch. Cheap to clone; other parties keep one to `resume()` or
/// `abort()` the thread.
pub struct EventController {
    pub(crate) exec: Weak<ExecShared>,
    pub(crate) state: Rc<RefCell<FiberState>>,
}

impl Clone for EventController {
    fn clone(&self) -> Self {
        Self {
            exec: self.exec.clone(),
            state: self.state.clone(),
        }
    }
}

impl EventController {
    pub fn fiber_id(&self) -> FiberId {
        self.state.borrow().id
    }

    fn executive(&self) -> Option<Executive> {
        self.exec.upgrade().map(Executive::from_shared)
    }

    /// True while the body is on the stack, i.e. a suspension can park it.
    pub fn can_suspend(&self) -> bool {
        self.state.borrow().phase == FiberPhase::Running && self.exec.strong_count() > 0
    }

    /// Park until the virtual clock reaches `now + d`.
    pub fn suspend_for(&self, d: SimDuration) -> Suspension {
        let deadline = self.executive().map(|e| e.now() + d);
        Suspension {
            ctl: self.clone(),
            deadline,
            timed: true,
            armed: false,
        }
    }

    /// Park until the virtual clock reaches `t`.
    pub fn suspend_until(&self, t: SimTime) -> Suspension {
        Suspension {
            ctl: self.clone(),
            deadline: Some(t),
            timed: true,
            armed: false,
        }
    }

    /// Park with no scheduled resume; only an explicit `resume()` (or an
    /// abort) continues the thread.
    pub fn suspend_until_resumed(&self) -> Suspension {
        Suspension {
            ctl: self.clone(),
            deadline: None,
            timed: false,
            armed: false,
        }
    }

    /// Schedule an immediate resume for a parked thread. Replaces any
    /// pending timed resume. No-op on a thread that is not suspended.
    pub fn resume(&self) {
        let Some(exec) = self.executive() else {
            return;
        };
        let pending = {
            let st = self.state.borrow();
            if st.phase != FiberPhase::Suspended {
                return;
            }
            st.resume_key
        };
        if let Some(key) = pending {
            exec.unrequest(key);
        }
        let (id, priority) = {
            let st = self.state.borrow();
            (st.id, st.priority)
        };
        match exec.schedule_resume(id, exec.now(), priority) {
            Ok(key) => self.state.borrow_mut().resume_key = Some(key),
            Err(_) => {
                // Executive already finished; the fiber will be dropped with it.
            }
        }
    }

    /// Terminate the thread. A suspended thread is dropped immediately,
    /// running its `Drop` release handlers; a running thread observes
    /// `SimError::FiberAborted` at its next suspension point.
    pub fn abort(&self) {
        let phase = self.state.borrow().phase;
        match phase {
            FiberPhase::Suspended => {
                if let Some(exec) = self.executive() {
                    exec.abort_fiber(self.fiber_id());
                }
            }
            FiberPhase::Running => {
                self.state.borrow_mut().abort_requested = true;
            }
            FiberPhase::Finished => {}
        }
    }
}

/// Future returned by the `suspend_*` family. Arms the suspension (and
/// schedules the timed resume event) on first poll, then stays pending
/// until the executive grants the resume.
pub struct Suspension {
    ctl: EventController,
    deadline: Option<SimTime>,
    timed: bool,
    armed: bool,
}

impl Future for Suspension {
    type Output = SimResult<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        {
            let mut st = this.ctl.state.borrow_mut();
            if st.abort_requested {
                st.abort_requested = false;
                st.phase = FiberPhase::Running;
                return Poll::Ready(Err(SimError::FiberAborted));
            }
            if this.armed {
                return if st.resume_granted {
                    st.resume_granted = false;
                    st.resume_key = None;
                    st.phase = FiberPhase::Running;
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Pending
                };
            }
            st.phase = FiberPhase::Suspended;
            st.resume_granted = false;
            this.armed = true;
        }
        if this.timed {
            let Some(exec) = this.ctl.executive() else {
                return Poll::Ready(Err(SimError::FiberAborted));
            };
            let deadline = this.deadline.unwrap_or_else(|| exec.now());
            let (id, priority) = {
                let st = this.ctl.state.borrow();
                (st.id, st.priority)
            };
            match exec.schedule_resume(id, deadline, priority) {
                Ok(key) => this.ctl.state.borrow_mut().resume_key = Some(key),
                Err(e) => {
                    this.ctl.state.borrow_mut().phase = FiberPhase::Running;
                    return Poll::Ready(Err(e));
                }
            }
        }
        Poll::Pending
    }
}
