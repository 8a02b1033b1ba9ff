use std::fmt;

use crate::wire::envelope::ResultCode;

/// A state enum with a declared set of legal edges.
pub trait LifecycleState: Copy + Eq + fmt::Debug + fmt::Display {
    fn can_transition_to(self, target: Self) -> bool;

    fn is_terminal(self) -> bool;
}

#[derive(Debug, PartialEq, Eq)]
pub enum TransitionError<S> {
    IllegalEdge { from: S, to: S },
    Terminal { state: S },
    AlreadyInTransition { state: S, target: S },
    UnexpectedReport { state: S, in_transition: S, reported: S },
}

impl<S: fmt::Display> fmt::Display for TransitionError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalEdge { from, to } => write!(f, "cannot move from {from} to {to}"),
            Self::Terminal { state } => write!(f, "{state} is final"),
            Self::AlreadyInTransition { state, target } => {
                write!(f, "already moving from {state} to {target}")
            }
            Self::UnexpectedReport {
                state,
                in_transition,
                reported,
            } => write!(
                f,
                "reported {reported} while in {state} (moving to {in_transition})"
            ),
        }
    }
}

impl<S: fmt::Debug + fmt::Display> std::error::Error for TransitionError<S> {}

/// What a change report did to a tracked entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOutcome<S> {
    Settled { from: S, to: S },
    Unchanged { state: S },
    Failed { state: S, attempted: S, result: ResultCode },
}

/// Current state, the state being moved toward (equal when settled) and the
/// last result a worker reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tracked<S> {
    state: S,
    in_transition: S,
    result: ResultCode,
}

impl<S: LifecycleState> Tracked<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            in_transition: initial,
            result: ResultCode::Success,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn in_transition(&self) -> S {
        self.in_transition
    }

    pub fn result(&self) -> ResultCode {
        self.result
    }

    pub fn is_settled(&self) -> bool {
        self.state == self.in_transition
    }

    pub fn request(&mut self, target: S) -> Result<(), TransitionError<S>> {
        if !self.is_settled() {
            return Err(TransitionError::AlreadyInTransition {
                state: self.state,
                target: self.in_transition,
            });
        }
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal { state: self.state });
        }
        if !self.state.can_transition_to(target) {
            return Err(TransitionError::IllegalEdge {
                from: self.state,
                to: target,
            });
        }
        self.in_transition = target;
        Ok(())
    }

    /// Drops a pending target without touching the confirmed state.
    pub fn abandon(&mut self) {
        self.in_transition = self.state;
    }

    /// Requests `target` after abandoning whatever was pending.
    pub fn redirect(&mut self, target: S) -> Result<(), TransitionError<S>> {
        let pending = self.in_transition;
        self.abandon();
        self.request(target).inspect_err(|_| {
            self.in_transition = pending;
        })
    }

    /// Confirms the pending target.
    pub fn settle(&mut self) -> TransitionOutcome<S> {
        let from = self.state;
        self.state = self.in_transition;
        self.result = ResultCode::Success;
        if from == self.state {
            TransitionOutcome::Unchanged { state: from }
        } else {
            TransitionOutcome::Settled {
                from,
                to: self.state,
            }
        }
    }

    /// Records a failure of the pending target; the confirmed state stays.
    pub fn fail(&mut self, result: ResultCode) -> TransitionOutcome<S> {
        let attempted = self.in_transition;
        self.in_transition = self.state;
        self.result = result;
        TransitionOutcome::Failed {
            state: self.state,
            attempted,
            result,
        }
    }

    /// Moves along a legal edge and confirms it at once, for edges the
    /// manager owns itself.
    pub fn advance(&mut self, target: S) -> Result<TransitionOutcome<S>, TransitionError<S>> {
        self.request(target)?;
        Ok(self.settle())
    }

    /// Applies a change report from a worker.
    pub fn apply_report(
        &mut self,
        reported: S,
        result: ResultCode,
    ) -> Result<TransitionOutcome<S>, TransitionError<S>> {
        if !result.is_success() {
            return Ok(self.fail(result));
        }

        if !self.is_settled() && reported == self.in_transition {
            return Ok(self.settle());
        }
        if reported == self.state {
            return Ok(TransitionOutcome::Unchanged { state: reported });
        }
        if self.is_settled() && self.state.can_transition_to(reported) {
            self.in_transition = reported;
            return Ok(self.settle());
        }

        Err(TransitionError::UnexpectedReport {
            state: self.state,
            in_transition: self.in_transition,
            reported,
        })
    }
}
