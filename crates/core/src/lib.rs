//! Client-side conversation logic: turning a branching message map into the
//! path a user sees, and the agent "thinking" indicator.

pub mod thinking;
pub mod tree;

pub use thinking::{
    FINISHED_COUNT, FINISHING_DELAY, ThinkingEvent, ThinkingPhase, ThinkingRejection,
    ThinkingState, ThinkingTransitionResult, progress,
};
pub use tree::{DisplayMessage, linearize, switch_branch, terminal_of};
