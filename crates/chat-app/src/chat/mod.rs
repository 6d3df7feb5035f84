pub mod controller;

pub use controller::{ChatSession, SendOptions, SendOutcome};
