pub mod chat;
pub mod cli;
pub mod error;
pub mod settings;
