pub mod chat;
pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod session;
pub mod signaling;
pub mod telemetry;

#[cfg(test)]
mod tests;
