//! # stagehand-bus
//!
//! Publish/subscribe message transport for the stagehand scheduler.
//!
//! The transport itself has no notion of request/response, correlation, or
//! timeouts. This crate layers the two pieces the scheduler needs on top:
//!
//! - `MessageBus::request`: publish with a unique reply inbox attached, so
//!   a responder can send 0, 1, or 2 replies back on the inbox subject
//! - `bridge::Promise` / `bridge::Completion`: a resolve-exactly-once
//!   handle that lets a subscription reader task hand one reply to a caller
//!   that is suspended at an await point
//!
//! Delivery is at-least-once from the consumer's point of view: subscribers
//! must tolerate duplicate and missing messages.

pub mod bridge;
mod bus;
mod error;
mod memory;

pub use bus::{BusMessage, MessageBus, Subscription};
pub use error::BusError;
pub use memory::InProcessBus;
