//! Outbound surface of the stepgate engine.
//!
//! The engine never talks to chat, mail or pager systems directly. It
//! publishes [`protocol::EngineEvent`]s on an [`event_bus::EventBus`] and
//! decides *that* a human must be told and *whom* via
//! [`notifications::Notification`]. Delivery belongs to whoever subscribes.

pub mod event_bus;
pub mod notifications;
pub mod protocol;
