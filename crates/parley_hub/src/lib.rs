#![forbid(unsafe_code)]

pub mod client;
pub mod event;
pub mod hub;

pub use client::Client;
pub use event::{ChatEvent, EventKind};
pub use hub::{Hub, SubscriptionHandle};
