//! Core delivery components.

pub mod cleanup;
pub mod clock;
pub mod delivery;
pub mod dlq;
pub mod events;
pub mod registry;
pub mod visibility;
