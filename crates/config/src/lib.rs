//! Configuration for the aloud synthesis engine.
//!
//! One [`Settings`] struct aggregates the tunables of every component
//! (cache, router, scheduler, coordinators), loaded figment-style from
//! defaults, an optional TOML file, and environment variables. Components
//! receive their own section by value and never read the environment
//! themselves.

pub mod error;
mod settings;

pub use crate::settings::{
    CacheSettings, CoordinatorSettings, DeviceStorageClass, RouterSettings, SchedulerSettings, Settings,
};
