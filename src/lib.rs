//! Terminal remote control for Spotify.
//!
//! A headless browser hosts the Web Playback SDK, which makes it a Spotify
//! Connect device. The [`handshake`] sets that device up; the [`broker`]
//! carries user commands to the [`controller`] and track changes from the
//! [`watcher`] back to subscribers.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod broker;
pub mod browser;
pub mod cdp;
pub mod channel;
pub mod config;
pub mod console;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handshake;
pub mod http;
pub mod registry;
pub mod remote;
pub mod signal;
pub mod token;
pub mod watcher;

#[cfg(test)]
mod testing;
