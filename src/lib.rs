//! Core library for the coil_daq application.
//!
//! Orchestrates a magnet/coil test bench: a nanovoltmeter, a programmable
//! supply that ramps the coil current and an analog digitizer, with an optional
//! temperature monitor. A fixed-period acquisition loop samples every
//! instrument into an append-only CSV log and an InfluxDB bucket while an
//! operator command channel reconfigures the supply mid-run.
//!
//! Every instrument link is owned by one session task (see [`session`]), so
//! the acquisition loop and operator commands can share instruments without
//! ever interleaving their traffic.

pub mod app;
pub mod command;
pub mod config;
pub mod digitizer;
pub mod error;
pub mod instruments;
pub mod protocol;
pub mod record;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod sink;
pub mod supply;
