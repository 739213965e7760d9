//! A UPnP 1.0/1.1 control point core: the SSDP discovery and GENA
//! eventing substrate described in the design notes for this crate.
//!
//! This crate is the client side of the UPnP device architecture: it
//! discovers devices over multicast SSDP, validates their self-described
//! `LOCATION`, and subscribes to service state-change events over GENA.
//! XML description parsing, SOAP action invocation, and the resulting
//! device/service object model are deliberately out of scope — callers
//! plug their own `Receiver`/`Service`/`EventEndpoint` implementations
//! into the traits this crate exposes.
//!
//! # Layout
//!
//! - [`executor`] — the three task pools (server/io/callback) every
//!   long-lived or short-lived operation in this crate runs on.
//! - [`iface`] — address-family enumeration (`AddressMode`) and
//!   per-interface address binding (`InterfaceBinding`).
//! - [`datagram_server`] — the one multicast-socket core parametrized
//!   by bind port and group-join, underlying both discovery roles.
//! - [`message`] — SSDP message parsing/serialization.
//! - [`notify`] / [`search`] — the Notify Receiver and Search Responder
//!   built atop [`datagram_server`].
//! - [`location`] — the `LOCATION` header validator.
//! - [`subscription`] — the GENA subscription manager and its renewal
//!   scheduler.
//! - [`http_client`] — the HTTP facade the subscription manager speaks
//!   GENA over.
//! - [`error`] — the crate-wide error taxonomy.

pub mod datagram_server;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod iface;
pub mod location;
pub mod message;
pub mod notify;
pub mod search;
pub mod subscription;

pub use error::{Error, Result};
pub use executor::Executors;
pub use iface::{AddressMode, InterfaceBinding};
pub use message::SsdpMessage;
