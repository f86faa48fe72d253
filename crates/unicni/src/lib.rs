//! # unicni
//!
//! CNI plugin that attaches containers to multi-network topologies.
//!
//! A pod's annotation describes the system channels and external ports it
//! needs; on `ADD` the plugin builds the host bridges, veth pairs and
//! macvlans for them and on `DEL` removes them again.

#![warn(missing_docs)]

pub mod annotations;
pub mod cli;
pub mod cni;
pub mod logging;
