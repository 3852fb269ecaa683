//! Bullet: single-decree Paxos with a movable leader token.
//!
//! Every process holds its own view of the whole cluster, a [`state::ClusterState`].
//! The view only changes through five guarded actions (candidate promotion,
//! leader election, log replication, message garbage collection and the
//! "magic bullet" pass) and through the bookkeeping a node does when peers'
//! messages arrive.
//!
//! # Architecture
//!
//! - **Caller thread**: drives a [`bridge::Bridge`]; actions run under the state
//!   lock, network sends run after it is released
//! - **Listener thread**: accepts one-message TCP connections from peers
//! - **Connection handler threads**: decode, verify and apply a single message,
//!   answer ACK/NACK and send any protocol reply
//!
//! Promises that arrive while a node campaigns are forwarded to the caller over
//! a crossbeam channel, so an election waits on events instead of sleeping.
//!
//! # Modules
//!
//! - [`codec`]: binary message format and TCP framing
//! - [`state`]: cluster view and the protocol actions
//! - [`safety`]: OneLeader and LogConsistency checks
//! - [`transport`]: listener, handlers and outbound sends
//! - [`bridge`]: propose, request leadership, transfer, status
//! - [`config`]: node configuration and peer table parsing
//! - [`console`]: shell command parsing
//! - [`error`]: error types

pub mod bridge;
pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod safety;
pub mod state;
pub mod transport;
