//! Confab - clustered real-time messaging server core
//!
//! Clients hold long-lived sessions, join named *topics* (group chats, 1:1
//! conversations, user-scoped meta topics), publish messages, and receive
//! fan-out broadcasts with read/recv receipts, typing indicators,
//! access-control updates and presence.
//!
//! ## Architecture
//!
//! ```text
//! transport → session dispatch → hub (route by name) → topic loop
//!                                                        ↓ fan-out
//!                                       session outbound queues → writer
//! ```
//!
//! Every loaded topic runs a single-writer event loop owning all its state.
//! In a cluster, a topic is mastered on exactly one node (consistent hash
//! over live nodes); other nodes run *proxy* topics that relay client
//! traffic to the master through a multiplexing session.
//!
//! Transports, store backends, push connectors and the cluster wire are
//! pluggable and out of scope; their contracts live in `store`, `push` and
//! `cluster`.

pub mod access;
pub mod cluster;
pub mod config;
pub mod error;
pub mod hub;
pub mod presence;
pub mod proto;
pub mod push;
pub mod session;
pub mod store;
pub mod topic;
pub mod types;

pub use access::AccessMode;
pub use config::Config;
pub use hub::Hub;
pub use proto::{ClientMsg, ClientPayload, ServerMsg, ServerPayload};
pub use session::{Proto, Session};
pub use store::{MemoryStore, Store};
pub use types::{TopicCat, Uid};
