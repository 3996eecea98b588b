//! # cnet-proto
//!
//! Wire vocabulary for the contract-net negotiation protocol.
//!
//! This crate defines the messages exchanged between a manager (the role
//! announcing work) and its contractors (the roles bidding on it), plus the
//! identifiers and addressing types both sides stamp onto them. It is pure
//! data: no transport, no timers, no state machines — those live in
//! `cnet-contract`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod message;
pub mod recipient;
pub mod types;

pub use message::{ContractMessage, MessageBody, MessageKind};
pub use recipient::{Recipient, RecipientKind};
pub use types::{MessageId, SessionId};
