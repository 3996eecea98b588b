//! # cnet-contract
//!
//! Contract-net negotiation core: the manager and contractor halves of a
//! work-announcement protocol, driven entirely by inbound messages and
//! wall-clock deadlines.
//!
//! This crate provides:
//!
//! - **Manager role** — [`Manager`] announces work, collects bids, grants,
//!   and acknowledges final reports
//! - **Contractor role** — [`Contractor`] answers an announcement with a
//!   bid, refusal or delegation and carries granted work to completion
//! - **Policy traits** — [`ManagerPolicy`] / [`ContractorPolicy`] embed the
//!   business logic; every protocol decision arrives as a hook call
//! - **Runtimes** — [`TokioRuntime`](live::TokioRuntime) for real time,
//!   [`EmuRuntime`](emu::EmuRuntime) with a manual clock for tests
//!
//! ## Example
//!
//! ```rust
//! use cnet_contract::emu::EmuRuntime;
//! use cnet_contract::error::ProtocolError;
//! use cnet_contract::manager::{Manager, ManagerCore, ManagerPolicy};
//! use cnet_contract::state::ContractState;
//! use cnet_proto::{ContractMessage, Recipient};
//!
//! struct Survey;
//!
//! impl ManagerPolicy for Survey {
//!     fn protocol_id(&self) -> &str {
//!         "survey"
//!     }
//!
//!     fn initiate(&mut self, core: &mut ManagerCore) -> Result<(), ProtocolError> {
//!         core.announce(ContractMessage::announcement())?;
//!         Ok(())
//!     }
//! }
//!
//! let runtime = EmuRuntime::new();
//! let mut manager = Manager::new(
//!     runtime.handle(),
//!     vec![Recipient::broadcast("workers")],
//!     Survey,
//! );
//! manager.initiate()?;
//! assert_eq!(manager.state(), ContractState::Announced);
//! # Ok::<(), ProtocolError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod contractor;
pub mod dispatch;
pub mod emu;
pub mod error;
pub mod expiration;
pub mod live;
pub mod machine;
pub mod manager;
pub mod record;
pub mod reporter;
pub mod runtime;
pub mod state;

pub use channel::Channel;
pub use contractor::{Contractor, ContractorCore, ContractorPolicy};
pub use error::ProtocolError;
pub use expiration::{ExpirationScheduler, TimerId};
pub use machine::StateMachine;
pub use manager::{Manager, ManagerCore, ManagerPolicy};
pub use record::{ContractorRecord, ContractorRecords};
pub use runtime::{Listener, Runtime, SharedListener, TimerHandle};
pub use state::{ContractState, RecordState};
