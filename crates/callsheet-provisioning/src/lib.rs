//! Remote provisioning steps for Callsheet.
//!
//! Long-running cloud operations (template deployments, resource-group
//! deletions, CDS database creation, LUIS training) answer their initial request
//! with a tracking URI. This crate turns such calls into [`OperationStep`]s the
//! runner can sequence: [`TrackedRequest`] sends the request through a
//! [`ProvisioningSession`] and waits with [`poll_to_completion`].
//!
//! [`OperationStep`]: callsheet_abstraction::OperationStep

pub mod error;
pub mod poll;
pub mod session;
pub mod steps;
pub mod token;

pub use error::{ProvisioningError, Result};
pub use poll::{
    InitialResponse, PollOutcome, PollPolicy, PollReading, PollSource, PollState, StatusSchema,
    Tracking, poll_to_completion,
};
pub use session::{Endpoints, HttpReply, ProvisioningSession, SessionPollSource};
pub use steps::{ExistenceCheck, TrackedRequest};
pub use token::{AccessToken, StaticTokenSource, TokenCache, TokenSource};
