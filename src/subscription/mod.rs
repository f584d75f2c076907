//! Subscription registry and multiplexing.
//!
//! Many consumers share one connection; each `subscribe` adds a handler to
//! the channel's ordered list and returns a [`SubscriptionHandle`] that
//! removes exactly that handler.

mod handle;
mod registry;
mod types;

pub use handle::{SubscriptionControl, SubscriptionHandle};
pub use registry::{validate_channel, Registration, Rejection, Removal, Resumed, SubscriptionRegistry};
pub use types::{
    DispatchOutcome, ErrorHandler, MessageHandler, SubscriptionId, SubscriptionInfo,
    SubscriptionOptions,
};
