//! Connector contracts and descriptors.
//!
//! A connector is an interchangeable backend capable of producing text
//! completions. The core consumes backends only through the
//! [`CompletionProvider`] capability and the [`TokenCounter`] accounting
//! hook; everything wire-level lives outside this crate.

pub mod arithmetic;
pub mod named;
pub mod provider;

pub use arithmetic::{ArithmeticEngine, ArithmeticOperation, ArithmeticProvider};
pub use named::{MaxTokensAdjustment, NamedConnector};
pub use provider::{CompletionProvider, CompletionStream, TokenCounter, whitespace_token_counter};
