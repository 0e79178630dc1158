//! Handler trait and qualified handler names.
//!
//! Handlers are the processing units of a pipeline. They are **shared**:
//! one instance serves every in-flight message, so anything a handler needs
//! to remember about a particular message lives on the [`MessageContext`].
//!
//! # Key Properties
//!
//! - **Named**: identity inside a phase is the local part of the name
//! - **Stateless across messages**: per-message state goes on the context
//! - **Three outcomes**: continue, suspend, or fault (`Err`)
//! - **Explicit resume**: the handler that suspended is told it is resuming

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::MessageContext;

/// Qualified name of a handler (optional namespace plus local part).
///
/// Ordering constraints and duplicate detection compare local parts only,
/// so `{urn:security}Signer` and `Signer` refer to the same slot in a phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    local: String,
}

impl HandlerName {
    /// Create an unqualified name.
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            namespace: None,
            local: local.into(),
        }
    }

    /// Create a name qualified by a namespace.
    pub fn qualified(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: (!namespace.is_empty()).then_some(namespace),
            local: local.into(),
        }
    }

    pub fn local_part(&self) -> &str {
        &self.local
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{{{}}}{}", ns, self.local),
            None => f.write_str(&self.local),
        }
    }
}

impl From<&str> for HandlerName {
    fn from(local: &str) -> Self {
        Self::new(local)
    }
}

impl From<String> for HandlerName {
    fn from(local: String) -> Self {
        Self::new(local)
    }
}

/// How a handler is being entered for the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// First invocation of this handler for this pass.
    Fresh,
    /// The handler suspended on a previous call and the phase is retrying
    /// it at the same cursor position.
    Resumed,
}

impl Entry {
    pub fn is_resumed(self) -> bool {
        matches!(self, Entry::Resumed)
    }
}

/// Non-fault outcome of a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResponse {
    /// Processing finished; the phase moves on to the next handler.
    Continue,
    /// An asynchronous operation is outstanding. The phase stops and keeps
    /// its cursor on this handler until the message is resumed.
    Suspend,
}

/// A named unit of message processing.
///
/// Handlers are invoked once per message pass by the [`Phase`](crate::Phase)
/// that owns them. They can:
/// 1. Read and write per-message state on the [`MessageContext`]
/// 2. Return [`HandlerResponse::Continue`] to let the phase proceed
/// 3. Return [`HandlerResponse::Suspend`] (or call [`MessageContext::pause`])
///    to park the message
/// 4. Return `Err` to fault the message; the error reaches the caller unchanged
///
/// # Example
///
/// ```ignore
/// struct AddressingHandler {
///     name: HandlerName,
/// }
///
/// #[async_trait]
/// impl Handler for AddressingHandler {
///     fn name(&self) -> &HandlerName {
///         &self.name
///     }
///
///     async fn invoke(&self, ctx: &mut MessageContext, _entry: Entry) -> Result<HandlerResponse> {
///         let to = ctx.property("wsa.to").cloned().context("missing wsa:To")?;
///         ctx.set_property("dispatch.target", to);
///         Ok(HandlerResponse::Continue)
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Qualified name of this handler.
    fn name(&self) -> &HandlerName;

    /// Process the message.
    ///
    /// `entry` is [`Entry::Resumed`] only for the handler sitting at the
    /// cursor of a suspended phase. A handler re-entered after it faulted
    /// sees [`Entry::Fresh`]. Handlers that never suspend can ignore it.
    async fn invoke(&self, ctx: &mut MessageContext, entry: Entry) -> Result<HandlerResponse>;

    /// Release resources on engine shutdown.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unqualified_name_display() {
        let name = HandlerName::new("Dispatch");
        assert_eq!(name.to_string(), "Dispatch");
        assert_eq!(name.local_part(), "Dispatch");
        assert!(name.namespace().is_none());
    }

    #[test]
    fn test_qualified_name_display() {
        let name = HandlerName::qualified("urn:security", "Signer");
        assert_eq!(name.to_string(), "{urn:security}Signer");
        assert_eq!(name.local_part(), "Signer");
        assert_eq!(name.namespace(), Some("urn:security"));
    }

    #[test]
    fn test_empty_namespace_is_unqualified() {
        let name = HandlerName::qualified("", "Signer");
        assert_eq!(name, HandlerName::new("Signer"));
    }

    #[test]
    fn test_entry_is_resumed() {
        assert!(Entry::Resumed.is_resumed());
        assert!(!Entry::Fresh.is_resumed());
    }

    #[test]
    fn test_name_round_trips_through_json() {
        let name = HandlerName::qualified("urn:a", "B");
        let json = serde_json::to_value(&name).unwrap();
        assert_eq!(json["local"], "B");
        let back: HandlerName = serde_json::from_value(json).unwrap();
        assert_eq!(back, name);
    }
}
