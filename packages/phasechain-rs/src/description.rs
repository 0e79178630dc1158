//! Handler descriptions: a handler plus its placement rules and parameters.
//!
//! Descriptions are what deployment configuration produces. A
//! [`Phase`](crate::Phase) consumes them through
//! [`add_handler`](crate::Phase::add_handler) and keeps only the handler.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PhaseError;
use crate::handler::{Handler, HandlerName};

// =============================================================================
// Phase Rule
// =============================================================================

/// Placement rules declared by a handler.
///
/// Empty strings count as "not set", matching descriptors that write
/// `before=""` for an unconstrained handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    after: Option<String>,
    #[serde(default)]
    phase_first: bool,
    #[serde(default)]
    phase_last: bool,
}

impl PhaseRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the phase this handler belongs to.
    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    /// Place this handler before the handler with the given local name.
    pub fn before(mut self, handler: impl Into<String>) -> Self {
        self.before = Some(handler.into());
        self
    }

    /// Place this handler after the handler with the given local name.
    pub fn after(mut self, handler: impl Into<String>) -> Self {
        self.after = Some(handler.into());
        self
    }

    pub fn phase_first(mut self) -> Self {
        self.phase_first = true;
        self
    }

    pub fn phase_last(mut self) -> Self {
        self.phase_last = true;
        self
    }

    pub fn phase(&self) -> Option<&str> {
        non_empty(&self.phase)
    }

    pub fn before_target(&self) -> Option<&str> {
        non_empty(&self.before)
    }

    pub fn after_target(&self) -> Option<&str> {
        non_empty(&self.after)
    }

    pub fn is_phase_first(&self) -> bool {
        self.phase_first
    }

    pub fn is_phase_last(&self) -> bool {
        self.phase_last
    }

    /// Relative ordering category of this rule.
    pub fn constraint(&self) -> Constraint<'_> {
        match (self.before_target(), self.after_target()) {
            (Some(before), Some(after)) => Constraint::Both { before, after },
            (Some(before), None) => Constraint::Before(before),
            (None, Some(after)) => Constraint::After(after),
            (None, None) => Constraint::Anywhere,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Relative ordering requested by a [`PhaseRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint<'a> {
    /// Before one handler and after another.
    Both { before: &'a str, after: &'a str },
    Before(&'a str),
    After(&'a str),
    /// No relative constraint.
    Anywhere,
}

impl Constraint<'_> {
    pub fn is_anywhere(&self) -> bool {
        matches!(self, Constraint::Anywhere)
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// A configuration parameter attached to a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Value,
    /// Locked parameters cannot be overridden by narrower configuration.
    #[serde(default)]
    pub locked: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            locked: false,
        }
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }
}

/// Insertion-ordered set of parameters, unique by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(Vec<Parameter>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter. A locked parameter is never replaced;
    /// returns `false` in that case.
    pub fn insert(&mut self, parameter: Parameter) -> bool {
        match self.0.iter_mut().find(|p| p.name == parameter.name) {
            Some(existing) if existing.locked => false,
            Some(existing) => {
                *existing = parameter;
                true
            }
            None => {
                self.0.push(parameter);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.0.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Parameter> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        let mut set = ParameterSet::new();
        for parameter in iter {
            set.insert(parameter);
        }
        set
    }
}

// =============================================================================
// Handler Description
// =============================================================================

/// A handler together with its placement rules and parameters.
///
/// # Example
///
/// ```ignore
/// let desc = HandlerDescription::new(Arc::new(SignatureHandler::new()))
///     .with_rule(PhaseRule::new().in_phase("Security").after("Timestamp"))
///     .with_parameter(Parameter::new("algorithm", "rsa-sha256"));
///
/// phase.add_handler(&desc)?;
/// ```
#[derive(Clone)]
pub struct HandlerDescription {
    handler: Arc<dyn Handler>,
    rules: PhaseRule,
    parameters: ParameterSet,
}

impl HandlerDescription {
    /// Describe a handler with no rules (placed anywhere) and no parameters.
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            rules: PhaseRule::default(),
            parameters: ParameterSet::default(),
        }
    }

    pub fn with_rule(mut self, rules: PhaseRule) -> Self {
        self.rules = rules;
        self
    }

    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.rules = self.rules.in_phase(phase);
        self
    }

    pub fn before(mut self, handler: impl Into<String>) -> Self {
        self.rules = self.rules.before(handler);
        self
    }

    pub fn after(mut self, handler: impl Into<String>) -> Self {
        self.rules = self.rules.after(handler);
        self
    }

    pub fn phase_first(mut self) -> Self {
        self.rules = self.rules.phase_first();
        self
    }

    pub fn phase_last(mut self) -> Self {
        self.rules = self.rules.phase_last();
        self
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.insert(parameter);
        self
    }

    pub fn with_parameters(mut self, parameters: ParameterSet) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn name(&self) -> &HandlerName {
        self.handler.name()
    }

    pub fn rules(&self) -> &PhaseRule {
        &self.rules
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Check the rule set for contradictions that do not depend on what is
    /// already in the phase.
    ///
    /// # Errors
    ///
    /// - [`PhaseError::AmbiguousConstraint`] if before and after name the
    ///   same handler
    /// - [`PhaseError::PinnedWithRelativeConstraint`] if a phaseFirst or
    ///   phaseLast handler also declares before or after
    pub fn validate(&self, phase: &str) -> Result<(), PhaseError> {
        let constraint = self.rules.constraint();

        if let Constraint::Both { before, after } = constraint {
            if before == after {
                return Err(PhaseError::AmbiguousConstraint {
                    phase: phase.to_string(),
                    handler: self.name().to_string(),
                    target: before.to_string(),
                });
            }
        }

        if (self.rules.phase_first || self.rules.phase_last) && !constraint.is_anywhere() {
            return Err(PhaseError::PinnedWithRelativeConstraint {
                phase: phase.to_string(),
                handler: self.name().to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Debug for HandlerDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescription")
            .field("name", self.name())
            .field("rules", &self.rules)
            .field("parameters", &self.parameters)
            .finish()
    }
}
