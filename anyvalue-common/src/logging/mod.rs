// Logging utilities for the AnyValue crates
//
// This module provides a small structured logging layer on top of the `log` facade:
// - Component-based prefixes
// - Instance id tracking through logger inheritance
// - Allocation-free `*_args` variants

use log::{debug, warn};
use std::fmt::{self, Arguments, Display, Formatter};

/// Predefined components for logging categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Registry,
    ResolverCache,
    Keys,
    System,
    Custom(&'static str),
}

impl Component {
    /// Get the string representation of the component
    pub fn as_str(&self) -> &str {
        match self {
            Component::Registry => "Registry",
            Component::ResolverCache => "ResolverCache",
            Component::Keys => "Keys",
            Component::System => "System",
            Component::Custom(name) => name,
        }
    }
}

// Lightweight Display helper to avoid prefix String allocations
struct ComponentPrefixDisplay {
    parent: Option<Component>,
    component: Component,
}

impl Display for ComponentPrefixDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) if parent != Component::System => {
                write!(f, "{}.{}", parent.as_str(), self.component.as_str())
            }
            _ => write!(f, "{}", self.component.as_str()),
        }
    }
}

/// A helper for creating component-specific loggers with instance id tracking
#[derive(Clone, Debug)]
pub struct Logger {
    component: Component,
    instance_id: String,
    parent_component: Option<Component>,
}

impl Logger {
    /// Create a new root logger for a component and instance id
    pub fn new_root(component: Component, instance_id: &str) -> Self {
        Self {
            component,
            instance_id: instance_id.to_string(),
            parent_component: None,
        }
    }

    /// Create a child logger with the same instance id but a different component
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            instance_id: self.instance_id.clone(),
            parent_component: Some(self.component),
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn prefix(&self) -> ComponentPrefixDisplay {
        ComponentPrefixDisplay {
            parent: self.parent_component,
            component: self.component,
        }
    }

    /// Log a debug message
    pub fn debug(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Debug) {
            debug!("[{}][{}] {}", self.instance_id, self.prefix(), message.into());
        }
    }

    /// Log a debug message using fmt::Arguments (avoids allocating message String)
    pub fn debug_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Debug) {
            debug!("[{}][{}] {}", self.instance_id, self.prefix(), args);
        }
    }

    /// Log a warning using fmt::Arguments
    pub fn warn_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Warn) {
            warn!("[{}][{}] {}", self.instance_id, self.prefix(), args);
        }
    }
}
