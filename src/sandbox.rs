//! Sandbox policies: which tags, filters, functions, methods and properties a
//! sandboxed template may use.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{SecurityError, SecurityErrorKind};
use crate::extension::{CoreTag, Extension, TagHandler, VisitorKind};
use crate::value::Object;

/// Method name checked before a host object is converted to a string.
pub const TO_STRING_METHOD: &str = "__toString";

/// Decides what sandboxed templates may do.
pub trait SecurityPolicy: fmt::Debug + Send + Sync {
    /// Checks the tags, filters and functions a template uses, before it
    /// renders anything.
    ///
    /// # Errors
    ///
    /// The first disallowed name.
    fn check_security(
        &self,
        tags: &[&str],
        filters: &[&str],
        functions: &[&str],
    ) -> Result<(), SecurityError>;

    /// # Errors
    ///
    /// When the method may not be called on this object.
    fn check_method_allowed(&self, object: &dyn Object, method: &str) -> Result<(), SecurityError>;

    /// # Errors
    ///
    /// When the property may not be read on this object.
    fn check_property_allowed(&self, object: &dyn Object, property: &str) -> Result<(), SecurityError>;
}

/// A policy built from explicit allow lists.
///
/// Objects are matched by [`Object::class_name`]. Method names compare
/// case-insensitively, property names exactly.
///
/// # Examples
///
/// ```rust
/// use twiglet::sandbox::AllowListPolicy;
///
/// let policy = AllowListPolicy::new()
///     .allow_tags(["if", "for"])
///     .allow_filters(["upper"])
///     .allow_methods("Article", ["getTitle"]);
/// assert!(policy.allows_tag("if"));
/// assert!(!policy.allows_tag("include"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct AllowListPolicy {
    tags: HashSet<String>,
    filters: HashSet<String>,
    functions: HashSet<String>,
    methods: HashMap<String, HashSet<String>>,
    properties: HashMap<String, HashSet<String>>,
}

impl AllowListPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn allow_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters.extend(filters.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn allow_functions<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.functions.extend(functions.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn allow_methods<I, S>(mut self, class: &str, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods
            .entry(class.to_owned())
            .or_default()
            .extend(methods.into_iter().map(|m| m.into().to_lowercase()));
        self
    }

    #[must_use]
    pub fn allow_properties<I, S>(mut self, class: &str, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties
            .entry(class.to_owned())
            .or_default()
            .extend(properties.into_iter().map(Into::into));
        self
    }

    pub fn allows_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

impl SecurityPolicy for AllowListPolicy {
    fn check_security(
        &self,
        tags: &[&str],
        filters: &[&str],
        functions: &[&str],
    ) -> Result<(), SecurityError> {
        if let Some(tag) = tags.iter().find(|tag| !self.tags.contains(**tag)) {
            return Err(SecurityError::new(SecurityErrorKind::NotAllowedTag {
                tag: (*tag).to_owned(),
            }));
        }
        if let Some(filter) = filters.iter().find(|filter| !self.filters.contains(**filter)) {
            return Err(SecurityError::new(SecurityErrorKind::NotAllowedFilter {
                filter: (*filter).to_owned(),
            }));
        }
        if let Some(function) = functions
            .iter()
            .find(|function| !self.functions.contains(**function))
        {
            return Err(SecurityError::new(SecurityErrorKind::NotAllowedFunction {
                function: (*function).to_owned(),
            }));
        }
        Ok(())
    }

    fn check_method_allowed(&self, object: &dyn Object, method: &str) -> Result<(), SecurityError> {
        let allowed = self
            .methods
            .get(object.class_name())
            .is_some_and(|methods| methods.contains(&method.to_lowercase()));
        if allowed {
            return Ok(());
        }
        Err(SecurityError::new(SecurityErrorKind::NotAllowedMethod {
            class: object.class_name().to_owned(),
            method: method.to_owned(),
        }))
    }

    fn check_property_allowed(&self, object: &dyn Object, property: &str) -> Result<(), SecurityError> {
        let allowed = self
            .properties
            .get(object.class_name())
            .is_some_and(|properties| properties.contains(property));
        if allowed {
            return Ok(());
        }
        Err(SecurityError::new(SecurityErrorKind::NotAllowedProperty {
            class: object.class_name().to_owned(),
            property: property.to_owned(),
        }))
    }
}

/// Adds the `sandbox` tag, the sandbox pass and a policy.
///
/// Templates are checked against the policy when the environment is created
/// with [`EnvironmentOptions::sandboxed`](crate::EnvironmentOptions), and
/// inside `{% sandbox %}` bodies and sandboxed includes otherwise.
#[derive(Debug, Clone)]
pub struct SandboxExtension {
    policy: Arc<dyn SecurityPolicy>,
}

impl SandboxExtension {
    pub fn new<P: SecurityPolicy + 'static>(policy: P) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &Arc<dyn SecurityPolicy> {
        &self.policy
    }
}

impl Extension for SandboxExtension {
    fn name(&self) -> &str {
        "sandbox"
    }

    fn token_parsers(&self) -> Vec<TagHandler> {
        vec![TagHandler::Core(CoreTag::Sandbox)]
    }

    fn node_visitors(&self) -> Vec<VisitorKind> {
        vec![VisitorKind::Sandbox]
    }

    fn security_policy(&self) -> Option<Arc<dyn SecurityPolicy>> {
        Some(Arc::clone(&self.policy))
    }
}
