use crate::error::Error;

use std::collections::BTreeMap;
use std::sync::Arc;

/// Call shape of a method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// One request, one reply.
    Unary,
    /// One request, many replies.
    ServerStreaming,
    /// Requests and replies both stream.
    BidiStreaming,
}

impl MethodKind {
    /// Whether the method is served through a stream.
    pub const fn is_streaming(self) -> bool {
        !matches!(self, Self::Unary)
    }
}

/// Describes a single method of a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    name: String,
    kind: MethodKind,
    subject_suffix: Option<String>,
    skip_inputs: bool,
}

impl MethodDescriptor {
    /// A method of the given kind.
    pub fn new(name: impl Into<String>, kind: MethodKind) -> Self {
        Self {
            name: name.into(),
            kind,
            subject_suffix: None,
            skip_inputs: false,
        }
    }

    /// A unary method.
    pub fn unary(name: impl Into<String>) -> Self {
        Self::new(name, MethodKind::Unary)
    }

    /// A server-streaming method.
    pub fn server_streaming(name: impl Into<String>) -> Self {
        Self::new(name, MethodKind::ServerStreaming)
    }

    /// A bidirectional streaming method.
    pub fn bidi_streaming(name: impl Into<String>) -> Self {
        Self::new(name, MethodKind::BidiStreaming)
    }

    /// Replaces the name-derived subject tokens with `suffix`.
    #[must_use]
    pub fn with_subject_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.subject_suffix = Some(suffix.into());
        self
    }

    /// Marks the method as write-only: the server does not subscribe to it
    /// and clients refuse to call it.
    #[must_use]
    pub const fn with_skip_inputs(mut self, skip_inputs: bool) -> Self {
        self.skip_inputs = skip_inputs;
        self
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call shape.
    pub const fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Subject suffix override.
    pub fn subject_suffix(&self) -> Option<&str> {
        self.subject_suffix.as_deref()
    }

    /// Whether inputs are disabled.
    pub const fn skip_inputs(&self) -> bool {
        self.skip_inputs
    }
}

/// Describes a service: its package-qualified name and methods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    full_name: String,
    methods: Vec<MethodDescriptor>,
    subject_prefix: Option<String>,
}

impl ServiceDescriptor {
    /// A service without methods. `full_name` is package qualified, e.g.
    /// `types.rpc.TestService`.
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            methods: Vec::new(),
            subject_prefix: None,
        }
    }

    /// Adds a method.
    #[must_use]
    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// Replaces the name-derived service tokens with `prefix`.
    #[must_use]
    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = Some(prefix.into());
        self
    }

    /// Package-qualified name.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Last component of the full name.
    pub fn name(&self) -> &str {
        self.full_name
            .rsplit_once('.')
            .map_or(self.full_name.as_str(), |(_, name)| name)
    }

    /// Last component of the package, or `""` for unqualified services.
    pub fn package_name(&self) -> &str {
        self.full_name
            .rsplit_once('.')
            .map_or("", |(package, _)| {
                package.rsplit_once('.').map_or(package, |(_, name)| name)
            })
    }

    /// Subject prefix override.
    pub fn subject_prefix(&self) -> Option<&str> {
        self.subject_prefix.as_deref()
    }

    /// All methods.
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Looks up a method by name.
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|method| method.name == name)
    }
}

/// Descriptor lookup shared by registrars and client connections.
#[derive(Clone, Debug, Default)]
pub struct DescriptorRegistry {
    services: BTreeMap<String, Arc<ServiceDescriptor>>,
}

impl DescriptorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service descriptor.
    ///
    /// # Errors
    /// `DuplicateService` if the full name is taken.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<(), Error> {
        if self.services.contains_key(descriptor.full_name()) {
            return Err(Error::DuplicateService(descriptor.full_name));
        }

        self.services
            .insert(descriptor.full_name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Looks up a service by full name.
    pub fn service(&self, full_name: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.services.get(full_name)
    }

    /// Resolves a method path of the form `/{service}/{method}`.
    ///
    /// # Errors
    /// `InvalidMethod` for malformed paths, `UnknownService` and
    /// `UnknownMethod` for lookups that fail.
    pub fn resolve(&self, path: &str) -> Result<(&ServiceDescriptor, &MethodDescriptor), Error> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let Some((service_name, method_name)) = trimmed.split_once('/') else {
            return Err(Error::InvalidMethod(path.to_string()));
        };
        if service_name.is_empty() || method_name.is_empty() || method_name.contains('/') {
            return Err(Error::InvalidMethod(path.to_string()));
        }

        let service = self
            .services
            .get(service_name)
            .ok_or_else(|| Error::UnknownService(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .ok_or_else(|| Error::UnknownMethod {
                service: service_name.to_string(),
                method: method_name.to_string(),
            })?;

        Ok((service, method))
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
