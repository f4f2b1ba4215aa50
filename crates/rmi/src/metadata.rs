//! # Method Metadata
//!
//! Per-method marshaling declarations, fixed when the method is defined.

/// How one argument (or a return value) crosses the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterType {
    /// Plain structured data, copied by value.
    #[default]
    Serializable,
    /// A function the peer may invoke any number of times.
    Callback,
    /// A registered instance, sent by namespace id.
    RemoteObject,
}

/// Name and marshaling policy of one method.
///
/// Positions beyond the declared parameters are `Serializable`, as is an
/// undeclared return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodMetadata {
    name: String,
    params: Vec<ParameterType>,
    returns: ParameterType,
}

impl MethodMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), params: Vec::new(), returns: ParameterType::Serializable }
    }

    /// Declares the next parameter.
    pub fn param(mut self, ty: ParameterType) -> Self {
        self.params.push(ty);
        self
    }

    pub fn params(mut self, types: impl IntoIterator<Item = ParameterType>) -> Self {
        self.params.extend(types);
        self
    }

    pub fn returns(mut self, ty: ParameterType) -> Self {
        self.returns = ty;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_type(&self, position: usize) -> ParameterType {
        self.params.get(position).copied().unwrap_or_default()
    }

    pub fn declared_params(&self) -> &[ParameterType] {
        &self.params
    }

    pub fn return_type(&self) -> ParameterType {
        self.returns
    }
}

impl From<&str> for MethodMetadata {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for MethodMetadata {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}
