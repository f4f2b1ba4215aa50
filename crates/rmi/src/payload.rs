/// A value together with the namespace and method it belongs to.
///
/// Marshaling rewraps intermediate encodings with `new_payload` so errors and
/// registrations made along the way still know which call produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload<T> {
    data: T,
    namespace: String,
    method: String,
}

impl<T> Payload<T> {
    pub fn new(data: T, namespace: impl Into<String>, method: impl Into<String>) -> Self {
        Self { data, namespace: namespace.into(), method: method.into() }
    }

    /// Same namespace and method, different data.
    pub fn new_payload<U>(&self, data: U) -> Payload<U> {
        Payload { data, namespace: self.namespace.clone(), method: self.method.clone() }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}
