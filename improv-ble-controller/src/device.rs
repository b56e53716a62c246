use improv_proto::Capabilities;

/// A discovered Improv device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    address: String,
    name: String,
    capabilities: Option<Capabilities>,
}

#[derive(Debug, thiserror::Error)]
#[error("capabilities of {0} were already negotiated")]
pub struct CapabilitiesAlreadySet(pub String);

impl DeviceHandle {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            capabilities: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Negotiated capabilities, empty until the first capability read
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.unwrap_or_default()
    }

    pub fn is_negotiated(&self) -> bool {
        self.capabilities.is_some()
    }

    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities().contains(capability)
    }

    pub(crate) fn set_capabilities(
        &mut self,
        capabilities: Capabilities,
    ) -> Result<(), CapabilitiesAlreadySet> {
        if self.capabilities.is_some() {
            return Err(CapabilitiesAlreadySet(self.address.clone()));
        }
        self.capabilities = Some(capabilities);
        Ok(())
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}
