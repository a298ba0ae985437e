#[derive(Clone)]
pub struct OmpaError {
    exit_code: u8,
    message: String,
}

impl OmpaError {
    /// Exit-code conventions:
    /// - 2: configuration errors (bad weights, unknown tracers, export flags)
    /// - 3: data-quality errors (missing coordinate columns, non-finite cells)
    /// - 4: solver failures and internal invariant violations
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for OmpaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for OmpaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OmpaError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for OmpaError {}
