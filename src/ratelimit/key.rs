//! Rate key generation.

/// The namespaced identity a counter and a block are stored under.
///
/// Address keys and token keys carry different prefixes, so an address and a
/// token with the same text never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    /// A client network address
    Address(String),
    /// A registered access token
    Token(String),
}

impl RateKey {
    /// Create an address-scoped key.
    pub fn address(address: &str) -> Self {
        RateKey::Address(address.to_string())
    }

    /// Create a token-scoped key.
    pub fn token(token: &str) -> Self {
        RateKey::Token(token.to_string())
    }

    /// The namespace prefix of this key.
    pub fn namespace(&self) -> &'static str {
        match self {
            RateKey::Address(_) => "ip",
            RateKey::Token(_) => "token",
        }
    }

    /// The raw subject value without its namespace.
    pub fn subject(&self) -> &str {
        match self {
            RateKey::Address(value) | RateKey::Token(value) => value,
        }
    }

    /// The string handed to the counter store.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.namespace(), self.subject())
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace(), self.subject())
    }
}
