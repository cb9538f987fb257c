use std::fmt;
use std::sync::Arc;

/// Source of the bearer token attached to each connect attempt.
///
/// The token is read again on every attempt, so a source backed by a
/// refreshing auth collaborator hands out the current value after a reconnect.
#[derive(Clone)]
pub struct Credentials {
    source: Arc<dyn Fn() -> Option<String> + Send + Sync>,
}

impl Credentials {
    /// No token; the broker receives an empty `Authorization` value.
    pub fn anonymous() -> Self {
        Self::from_fn(|| None)
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        let token = token.into();
        Self::from_fn(move || Some(token.clone()))
    }

    pub fn from_fn<F>(source: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(source),
        }
    }

    pub fn token(&self) -> Option<String> {
        (self.source)().filter(|token| !token.is_empty())
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl From<Option<String>> for Credentials {
    fn from(token: Option<String>) -> Self {
        match token {
            Some(token) => Self::bearer(token),
            None => Self::anonymous(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present = self.token().is_some();
        f.debug_struct("Credentials")
            .field("token", if present { &"<redacted>" } else { &"<none>" })
            .finish()
    }
}
