use thiserror::Error;

/// Failure talking to the upstream API
#[derive(Error, Debug)]
pub enum FetchError {
    /// Worth retrying: network failure, 429 or 5xx
    #[error("Transient fetch error{}: {message}", status_suffix(.status))]
    Transient { status: Option<u16>, message: String },

    /// Retrying cannot help: bad request, rejected credentials, malformed body
    #[error("Terminal fetch error{}: {message}", status_suffix(.status))]
    Terminal { status: Option<u16>, message: String },

    /// Every attempt failed transiently
    #[error("Fetch gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl FetchError {
    pub fn transient(status: Option<u16>, message: impl Into<String>) -> Self {
        FetchError::Transient {
            status,
            message: message.into(),
        }
    }

    pub fn terminal(status: Option<u16>, message: impl Into<String>) -> Self {
        FetchError::Terminal {
            status,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    /// Classify an HTTP status that is not a success
    pub fn from_status(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        match status {
            401 => FetchError::terminal(
                Some(status),
                "credentials rejected; check EPC_EMAIL and EPC_API_KEY",
            ),
            429 | 500..=599 => FetchError::transient(Some(status), snippet),
            _ => FetchError::terminal(Some(status), snippet),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return FetchError::terminal(None, err.to_string());
        }
        match err.status() {
            Some(status) => FetchError::from_status(status.as_u16(), &err.to_string()),
            None => FetchError::transient(None, err.to_string()),
        }
    }
}
