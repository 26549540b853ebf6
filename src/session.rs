//! Per-connection session identity

use serde::{Deserialize, Serialize};
use url::Url;

use crate::protocol::DynamicVariable;
use crate::{Error, Result};

/// Call parameters shared by every connection of a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParams {
    pub agent_name: String,
    pub customer_name: String,
    pub amount: String,
    pub due_date: String,
}

impl Default for CallParams {
    fn default() -> Self {
        Self {
            agent_name: "Pooja".to_string(),
            customer_name: "Ram".to_string(),
            amount: "15000".to_string(),
            due_date: "20th".to_string(),
        }
    }
}

/// Identity of one connection attempt
///
/// The parameters are fixed for the client's lifetime; the token is
/// regenerated for every attempt so the server sees each reconnect as a
/// fresh session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    params: CallParams,
    token: String,
}

impl SessionIdentity {
    /// Identity with a token derived from the current time in milliseconds
    #[must_use]
    pub fn fresh(params: &CallParams) -> Self {
        Self::with_token(params, chrono::Utc::now().timestamp_millis().to_string())
    }

    #[must_use]
    pub fn with_token(params: &CallParams, token: impl Into<String>) -> Self {
        Self {
            params: params.clone(),
            token: token.into(),
        }
    }

    #[must_use]
    pub const fn params(&self) -> &CallParams {
        &self.params
    }

    /// Numeric session token sent as `sid`
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Connection URL with the identity as percent-encoded query parameters
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `base` is not a valid URL
    pub fn url(&self, base: &str) -> Result<Url> {
        let mut url =
            Url::parse(base).map_err(|e| Error::Config(format!("invalid stream url {base}: {e}")))?;

        let query = [
            ("agent_name", self.params.agent_name.as_str()),
            ("customer_name", self.params.customer_name.as_str()),
            ("amount", self.params.amount.as_str()),
            ("due_date", self.params.due_date.as_str()),
            ("sid", self.token.as_str()),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

        let merged = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
            _ => query,
        };
        url.set_query(Some(&merged));
        Ok(url)
    }

    /// Identity as initiation dynamic variables
    #[must_use]
    pub fn dynamic_variables(&self) -> Vec<DynamicVariable> {
        vec![
            DynamicVariable::new("agent_name", &self.params.agent_name),
            DynamicVariable::new("customer_name", &self.params.customer_name),
            DynamicVariable::new("amount", &self.params.amount),
            DynamicVariable::new("due_date", &self.params.due_date),
            DynamicVariable::new("sid", &self.token),
        ]
    }
}
