//! Channel URI strings of the form `prefix:media?key=value|key=value`.

use std::fmt;

use crate::error::BackupError;

/// Name of the endpoint parameter in a channel URI.
pub const ENDPOINT_PARAM_NAME: &str = "endpoint";

/// Name of the session-id parameter used to pin a replay subscription.
pub const SESSION_ID_PARAM_NAME: &str = "session-id";

/// A parsed channel URI.
///
/// Parameters keep their insertion order so a round-tripped URI is stable,
/// and `put` on an existing key updates it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    prefix: String,
    media: String,
    params: Vec<(String, String)>,
}

impl ChannelUri {
    /// Parse `prefix:media` or `prefix:media?key=value|key=value`.
    pub fn parse(uri: &str) -> Result<Self, BackupError> {
        let bad = |reason: &str| BackupError::Channel {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = uri.split_once(':').ok_or_else(|| bad("missing ':' separator"))?;
        if scheme.is_empty() {
            return Err(bad("empty prefix"));
        }

        let (media, query) = match rest.split_once('?') {
            Some((media, query)) => (media, Some(query)),
            None => (rest, None),
        };
        if media.is_empty() {
            return Err(bad("empty media"));
        }

        let mut params = Vec::new();
        if let Some(query) = query {
            for pair in query.split('|') {
                let (key, value) = pair.split_once('=').ok_or_else(|| bad("parameter without '='"))?;
                if key.is_empty() {
                    return Err(bad("parameter with empty key"));
                }
                params.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Self {
            prefix: scheme.to_string(),
            media: media.to_string(),
            params,
        })
    }

    /// Set `key` to `value`, replacing an existing entry.
    pub fn put(&mut self, key: &str, value: impl ToString) -> &mut Self {
        let value = value.to_string();
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.params.push((key.to_string(), value)),
        }
        self
    }

    /// Look up a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.media)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '|' };
            write!(f, "{}{}={}", sep, k, v)?;
        }
        Ok(())
    }
}
