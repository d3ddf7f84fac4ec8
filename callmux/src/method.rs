use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Message sequence a call follows.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Pattern {
    /// One request, one response.
    #[default]
    Unary,
    /// One request, zero or more responses.
    ServerStream,
    /// Zero or more requests, one response.
    ClientStream,
    /// Requests and responses interleave freely.
    BidiStream,
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Fully qualified method identifier, written `Service/Method` on the wire.
///
/// ```rust
/// # use callmux::MethodId;
/// const SAY_HELLO: MethodId = MethodId::from_static("Foo", "SayHello");
/// assert_eq!(SAY_HELLO.to_string(), "Foo/SayHello");
/// assert_eq!("Foo/SayHello".parse::<MethodId>().unwrap(), SAY_HELLO);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    service: Cow<'static, str>,
    method: Cow<'static, str>,
}

impl MethodId {
    #[must_use]
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: Cow::Owned(service.into()),
            method: Cow::Owned(method.into()),
        }
    }

    #[must_use]
    pub const fn from_static(service: &'static str, method: &'static str) -> Self {
        Self {
            service: Cow::Borrowed(service),
            method: Cow::Borrowed(method),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

impl std::str::FromStr for MethodId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((service, method))
                if !service.is_empty() && !method.is_empty() && !method.contains('/') =>
            {
                Ok(Self::new(service, method))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("invalid method id: {s:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method_id() {
        let id: MethodId = "Bar/CollectMessages".parse().unwrap();
        assert_eq!(id.service(), "Bar");
        assert_eq!(id.method(), "CollectMessages");
        assert_eq!(id, MethodId::from_static("Bar", "CollectMessages"));

        for invalid in ["", "Bar", "/GetInfo", "Bar/", "a/b/c"] {
            let err = invalid.parse::<MethodId>().unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn test_pattern_serde() {
        let json = serde_json::to_string(&Pattern::ServerStream).unwrap();
        assert_eq!(json, "\"ServerStream\"");
        assert_eq!(Pattern::default(), Pattern::Unary);
    }
}
