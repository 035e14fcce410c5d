use std::collections::HashMap;

use crate::error::{Error, Result};

/// Raw inbound request as seen by the aggregator: query string plus an
/// optional text body.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub query: HashMap<String, String>,
    pub body: Option<String>,
}

impl Request {
    pub fn from_query<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            query: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Validated parameters: every required name is present and non-blank.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, String>,
    body: Option<String>,
}

impl Params {
    /// Value of a parameter that was declared required.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Value of a required parameter, as an error if it was not declared.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::MissingParameter(name.to_string()))
    }

    /// A required parameter split on commas into distinct non-empty values,
    /// keeping first-seen order.
    pub fn list(&self, name: &str) -> Result<Vec<String>> {
        let raw = self.require(name)?;
        let mut values: Vec<String> = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if !values.iter().any(|v| v == part) {
                values.push(part.to_string());
            }
        }
        if values.is_empty() {
            return Err(Error::MissingParameter(name.to_string()));
        }
        Ok(values)
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Extract `required` from the request. Absent, empty and whitespace-only
/// values are all reported as missing, naming the first one in declaration
/// order.
pub fn validate(request: &Request, required: &[&str]) -> Result<Params> {
    let mut values = HashMap::with_capacity(required.len());
    for &name in required {
        match request.query.get(name) {
            Some(value) if !is_blank(value) => {
                values.insert(name.to_string(), value.trim().to_string());
            }
            _ => return Err(Error::MissingParameter(name.to_string())),
        }
    }

    let body = request
        .body
        .as_deref()
        .filter(|b| !is_blank(b))
        .map(str::to_string);

    Ok(Params { values, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_required_values() {
        let request = Request::from_query([("subscriptionId", "sub-1"), ("workspaceId", "ws-1")]);
        let params = validate(&request, &["subscriptionId", "workspaceId"]).unwrap();
        assert_eq!(params.get("subscriptionId"), Some("sub-1"));
        assert_eq!(params.get("workspaceId"), Some("ws-1"));
    }

    #[test]
    fn absent_key_is_missing() {
        let request = Request::from_query([("subscriptionId", "sub-1")]);
        let err = validate(&request, &["subscriptionId", "workspaceId"]).unwrap_err();
        assert!(matches!(err, Error::MissingParameter(ref n) if n == "workspaceId"));
    }

    #[test]
    fn empty_and_blank_values_are_missing() {
        for value in ["", "   "] {
            let request = Request::from_query([("tenantId", value)]);
            let err = validate(&request, &["tenantId"]).unwrap_err();
            assert!(matches!(err, Error::MissingParameter(ref n) if n == "tenantId"));
        }
    }

    #[test]
    fn first_missing_parameter_is_reported() {
        let request = Request::default();
        let err = validate(&request, &["subId", "rg", "vault"]).unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: subId");
    }

    #[test]
    fn list_splits_trims_and_dedups() {
        let request = Request::from_query([("tenantId", " a , b,,a, c ")]);
        let params = validate(&request, &["tenantId"]).unwrap();
        assert_eq!(params.list("tenantId").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn list_of_only_commas_is_missing() {
        let request = Request::from_query([("tenantId", ",,")]);
        let params = validate(&request, &["tenantId"]).unwrap();
        assert!(params.list("tenantId").is_err());
    }

    #[test]
    fn blank_body_is_dropped() {
        let request = Request::default().with_body("  \n");
        let params = validate(&request, &[]).unwrap();
        assert!(params.body().is_none());
    }
}
