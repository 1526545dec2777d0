use common::domain::{DomainError, DomainResult};
use std::collections::HashMap;

pub const RETURN_EVENT: &str = "ds-returnevent";
pub const PUSH_EVENT: &str = "ds-pushevent";

pub const OFFSET: &str = "offset";
pub const LIMIT: &str = "limit";
pub const DEFAULT_OFFSET: i32 = 0;
pub const DEFAULT_LIMIT: i32 = 20;

/// Reserved device-service parameters accept exactly "true" or "false"
pub fn validate_reserved_query_params(params: &HashMap<String, String>) -> DomainResult<()> {
    for name in [RETURN_EVENT, PUSH_EVENT] {
        if let Some(value) = params.get(name) {
            if value != "true" && value != "false" {
                return Err(DomainError::InvalidQueryParameter {
                    name: name.to_string(),
                    value: value.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Paging for the "all devices" listing; absent or empty values use the defaults
pub fn paging_from_query_params(params: &HashMap<String, String>) -> DomainResult<(i32, i32)> {
    let offset = integer_param(params, OFFSET, DEFAULT_OFFSET)?;
    let limit = integer_param(params, LIMIT, DEFAULT_LIMIT)?;
    Ok((offset, limit))
}

fn integer_param(params: &HashMap<String, String>, name: &str, default: i32) -> DomainResult<i32> {
    match params.get(name).map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse::<i32>().map_err(|e| {
            DomainError::InvalidPagination(format!(
                "failed to convert '{}' query parameter to integer: {}",
                name, e
            ))
        }),
    }
}
