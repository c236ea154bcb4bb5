use axum::http::HeaderMap;

use super::error::AppError;

pub(super) const API_TOKEN_HEADER: &str = "x-api-token";

pub(super) fn check_auth(expected_token: &str, headers: &HeaderMap) -> Result<(), AppError> {
    let token = headers
        .get(API_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !tokens_match(token.as_bytes(), expected_token.as_bytes()) {
        return Err(AppError::Unauthorized(
            "invalid or missing X-API-Token".to_string(),
        ));
    }
    Ok(())
}

/// Comparison time depends only on the lengths.
fn tokens_match(given: &[u8], expected: &[u8]) -> bool {
    given.len() == expected.len()
        && given
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn token_must_match_exactly() {
        let mut headers = HeaderMap::new();
        assert!(check_auth("secret", &headers).is_err());

        headers.insert(API_TOKEN_HEADER, HeaderValue::from_static("secre"));
        assert!(check_auth("secret", &headers).is_err());

        headers.insert(API_TOKEN_HEADER, HeaderValue::from_static("secret"));
        assert!(check_auth("secret", &headers).is_ok());
    }
}
