use std::path::Path;

use reqwest::Url;

use crate::error::CoreError;

/// Credentials in precedence order: explicit user + pass, then the first
/// `user:pass` line of the cookie file, then none.
pub(super) fn resolve_auth(
    user: Option<&str>,
    pass: Option<&str>,
    cookie_file: Option<&Path>,
) -> Result<Option<(String, String)>, CoreError> {
    match (user, pass) {
        (Some(u), Some(p)) => return Ok(Some((u.to_owned(), p.to_owned()))),
        (Some(_), None) | (None, Some(_)) => {
            return Err(CoreError::InputValidation(
                "both rpc user and rpc pass must be set together".to_owned(),
            ));
        }
        (None, None) => {}
    }

    let Some(cookie_file) = cookie_file else {
        return Ok(None);
    };

    let content = std::fs::read_to_string(cookie_file).map_err(|e| {
        CoreError::InputValidation(format!(
            "failed to read rpc cookie file {}: {e}",
            cookie_file.display()
        ))
    })?;
    let (cookie_user, cookie_pass) = content
        .lines()
        .next()
        .map(str::trim)
        .and_then(|line| line.split_once(':'))
        .filter(|(u, p)| !u.is_empty() && !p.is_empty())
        .ok_or_else(|| {
            CoreError::InputValidation(format!(
                "rpc cookie file {} must contain non-empty `username:password`",
                cookie_file.display()
            ))
        })?;

    Ok(Some((cookie_user.to_owned(), cookie_pass.to_owned())))
}

pub(super) fn parse_connection(connection: &str) -> Result<String, CoreError> {
    let parsed = Url::parse(connection).map_err(|e| {
        CoreError::InputValidation(format!(
            "invalid rpc url `{connection}`: expected HTTP(S) URL ({e})"
        ))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(connection.to_owned()),
        other => Err(CoreError::InputValidation(format!(
            "unsupported rpc url scheme `{other}`; expected http or https"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn http_urls_are_accepted() {
        assert_eq!(
            parse_connection("http://127.0.0.1:18443").unwrap(),
            "http://127.0.0.1:18443"
        );
    }

    #[test]
    fn other_schemes_are_rejected() {
        let err = parse_connection("ftp://example.com").expect_err("must reject ftp");
        assert!(err.to_string().contains("unsupported rpc url scheme"));
    }

    #[test]
    fn partial_credentials_are_rejected() {
        let err = resolve_auth(None, Some("secret"), None).expect_err("must reject partial auth");
        assert!(err.to_string().contains("must be set together"));
    }

    #[test]
    fn explicit_credentials_win() {
        let auth = resolve_auth(Some("alice"), Some("secret"), None).unwrap();
        assert_eq!(auth, Some(("alice".to_owned(), "secret".to_owned())));
    }

    #[test]
    fn cookie_file_is_read() {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time must be after unix epoch")
            .as_nanos();
        let cookie_path = std::env::temp_dir().join(format!("allot-cookie-{unique}.txt"));
        fs::write(&cookie_path, "__cookie__:token\n").expect("cookie file must be writable");

        let auth = resolve_auth(None, None, Some(&cookie_path)).unwrap();
        assert_eq!(auth, Some(("__cookie__".to_owned(), "token".to_owned())));

        fs::write(&cookie_path, "no-separator\n").expect("cookie file must be writable");
        assert!(resolve_auth(None, None, Some(&cookie_path)).is_err());

        let _ = fs::remove_file(cookie_path);
    }
}
