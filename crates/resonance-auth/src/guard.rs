//! Input guards run at the boundary of every public operation.

use crate::{Error, Result};

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 50;
pub const PASSWORD_MIN: usize = 8;
pub const PASSWORD_MAX: usize = 100;
pub const EMAIL_MAX: usize = 254;
pub const AUTHORIZATION_CODE_MAX: usize = 2048;

/// Login input only needs to be present and bounded; policy is enforced at registration.
pub fn login_fields(username: &str, password: &str) -> Result<()> {
    if username.trim().is_empty() {
        return Err(Error::Validation("username is required".to_string()));
    }
    if password.is_empty() {
        return Err(Error::Validation("password is required".to_string()));
    }
    if username.chars().count() > EMAIL_MAX || password.chars().count() > PASSWORD_MAX {
        return Err(Error::Validation("credentials too long".to_string()));
    }
    Ok(())
}

pub fn registration(email: &str, username: &str, password: &str) -> Result<()> {
    email_address(email)?;
    let name_len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&name_len) {
        return Err(Error::Validation(format!(
            "username must be between {USERNAME_MIN} and {USERNAME_MAX} characters"
        )));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(Error::Validation("username must not contain whitespace".to_string()));
    }
    let pw_len = password.chars().count();
    if !(PASSWORD_MIN..=PASSWORD_MAX).contains(&pw_len) {
        return Err(Error::Validation(format!(
            "password must be between {PASSWORD_MIN} and {PASSWORD_MAX} characters"
        )));
    }
    Ok(())
}

pub fn email_address(email: &str) -> Result<()> {
    let invalid = || Error::Validation("email address is not valid".to_string());
    if email.is_empty() || email.len() > EMAIL_MAX || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid());
    }
    Ok(())
}

pub fn authorization_code(code: &str) -> Result<()> {
    if code.trim().is_empty() {
        return Err(Error::Validation("authorization code is required".to_string()));
    }
    if code.len() > AUTHORIZATION_CODE_MAX {
        return Err(Error::Validation("authorization code too long".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_bounds() {
        assert!(registration("a@b.io", "abc", "12345678").is_ok());
        assert!(registration("a@b.io", "ab", "12345678").is_err());
        assert!(registration("a@b.io", &"x".repeat(51), "12345678").is_err());
        assert!(registration("a@b.io", "abc", "1234567").is_err());
        assert!(registration("a@b.io", "abc", &"p".repeat(101)).is_err());
        assert!(registration("a@b.io", "a b", "12345678").is_err());
    }

    #[test]
    fn email_shapes() {
        for ok in ["a@b.io", "first.last+tag@mail.example.com"] {
            assert!(email_address(ok).is_ok(), "{ok}");
        }
        for bad in ["", "plain", "@b.io", "a@b", "a@@b.io", "a@.io", "a @b.io", "a@b..io"] {
            assert!(email_address(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn login_requires_both_fields() {
        assert!(login_fields("u", "p").is_ok());
        assert!(matches!(login_fields(" ", "p"), Err(Error::Validation(_))));
        assert!(matches!(login_fields("u", ""), Err(Error::Validation(_))));
    }

    #[test]
    fn empty_code_is_rejected() {
        assert!(authorization_code("").is_err());
        assert!(authorization_code("4/0Ab").is_ok());
    }
}
