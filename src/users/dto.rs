use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::users::repo::{Role, User};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(email: &str) -> Result<String, ApiError> {
    let email = email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(ApiError::validation("Please enter a valid email."));
    }
    Ok(email)
}

fn validate_password_pair(password: &str, confirm: &str) -> Result<(), ApiError> {
    if password.len() < 8 {
        return Err(ApiError::validation(
            "Password must be at least 8 characters.",
        ));
    }
    if password != confirm {
        return Err(ApiError::validation("Passwords do not match."));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(rename = "confirmPassword")]
    pub confirm_password: String,
}

impl SignupRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(ApiError::validation("Please enter your name."));
        }
        self.email = normalize_email(&self.email)?;
        validate_password_pair(&self.password, &self.confirm_password)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub password: String,
    #[serde(rename = "confirmPassword")]
    pub confirm_password: String,
}

impl ResetPasswordRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_password_pair(&self.password, &self.confirm_password)
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    #[serde(rename = "currentPassword")]
    pub current_password: String,
    pub password: String,
    #[serde(rename = "confirmPassword")]
    pub confirm_password: String,
}

impl UpdatePasswordRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_password_pair(&self.password, &self.confirm_password)
    }
}

/// Self-service profile update: name/email only, password fields rejected.
#[derive(Debug, Deserialize)]
pub struct UpdateMeRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "confirmPassword")]
    pub confirm_password: Option<String>,
}

impl UpdateMeRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        if self.password.is_some() || self.confirm_password.is_some() {
            return Err(ApiError::validation(
                "This route is not for password updates. Please use /api/users/updatePassword.",
            ));
        }
        if let Some(name) = &self.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(ApiError::validation("Please enter your name."));
            }
            self.name = Some(name);
        }
        if let Some(email) = &self.email {
            self.email = Some(normalize_email(email)?);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminUpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

impl AdminUpdateUserRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        if let Some(name) = &self.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(ApiError::validation("Please enter your name."));
            }
            self.name = Some(name);
        }
        if let Some(email) = &self.email {
            self.email = Some(normalize_email(email)?);
        }
        Ok(())
    }
}

/// The client-facing user shape; credential and reset fields never leave
/// the server.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub is_active: bool,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
            is_active: user.is_active,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub status: &'static str,
    pub token: String,
    pub user: PublicUser,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signup(name: &str, email: &str, password: &str, confirm: &str) -> SignupRequest {
        SignupRequest {
            name: name.into(),
            email: email.into(),
            password: password.into(),
            confirm_password: confirm.into(),
        }
    }

    #[test]
    fn valid_signup_passes_and_normalizes_email() {
        let mut req = signup("A", "  A@B.Com ", "12345678", "12345678");
        req.validate().expect("should validate");
        assert_eq!(req.email, "a@b.com");
    }

    #[test]
    fn signup_rejects_short_password() {
        let mut req = signup("A", "a@b.com", "1234567", "1234567");
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("at least 8"));
    }

    #[test]
    fn signup_rejects_mismatched_confirmation() {
        let mut req = signup("A", "a@b.com", "12345678", "12345679");
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("do not match"));
    }

    #[test]
    fn signup_rejects_invalid_email() {
        let mut req = signup("A", "not-an-email", "12345678", "12345678");
        assert!(req.validate().is_err());
    }

    #[test]
    fn signup_rejects_blank_name() {
        let mut req = signup("   ", "a@b.com", "12345678", "12345678");
        assert!(req.validate().is_err());
    }

    #[test]
    fn update_me_rejects_password_fields() {
        let mut req = UpdateMeRequest {
            name: None,
            email: None,
            password: Some("12345678".into()),
            confirm_password: None,
        };
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("updatePassword"));
    }

    #[test]
    fn update_me_normalizes_fields() {
        let mut req = UpdateMeRequest {
            name: Some("  B  ".into()),
            email: Some("B@B.COM".into()),
            password: None,
            confirm_password: None,
        };
        req.validate().expect("should validate");
        assert_eq!(req.name.as_deref(), Some("B"));
        assert_eq!(req.email.as_deref(), Some("b@b.com"));
    }

    #[test]
    fn public_user_omits_credentials() {
        let user = User {
            id: Uuid::new_v4(),
            name: "A".into(),
            email: "a@b.com".into(),
            password_hash: "secret-hash".into(),
            role: Role::User,
            is_active: true,
            password_changed_at: None,
            password_reset_token: Some("digest".into()),
            password_reset_expires: None,
            created_at: time::OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_string(&PublicUser::from(&user)).unwrap();
        assert!(json.contains("a@b.com"));
        assert!(!json.contains("secret-hash"));
        assert!(!json.contains("password"));
        assert!(!json.contains("digest"));
    }

    #[test]
    fn public_user_exposes_activation_state() {
        let mut user = User {
            id: Uuid::new_v4(),
            name: "A".into(),
            email: "a@b.com".into(),
            password_hash: "hash".into(),
            role: Role::User,
            is_active: false,
            password_changed_at: None,
            password_reset_token: None,
            password_reset_expires: None,
            created_at: time::OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_string(&PublicUser::from(&user)).unwrap();
        assert!(json.contains("\"is_active\":false"));

        user.is_active = true;
        let json = serde_json::to_string(&PublicUser::from(&user)).unwrap();
        assert!(json.contains("\"is_active\":true"));
    }
}
