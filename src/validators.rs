/// Input validators for registration and password changes
/// Features:
/// 1. DoS Protection: Input length limits
/// 2. Username charset restriction
/// 3. Email format validation
/// 4. Password policy (length and character classes)

use lazy_static::lazy_static;
use regex::Regex;

use crate::auth::MAX_PASSWORD_BYTES;
use crate::error::ValidationError;

const MIN_USERNAME_LENGTH: usize = 3;
const MAX_USERNAME_LENGTH: usize = 50;
const MIN_EMAIL_LENGTH: usize = 5;
const MAX_EMAIL_LENGTH: usize = 100; // column width of identities.email
const MIN_PASSWORD_LENGTH: usize = 6;

const PASSWORD_SPECIALS: &str = "@$!%*?&";

lazy_static! {
    static ref USERNAME_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();

    // RFC 5322 simplified email regex (practical validation)
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$"
    ).unwrap();
}

/// Registration input after validation and normalisation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRegistration {
    pub username: String,
    pub email: String,
}

/// Validates a username
/// - 3 to 50 characters after trimming
/// - letters, digits, underscores and hyphens only
pub fn is_valid_username(username: &str) -> Result<String, ValidationError> {
    let trimmed = username.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("username"));
    }

    if trimmed.chars().count() < MIN_USERNAME_LENGTH {
        return Err(ValidationError::TooShort("username", MIN_USERNAME_LENGTH));
    }

    if trimmed.chars().count() > MAX_USERNAME_LENGTH {
        return Err(ValidationError::TooLong("username", MAX_USERNAME_LENGTH));
    }

    if !USERNAME_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidFormat("username"));
    }

    Ok(trimmed.to_string())
}

/// Validates an email address and returns it trimmed and lower-cased
pub fn is_valid_email(email: &str) -> Result<String, ValidationError> {
    let trimmed = email.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("email"));
    }

    if trimmed.len() < MIN_EMAIL_LENGTH {
        return Err(ValidationError::TooShort("email", MIN_EMAIL_LENGTH));
    }

    if trimmed.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::TooLong("email", MAX_EMAIL_LENGTH));
    }

    if !EMAIL_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidFormat("email"));
    }

    if has_suspicious_email_patterns(trimmed) {
        return Err(ValidationError::SuspiciousContent("email"));
    }

    Ok(trimmed.to_lowercase())
}

/// Validates password strength
///
/// Requirements:
/// - 6 characters to 72 bytes (the bcrypt input limit)
/// - at least one lowercase letter, one uppercase letter, one digit
///   and one of `@$!%*?&`
/// - no characters outside those classes
pub fn is_valid_password(field: &'static str, password: &str) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }

    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(ValidationError::TooShort(field, MIN_PASSWORD_LENGTH));
    }

    // Measured in bytes: bcrypt ignores everything past the 72nd.
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(ValidationError::TooLong(field, MAX_PASSWORD_BYTES));
    }

    let is_special = |c: char| PASSWORD_SPECIALS.contains(c);
    let allowed = password
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || is_special(c));
    let has_lowercase = password.chars().any(|c| c.is_ascii_lowercase());
    let has_uppercase = password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(is_special);

    if !(allowed && has_lowercase && has_uppercase && has_digit && has_special) {
        return Err(ValidationError::WeakPassword(field));
    }

    Ok(())
}

/// Checks that the confirmation field repeats the password
pub fn passwords_match(
    field: &'static str,
    password: &str,
    confirmation: &str,
) -> Result<(), ValidationError> {
    if password != confirmation {
        return Err(ValidationError::Mismatch(field));
    }
    Ok(())
}

/// Validates a whole registration form, reporting every failing field
pub fn validate_registration(
    username: &str,
    email: &str,
    password: &str,
    confirm_password: &str,
) -> Result<ValidRegistration, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let username = is_valid_username(username).map_err(|e| errors.push(e)).ok();
    let email = is_valid_email(email).map_err(|e| errors.push(e)).ok();
    if let Err(e) = is_valid_password("password", password) {
        errors.push(e);
    }
    if let Err(e) = passwords_match("confirmPassword", password, confirm_password) {
        errors.push(e);
    }

    match (username, email) {
        (Some(username), Some(email)) if errors.is_empty() => {
            Ok(ValidRegistration { username, email })
        }
        _ => Err(errors),
    }
}

/// Detects suspicious patterns in email addresses
fn has_suspicious_email_patterns(email: &str) -> bool {
    // Overlong local part
    if let Some(at_pos) = email.find('@') {
        if at_pos > 64 {
            return true;
        }
    }

    if email.matches('@').count() != 1 {
        return true;
    }

    email.contains('\0')
}
