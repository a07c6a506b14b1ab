//! Input validation
//!
//! Usernames must be:
//! - 3-40 characters
//! - [0-9a-zA-Z_] characters only
//! - Started by a letter or digit
//!
//! Public keys are hex-encoded Ed25519 verifying keys.

use thiserror::Error;

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 40;
pub const MAX_KEY_FILE_BYTES: usize = 2048;
pub const BUILD_ID_LEN: usize = 40;

/// User-facing validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("User name not specified.")]
    EmptyUsername,

    #[error("Username must be at least {min} characters long.")]
    UsernameTooShort { min: usize, got: usize },

    #[error("Username must not exceed {max} characters in length.")]
    UsernameTooLong { max: usize, got: usize },

    #[error("Username can only contain these characters: 0-9a-zA-Z_ (found '{char}' at position {position})")]
    InvalidUsernameCharacter { position: usize, char: char },

    #[error("Username must start with one of these characters: 0-9a-zA-Z")]
    InvalidUsernameStart,

    #[error("Duplicate user names are not allowed: {0}")]
    DuplicateUsername(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Public key too large, file size limit is {max} bytes (got {got})")]
    KeyTooLarge { max: usize, got: usize },

    #[error("Invalid public key provided.")]
    InvalidPublicKey,

    #[error("Percentage should be between 1 and 100 (got {0}).")]
    InvalidPercentage(u32),

    #[error("Vessel resources must total {required}% exactly. Current vessels total {current}%.")]
    PercentageTotal { required: u32, current: u32 },

    #[error("At most {max} vessels are allowed (got {got}).")]
    TooManyVessels { max: usize, got: usize },

    #[error("{user} is listed more than once in vessel {index}.")]
    DuplicateVesselUser { index: usize, user: String },

    #[error("At least one vessel is required.")]
    NoVessels,

    #[error("Vessel {index} has users but no owner.")]
    VesselWithoutOwner { index: usize },

    #[error("All vessels must have a specified owner.")]
    NoOwner,

    #[error("Invalid build_id provided.")]
    InvalidBuildId,

    #[error("Invalid platform specified: {0}")]
    InvalidPlatform(String),

    #[error("Invalid key type specified: {0}")]
    InvalidKeyKind(String),
}

/// Validate a username for length and content
pub fn validate_username(name: &str) -> Result<(), ValidationError> {
    let len = name.chars().count();
    if len == 0 {
        return Err(ValidationError::EmptyUsername);
    }
    if len < USERNAME_MIN_LEN {
        return Err(ValidationError::UsernameTooShort {
            min: USERNAME_MIN_LEN,
            got: len,
        });
    }
    if len > USERNAME_MAX_LEN {
        return Err(ValidationError::UsernameTooLong {
            max: USERNAME_MAX_LEN,
            got: len,
        });
    }

    for (position, c) in name.chars().enumerate() {
        if !(c.is_ascii_alphanumeric() || c == '_') {
            return Err(ValidationError::InvalidUsernameCharacter { position, char: c });
        }
    }

    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidUsernameStart);
    }

    Ok(())
}

/// Validate the raw bytes of an uploaded key file.
///
/// Returns the trimmed key text on success.
pub fn validate_key_upload(bytes: &[u8]) -> Result<String, ValidationError> {
    if bytes.len() > MAX_KEY_FILE_BYTES {
        return Err(ValidationError::KeyTooLarge {
            max: MAX_KEY_FILE_BYTES,
            got: bytes.len(),
        });
    }
    let text = std::str::from_utf8(bytes).map_err(|_| ValidationError::InvalidPublicKey)?;
    let key = text.trim();
    validate_public_key(key)?;
    Ok(key.to_string())
}

/// Validate a hex-encoded Ed25519 public key
pub fn validate_public_key(key: &str) -> Result<(), ValidationError> {
    let bytes = hex::decode(key).map_err(|_| ValidationError::InvalidPublicKey)?;
    crate::crypto::verifying_key_from_bytes(&bytes).map_err(|_| ValidationError::InvalidPublicKey)?;
    Ok(())
}

/// Percentages are whole numbers between 1 and 100
pub fn validate_percentage(percentage: u32) -> Result<(), ValidationError> {
    if !(1..=100).contains(&percentage) {
        return Err(ValidationError::InvalidPercentage(percentage));
    }
    Ok(())
}

/// The user-defined vessels must cover everything but the reserved share
pub fn validate_percentage_total(current: u32, required: u32) -> Result<(), ValidationError> {
    if current != required {
        return Err(ValidationError::PercentageTotal { required, current });
    }
    Ok(())
}

/// Every vessel share is a valid percentage and together they cover `required`
pub fn validate_vessel_percentages(percentages: &[u32], required: u32) -> Result<(), ValidationError> {
    for &percentage in percentages {
        validate_percentage(percentage)?;
    }
    let current: u64 = percentages.iter().map(|&p| u64::from(p)).sum();
    validate_percentage_total(u32::try_from(current).unwrap_or(u32::MAX), required)
}

/// Build ids are exactly 40 lowercase letters or digits
pub fn validate_build_id(build_id: &str) -> Result<(), ValidationError> {
    let well_formed = build_id.len() == BUILD_ID_LEN
        && build_id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase());
    if !well_formed {
        return Err(ValidationError::InvalidBuildId);
    }
    Ok(())
}
