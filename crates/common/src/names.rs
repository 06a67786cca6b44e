//! Bus name, interface, member and object path validation.
//!
//! All names are limited to [`MAX_NAME_LEN`] bytes. Dotted names need at
//! least two elements; an element may not be empty and may not start with
//! a digit, except in unique names (which begin with `:`).

use crate::error::{Result, ValidationError};

/// Maximum length of any bus, interface or member name.
pub const MAX_NAME_LEN: usize = 255;

fn check_length(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

fn is_bus_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Validate dotted elements: non-empty, allowed chars, optional digit rule.
fn check_elements(
    name: &str,
    body: &str,
    allowed: fn(char) -> bool,
    digit_first_ok: bool,
) -> Result<()> {
    let mut count = 0usize;
    for element in body.split('.') {
        count += 1;
        let mut chars = element.chars();
        let Some(first) = chars.next() else {
            return Err(ValidationError::InvalidElement(name.to_string()));
        };
        if !digit_first_ok && first.is_ascii_digit() {
            return Err(ValidationError::InvalidElement(name.to_string()));
        }
        if !allowed(first) || !chars.all(allowed) {
            return Err(ValidationError::InvalidElement(name.to_string()));
        }
    }
    if count < 2 {
        return Err(ValidationError::TooFewElements(name.to_string()));
    }
    Ok(())
}

/// Validate a well-known name such as `org.example.Foo`.
pub fn validate_well_known_name(name: &str) -> Result<()> {
    check_length(name)?;
    check_elements(name, name, is_bus_name_char, false)
}

/// Validate a unique connection name such as `:1.42`.
pub fn validate_unique_name(name: &str) -> Result<()> {
    check_length(name)?;
    let Some(body) = name.strip_prefix(':') else {
        return Err(ValidationError::InvalidElement(name.to_string()));
    };
    check_elements(name, body, is_bus_name_char, true)
}

/// Validate either a unique or a well-known name.
pub fn validate_bus_name(name: &str) -> Result<()> {
    if name.starts_with(':') {
        validate_unique_name(name)
    } else {
        validate_well_known_name(name)
    }
}

/// Validate a discovery prefix.
///
/// Prefixes only need the right charset and length. The empty prefix
/// matches every name and a trailing `.` is allowed.
pub fn validate_name_prefix(prefix: &str) -> Result<()> {
    if prefix.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            len: prefix.len(),
            max: MAX_NAME_LEN,
        });
    }
    if prefix.chars().all(|c| is_bus_name_char(c) || c == '.') {
        Ok(())
    } else {
        Err(ValidationError::InvalidElement(prefix.to_string()))
    }
}

/// Validate an interface name such as `org.freedesktop.DBus.Introspectable`.
pub fn validate_interface_name(name: &str) -> Result<()> {
    check_length(name)?;
    check_elements(name, name, is_identifier_char, false)
}

/// Validate a method or signal name.
pub fn validate_member_name(name: &str) -> Result<()> {
    check_length(name)?;
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return Err(ValidationError::InvalidElement(name.to_string())),
    }
    if chars.all(is_identifier_char) {
        Ok(())
    } else {
        Err(ValidationError::InvalidElement(name.to_string()))
    }
}

/// Validate an object path such as `/org/example/Object`.
pub fn validate_object_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    let Some(body) = path.strip_prefix('/') else {
        return Err(ValidationError::InvalidElement(path.to_string()));
    };
    if body.split('/').all(|e| !e.is_empty() && e.chars().all(is_identifier_char)) {
        Ok(())
    } else {
        Err(ValidationError::InvalidElement(path.to_string()))
    }
}
